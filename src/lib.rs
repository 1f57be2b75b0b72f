// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

#![allow(rustdoc::invalid_rust_codeblocks)]
#![doc = include_str!("../README.md")]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(unreachable_pub)]
#![warn(unsafe_code)]
#![warn(clippy::pedantic)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(rustdoc::broken_intra_doc_links)]
// Repetitions of module/type names occur frequently when using many
// modules for keeping the size of the source files handy. Often
// types have the same name as their parent module.
#![allow(clippy::module_name_repetitions)]
// Repeating the type name in `..Default::default()` expressions
// is not needed since the context is obvious.
#![allow(clippy::default_trait_access)]

pub mod backend;
pub use self::backend::{make_endpoints, BackendKind, Endpoints, NativeApis, Unavailable};

pub mod config;
pub use self::config::{CancellationToken, Config, RetryPolicy};

mod connection;

pub mod endpoint;
pub use self::endpoint::{
    Block, BlockDirection, DeviceInfo, Endpoint, EndpointAndStaticInfo, EndpointId, IoKind,
    StaticDeviceInfo, Transport,
};

pub mod listener;
pub use self::listener::{Consumer, DisconnectionListener, EndpointsListener, NoListener};

pub mod registry;

pub mod session;
pub use self::session::{Input, Output, Session, VirtualEndpoint, VirtualEndpointConfig};

pub mod ump;
pub use self::ump::{PacketProtocol, View};

pub mod watcher;
pub use self::watcher::{DeviceWatcher, PollingWatcher, WatcherError, WatcherEvent};

mod worker;
