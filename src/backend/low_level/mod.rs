// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Backend for low-level blocking MIDI 1.0 APIs.
//!
//! Devices are addressed by their index in the native enumeration. All
//! devices are polled periodically and the registry is rebuilt from
//! scratch whenever the enumeration changes.

use std::{collections::BTreeMap, fmt, sync::Arc, thread, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;

use super::{spawn_worker, BackendKind, Unavailable};
use crate::{
    config::{CancellationToken, Config, RetryPolicy},
    connection::{BytestreamInput, ConnectionCache, Hub, SharedDevice},
    endpoint::{
        append_numbers_to_duplicates, make_proxy_endpoint, EndpointAndStaticInfo, EndpointId,
        IoKind,
    },
    listener::{EndpointsListener, ListenerList},
    registry::{Change, Registry},
    session::{EndpointsBackend, SessionBackend},
    ump::to_bytestream::ToBytestream,
    watcher::{DeviceWatcher, PollingWatcher, WatcherEvent},
};

#[cfg(feature = "midir")]
pub mod midir;


/// Interval for polling the completion of a long message.
pub const LONG_MESSAGE_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LowLevelError {
    #[error("device is already allocated")]
    Allocated,
    #[error("device is not ready")]
    NotReady,
    #[error("buffer is still playing")]
    StillPlaying,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

/// A device as reported by the native enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LowLevelDeviceInfo {
    pub name: String,
    /// Path of the driver interface.
    ///
    /// Empty if the driver does not provide one.
    pub interface: String,
}

impl LowLevelDeviceInfo {
    fn native_id(&self) -> &str {
        if self.interface.is_empty() {
            &self.name
        } else {
            &self.interface
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent<'a> {
    /// A complete short message or a chunk of a long message.
    Data {
        bytes: &'a [u8],
        /// Native time since the device has been opened.
        elapsed_millis: f64,
    },
    /// The driver has closed the device.
    Closed,
}

pub type InputCallback = Box<dyn FnMut(InputEvent<'_>) + Send>;

/// Entry point into the low-level API.
pub trait LowLevelApi: Send + Sync {
    /// Enumerates all devices of one direction in native order.
    fn devices(&self, kind: IoKind) -> Result<Vec<LowLevelDeviceInfo>, LowLevelError>;

    /// Opens and starts the input device at `index`.
    fn open_input(
        &self,
        index: usize,
        callback: InputCallback,
    ) -> Result<Box<dyn LowLevelInput>, LowLevelError>;

    fn open_output(&self, index: usize) -> Result<Box<dyn LowLevelOutput>, LowLevelError>;
}

pub trait LowLevelInput: Send {
    /// Stops the device and releases the handle.
    ///
    /// No callbacks are invoked after this function has succeeded.
    fn close(&mut self) -> Result<(), LowLevelError>;
}

pub trait LowLevelOutput: Send {
    /// Sends a message of up to 3 bytes, packed little-endian.
    fn short_message(&mut self, message: u32) -> Result<(), LowLevelError>;

    /// Starts the transfer of a long message.
    fn begin_long_message(
        &mut self,
        bytes: &[u8],
    ) -> Result<Box<dyn PendingTransfer>, LowLevelError>;
}

/// A long message that is owned by the driver until it has been played.
///
/// Dropping an unreleased transfer must keep the buffer alive until the
/// driver is done with it.
pub trait PendingTransfer: Send {
    fn is_done(&self) -> bool;

    /// Hands the buffer back.
    fn release(&mut self) -> Result<(), LowLevelError>;
}

/// Creates the default native API.
#[cfg(feature = "midir")]
pub fn default_api(config: &Config) -> Result<Arc<dyn LowLevelApi>, Unavailable> {
    let api = midir::MidirApi::new(config.client_name())
        .map_err(|err| Unavailable::new(BackendKind::LowLevel, err.to_string()))?;
    Ok(Arc::new(api))
}

/// Creates the default native API.
#[cfg(not(feature = "midir"))]
pub fn default_api(config: &Config) -> Result<Arc<dyn LowLevelApi>, Unavailable> {
    let _ = config;
    Err(Unavailable::new(
        BackendKind::LowLevel,
        "no native API enabled at build time",
    ))
}

/// Packs a message that fits into a single short message.
///
/// Returns `None` for sysex messages and all of their chunks.
#[must_use]
pub fn pack_short_message(bytes: &[u8]) -> Option<u32> {
    let (&status, data) = bytes.split_first()?;
    if status < 0x80 || status == 0xf0 || status == 0xf7 || data.len() > 2 {
        return None;
    }
    Some(
        bytes
            .iter()
            .rev()
            .fold(0, |packed, &byte| (packed << 8) | u32::from(byte)),
    )
}

/// Enumerates all devices as proxy endpoints.
///
/// Duplicate names and ids are numbered in native order.
fn enumerate(
    api: &dyn LowLevelApi,
    kind: IoKind,
) -> Result<Vec<EndpointAndStaticInfo>, LowLevelError> {
    let devices = api.devices(kind)?;
    let mut names: Vec<_> = devices.iter().map(|device| device.name.clone()).collect();
    let mut ids: Vec<_> = devices
        .iter()
        .map(|device| device.native_id().to_owned())
        .collect();
    append_numbers_to_duplicates(&mut names);
    append_numbers_to_duplicates(&mut ids);
    Ok(ids
        .into_iter()
        .zip(names)
        .map(|(id, name)| make_proxy_endpoint(kind, id, name))
        .collect())
}

fn enumerate_all(api: &dyn LowLevelApi) -> Vec<(String, EndpointAndStaticInfo)> {
    [IoKind::Src, IoKind::Dst]
        .into_iter()
        .flat_map(|kind| {
            enumerate(api, kind).unwrap_or_else(|err| {
                log::warn!("Failed to enumerate {kind:?} devices: {err}");
                Vec::new()
            })
        })
        .map(|entry| (entry.id.to_string(), entry))
        .collect()
}

fn send_message(
    output: &mut dyn LowLevelOutput,
    bytes: &[u8],
    cancellation: Option<&CancellationToken>,
) -> Result<(), LowLevelError> {
    let is_cancelled = || cancellation.is_some_and(CancellationToken::is_cancelled);
    if is_cancelled() {
        return Err(LowLevelError::Cancelled);
    }
    if let Some(message) = pack_short_message(bytes) {
        return RetryPolicy::SEND_SHORT.run(
            || output.short_message(message),
            |err| *err == LowLevelError::NotReady,
        );
    }
    let mut transfer = output.begin_long_message(bytes)?;
    while !transfer.is_done() {
        if is_cancelled() {
            log::info!(
                "Abandoning long message with {len} byte(s)",
                len = bytes.len()
            );
            return Err(LowLevelError::Cancelled);
        }
        thread::sleep(LONG_MESSAGE_POLL_INTERVAL);
    }
    RetryPolicy::RELEASE_LONG.run(
        || transfer.release(),
        |err| *err == LowLevelError::StillPlaying,
    )
}

struct Output {
    native: Box<dyn LowLevelOutput>,
    encoder: ToBytestream,
}

enum Native {
    Input(Mutex<Box<dyn LowLevelInput>>),
    Output(Mutex<Output>),
}

struct LowLevelDevice {
    id: EndpointId,
    input: Arc<BytestreamInput>,
    native: Native,
}

impl LowLevelDevice {
    fn send_words(&self, words: &[u32], cancellation: Option<&CancellationToken>) -> bool {
        let Native::Output(output) = &self.native else {
            return false;
        };
        let mut output = output.lock();
        let Output { native, encoder } = &mut *output;
        let mut result = Ok(());
        encoder.convert_words(words, |message| {
            if result.is_ok() {
                result = send_message(native.as_mut(), message.bytes, cancellation);
            }
        });
        match result {
            Ok(()) => true,
            Err(LowLevelError::InvalidHandle) => {
                log::warn!("Device {id} has vanished", id = self.id);
                self.input.hub().notify_disconnected();
                false
            }
            Err(LowLevelError::Cancelled) => {
                log::debug!("Cancelled sending to {id}", id = self.id);
                false
            }
            Err(err) => {
                log::warn!("Failed to send to {id}: {err}", id = self.id);
                false
            }
        }
    }
}

impl SharedDevice for LowLevelDevice {
    fn endpoint_id(&self) -> &EndpointId {
        &self.id
    }

    fn hub(&self) -> &Hub {
        self.input.hub()
    }

    fn send(&self, words: &[u32]) -> bool {
        self.send_words(words, None)
    }

    fn send_cancellable(&self, words: &[u32], cancellation: &CancellationToken) -> bool {
        self.send_words(words, Some(cancellation))
    }
}

impl Drop for LowLevelDevice {
    fn drop(&mut self) {
        log::debug!("Closing device {id}", id = self.id);
        if let Native::Input(input) = &mut self.native {
            let input = input.get_mut();
            if let Err(err) = RetryPolicy::CLOSE_INPUT.run(|| input.close(), |_| true) {
                log::warn!("Failed to close device {id}: {err}", id = self.id);
            }
        }
    }
}

struct Client {
    api: Arc<dyn LowLevelApi>,
    registry: Arc<Registry>,
    known: Mutex<BTreeMap<String, EndpointAndStaticInfo>>,
    /// Shared by all sessions. Native devices can only be opened once.
    connections: ConnectionCache<LowLevelDevice>,
    open_devices: ListenerList<LowLevelDevice>,
    config: Config,
}

impl Client {
    fn devices_changed(&self, event: WatcherEvent<EndpointAndStaticInfo>) {
        let mut removed = None;
        let entries = {
            let mut known = self.known.lock();
            let modified = match event {
                WatcherEvent::Added { id, info } | WatcherEvent::Updated { id, info } => {
                    if known.get(&id) == Some(&info) {
                        false
                    } else {
                        known.insert(id, info);
                        true
                    }
                }
                WatcherEvent::Removed { id } => {
                    removed = known.remove(&id);
                    removed.is_some()
                }
                WatcherEvent::EnumerationCompleted { devices } => {
                    let devices: BTreeMap<_, _> = devices.into_iter().collect();
                    if *known == devices {
                        false
                    } else {
                        *known = devices;
                        true
                    }
                }
            };
            if !modified {
                return;
            }
            known.values().cloned().collect()
        };
        if let Some(entry) = removed {
            for device in self.open_devices.snapshot() {
                if device.id == entry.id {
                    log::info!("Device {id} has vanished", id = device.id);
                    device.input.hub().notify_disconnected();
                }
            }
        }
        self.registry.enqueue(Change::Replace(entries));
    }

    fn open_device(&self, kind: IoKind, id: &EndpointId) -> Option<Arc<LowLevelDevice>> {
        let entries = enumerate(self.api.as_ref(), kind)
            .map_err(|err| {
                log::warn!("Failed to enumerate {kind:?} devices: {err}");
            })
            .ok()?;
        let Some(index) = entries.iter().position(|entry| &entry.id == id) else {
            log::warn!("Unknown device {id}");
            return None;
        };
        let input = Arc::new(BytestreamInput::new(
            self.registry.worker().clone(),
            &self.config,
        ));
        let native = match kind {
            IoKind::Src => {
                let receiver = Arc::clone(&input);
                let callback = Box::new(move |event: InputEvent<'_>| match event {
                    InputEvent::Data {
                        bytes,
                        elapsed_millis,
                    } => receiver.receive(bytes, elapsed_millis),
                    InputEvent::Closed => receiver.hub().notify_disconnected(),
                });
                let native = self
                    .api
                    .open_input(index, callback)
                    .map_err(|err| log::warn!("Failed to open input {id}: {err}"))
                    .ok()?;
                Native::Input(Mutex::new(native))
            }
            IoKind::Dst => {
                let native = self
                    .config
                    .open_retry()
                    .run(
                        || self.api.open_output(index),
                        |err| *err == LowLevelError::Allocated,
                    )
                    .map_err(|err| log::warn!("Failed to open output {id}: {err}"))
                    .ok()?;
                Native::Output(Mutex::new(Output {
                    native,
                    encoder: ToBytestream::new(self.config.sysex_capacity()),
                }))
            }
        };
        let device = Arc::new(LowLevelDevice {
            id: id.clone(),
            input,
            native,
        });
        self.open_devices.add(&device);
        Some(device)
    }
}

struct LowLevelSession {
    client: Arc<Client>,
}

impl SessionBackend for LowLevelSession {
    fn open_device(&self, kind: IoKind, id: &EndpointId) -> Option<Arc<dyn SharedDevice>> {
        let client = &self.client;
        let device = client
            .connections
            .open(id, |id| client.open_device(kind, id))?;
        Some(device)
    }
}

pub(crate) struct LowLevelBackend {
    client: Arc<Client>,
    watcher: Mutex<Box<dyn DeviceWatcher<EndpointAndStaticInfo>>>,
}

impl fmt::Debug for LowLevelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LowLevelBackend")
            .field("registry", &self.client.registry)
            .finish_non_exhaustive()
    }
}

impl LowLevelBackend {
    pub(crate) fn open(
        api: Arc<dyn LowLevelApi>,
        config: &Config,
        listener: Arc<dyn EndpointsListener>,
    ) -> Result<Self, Unavailable> {
        let kind = BackendKind::LowLevel;
        api.devices(IoKind::Src)
            .map_err(|err| Unavailable::new(kind, err.to_string()))?;
        // The endpoints are available as soon as the backend has been opened
        let known: BTreeMap<_, _> = enumerate_all(api.as_ref()).into_iter().collect();
        let registry =
            Registry::new(spawn_worker(kind)?, listener).with_entries(known.values().cloned());
        let client = Arc::new(Client {
            api: Arc::clone(&api),
            registry: Arc::new(registry),
            known: Mutex::new(known),
            connections: Default::default(),
            open_devices: Default::default(),
            config: config.clone(),
        });
        let mut watcher = PollingWatcher::new(config.poll_interval(), move || {
            enumerate_all(api.as_ref())
        });
        let weak_client = Arc::downgrade(&client);
        watcher
            .start(Box::new(move |event| {
                if let Some(client) = weak_client.upgrade() {
                    client.devices_changed(event);
                }
            }))
            .map_err(|err| Unavailable::new(kind, err.to_string()))?;
        Ok(Self {
            client,
            watcher: Mutex::new(Box::new(watcher)),
        })
    }
}

impl Drop for LowLevelBackend {
    fn drop(&mut self) {
        self.watcher.get_mut().stop();
    }
}

impl EndpointsBackend for LowLevelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LowLevel
    }

    fn registry(&self) -> &Arc<Registry> {
        &self.client.registry
    }

    fn make_session(&self, _name: &str) -> Option<Box<dyn SessionBackend>> {
        Some(Box::new(LowLevelSession {
            client: Arc::clone(&self.client),
        }))
    }
}
