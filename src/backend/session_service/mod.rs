// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Backend for session-based services with native UMP transport.
//!
//! The native service is accessed through [`SessionService`]. Every session
//! shares one native connection per endpoint among all inputs and outputs.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{spawn_worker, BackendKind, Unavailable};
use crate::{
    config::Config,
    connection::{ConnectionCache, Hub, SharedDevice},
    endpoint::{
        Block, DeviceInfo, Endpoint, EndpointAndStaticInfo, EndpointId, IoKind, StaticDeviceInfo,
        Transport,
    },
    listener::EndpointsListener,
    registry::{Change, Registry},
    session::{EndpointsBackend, SessionBackend, VirtualDevice, VirtualEndpointConfig},
    ump::{timestamp::TimestampConverter, Group, PacketProtocol},
    watcher::{DeviceWatcher, WatcherEvent},
    worker::WorkerHandle,
};


/// Endpoint metadata as reported by the native service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceEndpointInfo {
    /// Native endpoint device id.
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub product: String,
    pub native_data_format: Transport,
    pub declared_protocol: PacketProtocol,
    pub ump_version: (u8, u8),
    pub device_info: DeviceInfo,
    pub product_instance_id: String,
    pub midi1_support: bool,
    pub midi2_support: bool,
    pub static_blocks: bool,
    pub receive_jr_support: bool,
    pub transmit_jr_support: bool,
    /// Blocks declared by the device itself.
    pub function_blocks: Vec<Block>,
    /// Blocks derived from the USB descriptors.
    pub group_terminal_blocks: Vec<Block>,
}

/// Identifies a single group of an endpoint for legacy clients.
///
/// Encoded as a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyIdentifier {
    pub endpoint: String,
    pub group: u8,
}

impl LegacyIdentifier {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

fn legacy_identifiers(endpoint: &str) -> [String; Group::COUNT] {
    let mut identifiers: [String; Group::COUNT] = Default::default();
    for (group, identifier) in (0u8..).zip(identifiers.iter_mut()) {
        let legacy = LegacyIdentifier {
            endpoint: endpoint.to_owned(),
            group,
        };
        match legacy.to_json() {
            Ok(json) => *identifier = json,
            Err(err) => {
                log::warn!("Failed to encode legacy identifier {legacy:?}: {err}");
            }
        }
    }
    identifiers
}

/// Maps native metadata onto a registry entry.
///
/// Group terminal blocks are only used if the device does not declare any
/// function blocks. Byte-stream devices always use the MIDI 1.0 protocol.
#[must_use]
pub fn make_entry(info: &ServiceEndpointInfo) -> EndpointAndStaticInfo {
    let protocol = if info.native_data_format == Transport::Bytestream {
        PacketProtocol::Midi1
    } else {
        info.declared_protocol
    };
    let blocks = if info.function_blocks.is_empty() {
        &info.group_terminal_blocks
    } else {
        &info.function_blocks
    };
    let (major, minor) = info.ump_version;
    let endpoint = Endpoint::default()
        .with_name(info.name.clone())
        .with_protocol(protocol)
        .with_blocks(blocks.iter().cloned())
        .with_device_info(info.device_info)
        .with_product_instance_id(info.product_instance_id.clone())
        .with_ump_version(major, minor)
        .with_midi1_support(info.midi1_support)
        .with_midi2_support(info.midi2_support)
        .with_static_blocks(info.static_blocks)
        .with_receive_jr_support(info.receive_jr_support)
        .with_transmit_jr_support(info.transmit_jr_support);
    let has_direction = |kind: IoKind| {
        info.function_blocks
            .iter()
            .chain(&info.group_terminal_blocks)
            .any(|block| block.direction.supports(kind))
    };
    let legacy_identifiers = legacy_identifiers(&info.id);
    let static_info = StaticDeviceInfo::default()
        .with_name(info.name.clone())
        .with_manufacturer(info.manufacturer.clone())
        .with_product(info.product.clone())
        .with_has_source(has_direction(IoKind::Src))
        .with_has_destination(has_direction(IoKind::Dst))
        .with_legacy_identifiers(IoKind::Src, legacy_identifiers.clone())
        .with_legacy_identifiers(IoKind::Dst, legacy_identifiers)
        .with_transport(info.native_data_format);
    EndpointAndStaticInfo {
        id: EndpointId::bidirectional(info.id.clone()),
        endpoint,
        info: static_info,
    }
}

/// Entry point into the native service.
pub trait SessionService: Send + Sync {
    /// Fails if the service is not installed or not running.
    fn create_watcher(
        &self,
    ) -> Result<Box<dyn DeviceWatcher<ServiceEndpointInfo>>, crate::watcher::WatcherError>;

    fn create_session(&self, name: &str) -> Option<Box<dyn NativeSession>>;

    /// Whether virtual devices can be created.
    fn is_virtual_device_transport_available(&self) -> bool;
}

/// A native session.
///
/// Closed when dropped.
pub trait NativeSession: Send + Sync {
    /// Opens a connection to an endpoint.
    ///
    /// The native connection must report inbound messages and the
    /// disappearance of the device through `events`.
    fn open_connection(
        &self,
        endpoint_id: &str,
        events: ConnectionEvents,
    ) -> Option<Box<dyn NativeConnection>>;

    fn create_virtual_device(
        &self,
        config: &VirtualEndpointConfig,
    ) -> Option<Box<dyn NativeVirtualDevice>>;
}

/// An open native connection.
///
/// Disconnected when dropped.
pub trait NativeConnection: Send + Sync {
    fn send_words(&self, words: &[u32]) -> bool;
}

/// A virtual device registered with the native service.
///
/// Removed when dropped.
pub trait NativeVirtualDevice: Send + Sync {
    fn endpoint_id(&self) -> String;

    fn update_name(&self, name: &str) -> bool;

    fn update_block(&self, index: usize, block: &Block) -> bool;
}

struct ConnectionEventsInner {
    hub: Hub,
    timestamps: Mutex<TimestampConverter>,
}

/// Callbacks of a native connection.
#[derive(Clone)]
pub struct ConnectionEvents {
    inner: Arc<ConnectionEventsInner>,
}

impl fmt::Debug for ConnectionEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("disconnected", &self.inner.hub.is_disconnected())
            .finish_non_exhaustive()
    }
}

impl ConnectionEvents {
    fn new(worker: WorkerHandle, timestamps: TimestampConverter) -> Self {
        Self {
            inner: Arc::new(ConnectionEventsInner {
                hub: Hub::new(worker),
                timestamps: Mutex::new(timestamps),
            }),
        }
    }

    /// Delivers inbound packets.
    ///
    /// `elapsed_millis` is measured on the native clock since the
    /// connection has been opened.
    pub fn message_received(&self, words: &[u32], elapsed_millis: f64) {
        let timestamp = self.inner.timestamps.lock().convert(elapsed_millis);
        log::trace!("Received {words:08x?} at {timestamp}");
        self.inner.hub.deliver_words(words, timestamp);
    }

    /// The endpoint device has disappeared.
    pub fn disconnected(&self) {
        self.inner.hub.notify_disconnected();
    }
}

struct ServiceDevice {
    id: EndpointId,
    events: ConnectionEvents,
    connection: Box<dyn NativeConnection>,
}

impl SharedDevice for ServiceDevice {
    fn endpoint_id(&self) -> &EndpointId {
        &self.id
    }

    fn hub(&self) -> &Hub {
        &self.events.inner.hub
    }

    fn send(&self, words: &[u32]) -> bool {
        self.connection.send_words(words)
    }
}

impl Drop for ServiceDevice {
    fn drop(&mut self) {
        log::debug!("Closing connection to {id}", id = self.id);
    }
}

struct ServiceVirtualDevice {
    device: Box<dyn NativeVirtualDevice>,
    // The native service only routes data to virtual devices with an
    // open connection.
    _connection: Arc<dyn SharedDevice>,
}

impl VirtualDevice for ServiceVirtualDevice {
    fn update_name(&self, name: &str) -> bool {
        self.device.update_name(name)
    }

    fn update_block(&self, index: usize, block: &Block) -> bool {
        self.device.update_block(index, block)
    }
}

struct ServiceSession {
    native: Box<dyn NativeSession>,
    connections: ConnectionCache<ServiceDevice>,
    worker: WorkerHandle,
    config: Config,
}

impl SessionBackend for ServiceSession {
    fn open_device(&self, kind: IoKind, id: &EndpointId) -> Option<Arc<dyn SharedDevice>> {
        let native_id = id.get(kind);
        let device = self
            .connections
            .open(&EndpointId::bidirectional(native_id), |id| {
                let events =
                    ConnectionEvents::new(self.worker.clone(), self.config.timestamp_converter());
                let connection = self.native.open_connection(native_id, events.clone())?;
                Some(Arc::new(ServiceDevice {
                    id: id.clone(),
                    events,
                    connection,
                }))
            })?;
        Some(device)
    }

    fn create_virtual_device(
        &self,
        config: &VirtualEndpointConfig,
    ) -> Option<(EndpointAndStaticInfo, Box<dyn VirtualDevice>)> {
        let Some(device) = self.native.create_virtual_device(config) else {
            log::warn!("Failed to create virtual device \"{name}\"", name = config.name);
            return None;
        };
        let id = EndpointId::bidirectional(device.endpoint_id());
        let connection = self.open_device(IoKind::Src, &id)?;
        let info = StaticDeviceInfo::default()
            .with_name(config.name.clone())
            .with_transport(Transport::Ump)
            .with_has_source(true)
            .with_has_destination(true);
        let entry = EndpointAndStaticInfo {
            id,
            endpoint: config.to_endpoint(),
            info,
        };
        let device = ServiceVirtualDevice {
            device,
            _connection: connection,
        };
        Some((entry, Box::new(device)))
    }
}

fn change_from_event(event: WatcherEvent<ServiceEndpointInfo>) -> Change {
    match event {
        WatcherEvent::Added { info, .. } | WatcherEvent::Updated { info, .. } => {
            Change::Insert(make_entry(&info))
        }
        WatcherEvent::Removed { id } => Change::Remove(EndpointId::bidirectional(id)),
        WatcherEvent::EnumerationCompleted { devices } => Change::Replace(
            devices
                .iter()
                .map(|(_, info)| make_entry(info))
                .collect(),
        ),
    }
}

pub(crate) struct SessionServiceBackend {
    service: Arc<dyn SessionService>,
    registry: Arc<Registry>,
    watcher: Mutex<Box<dyn DeviceWatcher<ServiceEndpointInfo>>>,
    config: Config,
}

impl SessionServiceBackend {
    pub(crate) fn open(
        service: Arc<dyn SessionService>,
        config: &Config,
        listener: Arc<dyn EndpointsListener>,
    ) -> Result<Self, Unavailable> {
        let kind = BackendKind::SessionService;
        let mut watcher = service
            .create_watcher()
            .map_err(|err| Unavailable::new(kind, err.to_string()))?;
        let registry = Arc::new(Registry::new(spawn_worker(kind)?, listener));
        let weak_registry = Arc::downgrade(&registry);
        watcher
            .start(Box::new(move |event| {
                let Some(registry) = weak_registry.upgrade() else {
                    return;
                };
                registry.enqueue(change_from_event(event));
            }))
            .map_err(|err| Unavailable::new(kind, err.to_string()))?;
        Ok(Self {
            service,
            registry,
            watcher: Mutex::new(watcher),
            config: config.clone(),
        })
    }
}

impl Drop for SessionServiceBackend {
    fn drop(&mut self) {
        self.watcher.get_mut().stop();
    }
}

impl EndpointsBackend for SessionServiceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SessionService
    }

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn make_session(&self, name: &str) -> Option<Box<dyn SessionBackend>> {
        let Some(native) = self.service.create_session(name) else {
            log::warn!("Failed to create native session \"{name}\"");
            return None;
        };
        Some(Box::new(ServiceSession {
            native,
            connections: Default::default(),
            worker: self.registry.worker().clone(),
            config: self.config.clone(),
        }))
    }

    fn is_virtual_ump_service_active(&self) -> bool {
        self.service.is_virtual_device_transport_available()
    }

    fn is_virtual_bytestream_service_active(&self) -> bool {
        self.service.is_virtual_device_transport_available()
    }
}
