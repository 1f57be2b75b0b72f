// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Backend for legacy object-broker services.
//!
//! Brokers only know unidirectional MIDI 1.0 ports. Every port is exposed
//! as a proxy endpoint that is identified by the container id of the
//! physical device. Ports are opened asynchronously and the pending
//! operation is abandoned after [`Config::broker_open_timeout`].

use std::{fmt, sync::Arc, thread};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use super::{spawn_worker, BackendKind, Unavailable};
use crate::{
    config::Config,
    connection::{BytestreamInput, ConnectionCache, Hub, SharedDevice},
    endpoint::{
        append_numbers_to_duplicates, make_proxy_endpoint, EndpointAndStaticInfo, EndpointId,
        IoKind,
    },
    listener::{EndpointsListener, ListenerList},
    registry::{Change, Registry},
    session::{EndpointsBackend, SessionBackend},
    ump::to_bytestream::ToBytestream,
    watcher::{DeviceWatcher, WatcherError, WatcherEvent},
    worker::WorkerHandle,
};


/// Port metadata as reported by the broker.
///
/// Watcher events are keyed by the native device id of the port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrokerDeviceInfo {
    pub name: String,
    /// Id of the physical device that contains the port.
    ///
    /// Shared by the input and output ports of a device.
    pub container_id: String,
}

/// Entry point into the broker service.
pub trait DeviceBroker: Send + Sync {
    /// Watches the input ports for [`IoKind::Src`] or the output ports
    /// for [`IoKind::Dst`].
    fn create_watcher(
        &self,
        kind: IoKind,
    ) -> Result<Box<dyn DeviceWatcher<BrokerDeviceInfo>>, WatcherError>;

    /// Watches Bluetooth LE devices, keyed by their container id.
    ///
    /// Optional. Without it disconnected wireless devices are only
    /// noticed when the broker removes their ports.
    fn create_ble_watcher(&self) -> Result<Box<dyn DeviceWatcher<()>>, WatcherError>;

    /// Opens an input port.
    ///
    /// The port must report inbound bytes through `events` until it is
    /// dropped.
    fn open_input(
        &self,
        device_id: &str,
        events: PortEvents,
    ) -> BoxFuture<'static, Option<Box<dyn BrokerPort>>>;

    fn open_output(&self, device_id: &str) -> BoxFuture<'static, Option<Box<dyn BrokerPort>>>;
}

/// An open broker port.
///
/// Closed when dropped.
pub trait BrokerPort: Send + Sync {
    /// Transmits a complete MIDI 1.0 message.
    ///
    /// Input ports do not support sending.
    fn send_bytes(&self, bytes: &[u8]) -> bool {
        let _ = bytes;
        false
    }
}

/// Callbacks of an open broker port.
#[derive(Clone)]
pub struct PortEvents {
    input: Arc<BytestreamInput>,
}

impl fmt::Debug for PortEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortEvents")
            .field("disconnected", &self.input.hub().is_disconnected())
            .finish_non_exhaustive()
    }
}

impl PortEvents {
    fn new(worker: WorkerHandle, config: &Config) -> Self {
        Self {
            input: Arc::new(BytestreamInput::new(worker, config)),
        }
    }

    /// Delivers inbound bytes.
    ///
    /// Messages may be split across multiple invocations. `elapsed_millis`
    /// is measured on the native clock since the port has been opened.
    pub fn bytes_received(&self, bytes: &[u8], elapsed_millis: f64) {
        self.input.receive(bytes, elapsed_millis);
    }

    /// The port has been closed by the broker.
    pub fn disconnected(&self) {
        self.input.hub().notify_disconnected();
    }
}

/// A known port.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Port {
    device_id: String,
    info: BrokerDeviceInfo,
}

impl Port {
    fn container_id(&self) -> &str {
        if self.info.container_id.is_empty() {
            &self.device_id
        } else {
            &self.info.container_id
        }
    }
}

/// Ports in order of appearance.
#[derive(Debug, Default)]
struct PortList {
    ports: Vec<Port>,
}

impl PortList {
    /// Returns `true` if the list has been modified.
    fn apply(&mut self, event: WatcherEvent<BrokerDeviceInfo>) -> bool {
        match event {
            WatcherEvent::Added { id, info } | WatcherEvent::Updated { id, info } => {
                self.upsert(id, info)
            }
            WatcherEvent::Removed { id } => {
                let len = self.ports.len();
                self.ports.retain(|port| port.device_id != id);
                self.ports.len() != len
            }
            WatcherEvent::EnumerationCompleted { devices } => {
                let mut modified = false;
                for (id, info) in devices {
                    modified |= self.upsert(id, info);
                }
                modified
            }
        }
    }

    fn upsert(&mut self, device_id: String, info: BrokerDeviceInfo) -> bool {
        if let Some(port) = self
            .ports
            .iter_mut()
            .find(|port| port.device_id == device_id)
        {
            if port.info == info {
                return false;
            }
            port.info = info;
        } else {
            self.ports.push(Port { device_id, info });
        }
        true
    }

    /// Proxy endpoints with unique names and ids.
    fn entries(&self, kind: IoKind) -> impl Iterator<Item = (EndpointAndStaticInfo, &Port)> {
        let mut names: Vec<_> = self.ports.iter().map(|port| port.info.name.clone()).collect();
        let mut ids: Vec<_> = self
            .ports
            .iter()
            .map(|port| port.container_id().to_owned())
            .collect();
        append_numbers_to_duplicates(&mut names);
        append_numbers_to_duplicates(&mut ids);
        ids.into_iter()
            .zip(names)
            .zip(&self.ports)
            .map(move |((id, name), port)| (make_proxy_endpoint(kind, id, name), port))
    }
}

#[derive(Debug, Default)]
struct Ports {
    inputs: PortList,
    outputs: PortList,
}

impl Ports {
    fn list(&self, kind: IoKind) -> &PortList {
        match kind {
            IoKind::Src => &self.inputs,
            IoKind::Dst => &self.outputs,
        }
    }

    fn list_mut(&mut self, kind: IoKind) -> &mut PortList {
        match kind {
            IoKind::Src => &mut self.inputs,
            IoKind::Dst => &mut self.outputs,
        }
    }

    fn entries(&self) -> Vec<EndpointAndStaticInfo> {
        [IoKind::Src, IoKind::Dst]
            .into_iter()
            .flat_map(|kind| self.list(kind).entries(kind).map(|(entry, _)| entry))
            .collect()
    }

    fn resolve(&self, kind: IoKind, id: &EndpointId) -> Option<Port> {
        self.list(kind)
            .entries(kind)
            .find_map(|(entry, port)| (&entry.id == id).then(|| port.clone()))
    }
}

struct BrokerDevice {
    id: EndpointId,
    port: Port,
    events: PortEvents,
    native: Box<dyn BrokerPort>,
    encoder: Mutex<ToBytestream>,
}

impl SharedDevice for BrokerDevice {
    fn endpoint_id(&self) -> &EndpointId {
        &self.id
    }

    fn hub(&self) -> &Hub {
        self.events.input.hub()
    }

    fn send(&self, words: &[u32]) -> bool {
        let mut sent = true;
        self.encoder.lock().convert_words(words, |message| {
            sent &= self.native.send_bytes(message.bytes);
        });
        sent
    }
}

impl Drop for BrokerDevice {
    fn drop(&mut self) {
        log::debug!("Closing port {device_id}", device_id = self.port.device_id);
    }
}

/// State shared by the backend, its sessions and the watcher callbacks.
struct Client {
    broker: Arc<dyn DeviceBroker>,
    registry: Arc<Registry>,
    ports: Mutex<Ports>,
    /// Shared by all sessions. Ports can only be opened once.
    connections: ConnectionCache<BrokerDevice>,
    open_devices: ListenerList<BrokerDevice>,
    runtime: tokio::runtime::Runtime,
    config: Config,
}

impl Client {
    fn port_changed(&self, kind: IoKind, event: WatcherEvent<BrokerDeviceInfo>) {
        let removed_id = match &event {
            WatcherEvent::Removed { id } => Some(id.clone()),
            _ => None,
        };
        let entries = {
            let mut ports = self.ports.lock();
            if !ports.list_mut(kind).apply(event) {
                return;
            }
            ports.entries()
        };
        if let Some(device_id) = removed_id {
            self.disconnect_where(|port| port.device_id == device_id);
        }
        self.registry.enqueue(Change::Replace(entries));
    }

    fn ble_changed(&self, event: WatcherEvent<()>) {
        match event {
            WatcherEvent::Removed { id: container_id } => {
                log::debug!("Bluetooth LE device {container_id} disconnected");
                self.disconnect_where(|port| port.container_id() == container_id);
            }
            WatcherEvent::Added { id, .. } => {
                log::debug!("Bluetooth LE device {id} connected");
            }
            WatcherEvent::Updated { .. } | WatcherEvent::EnumerationCompleted { .. } => (),
        }
    }

    fn disconnect_where(&self, mut matches: impl FnMut(&Port) -> bool) {
        for device in self.open_devices.snapshot() {
            if matches(&device.port) {
                log::info!("Port {id} disconnected", id = device.id);
                device.events.disconnected();
            }
        }
    }

    fn open_port(&self, kind: IoKind, id: &EndpointId) -> Option<Arc<BrokerDevice>> {
        let Some(port) = self.ports.lock().resolve(kind, id) else {
            log::warn!("Unknown port {id}");
            return None;
        };
        let events = PortEvents::new(self.registry.worker().clone(), &self.config);
        let opening = match kind {
            IoKind::Src => self.broker.open_input(&port.device_id, events.clone()),
            IoKind::Dst => self.broker.open_output(&port.device_id),
        };
        let native = self.await_open(&port.device_id, opening)?;
        let device = Arc::new(BrokerDevice {
            id: id.clone(),
            port,
            events,
            native,
            encoder: Mutex::new(ToBytestream::new(self.config.sysex_capacity())),
        });
        self.open_devices.add(&device);
        Some(device)
    }

    /// Waits for a pending open on a separate thread.
    ///
    /// The calling thread might already be driving another runtime.
    fn await_open(
        &self,
        device_id: &str,
        opening: BoxFuture<'static, Option<Box<dyn BrokerPort>>>,
    ) -> Option<Box<dyn BrokerPort>> {
        let timeout = self.config.broker_open_timeout();
        let runtime = &self.runtime;
        let joined = thread::scope(|scope| {
            thread::Builder::new()
                .name("umpio-broker-open".into())
                .spawn_scoped(scope, move || {
                    runtime.block_on(async move { tokio::time::timeout(timeout, opening).await })
                })
                .map(thread::ScopedJoinHandle::join)
        });
        match joined {
            Ok(Ok(Ok(Some(native)))) => {
                log::debug!("Opened port {device_id}");
                Some(native)
            }
            Ok(Ok(Ok(None))) => {
                log::warn!("Failed to open port {device_id}");
                None
            }
            Ok(Ok(Err(_))) => {
                log::warn!("Opening port {device_id} timed out after {timeout:?}");
                None
            }
            Ok(Err(_)) => {
                log::error!("Opening port {device_id} panicked");
                None
            }
            Err(err) => {
                log::warn!("Failed to spawn thread for opening port {device_id}: {err}");
                None
            }
        }
    }
}

struct BrokerSession {
    client: Arc<Client>,
}

impl SessionBackend for BrokerSession {
    fn open_device(&self, kind: IoKind, id: &EndpointId) -> Option<Arc<dyn SharedDevice>> {
        let client = &self.client;
        let device = client
            .connections
            .open(id, |id| client.open_port(kind, id))?;
        Some(device)
    }
}

type PortWatcher = Box<dyn DeviceWatcher<BrokerDeviceInfo>>;

#[derive(Default)]
struct Watchers {
    ports: Vec<PortWatcher>,
    ble: Option<Box<dyn DeviceWatcher<()>>>,
}

pub(crate) struct BrokerBackend {
    client: Arc<Client>,
    watchers: Mutex<Watchers>,
}

impl BrokerBackend {
    pub(crate) fn open(
        broker: Arc<dyn DeviceBroker>,
        config: &Config,
        listener: Arc<dyn EndpointsListener>,
    ) -> Result<Self, Unavailable> {
        let kind = BackendKind::Broker;
        let mut port_watchers = Vec::with_capacity(2);
        for io_kind in [IoKind::Src, IoKind::Dst] {
            let watcher = broker
                .create_watcher(io_kind)
                .map_err(|err| Unavailable::new(kind, err.to_string()))?;
            port_watchers.push((io_kind, watcher));
        }
        let ble_watcher = broker
            .create_ble_watcher()
            .map_err(|err| {
                log::info!("Bluetooth LE devices are not watched: {err}");
            })
            .ok();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| Unavailable::new(kind, format!("failed to create runtime: {err}")))?;
        let client = Arc::new(Client {
            broker,
            registry: Arc::new(Registry::new(spawn_worker(kind)?, listener)),
            ports: Default::default(),
            connections: Default::default(),
            open_devices: Default::default(),
            runtime,
            config: config.clone(),
        });
        let backend = Self {
            client: Arc::clone(&client),
            watchers: Default::default(),
        };
        // Started watchers are stopped when the backend is dropped
        for (io_kind, mut watcher) in port_watchers {
            let weak_client = Arc::downgrade(&client);
            let started = watcher.start(Box::new(move |event| {
                if let Some(client) = weak_client.upgrade() {
                    client.port_changed(io_kind, event);
                }
            }));
            backend.watchers.lock().ports.push(watcher);
            started.map_err(|err| Unavailable::new(kind, err.to_string()))?;
        }
        if let Some(mut watcher) = ble_watcher {
            let weak_client = Arc::downgrade(&client);
            match watcher.start(Box::new(move |event| {
                if let Some(client) = weak_client.upgrade() {
                    client.ble_changed(event);
                }
            })) {
                Ok(()) => backend.watchers.lock().ble = Some(watcher),
                Err(err) => log::info!("Bluetooth LE devices are not watched: {err}"),
            }
        }
        Ok(backend)
    }
}

impl Drop for BrokerBackend {
    fn drop(&mut self) {
        let watchers = self.watchers.get_mut();
        for watcher in &mut watchers.ports {
            watcher.stop();
        }
        if let Some(watcher) = &mut watchers.ble {
            watcher.stop();
        }
    }
}

impl EndpointsBackend for BrokerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Broker
    }

    fn registry(&self) -> &Arc<Registry> {
        &self.client.registry
    }

    fn make_session(&self, _name: &str) -> Option<Box<dyn SessionBackend>> {
        Some(Box::new(BrokerSession {
            client: Arc::clone(&self.client),
        }))
    }
}
