// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Logical inputs and outputs on top of shared native connections.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    backend::BackendKind,
    config::CancellationToken,
    connection::SharedDevice,
    endpoint::{
        Block, BlockDirection, DeviceInfo, Endpoint, EndpointAndStaticInfo, EndpointId, IoKind,
        StaticDeviceInfo,
    },
    listener::{Consumer, DisconnectionListener},
    registry::{Registry, VirtualEntry},
    ump::{GenericConverter, PacketProtocol, View},
};

#[cfg(test)]
mod tests;

/// Native side of an endpoints service.
pub(crate) trait EndpointsBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn registry(&self) -> &Arc<Registry>;

    fn make_session(&self, name: &str) -> Option<Box<dyn SessionBackend>>;

    fn is_virtual_ump_service_active(&self) -> bool {
        false
    }

    fn is_virtual_bytestream_service_active(&self) -> bool {
        false
    }
}

/// Native side of a [`Session`].
pub(crate) trait SessionBackend: Send + Sync {
    /// Opens or reuses the shared device for one side of an endpoint.
    fn open_device(&self, kind: IoKind, id: &EndpointId) -> Option<Arc<dyn SharedDevice>>;

    /// Registers a virtual device with the native service.
    ///
    /// Returns the registry entry of the new endpoint and its native handle.
    fn create_virtual_device(
        &self,
        config: &VirtualEndpointConfig,
    ) -> Option<(EndpointAndStaticInfo, Box<dyn VirtualDevice>)> {
        log::debug!(
            "Virtual endpoint \"{name}\" is not supported by this backend",
            name = config.name
        );
        None
    }
}

/// Native handle of a virtual device.
///
/// The device disappears when the handle is dropped.
pub(crate) trait VirtualDevice: Send + Sync {
    fn update_name(&self, name: &str) -> bool;

    fn update_block(&self, index: usize, block: &Block) -> bool;
}

/// Properties of a new virtual endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEndpointConfig {
    pub name: String,
    pub device_info: DeviceInfo,
    pub product_instance_id: String,
    pub protocol: PacketProtocol,
    pub blocks: Vec<Block>,
    pub static_blocks: bool,
}

impl VirtualEndpointConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_info: DeviceInfo::default(),
            product_instance_id: String::new(),
            protocol: PacketProtocol::Midi2,
            blocks: Vec::new(),
            static_blocks: true,
        }
    }

    #[must_use]
    pub const fn with_device_info(mut self, device_info: DeviceInfo) -> Self {
        self.device_info = device_info;
        self
    }

    #[must_use]
    pub fn with_product_instance_id(mut self, product_instance_id: impl Into<String>) -> Self {
        self.product_instance_id = product_instance_id.into();
        self
    }

    #[must_use]
    pub const fn with_protocol(mut self, protocol: PacketProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn with_blocks(mut self, blocks: impl IntoIterator<Item = Block>) -> Self {
        self.blocks = blocks.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn with_static_blocks(mut self, static_blocks: bool) -> Self {
        self.static_blocks = static_blocks;
        self
    }

    /// A MIDI 1.0 endpoint with a single block.
    #[must_use]
    pub fn legacy(name: impl Into<String>, direction: BlockDirection) -> Self {
        let name = name.into();
        Self::new(name.clone())
            .with_protocol(PacketProtocol::Midi1)
            .with_blocks([Block::legacy(name, direction)])
    }

    /// The endpoint as announced to other clients.
    #[must_use]
    pub fn to_endpoint(&self) -> Endpoint {
        Endpoint::default()
            .with_name(self.name.clone())
            .with_protocol(self.protocol)
            .with_device_info(self.device_info)
            .with_product_instance_id(self.product_instance_id.clone())
            .with_midi1_support(self.protocol == PacketProtocol::Midi1)
            .with_midi2_support(self.protocol == PacketProtocol::Midi2)
            .with_blocks(self.blocks.iter().cloned())
            .with_static_blocks(self.static_blocks)
    }
}

/// Named context for connecting to endpoints.
///
/// Connections that are opened through the same session share their
/// native handles.
pub struct Session {
    name: String,
    registry: Arc<Registry>,
    backend: Box<dyn SessionBackend>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        name: impl Into<String>,
        registry: Arc<Registry>,
        backend: Box<dyn SessionBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            backend,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receives packets from the source side of an endpoint.
    ///
    /// All packets are converted into `protocol` before they are passed to
    /// `consumer`. The `listener` is notified once if the device disappears.
    ///
    /// Returns `None` if the endpoint could not be opened.
    #[must_use]
    pub fn connect_input(
        &self,
        listener: Arc<dyn DisconnectionListener>,
        id: &EndpointId,
        protocol: PacketProtocol,
        consumer: Arc<dyn Consumer>,
    ) -> Option<Input> {
        debug_assert!(!id.is_empty());
        if id.src().is_empty() {
            log::warn!("Endpoint {id} has no src side");
            return None;
        }
        let device = self.backend.open_device(IoKind::Src, id)?;
        Input::new(device, listener, protocol, consumer)
    }

    /// Sends packets to the destination side of an endpoint.
    ///
    /// Returns `None` if the endpoint could not be opened.
    #[must_use]
    pub fn connect_output(
        &self,
        listener: Arc<dyn DisconnectionListener>,
        id: &EndpointId,
    ) -> Option<Output> {
        debug_assert!(!id.is_empty());
        if id.dst().is_empty() {
            log::warn!("Endpoint {id} has no dst side");
            return None;
        }
        let device = self.backend.open_device(IoKind::Dst, id)?;
        Output::new(device, listener)
    }

    /// Announces a new endpoint to other clients.
    ///
    /// The endpoint exists as long as the returned handle is alive.
    /// Returns `None` if the backend does not support virtual endpoints.
    #[must_use]
    pub fn create_virtual_endpoint(
        &self,
        config: &VirtualEndpointConfig,
    ) -> Option<VirtualEndpoint> {
        let (entry, device) = self.backend.create_virtual_device(config)?;
        let entry = Arc::new(RwLock::new(entry));
        self.registry.add_virtual_endpoint(&entry);
        Some(VirtualEndpoint { entry, device })
    }

    /// A virtual endpoint that receives MIDI 1.0 data from other clients.
    #[must_use]
    pub fn create_legacy_virtual_input(&self, name: &str) -> Option<VirtualEndpoint> {
        self.create_virtual_endpoint(&VirtualEndpointConfig::legacy(
            name,
            BlockDirection::Receiver,
        ))
    }

    /// A virtual endpoint that sends MIDI 1.0 data to other clients.
    #[must_use]
    pub fn create_legacy_virtual_output(&self, name: &str) -> Option<VirtualEndpoint> {
        self.create_virtual_endpoint(&VirtualEndpointConfig::legacy(name, BlockDirection::Sender))
    }
}

/// Endpoint that has been created by this process.
pub struct VirtualEndpoint {
    entry: Arc<VirtualEntry>,
    device: Box<dyn VirtualDevice>,
}

impl fmt::Debug for VirtualEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualEndpoint")
            .field("entry", &*self.entry.read())
            .finish_non_exhaustive()
    }
}

impl VirtualEndpoint {
    #[must_use]
    pub fn id(&self) -> EndpointId {
        self.entry.read().id.clone()
    }

    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.entry.read().endpoint.clone()
    }

    #[must_use]
    pub fn static_device_info(&self) -> StaticDeviceInfo {
        self.entry.read().info.clone()
    }

    /// Renames the endpoint.
    ///
    /// Returns `false` if the native service rejected the update.
    pub fn set_name(&self, name: &str) -> bool {
        if !self.device.update_name(name) {
            return false;
        }
        let mut entry = self.entry.write();
        entry.endpoint = entry.endpoint.clone().with_name(name);
        true
    }

    /// Replaces an existing block.
    ///
    /// Returns `false` if there is no block at `index` or if the native
    /// service rejected the update.
    pub fn set_block(&self, index: usize, block: Block) -> bool {
        if index >= self.entry.read().endpoint.blocks().len() {
            return false;
        }
        if !self.device.update_block(index, &block) {
            return false;
        }
        self.entry.write().endpoint.set_block(index, block)
    }
}

struct InputInner {
    converter: Mutex<GenericConverter>,
    consumer: Arc<dyn Consumer>,
    listener: Arc<dyn DisconnectionListener>,
    disconnected: AtomicBool,
}

impl Consumer for InputInner {
    fn consume(&self, packet: View<'_>, timestamp: f64) {
        if self.disconnected.load(Ordering::Acquire) {
            return;
        }
        self.converter
            .lock()
            .convert(packet, |packet| self.consumer.consume(packet, timestamp));
    }
}

impl DisconnectionListener for InputInner {
    fn disconnected(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.disconnected();
    }
}

/// Receives packets from a single endpoint.
///
/// Deregisters from the shared connection when dropped.
pub struct Input {
    inner: Arc<InputInner>,
    device: Arc<dyn SharedDevice>,
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Input")
            .field("endpoint_id", self.device.endpoint_id())
            .field("protocol", &self.protocol())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl Input {
    fn new(
        device: Arc<dyn SharedDevice>,
        listener: Arc<dyn DisconnectionListener>,
        protocol: PacketProtocol,
        consumer: Arc<dyn Consumer>,
    ) -> Option<Self> {
        let inner = Arc::new(InputInner {
            converter: Mutex::new(GenericConverter::new(protocol)),
            consumer,
            listener,
            disconnected: AtomicBool::new(false),
        });
        let input = Self { inner, device };
        let hub = input.device.hub();
        hub.add_consumer(&input.as_consumer());
        hub.add_disconnection_listener(&input.as_disconnection_listener());
        if hub.is_disconnected() {
            log::debug!(
                "Device {id} disconnected while connecting input",
                id = input.device.endpoint_id()
            );
            return None;
        }
        Some(input)
    }

    fn as_consumer(&self) -> Arc<dyn Consumer> {
        Arc::clone(&self.inner) as _
    }

    fn as_disconnection_listener(&self) -> Arc<dyn DisconnectionListener> {
        Arc::clone(&self.inner) as _
    }

    #[must_use]
    pub fn endpoint_id(&self) -> &EndpointId {
        self.device.endpoint_id()
    }

    #[must_use]
    pub fn protocol(&self) -> PacketProtocol {
        self.inner.converter.lock().protocol()
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.device.hub().is_disconnected()
    }
}

impl Drop for Input {
    fn drop(&mut self) {
        let hub = self.device.hub();
        hub.remove_consumer(&self.as_consumer());
        hub.remove_disconnection_listener(&self.as_disconnection_listener());
    }
}

/// Forwards the disconnection of a device once.
struct OutputListener {
    listener: Arc<dyn DisconnectionListener>,
    disconnected: AtomicBool,
}

impl DisconnectionListener for OutputListener {
    fn disconnected(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.disconnected();
    }
}

/// Sends packets to a single endpoint.
pub struct Output {
    listener: Arc<OutputListener>,
    device: Arc<dyn SharedDevice>,
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("endpoint_id", self.device.endpoint_id())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl Output {
    fn new(
        device: Arc<dyn SharedDevice>,
        listener: Arc<dyn DisconnectionListener>,
    ) -> Option<Self> {
        let output = Self {
            listener: Arc::new(OutputListener {
                listener,
                disconnected: AtomicBool::new(false),
            }),
            device,
        };
        let hub = output.device.hub();
        hub.add_disconnection_listener(&output.as_disconnection_listener());
        if hub.is_disconnected() {
            log::debug!(
                "Device {id} disconnected while connecting output",
                id = output.device.endpoint_id()
            );
            return None;
        }
        Some(output)
    }

    fn as_disconnection_listener(&self) -> Arc<dyn DisconnectionListener> {
        Arc::clone(&self.listener) as _
    }

    #[must_use]
    pub fn endpoint_id(&self) -> &EndpointId {
        self.device.endpoint_id()
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.device.hub().is_disconnected()
    }

    /// Sends a sequence of packets.
    ///
    /// Blocks until a native transfer has completed. Returns `false` after
    /// the device has been disconnected or if the transfer failed.
    pub fn send(&self, words: &[u32]) -> bool {
        self.send_with(words, None)
    }

    /// Sends a sequence of packets unless `cancellation` has been cancelled.
    ///
    /// Waiting for the device to consume long messages is abandoned once
    /// `cancellation` has been cancelled. All packets that have not been
    /// handed over to the device by then are discarded and `false` is
    /// returned. Other outputs and later sends are not affected.
    pub fn send_cancellable(&self, words: &[u32], cancellation: &CancellationToken) -> bool {
        self.send_with(words, Some(cancellation))
    }

    fn send_with(&self, words: &[u32], cancellation: Option<&CancellationToken>) -> bool {
        if self.is_disconnected() {
            log::debug!(
                "Cannot send to disconnected device {id}",
                id = self.endpoint_id()
            );
            return false;
        }
        if words.is_empty() {
            return true;
        }
        log::trace!("Sending {words:08x?} to {id}", id = self.endpoint_id());
        match cancellation {
            Some(cancellation) => self.device.send_cancellable(words, cancellation),
            None => self.device.send(words),
        }
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        self.device
            .hub()
            .remove_disconnection_listener(&self.as_disconnection_listener());
    }
}
