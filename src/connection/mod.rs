// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Native connections shared by multiple inputs and outputs.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;

use crate::{
    config::{CancellationToken, Config},
    endpoint::EndpointId,
    listener::{Consumer, DisconnectionListener, ListenerList},
    ump::{bytestream::BytestreamToUmp, timestamp::TimestampConverter, views, Group, View},
    worker::WorkerHandle,
};

#[cfg(test)]
mod tests;

/// A single open native handle.
pub(crate) trait SharedDevice: Send + Sync {
    fn endpoint_id(&self) -> &EndpointId;

    fn hub(&self) -> &Hub;

    /// Sends packets to the device.
    ///
    /// Returns `false` if the device is not able to send or if
    /// the native transfer failed.
    fn send(&self, words: &[u32]) -> bool;

    /// Sends packets and aborts waiting for the device once `cancellation`
    /// has been cancelled.
    ///
    /// Devices that never wait for native transfers ignore `cancellation`.
    fn send_cancellable(&self, words: &[u32], cancellation: &CancellationToken) -> bool {
        let _ = cancellation;
        self.send(words)
    }
}

/// Fan-out of inbound data and disconnection events.
#[derive(Debug)]
pub(crate) struct Hub {
    consumers: ListenerList<dyn Consumer>,
    listeners: ListenerList<dyn DisconnectionListener>,
    disconnected: AtomicBool,
    worker: WorkerHandle,
}

impl Hub {
    pub(crate) fn new(worker: WorkerHandle) -> Self {
        Self {
            consumers: Default::default(),
            listeners: Default::default(),
            disconnected: AtomicBool::new(false),
            worker,
        }
    }

    pub(crate) fn add_consumer(&self, consumer: &Arc<dyn Consumer>) {
        self.consumers.add(consumer);
    }

    pub(crate) fn remove_consumer(&self, consumer: &Arc<dyn Consumer>) {
        self.consumers.remove(consumer);
    }

    pub(crate) fn add_disconnection_listener(&self, listener: &Arc<dyn DisconnectionListener>) {
        self.listeners.add(listener);
    }

    pub(crate) fn remove_disconnection_listener(&self, listener: &Arc<dyn DisconnectionListener>) {
        self.listeners.remove(listener);
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Delivers a single packet to all consumers.
    pub(crate) fn deliver(&self, packet: View<'_>, timestamp: f64) {
        if self.is_disconnected() {
            return;
        }
        for consumer in self.consumers.snapshot() {
            consumer.consume(packet, timestamp);
        }
    }

    /// Delivers all packets of a word buffer to all consumers.
    pub(crate) fn deliver_words(&self, words: &[u32], timestamp: f64) {
        if self.is_disconnected() || words.is_empty() {
            return;
        }
        let consumers = self.consumers.snapshot();
        for packet in views(words) {
            for consumer in &consumers {
                consumer.consume(packet, timestamp);
            }
        }
    }

    /// Reports the disappearance of the native device.
    ///
    /// Only the first invocation has an effect. Listeners are notified
    /// asynchronously on the worker thread.
    pub(crate) fn notify_disconnected(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            log::trace!("Ignoring repeated disconnection");
            return;
        }
        let listeners = self.listeners.weak_snapshot();
        let posted = self.worker.post(move || {
            for listener in listeners.iter().filter_map(Weak::upgrade) {
                listener.disconnected();
            }
        });
        if !posted {
            log::warn!("Unable to deliver disconnection notification");
        }
    }
}

/// A hub that is fed with legacy MIDI 1.0 bytes.
///
/// Inbound bytes are framed into packets on group 0 and stamped with
/// host time.
#[derive(Debug)]
pub(crate) struct BytestreamInput {
    hub: Hub,
    parser: Mutex<(BytestreamToUmp, TimestampConverter)>,
}

impl BytestreamInput {
    pub(crate) fn new(worker: WorkerHandle, config: &Config) -> Self {
        let parser =
            BytestreamToUmp::new(Group::default()).with_max_sysex_payload(config.sysex_payload());
        Self {
            hub: Hub::new(worker),
            parser: Mutex::new((parser, config.timestamp_converter())),
        }
    }

    pub(crate) const fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Messages may be split across multiple invocations.
    pub(crate) fn receive(&self, bytes: &[u8], elapsed_millis: f64) {
        let mut parser = self.parser.lock();
        let (parser, timestamps) = &mut *parser;
        let timestamp = timestamps.convert(elapsed_millis);
        log::trace!("Received {bytes:02x?} at {timestamp}");
        parser.dispatch(bytes, timestamp, |packet, timestamp| {
            self.hub.deliver(packet, timestamp);
        });
    }
}

/// Remembers open devices without keeping them alive.
///
/// At most one live device exists per endpoint id. The native handle is
/// closed when the last input or output that uses it is dropped.
pub(crate) struct ConnectionCache<D: ?Sized> {
    devices: Mutex<HashMap<EndpointId, Weak<D>>>,
}

impl<D: ?Sized> std::fmt::Debug for ConnectionCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("len", &self.devices.lock().len())
            .finish()
    }
}

impl<D: ?Sized> Default for ConnectionCache<D> {
    fn default() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }
}

impl<D> ConnectionCache<D>
where
    D: SharedDevice + ?Sized,
{
    /// Returns the live device for `id` or opens a new one.
    ///
    /// `open_internal` is invoked while holding the lock of the cache,
    /// i.e. concurrent requests for the same id will share the result of
    /// a single invocation.
    ///
    /// A device that has been disconnected is still returned as long as it
    /// is referenced, because its native handle has not been closed yet.
    /// The device is reopened after all of its users have been dropped.
    pub(crate) fn open(
        &self,
        id: &EndpointId,
        open_internal: impl FnOnce(&EndpointId) -> Option<Arc<D>>,
    ) -> Option<Arc<D>> {
        debug_assert!(!id.is_empty());
        let mut devices = self.devices.lock();
        if let Some(device) = devices.get(id).and_then(Weak::upgrade) {
            if device.hub().is_disconnected() {
                log::debug!("Device {id} is disconnected but still in use");
            }
            return Some(device);
        }
        devices.retain(|_, device| device.strong_count() > 0);
        let Some(device) = open_internal(id) else {
            log::warn!("Failed to open device {id}");
            return None;
        };
        log::debug!("Opened device {id}");
        devices.insert(id.clone(), Arc::downgrade(&device));
        Some(device)
    }

    /// All devices that are currently open.
    #[cfg(test)]
    pub(crate) fn live(&self) -> Vec<Arc<D>> {
        self.devices
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}
