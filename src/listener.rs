// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Callback traits and weak listener registrations.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::ump::View;

/// Receives inbound packets.
///
/// Invoked synchronously from whatever thread the native backend delivers
/// its data on. Implementations must not block.
pub trait Consumer: Send + Sync {
    /// `timestamp` is measured in seconds on the local monotonic clock.
    fn consume(&self, packet: View<'_>, timestamp: f64);
}

impl<F> Consumer for F
where
    F: Fn(View<'_>, f64) + Send + Sync,
{
    fn consume(&self, packet: View<'_>, timestamp: f64) {
        self(packet, timestamp);
    }
}

/// Notified once after the device behind a connection has disappeared.
pub trait DisconnectionListener: Send + Sync {
    fn disconnected(&self);
}

impl<F> DisconnectionListener for F
where
    F: Fn() + Send + Sync,
{
    fn disconnected(&self) {
        self();
    }
}

/// Notified after the set of available endpoints has changed.
pub trait EndpointsListener: Send + Sync {
    fn endpoints_changed(&self);
}

impl<F> EndpointsListener for F
where
    F: Fn() + Send + Sync,
{
    fn endpoints_changed(&self) {
        self();
    }
}

/// Ignores all notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoListener;

impl DisconnectionListener for NoListener {
    fn disconnected(&self) {}
}

impl EndpointsListener for NoListener {
    fn endpoints_changed(&self) {}
}

/// Registrations that do not keep their listeners alive.
///
/// Callbacks are always invoked on a copy of the registrations without
/// holding the lock, i.e. listeners may add or remove registrations from
/// within their callbacks.
pub(crate) struct ListenerList<T: ?Sized> {
    entries: Mutex<Vec<Weak<T>>>,
}

impl<T: ?Sized> std::fmt::Debug for ListenerList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerList")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

impl<T: ?Sized> Default for ListenerList<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> ListenerList<T> {
    /// Returns `false` if the listener has already been registered.
    pub(crate) fn add(&self, listener: &Arc<T>) -> bool {
        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.strong_count() > 0);
        if entries
            .iter()
            .any(|entry| std::ptr::addr_eq(entry.as_ptr(), Arc::as_ptr(listener)))
        {
            return false;
        }
        entries.push(Arc::downgrade(listener));
        true
    }

    /// Returns `false` if the listener was not registered.
    pub(crate) fn remove(&self, listener: &Arc<T>) -> bool {
        let mut removed = false;
        self.entries.lock().retain(|entry| {
            if std::ptr::addr_eq(entry.as_ptr(), Arc::as_ptr(listener)) {
                removed = true;
                return false;
            }
            entry.strong_count() > 0
        });
        removed
    }

    /// Strong references to all listeners that are still alive.
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.lock().iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn weak_snapshot(&self) -> Vec<Weak<T>> {
        self.entries.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}
