// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Device discovery and hotplug notifications.

use std::{borrow::Cow, collections::BTreeMap, thread::JoinHandle, time::Duration};

use crossbeam_channel::{RecvTimeoutError, Sender};
use thiserror::Error;


/// Default interval between two enumerations of a [`PollingWatcher`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent<I> {
    Added { id: String, info: I },
    Removed { id: String },
    Updated { id: String, info: I },
    /// The initial enumeration has finished.
    ///
    /// Contains all devices that have been discovered so far.
    EnumerationCompleted { devices: Vec<(String, I)> },
}

impl<I> WatcherEvent<I> {
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Added { id, .. } | Self::Removed { id } | Self::Updated { id, .. } => Some(id),
            Self::EnumerationCompleted { .. } => None,
        }
    }
}

pub type WatcherCallback<I> = Box<dyn FnMut(WatcherEvent<I>) + Send>;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("device watcher unavailable: {reason}")]
    Unavailable { reason: Cow<'static, str> },
    #[error("device watcher has already been started")]
    AlreadyStarted,
    #[error(transparent)]
    Spawn(#[from] std::io::Error),
}

/// Native device enumeration and notification facility.
///
/// Events are delivered on a background thread. Callbacks never overlap.
pub trait DeviceWatcher<I>: Send {
    fn start(&mut self, callback: WatcherCallback<I>) -> Result<(), WatcherError>;

    /// Stops the delivery of events.
    ///
    /// No callbacks are invoked after this function has returned.
    fn stop(&mut self);
}

/// Discovers devices by repeatedly enumerating them on a dedicated thread.
///
/// For native facilities that do not offer hotplug notifications.
/// Devices with the same id are merged.
pub struct PollingWatcher<I, E> {
    poll_interval: Duration,
    enumerate: Option<E>,
    thread: Option<(Sender<()>, JoinHandle<()>)>,
    _info: std::marker::PhantomData<fn() -> I>,
}

impl<I, E> std::fmt::Debug for PollingWatcher<I, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingWatcher")
            .field("poll_interval", &self.poll_interval)
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl<I, E> PollingWatcher<I, E>
where
    I: Clone + PartialEq + Send + 'static,
    E: FnMut() -> Vec<(String, I)> + Send + 'static,
{
    #[must_use]
    pub const fn new(poll_interval: Duration, enumerate: E) -> Self {
        Self {
            poll_interval,
            enumerate: Some(enumerate),
            thread: None,
            _info: std::marker::PhantomData,
        }
    }
}

impl<I, E> PollingWatcher<I, E> {
    fn join(&mut self) -> anyhow::Result<()> {
        let Some((stop_tx, os_thread)) = self.thread.take() else {
            return Ok(());
        };
        // The thread also terminates if the channel has been disconnected.
        let _ = stop_tx.send(());
        if os_thread.thread().id() == std::thread::current().id() {
            // Stopped from within a callback
            return Ok(());
        }
        os_thread
            .join()
            .map_err(|err| anyhow::anyhow!("Device watcher thread panicked: {err:?}"))
    }
}

impl<I, E> DeviceWatcher<I> for PollingWatcher<I, E>
where
    I: Clone + PartialEq + Send + 'static,
    E: FnMut() -> Vec<(String, I)> + Send + 'static,
{
    fn start(&mut self, mut callback: WatcherCallback<I>) -> Result<(), WatcherError> {
        let Some(mut enumerate) = self.enumerate.take() else {
            return Err(WatcherError::AlreadyStarted);
        };
        let poll_interval = self.poll_interval;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let os_thread = std::thread::Builder::new()
            .name("device-watcher".to_owned())
            .spawn(move || {
                log::debug!("Entering device watcher thread");
                let mut known = BTreeMap::new();
                for (id, info) in enumerate() {
                    known.insert(id, info);
                }
                for (id, info) in &known {
                    callback(WatcherEvent::Added {
                        id: id.clone(),
                        info: info.clone(),
                    });
                }
                callback(WatcherEvent::EnumerationCompleted {
                    devices: known
                        .iter()
                        .map(|(id, info)| (id.clone(), info.clone()))
                        .collect(),
                });
                loop {
                    match stop_rx.recv_timeout(poll_interval) {
                        Err(RecvTimeoutError::Timeout) => (),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let current = enumerate().into_iter().collect::<BTreeMap<_, _>>();
                    for event in diff(&known, &current) {
                        callback(event);
                    }
                    known = current;
                }
                log::debug!("Exiting device watcher thread");
            })?;
        self.thread = Some((stop_tx, os_thread));
        Ok(())
    }

    fn stop(&mut self) {
        if let Err(err) = self.join() {
            log::error!("Failed to stop device watcher: {err}");
        }
    }
}

impl<I, E> Drop for PollingWatcher<I, E> {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            log::error!("Failed to stop device watcher: {err}");
        }
    }
}

fn diff<I: Clone + PartialEq>(
    previous: &BTreeMap<String, I>,
    current: &BTreeMap<String, I>,
) -> Vec<WatcherEvent<I>> {
    let removed = previous
        .keys()
        .filter(|id| !current.contains_key(*id))
        .map(|id| WatcherEvent::Removed { id: id.clone() });
    let added_or_updated = current.iter().filter_map(|(id, info)| match previous.get(id) {
        None => Some(WatcherEvent::Added {
            id: id.clone(),
            info: info.clone(),
        }),
        Some(previous_info) if previous_info != info => Some(WatcherEvent::Updated {
            id: id.clone(),
            info: info.clone(),
        }),
        Some(_) => None,
    });
    removed.chain(added_or_updated).collect()
}
