// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Consistent snapshots of the endpoints of a backend.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    endpoint::{Endpoint, EndpointAndStaticInfo, EndpointId, StaticDeviceInfo},
    listener::EndpointsListener,
    worker::WorkerHandle,
};


/// All endpoints of a backend, ordered by id.
pub type Snapshot = BTreeMap<EndpointId, EndpointAndStaticInfo>;

/// Pending modification of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Change {
    /// Adds or replaces a single entry.
    Insert(EndpointAndStaticInfo),
    Remove(EndpointId),
    /// Replaces all entries.
    Replace(Vec<EndpointAndStaticInfo>),
}

impl Change {
    fn apply(self, snapshot: &mut Snapshot) {
        match self {
            Self::Insert(entry) => {
                log::debug!("Inserting endpoint {id}", id = entry.id);
                snapshot.insert(entry.id.clone(), entry);
            }
            Self::Remove(id) => {
                if snapshot.remove(&id).is_some() {
                    log::debug!("Removed endpoint {id}");
                } else {
                    log::debug!("Endpoint {id} has already been removed");
                }
            }
            Self::Replace(entries) => {
                log::debug!("Replacing all endpoints with {count} entries", count = entries.len());
                snapshot.clear();
                for entry in entries {
                    debug_assert!(!snapshot.contains_key(&entry.id));
                    snapshot.insert(entry.id.clone(), entry);
                }
            }
        }
    }
}

/// Live state of a virtual endpoint.
///
/// Owned by the virtual endpoint and only referenced weakly by the
/// registry.
pub(crate) type VirtualEntry = RwLock<EndpointAndStaticInfo>;

/// Endpoint registry of a single backend.
///
/// Changes are queued by the native watcher callbacks and applied on the
/// worker thread. Readers always observe a complete snapshot.
pub(crate) struct Registry {
    snapshot: RwLock<Arc<Snapshot>>,
    pending: Mutex<VecDeque<Change>>,
    update_pending: AtomicBool,
    virtual_endpoints: Mutex<BTreeMap<EndpointId, Weak<VirtualEntry>>>,
    listener: Arc<dyn EndpointsListener>,
    worker: WorkerHandle,
    #[cfg(feature = "observables")]
    publisher: discro::Publisher<Arc<Snapshot>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.snapshot.read().len())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub(crate) fn new(worker: WorkerHandle, listener: Arc<dyn EndpointsListener>) -> Self {
        let snapshot = Arc::new(Snapshot::new());
        Self {
            #[cfg(feature = "observables")]
            publisher: discro::Publisher::new(Arc::clone(&snapshot)),
            snapshot: RwLock::new(snapshot),
            pending: Mutex::new(VecDeque::new()),
            update_pending: AtomicBool::new(false),
            virtual_endpoints: Mutex::new(BTreeMap::new()),
            listener,
            worker,
        }
    }

    /// Populates a new registry without notifying the listener.
    #[must_use]
    pub(crate) fn with_entries(
        mut self,
        entries: impl IntoIterator<Item = EndpointAndStaticInfo>,
    ) -> Self {
        let mut snapshot = Snapshot::new();
        Change::Replace(entries.into_iter().collect()).apply(&mut snapshot);
        let snapshot = Arc::new(snapshot);
        #[cfg(feature = "observables")]
        self.publisher.write(Arc::clone(&snapshot));
        *self.snapshot.get_mut() = snapshot;
        self
    }

    pub(crate) const fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// Queues a change and schedules its application.
    ///
    /// Never blocks on the worker. Multiple changes that are queued before
    /// the worker gets to run are applied as a single batch.
    pub(crate) fn enqueue(self: &Arc<Self>, change: Change) {
        self.pending.lock().push_back(change);
        if self.update_pending.swap(true, Ordering::AcqRel) {
            // Already scheduled
            return;
        }
        let registry = Arc::downgrade(self);
        let posted = self.worker.post(move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            registry.apply_pending();
        });
        if !posted {
            log::warn!("Unable to schedule registry update");
        }
    }

    /// Applies all queued changes as a single batch.
    fn apply_pending(&self) {
        self.update_pending.store(false, Ordering::Release);
        let changes = std::mem::take(&mut *self.pending.lock());
        if changes.is_empty() {
            return;
        }
        let mut next = Snapshot::clone(&self.snapshot.read());
        for change in changes {
            change.apply(&mut next);
        }
        let next = Arc::new(next);
        *self.snapshot.write() = Arc::clone(&next);
        #[cfg(feature = "observables")]
        self.publisher.write(next);
        #[cfg(not(feature = "observables"))]
        drop(next);
        self.listener.endpoints_changed();
    }

    /// The current snapshot.
    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    #[cfg(feature = "observables")]
    pub(crate) fn subscribe(&self) -> discro::Subscriber<Arc<Snapshot>> {
        self.publisher.subscribe()
    }

    pub(crate) fn endpoints(&self) -> Vec<EndpointId> {
        self.snapshot.read().keys().cloned().collect()
    }

    pub(crate) fn endpoint(&self, id: &EndpointId) -> Option<Endpoint> {
        if let Some(entry) = self.virtual_entry(id) {
            return Some(entry.read().endpoint.clone());
        }
        self.snapshot
            .read()
            .get(id)
            .map(|entry| entry.endpoint.clone())
    }

    pub(crate) fn static_device_info(&self, id: &EndpointId) -> Option<StaticDeviceInfo> {
        if let Some(entry) = self.virtual_entry(id) {
            return Some(entry.read().info.clone());
        }
        self.snapshot.read().get(id).map(|entry| entry.info.clone())
    }

    /// Makes a virtual endpoint visible to lookups while it is alive.
    pub(crate) fn add_virtual_endpoint(&self, entry: &Arc<VirtualEntry>) {
        let id = entry.read().id.clone();
        debug_assert!(!id.is_empty());
        let mut virtual_endpoints = self.virtual_endpoints.lock();
        virtual_endpoints.retain(|_, entry| entry.strong_count() > 0);
        log::debug!("Adding virtual endpoint {id}");
        virtual_endpoints.insert(id, Arc::downgrade(entry));
    }

    fn virtual_entry(&self, id: &EndpointId) -> Option<Arc<VirtualEntry>> {
        self.virtual_endpoints.lock().get(id).and_then(Weak::upgrade)
    }
}
