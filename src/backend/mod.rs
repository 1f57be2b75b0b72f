// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Selection of the native backend.

use std::{borrow::Cow, fmt, sync::Arc};

use strum::{Display, EnumIter, EnumString, IntoEnumIterator as _};
use thiserror::Error;

use crate::{
    config::Config,
    endpoint::{Endpoint, EndpointId, StaticDeviceInfo},
    listener::EndpointsListener,
    session::{EndpointsBackend, Session},
    worker::WorkerHandle,
};

#[cfg(feature = "broker")]
pub mod broker;

pub mod low_level;

pub mod session_service;


/// Native backends in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum BackendKind {
    /// Modern service with sessions and native UMP transport.
    SessionService,
    /// Legacy device broker with asynchronous opens.
    Broker,
    /// Low-level blocking byte-stream API.
    LowLevel,
}

/// A backend could not be initialized.
#[derive(Debug, Error)]
#[error("{backend} backend unavailable: {reason}")]
pub struct Unavailable {
    pub backend: BackendKind,
    pub reason: Cow<'static, str>,
}

impl Unavailable {
    pub(crate) fn new(backend: BackendKind, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            backend,
            reason: reason.into(),
        }
    }
}

/// Native services available to the backend selector.
///
/// Services that are missing make the corresponding backend unavailable.
/// The low-level backend falls back to [`midir`](low_level::midir) if
/// enabled.
#[derive(Default)]
pub struct NativeApis {
    pub session_service: Option<Arc<dyn session_service::SessionService>>,
    #[cfg(feature = "broker")]
    pub broker: Option<Arc<dyn broker::DeviceBroker>>,
    pub low_level: Option<Arc<dyn low_level::LowLevelApi>>,
}

impl fmt::Debug for NativeApis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("NativeApis");
        debug.field("session_service", &self.session_service.is_some());
        #[cfg(feature = "broker")]
        debug.field("broker", &self.broker.is_some());
        debug.field("low_level", &self.low_level.is_some());
        debug.finish()
    }
}

/// Endpoints discovered by the selected backend.
pub struct Endpoints {
    backend: Arc<dyn EndpointsBackend>,
}

impl fmt::Debug for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoints")
            .field("backend", &self.backend())
            .field("registry", self.backend.registry())
            .finish()
    }
}

impl Endpoints {
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Ids of all endpoints that are currently available.
    #[must_use]
    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.backend.registry().endpoints()
    }

    #[must_use]
    pub fn endpoint(&self, id: &EndpointId) -> Option<Endpoint> {
        self.backend.registry().endpoint(id)
    }

    #[must_use]
    pub fn static_device_info(&self, id: &EndpointId) -> Option<StaticDeviceInfo> {
        self.backend.registry().static_device_info(id)
    }

    /// Returns `None` if the native service refused to create a session.
    #[must_use]
    pub fn make_session(&self, name: &str) -> Option<Session> {
        let session = self.backend.make_session(name)?;
        log::debug!("Created session \"{name}\"");
        Some(Session::new(
            name,
            Arc::clone(self.backend.registry()),
            session,
        ))
    }

    #[must_use]
    pub fn is_virtual_ump_service_active(&self) -> bool {
        self.backend.is_virtual_ump_service_active()
    }

    #[must_use]
    pub fn is_virtual_bytestream_service_active(&self) -> bool {
        self.backend.is_virtual_bytestream_service_active()
    }

    /// Observes the endpoints.
    ///
    /// A new snapshot is published after each batch of changes.
    #[cfg(feature = "observables")]
    #[must_use]
    pub fn subscribe(&self) -> discro::Subscriber<Arc<crate::registry::Snapshot>> {
        self.backend.registry().subscribe()
    }
}

/// Initializes the first available backend.
///
/// Backends are tried in the order of [`BackendKind`], skipping those that
/// are disabled by `config`. The `listener` is notified after the set of
/// endpoints has changed.
///
/// Returns `None` if no backend is available.
#[must_use]
pub fn make_endpoints(
    apis: &NativeApis,
    config: &Config,
    listener: Arc<dyn EndpointsListener>,
) -> Option<Endpoints> {
    for kind in BackendKind::iter() {
        if !config.is_candidate(kind) {
            log::debug!("Skipping {kind} backend");
            continue;
        }
        match open_backend(kind, apis, config, &listener) {
            Ok(backend) => {
                log::info!("Using {kind} backend");
                return Some(Endpoints { backend });
            }
            Err(err) => {
                log::info!("{err}");
            }
        }
    }
    log::warn!("No MIDI backend available");
    None
}

fn open_backend(
    kind: BackendKind,
    apis: &NativeApis,
    config: &Config,
    listener: &Arc<dyn EndpointsListener>,
) -> Result<Arc<dyn EndpointsBackend>, Unavailable> {
    match kind {
        BackendKind::SessionService => {
            let Some(service) = &apis.session_service else {
                return Err(Unavailable::new(kind, "no native service"));
            };
            let backend = session_service::SessionServiceBackend::open(
                Arc::clone(service),
                config,
                Arc::clone(listener),
            )?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "broker")]
        BackendKind::Broker => {
            let Some(broker) = &apis.broker else {
                return Err(Unavailable::new(kind, "no native service"));
            };
            let backend =
                broker::BrokerBackend::open(Arc::clone(broker), config, Arc::clone(listener))?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "broker"))]
        BackendKind::Broker => Err(Unavailable::new(kind, "disabled at build time")),
        BackendKind::LowLevel => {
            let api = match &apis.low_level {
                Some(api) => Arc::clone(api),
                None => low_level::default_api(config)?,
            };
            let backend = low_level::LowLevelBackend::open(api, config, Arc::clone(listener))?;
            Ok(Arc::new(backend))
        }
    }
}

/// Spawns the worker thread of a backend.
fn spawn_worker(kind: BackendKind) -> Result<WorkerHandle, Unavailable> {
    WorkerHandle::spawn(&format!("umpio-{kind}"))
        .map_err(|err| Unavailable::new(kind, format!("failed to spawn worker thread: {err}")))
}
