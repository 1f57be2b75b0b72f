// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Tunables of the backends.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    backend::BackendKind,
    ump::{timestamp, to_bytestream, MAX_SYSEX7_PAYLOAD},
    watcher::DEFAULT_POLL_INTERVAL,
};

/// Default name under which native clients are registered.
pub const DEFAULT_CLIENT_NAME: &str = "umpio";

/// Default time to wait for a broker connection.
pub const DEFAULT_BROKER_OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Repeats an operation that fails with a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: usize,
    /// Pause between two attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Opening a low-level output that is still allocated by a previous
    /// handle.
    pub const OPEN_OUTPUT: Self = Self::new(4, Duration::from_millis(100));

    /// Sending a short message while the device is busy.
    pub const SEND_SHORT: Self = Self::new(50, Duration::from_millis(1));

    /// Releasing a long message buffer while the device is still playing it.
    pub const RELEASE_LONG: Self = Self::new(500, Duration::from_millis(2));

    /// Closing a low-level input.
    pub const CLOSE_INPUT: Self = Self::new(5, Duration::from_millis(20));

    #[must_use]
    pub const fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Invokes `op` until it succeeds, fails permanently, or the attempts
    /// are exhausted.
    ///
    /// Errors for which `is_transient` returns `true` are retried after
    /// sleeping. The last error is returned.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut() -> Result<T, E>,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts && is_transient(&err) => {
                    attempt += 1;
                    std::thread::sleep(self.delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Aborts blocking waits for native transfers.
///
/// Passed to a single send operation. Clones share the same state and a
/// cancelled token stays cancelled, i.e. use a new token for each
/// operation that should be cancellable.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Irreversibly cancels all pending and future waits.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl PartialEq for CancellationToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

/// Configuration of [`make_endpoints()`](crate::backend::make_endpoints).
///
/// There are no configuration files. All settings have sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    forced_backend: Option<BackendKind>,
    disabled_backends: Vec<BackendKind>,
    client_name: String,
    broker_open_timeout: Duration,
    poll_interval: Duration,
    sysex_capacity: usize,
    sysex_payload: usize,
    timestamp_guard: Duration,
    timestamp_nudge: Duration,
    open_retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            forced_backend: None,
            disabled_backends: Vec::new(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            broker_open_timeout: DEFAULT_BROKER_OPEN_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            sysex_capacity: to_bytestream::DEFAULT_CAPACITY,
            sysex_payload: MAX_SYSEX7_PAYLOAD,
            timestamp_guard: timestamp::DEFAULT_GUARD,
            timestamp_nudge: timestamp::DEFAULT_NUDGE,
            open_retry: RetryPolicy::OPEN_OUTPUT,
        }
    }
}

impl Config {
    /// Only tries the given backend, without falling back to others.
    #[must_use]
    pub const fn with_forced_backend(mut self, backend: BackendKind) -> Self {
        self.forced_backend = Some(backend);
        self
    }

    /// Skips the given backend during selection.
    #[must_use]
    pub fn with_disabled_backend(mut self, backend: BackendKind) -> Self {
        if !self.disabled_backends.contains(&backend) {
            self.disabled_backends.push(backend);
        }
        self
    }

    #[must_use]
    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    #[must_use]
    pub const fn with_broker_open_timeout(mut self, timeout: Duration) -> Self {
        self.broker_open_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Maximum number of bytes of a single sysex chunk that is sent to a
    /// byte-stream device.
    #[must_use]
    pub const fn with_sysex_capacity(mut self, capacity: usize) -> Self {
        self.sysex_capacity = capacity;
        self
    }

    /// Maximum number of payload bytes per sysex-7 packet, between 1 and 6.
    #[must_use]
    pub const fn with_sysex_payload(mut self, payload: usize) -> Self {
        self.sysex_payload = payload;
        self
    }

    #[must_use]
    pub const fn with_timestamp_drift_correction(
        mut self,
        guard: Duration,
        nudge: Duration,
    ) -> Self {
        self.timestamp_guard = guard;
        self.timestamp_nudge = nudge;
        self
    }

    #[must_use]
    pub const fn with_open_retry(mut self, open_retry: RetryPolicy) -> Self {
        self.open_retry = open_retry;
        self
    }

    #[must_use]
    pub const fn forced_backend(&self) -> Option<BackendKind> {
        self.forced_backend
    }

    /// Whether a backend may be tried during selection.
    #[must_use]
    pub fn is_candidate(&self, backend: BackendKind) -> bool {
        match self.forced_backend {
            Some(forced) => forced == backend,
            None => !self.disabled_backends.contains(&backend),
        }
    }

    #[must_use]
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    #[must_use]
    pub const fn broker_open_timeout(&self) -> Duration {
        self.broker_open_timeout
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub const fn sysex_capacity(&self) -> usize {
        self.sysex_capacity
    }

    #[must_use]
    pub const fn sysex_payload(&self) -> usize {
        self.sysex_payload
    }

    #[must_use]
    pub const fn timestamp_drift_correction(&self) -> (Duration, Duration) {
        (self.timestamp_guard, self.timestamp_nudge)
    }

    #[must_use]
    pub const fn open_retry(&self) -> RetryPolicy {
        self.open_retry
    }

    /// Creates a timestamp converter that starts at the current time.
    #[must_use]
    pub fn timestamp_converter(&self) -> timestamp::TimestampConverter {
        timestamp::TimestampConverter::new()
            .with_drift_correction(self.timestamp_guard, self.timestamp_nudge)
    }
}
