// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Reconciliation of native device timestamps with the local clock.

use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

/// Default tolerance before the clock offset is corrected.
pub const DEFAULT_GUARD: Duration = Duration::from_millis(2);

/// Default correction of the clock offset.
pub const DEFAULT_NUDGE: Duration = Duration::from_millis(1);

/// Source of the current time in milliseconds.
pub trait Clock {
    fn now_millis(&self) -> f64;
}

/// Milliseconds elapsed since the first use of any [`MonotonicClock`]
/// in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_millis(&self) -> f64 {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64() * 1000.0
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_millis(&self) -> f64 {
        (**self).now_millis()
    }
}

/// Converts ticks elapsed on a device clock into local timestamps.
///
/// The result never lies in the future. When a native timestamp runs ahead
/// of the local clock by more than the guard interval the start offset is
/// moved backwards by the nudge interval, slowly pulling both clocks back
/// into alignment. Results are non-decreasing.
#[derive(Debug, Clone)]
pub struct TimestampConverter<C = MonotonicClock> {
    clock: C,
    start_millis: f64,
    guard_millis: f64,
    nudge_millis: f64,
    last_millis: f64,
}

impl TimestampConverter {
    /// Starts counting at the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock)
    }
}

impl Default for TimestampConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> TimestampConverter<C> {
    #[must_use]
    pub fn with_clock(clock: C) -> Self {
        let start_millis = clock.now_millis();
        Self {
            clock,
            start_millis,
            guard_millis: DEFAULT_GUARD.as_secs_f64() * 1000.0,
            nudge_millis: DEFAULT_NUDGE.as_secs_f64() * 1000.0,
            last_millis: f64::MIN,
        }
    }

    #[must_use]
    pub fn with_drift_correction(mut self, guard: Duration, nudge: Duration) -> Self {
        self.guard_millis = guard.as_secs_f64() * 1000.0;
        self.nudge_millis = nudge.as_secs_f64() * 1000.0;
        self
    }

    /// Local time in milliseconds that corresponds to zero elapsed ticks.
    #[must_use]
    pub const fn start_millis(&self) -> f64 {
        self.start_millis
    }

    /// Converts the milliseconds elapsed since the start into seconds
    /// on the local clock.
    pub fn convert(&mut self, elapsed_millis: f64) -> f64 {
        let now = self.clock.now_millis();
        let mut millis = self.start_millis + elapsed_millis;
        if millis > now {
            if millis > now + self.guard_millis {
                self.start_millis -= self.nudge_millis;
            }
            millis = now;
        }
        millis = millis.max(self.last_millis);
        self.last_millis = millis;
        millis / 1000.0
    }
}
