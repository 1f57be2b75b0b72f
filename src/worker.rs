// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Dedicated thread for deferred work.
//!
//! Every backend owns a worker that drains its pending registry updates
//! and delivers disconnection notifications outside of native callbacks.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crossbeam_channel::{Receiver, Sender};

type Job = Box<dyn FnOnce() + Send>;

/// Posts jobs to a worker thread.
///
/// The thread terminates after all handles have been dropped and all
/// pending jobs have been executed.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    tx: Sender<Job>,
}

impl WorkerHandle {
    pub(crate) fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(&rx))?;
        Ok(Self { tx })
    }

    /// Returns `false` if the worker thread has already terminated.
    pub(crate) fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).is_ok()
    }

    /// Blocks until all jobs that have been posted before are finished.
    ///
    /// Must not be invoked from the worker thread itself.
    #[cfg(test)]
    pub(crate) fn flush(&self) -> bool {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if !self.post(move || {
            let _ = done_tx.send(());
        }) {
            return false;
        }
        done_rx.recv().is_ok()
    }
}

fn run(rx: &Receiver<Job>) {
    log::debug!("Entering worker thread");
    while let Ok(job) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("Job panicked on worker thread");
        }
    }
    log::debug!("Exiting worker thread");
}
