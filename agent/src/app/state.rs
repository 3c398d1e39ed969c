//! Shared control state: the stop flag and the update admission gate

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cooperative stop request, observed by the scheduler at the top of each tick
#[derive(Debug, Default)]
pub struct StopFlag {
    requested: AtomicBool,
    notify: Notify,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake everything waiting on it
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested
    pub async fn wait(&self) {
        loop {
            // Register before checking so a concurrent request is not missed
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Single-flight admission for update jobs.
///
/// Acquisition never waits: a caller that finds the gate held is rejected.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    busy: AtomicBool,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate if it is free. The gate reopens when the guard drops.
    pub fn try_acquire(&self) -> Option<GateGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof of holding the admission gate
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a AdmissionGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}
