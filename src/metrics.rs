use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Metrics {
    rounds_started: Arc<AtomicU64>,
    rounds_succeeded: Arc<AtomicU64>,
    rounds_failed: Arc<AtomicU64>,
    alices_registered: Arc<AtomicU64>,
    registrations_rejected: Arc<AtomicU64>,
    outputs_registered: Arc<AtomicU64>,
    outpoints_noted: Arc<AtomicU64>,
    outpoints_banned: Arc<AtomicU64>,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rounds_started: u64,
    pub rounds_succeeded: u64,
    pub rounds_failed: u64,
    pub alices_registered: u64,
    pub registrations_rejected: u64,
    pub outputs_registered: u64,
    pub outpoints_noted: u64,
    pub outpoints_banned: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_rounds_started(&self) {
        self.rounds_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rounds_succeeded(&self) {
        self.rounds_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rounds_failed(&self) {
        self.rounds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_alices_registered(&self) {
        self.alices_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_registrations_rejected(&self) {
        self.registrations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_outputs_registered(&self) {
        self.outputs_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_outpoints_noted(&self, n: usize) {
        self.outpoints_noted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_outpoints_banned(&self, n: usize) {
        self.outpoints_banned.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            rounds_succeeded: self.rounds_succeeded.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
            alices_registered: self.alices_registered.load(Ordering::Relaxed),
            registrations_rejected: self.registrations_rejected.load(Ordering::Relaxed),
            outputs_registered: self.outputs_registered.load(Ordering::Relaxed),
            outpoints_noted: self.outpoints_noted.load(Ordering::Relaxed),
            outpoints_banned: self.outpoints_banned.load(Ordering::Relaxed),
        }
    }

    pub fn report(&self) {
        let s = self.snapshot();
        tracing::info!(
            "Metrics: rounds={} succeeded={} failed={} alices={} rejected={} outputs={} noted={} banned={}",
            s.rounds_started,
            s.rounds_succeeded,
            s.rounds_failed,
            s.alices_registered,
            s.registrations_rejected,
            s.outputs_registered,
            s.outpoints_noted,
            s.outpoints_banned,
        );
    }
}
