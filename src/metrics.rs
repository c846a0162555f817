//! Engine counters. Every internal failure is observable here or in logs only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

#[derive(Debug)]
pub struct EngineMetrics {
    pub frames: AtomicU64,
    pub observations: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_rekeyed: AtomicU64,
    pub sessions_resumed: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub gate_events: AtomicU64,
    pub crossings: AtomicU64,
    pub verification_requests: AtomicU64,
    pub verification_successes: AtomicU64,
    pub verification_failures: AtomicU64,
    pub verification_timeouts: AtomicU64,
    pub results_applied: AtomicU64,
    pub results_discarded: AtomicU64,
    pub gate_denials: AtomicU64,
    pub started_at: Instant,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            frames: AtomicU64::new(0),
            observations: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_rekeyed: AtomicU64::new(0),
            sessions_resumed: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            gate_events: AtomicU64::new(0),
            crossings: AtomicU64::new(0),
            verification_requests: AtomicU64::new(0),
            verification_successes: AtomicU64::new(0),
            verification_failures: AtomicU64::new(0),
            verification_timeouts: AtomicU64::new(0),
            results_applied: AtomicU64::new(0),
            results_discarded: AtomicU64::new(0),
            gate_denials: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    #[inline]
    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Snapshot of the counters. Dropped observations are counted by the
    /// registry and filled in by the engine.
    pub fn summary(&self) -> MetricsSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSummary {
            frames: load(&self.frames),
            fps: self.fps(),
            observations: load(&self.observations),
            dropped_observations: 0,
            sessions_opened: load(&self.sessions_opened),
            sessions_rekeyed: load(&self.sessions_rekeyed),
            sessions_resumed: load(&self.sessions_resumed),
            sessions_closed: load(&self.sessions_closed),
            gate_events: load(&self.gate_events),
            crossings: load(&self.crossings),
            verification_requests: load(&self.verification_requests),
            verification_successes: load(&self.verification_successes),
            verification_failures: load(&self.verification_failures),
            verification_timeouts: load(&self.verification_timeouts),
            results_applied: load(&self.results_applied),
            results_discarded: load(&self.results_discarded),
            gate_denials: load(&self.gate_denials),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub frames: u64,
    pub fps: f64,
    pub observations: u64,
    /// Malformed observations rejected at ingestion
    pub dropped_observations: u64,
    pub sessions_opened: u64,
    pub sessions_rekeyed: u64,
    pub sessions_resumed: u64,
    pub sessions_closed: u64,
    pub gate_events: u64,
    pub crossings: u64,
    pub verification_requests: u64,
    pub verification_successes: u64,
    pub verification_failures: u64,
    pub verification_timeouts: u64,
    /// Results delivered to a session that was still open
    pub results_applied: u64,
    /// Results that arrived after their session had closed
    pub results_discarded: u64,
    pub gate_denials: u64,
    pub elapsed_secs: f64,
}
