//! Admission control for external verification calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Timestamp;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Ceiling reached; not queued. Try again on a later frame.
    Denied,
}

/// Sliding-log limiter: never more than `max_per_second` admissions in any
/// rolling one-second window, whatever the arrival pattern.
///
/// A call is counted when it is admitted, so timeouts and failures consume
/// budget exactly like completed calls.
pub struct CallGate {
    max_per_second: u32,
    admitted: Mutex<VecDeque<Timestamp>>,
    admitted_total: AtomicU64,
    denied_total: AtomicU64,
}

impl CallGate {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            admitted: Mutex::new(VecDeque::with_capacity(max_per_second as usize)),
            admitted_total: AtomicU64::new(0),
            denied_total: AtomicU64::new(0),
        }
    }

    pub fn max_per_second(&self) -> u32 {
        self.max_per_second
    }

    pub fn admit(&self, now: Timestamp) -> Admission {
        let mut log = self.admitted.lock();
        Self::evict(&mut log, now);

        if (log.len() as u64) < self.max_per_second as u64 {
            // Timestamps arriving out of order are clamped so the log stays sorted.
            let at = log.back().map_or(now, |last| now.max(*last));
            log.push_back(at);
            self.admitted_total.fetch_add(1, Ordering::Relaxed);
            Admission::Allowed
        } else {
            self.denied_total.fetch_add(1, Ordering::Relaxed);
            Admission::Denied
        }
    }

    /// Admissions still inside the window ending at `now`.
    pub fn in_window(&self, now: Timestamp) -> usize {
        let mut log = self.admitted.lock();
        Self::evict(&mut log, now);
        log.len()
    }

    pub fn admitted_total(&self) -> u64 {
        self.admitted_total.load(Ordering::Relaxed)
    }

    pub fn denied_total(&self) -> u64 {
        self.denied_total.load(Ordering::Relaxed)
    }

    fn evict(log: &mut VecDeque<Timestamp>, now: Timestamp) {
        while let Some(front) = log.front() {
            if now.saturating_since(*front) >= WINDOW {
                log.pop_front();
            } else {
                break;
            }
        }
    }
}
