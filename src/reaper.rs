//! Periodic idle-session sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cache::VerificationCache;
use crate::clock::{Clock, Timestamp};
use crate::metrics::EngineMetrics;
use crate::persist::{PersistenceRecord, PersistenceSink};
use crate::session::{ClosedSession, SessionId, TrackSessionRegistry};

/// Closes sessions whose track has been gone longer than the grace period and
/// hands the terminal record to persistence.
pub struct SessionReaper {
    registry: Arc<TrackSessionRegistry>,
    cache: Arc<VerificationCache<SessionId>>,
    sink: Arc<dyn PersistenceSink>,
    metrics: Arc<EngineMetrics>,
}

impl SessionReaper {
    pub fn new(
        registry: Arc<TrackSessionRegistry>,
        cache: Arc<VerificationCache<SessionId>>,
        sink: Arc<dyn PersistenceSink>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            registry,
            cache,
            sink,
            metrics,
        }
    }

    /// Close every session idle for longer than the grace period.
    ///
    /// Each session is closed and submitted exactly once; a second sweep at the
    /// same instant returns nothing.
    pub fn sweep(&self, now: Timestamp) -> Vec<ClosedSession> {
        let closed = self.registry.close_idle(now);
        for record in &closed {
            info!(
                session = %record.session_id,
                track = record.last_track_id,
                label = %record.label,
                duration_ms = record.duration.as_millis() as u64,
                closed_at = record.closed_at.as_secs_f64(),
                "session closed"
            );
            self.sink
                .submit(PersistenceRecord::SessionClosed(record.clone()));
        }
        self.metrics
            .add(&self.metrics.sessions_closed, closed.len() as u64);

        let pruned = self.registry.prune_retired(now);
        let purged = self.cache.purge_expired(now);
        if pruned > 0 || purged > 0 {
            debug!(pruned, purged, "housekeeping");
        }
        closed
    }

    /// Run [`sweep`](Self::sweep) every `interval` on the current tokio runtime.
    ///
    /// The task runs until the returned handle is aborted.
    pub fn spawn(self: Arc<Self>, clock: Arc<dyn Clock>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep(clock.now());
            }
        })
    }
}
