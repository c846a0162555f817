//! Per-frame entry point tying sessions, zones, cache, gate and verifier together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, Claim, VerificationCache};
use crate::clock::{Clock, SystemClock, Timestamp};
use crate::config::EngineConfig;
use crate::error::{ConfigError, VerificationError};
use crate::gate::{Admission, CallGate};
use crate::metrics::{EngineMetrics, MetricsSummary};
use crate::persist::{PersistenceRecord, PersistenceSink};
use crate::reaper::SessionReaper;
use crate::session::{
    ClosedSession, CropRef, MergeSource, Observation, Session, SessionId, SessionUpdate,
    TrackKey, TrackSessionRegistry,
};
use crate::verify::{Label, Verdict, VerificationResult, Verifier};
use crate::zone::{CrossingEvent, GateEvent, ZoneTrigger};

/// Extra lifetime of an in-flight marker beyond the call timeout.
const PENDING_SLACK: Duration = Duration::from_secs(1);

/// Zone event raised while processing a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FiredEvent {
    Gate(GateEvent),
    Crossing(CrossingEvent),
}

/// Per-observation result of [`Engine::process_frame`].
#[derive(Debug, Clone)]
pub struct TrackReport {
    pub key: TrackKey,
    pub session_id: SessionId,
    pub label: Label,
    pub confidence: f32,
    pub is_new_session: bool,
    pub merged_from: Option<MergeSource>,
    pub fired_events: Vec<FiredEvent>,
}

/// A verification call to launch once the session lock is released.
struct Dispatch {
    identity: SessionId,
    session_id: SessionId,
    crop: CropRef,
    session: Weak<Mutex<Session>>,
    /// Frame time the call was requested at
    requested_at: Timestamp,
    /// Engine clock reading at dispatch, used only to measure call latency
    dispatched_at: Timestamp,
}

struct EngineInner {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<TrackSessionRegistry>,
    cache: Arc<VerificationCache<SessionId>>,
    gate: CallGate,
    zones: ZoneTrigger,
    verifier: Arc<dyn Verifier>,
    sink: Arc<dyn PersistenceSink>,
    reaper: Arc<SessionReaper>,
    metrics: Arc<EngineMetrics>,
    runtime: Option<Handle>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Track lifecycle and verification engine.
///
/// Cheap to clone; every clone shares the same sessions and cache. Frames from
/// different streams may be processed concurrently. Verification calls run on
/// the tokio runtime the engine was created in and never block a frame.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine on the system clock.
    pub fn new(
        config: EngineConfig,
        verifier: Arc<dyn Verifier>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, verifier, sink, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        config: EngineConfig,
        verifier: Arc<dyn Verifier>,
        sink: Arc<dyn PersistenceSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(TrackSessionRegistry::new(config.session.clone()));
        let cache = Arc::new(VerificationCache::new(config.cache.clone()));
        let metrics = Arc::new(EngineMetrics::new());
        let reaper = Arc::new(SessionReaper::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&sink),
            Arc::clone(&metrics),
        ));
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            warn!("engine created outside a tokio runtime, verification will use the caller's runtime");
        }

        let engine = Self {
            inner: Arc::new(EngineInner {
                gate: CallGate::new(config.gate.max_calls_per_second),
                zones: ZoneTrigger::from_config(&config.zones),
                config,
                clock,
                registry,
                cache,
                verifier,
                sink,
                reaper,
                metrics,
                runtime,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        };
        let zones = &engine.inner.zones;
        info!(
            verifier = engine.inner.verifier.name(),
            max_calls_per_second = engine.inner.gate.max_per_second(),
            gate = ?zones.gate(),
            lines = ?zones.lines().iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
            "engine started"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    /// Process one frame batch at the engine clock's current time.
    pub fn process_frame(&self, observations: Vec<Observation>) -> Vec<TrackReport> {
        self.process_frame_at(observations, self.now())
    }

    /// Process one frame batch of tracker observations at `now`.
    ///
    /// Returns one report per accepted observation (malformed ones are dropped
    /// and duplicates of a track collapse). Verification results requested
    /// here are applied later, when the call completes.
    pub fn process_frame_at(&self, observations: Vec<Observation>, now: Timestamp) -> Vec<TrackReport> {
        let inner = &self.inner;
        inner.metrics.inc(&inner.metrics.frames);
        inner
            .metrics
            .add(&inner.metrics.observations, observations.len() as u64);

        let updates = inner.registry.update(observations, now);
        let mut reports = Vec::with_capacity(updates.len());
        let mut dispatches = Vec::new();

        for update in updates {
            self.count_session(&update);
            if let Some((report, dispatch)) = self.handle_update(update, now) {
                reports.push(report);
                dispatches.extend(dispatch);
            }
        }

        for dispatch in dispatches {
            self.spawn_verification(dispatch);
        }
        reports
    }

    fn count_session(&self, update: &SessionUpdate) {
        let m = &self.inner.metrics;
        match update.merged_from {
            Some(MergeSource::Idle(_)) => m.inc(&m.sessions_rekeyed),
            Some(MergeSource::Retired(_)) => m.inc(&m.sessions_resumed),
            None if update.is_new_session => m.inc(&m.sessions_opened),
            None => {}
        }
    }

    fn handle_update(&self, update: SessionUpdate, now: Timestamp) -> Option<(TrackReport, Option<Dispatch>)> {
        let inner = &self.inner;
        let min_conf = inner.config.cache.min_match_confidence;
        let mut guard = update.session.lock();
        // Closed by a concurrent sweep between attach and here.
        if !guard.is_open() {
            debug!(session = %update.session_id, "session closed before frame was applied");
            return None;
        }
        let session = &mut *guard;
        let key = update.observation.key;
        let session_id = session.session_id;

        let mut fired_events = Vec::new();
        let zone = inner.zones.observe(
            &mut session.zone,
            session_id,
            key,
            &update.observation.centroid,
            now,
        );
        for crossing in zone.crossings {
            info!(session = %session_id, track = %key, line = %crossing.line, direction = ?crossing.direction, "line crossed");
            inner.metrics.inc(&inner.metrics.crossings);
            inner.sink.submit(PersistenceRecord::Crossing(crossing.clone()));
            fired_events.push(FiredEvent::Crossing(crossing));
        }

        let mut dispatch = None;
        let crop = if zone.in_gate { session.latest_crop.clone() } else { None };
        if let Some(crop) = crop {
            let pending_ttl = inner.config.gate.call_timeout() + PENDING_SLACK;
            match inner.cache.try_claim(&session.identity, now, pending_ttl) {
                Claim::Hit(result) => {
                    if session.apply_result(&result, min_conf) {
                        debug!(session = %session_id, label = %session.label, "label restored from cache");
                    }
                }
                Claim::Pending => {}
                Claim::Claimed => match inner.gate.admit(now) {
                    Admission::Denied => {
                        inner.cache.release(&session.identity);
                        inner.metrics.inc(&inner.metrics.gate_denials);
                        debug!(session = %session_id, "verification deferred by rate limit");
                    }
                    Admission::Allowed => {
                        if let Some(event) = inner.zones.fire(&mut session.zone, session_id, key, now) {
                            info!(session = %session_id, track = %key, "gate fired");
                            inner.metrics.inc(&inner.metrics.gate_events);
                            inner.sink.submit(PersistenceRecord::Gate(event.clone()));
                            fired_events.push(FiredEvent::Gate(event));
                        }
                        dispatch = Some(Dispatch {
                            identity: session.identity,
                            session_id,
                            crop,
                            session: Arc::downgrade(&update.session),
                            requested_at: now,
                            dispatched_at: inner.clock.now(),
                        });
                    }
                },
            }
        }

        let report = TrackReport {
            key,
            session_id,
            label: session.label.clone(),
            confidence: session.confidence,
            is_new_session: update.is_new_session,
            merged_from: update.merged_from,
            fired_events,
        };
        Some((report, dispatch))
    }

    fn spawn_verification(&self, dispatch: Dispatch) {
        let inner = &self.inner;
        let runtime = match inner.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => handle,
            None => {
                warn!(session = %dispatch.session_id, "no tokio runtime, verification skipped");
                inner.cache.release(&dispatch.identity);
                return;
            }
        };

        inner.metrics.inc(&inner.metrics.verification_requests);
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let engine = Arc::clone(inner);
        runtime.spawn(async move {
            let _guard = InFlight(&engine);
            let timeout = engine.config.gate.call_timeout();
            let outcome = match tokio::time::timeout(timeout, engine.verifier.verify(&dispatch.crop)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(VerificationError::Timeout(timeout)),
            };
            engine.complete(dispatch, outcome);
        });
    }

    /// Wait until every verification call launched so far has completed.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn active_session_count(&self) -> usize {
        self.inner.registry.active_session_count()
    }

    /// Snapshot of the open session currently fed by `key`.
    pub fn session(&self, key: &TrackKey) -> Option<Session> {
        self.inner.registry.session(key)
    }

    pub fn open_sessions(&self) -> Vec<Session> {
        self.inner.registry.open_sessions()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn metrics(&self) -> MetricsSummary {
        let mut summary = self.inner.metrics.summary();
        summary.dropped_observations = self.inner.registry.dropped_observations();
        summary
    }

    /// Close idle sessions at the engine clock's current time.
    pub fn sweep(&self) -> Vec<ClosedSession> {
        self.sweep_at(self.now())
    }

    pub fn sweep_at(&self, now: Timestamp) -> Vec<ClosedSession> {
        self.inner.reaper.sweep(now)
    }

    /// Sweep periodically in the background until the handle is aborted.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        Arc::clone(&self.inner.reaper).spawn(Arc::clone(&self.inner.clock), interval)
    }
}

impl EngineInner {
    fn complete(&self, dispatch: Dispatch, outcome: Result<Verdict, VerificationError>) {
        // Completion on the caller's frame timeline: request time plus call latency.
        let latency = self.clock.now().saturating_since(dispatch.dispatched_at);
        let completed_at = dispatch.requested_at + latency;
        let result = match outcome {
            Ok(verdict) => {
                self.metrics.inc(&self.metrics.verification_successes);
                VerificationResult::from_verdict(verdict, completed_at)
            }
            Err(e) => {
                if matches!(e, VerificationError::Timeout(_)) {
                    self.metrics.inc(&self.metrics.verification_timeouts);
                } else {
                    self.metrics.inc(&self.metrics.verification_failures);
                }
                warn!(session = %dispatch.session_id, verifier = self.verifier.name(), error = %e, "verification failed");
                VerificationResult::unresolved(completed_at)
            }
        };

        let ttl = self.cache.store_result(dispatch.identity, result.clone(), completed_at);
        debug!(
            session = %dispatch.session_id,
            label = %result.label,
            confidence = result.confidence,
            ttl_secs = ttl.as_secs(),
            "verification result cached"
        );

        let applied = dispatch.session.upgrade().map(|handle| {
            let mut session = handle.lock();
            if !session.is_open() {
                return false;
            }
            if session.apply_result(&result, self.config.cache.min_match_confidence) {
                info!(session = %dispatch.session_id, label = %session.label, confidence = session.confidence, "session verified");
            }
            true
        });
        if applied == Some(true) {
            self.metrics.inc(&self.metrics.results_applied);
        } else {
            self.metrics.inc(&self.metrics.results_discarded);
            debug!(session = %dispatch.session_id, "session closed before its result arrived");
        }
    }
}

/// Decrements the in-flight count when a verification task ends, however it ends.
struct InFlight<'a>(&'a EngineInner);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
