use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio::sync::mpsc;

use parking_lot::Mutex;
use tracksession_rs::{
    ChannelSink, CropRef, CrossingDirection, CrossingLine, Engine, EngineConfig, FiredEvent, Label,
    ManualClock, MergeSource, Observation, ObservationBuilder, PersistenceRecord, SessionConfig,
    SessionId, StreamId, Timestamp, Verdict, VerificationError, Verifier,
};

struct ScriptedVerifier {
    calls: AtomicU32,
    verdict: Option<Verdict>,
}

impl ScriptedVerifier {
    fn returning(verdict: Verdict) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            verdict: Some(verdict),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            verdict: None,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(&self, _crop: &CropRef) -> Result<Verdict, VerificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict
            .clone()
            .ok_or_else(|| VerificationError::Transport("connection refused".to_string()))
    }
}

fn secs(s: f64) -> Timestamp {
    Timestamp::from_millis((s * 1000.0).round() as u64)
}

fn person(track_id: u64, x: f32, y: f32) -> Observation {
    ObservationBuilder::new()
        .track(track_id)
        .class("person")
        .centred_at(x, y)
        .crop(vec![0u8; 16])
        .build()
}

struct Harness {
    engine: Engine,
    clock: Arc<ManualClock>,
    records: mpsc::Receiver<PersistenceRecord>,
}

impl Harness {
    fn new(verifier: Arc<ScriptedVerifier>, config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
        let (sink, records) = ChannelSink::new(1024);
        let engine = Engine::with_clock(config, verifier, Arc::new(sink), clock.clone()).unwrap();
        Self {
            engine,
            clock,
            records,
        }
    }

    fn frame_at(&self, t: f64, observations: Vec<Observation>) -> Vec<tracksession_rs::TrackReport> {
        self.clock.set(secs(t));
        self.engine.process_frame(observations)
    }

    fn drain_records(&mut self) -> Vec<PersistenceRecord> {
        let mut out = Vec::new();
        while let Ok(record) = self.records.try_recv() {
            out.push(record);
        }
        out
    }
}

#[tokio::test]
async fn test_scenario_identity_survives_track_switch() {
    let verifier = ScriptedVerifier::returning(Verdict::known("Alice", 92.0));
    let mut h = Harness::new(verifier.clone(), EngineConfig::default());

    // t=0: track 7 enters and is verified once.
    let reports = h.frame_at(0.0, vec![person(7, 100.0, 200.0)]);
    assert!(reports[0].is_new_session);
    let first_session = reports[0].session_id;
    h.engine.drain().await;
    assert_eq!(verifier.calls(), 1);

    // t=5: still track 7, label comes from the cache.
    let reports = h.frame_at(5.0, vec![person(7, 105.0, 200.0)]);
    assert_eq!(reports[0].label, Label::Known("Alice".to_string()));
    assert_eq!(reports[0].confidence, 92.0);
    h.engine.drain().await;
    assert_eq!(verifier.calls(), 1);

    // t=10: last sighting of track 7.
    h.frame_at(10.0, vec![person(7, 110.0, 200.0)]);
    h.engine.drain().await;

    // Nothing closes inside the grace period.
    h.clock.set(secs(40.0));
    assert!(h.engine.sweep().is_empty());

    h.clock.set(secs(41.0));
    let closed = h.engine.sweep();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].session_id, first_session);
    assert_eq!(closed[0].label, Label::Known("Alice".to_string()));
    assert_eq!(closed[0].duration, Duration::from_secs(10));
    assert!(h.engine.sweep().is_empty());

    // t=42: the tracker hands out id 9 near the old position.
    let reports = h.frame_at(42.0, vec![person(9, 120.0, 200.0)]);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].label, Label::Known("Alice".to_string()));
    assert_eq!(reports[0].merged_from, Some(MergeSource::Retired(first_session)));
    assert_ne!(reports[0].session_id, first_session);
    h.engine.drain().await;
    assert_eq!(verifier.calls(), 1);

    let closed_records = h
        .drain_records()
        .into_iter()
        .filter(|r| matches!(r, PersistenceRecord::SessionClosed(_)))
        .count();
    assert_eq!(closed_records, 1);

    let metrics = h.engine.metrics();
    assert_eq!(metrics.sessions_opened, 1);
    assert_eq!(metrics.sessions_resumed, 1);
    assert_eq!(metrics.sessions_closed, 1);
    assert_eq!(metrics.verification_requests, 1);
}

#[tokio::test]
async fn test_scenario_failure_cached_then_retried() {
    let verifier = ScriptedVerifier::failing();
    let h = Harness::new(verifier.clone(), EngineConfig::default());

    let reports = h.frame_at(0.0, vec![person(12, 300.0, 300.0)]);
    h.engine.drain().await;
    assert_eq!(verifier.calls(), 1);
    assert_eq!(reports[0].label, Label::Unknown);

    // Unknown result is cached under the short TTL.
    for t in [1.0, 10.0, 20.0, 29.0] {
        let reports = h.frame_at(t, vec![person(12, 300.0, 300.0)]);
        assert_eq!(reports[0].label, Label::Unknown);
        h.engine.drain().await;
    }
    assert_eq!(verifier.calls(), 1);

    h.frame_at(31.0, vec![person(12, 300.0, 300.0)]);
    h.engine.drain().await;
    assert_eq!(verifier.calls(), 2);

    let metrics = h.engine.metrics();
    assert_eq!(metrics.verification_failures, 2);
    assert_eq!(metrics.verification_successes, 0);
}

#[tokio::test]
async fn test_frame_timeline_drives_cache_expiry() {
    let verifier = ScriptedVerifier::failing();
    let h = Harness::new(verifier.clone(), EngineConfig::default());

    // Engine clock far ahead of the tracker's frame timestamps.
    h.clock.set(secs(1000.0));
    for t in [0.0, 31.0, 120.0] {
        h.engine.process_frame_at(vec![person(12, 300.0, 300.0)], secs(t));
        h.engine.drain().await;
    }
    assert_eq!(verifier.calls(), 3);
}

#[tokio::test]
async fn test_detector_miss_does_not_hand_over_identity() {
    let verifier = ScriptedVerifier::returning(Verdict::known("Alice", 92.0));
    let h = Harness::new(verifier, EngineConfig::default());

    let reports = h.frame_at(0.0, vec![person(1, 100.0, 200.0)]);
    let alice = reports[0].session_id;
    h.engine.drain().await;
    h.frame_at(0.033, vec![person(1, 101.0, 200.0)]);

    // Track 1 missed for one frame; a new person appears 60px away.
    let reports = h.frame_at(0.066, vec![person(2, 161.0, 200.0)]);
    assert!(reports[0].is_new_session);
    assert_eq!(reports[0].merged_from, None);
    assert_ne!(reports[0].session_id, alice);
    h.engine.drain().await;

    let reports = h.frame_at(0.1, vec![person(1, 102.0, 200.0), person(2, 161.0, 200.0)]);
    let track1 = reports.iter().find(|r| r.key.track_id == 1).unwrap();
    assert_eq!(track1.session_id, alice);
    assert!(!track1.is_new_session);
    assert_eq!(track1.label, Label::Known("Alice".to_string()));
    assert_eq!(h.engine.active_session_count(), 2);
    assert_eq!(h.engine.metrics().sessions_rekeyed, 0);
}

#[tokio::test]
async fn test_rate_limit_across_tracks() {
    let verifier = ScriptedVerifier::returning(Verdict::known("Bob", 80.0));
    let h = Harness::new(verifier.clone(), EngineConfig::default());

    let crowd = |t: f64| -> Vec<Observation> {
        (0..20)
            .map(|i| person(i, 100.0 + i as f32 * 400.0, 200.0))
            .map(|mut o| {
                o.frame_timestamp = secs(t);
                o
            })
            .collect()
    };

    h.frame_at(0.0, crowd(0.0));
    h.engine.drain().await;
    assert_eq!(verifier.calls(), 5);

    h.frame_at(0.5, crowd(0.5));
    h.engine.drain().await;
    assert_eq!(verifier.calls(), 5);

    h.frame_at(1.0, crowd(1.0));
    h.engine.drain().await;
    assert_eq!(verifier.calls(), 10);
    assert!(h.engine.metrics().gate_denials >= 30);
}

#[tokio::test]
async fn test_gate_fires_once_over_fifty_frames() {
    let verifier = ScriptedVerifier::failing();
    let mut h = Harness::new(verifier.clone(), EngineConfig::default());

    let mut gate_events = 0;
    for frame in 0..50 {
        let reports = h.frame_at(frame as f64 * 0.04, vec![person(4, 200.0, 200.0)]);
        gate_events += reports[0]
            .fired_events
            .iter()
            .filter(|e| matches!(e, FiredEvent::Gate(_)))
            .count();
        h.engine.drain().await;
    }
    assert_eq!(gate_events, 1);

    let persisted = h
        .drain_records()
        .into_iter()
        .filter(|r| matches!(r, PersistenceRecord::Gate(_)))
        .count();
    assert_eq!(persisted, 1);
}

#[tokio::test]
async fn test_line_crossings_reported() {
    let mut config = EngineConfig::default();
    config.zones.lines = vec![CrossingLine::new("door", [0.0, 300.0], [1000.0, 300.0])];
    let verifier = ScriptedVerifier::failing();
    let mut h = Harness::new(verifier, config);

    let mut directions = Vec::new();
    for (i, y) in [250.0, 280.0, 350.0, 380.0, 250.0].into_iter().enumerate() {
        let reports = h.frame_at(i as f64 * 0.1, vec![person(3, 500.0, y)]);
        for event in &reports[0].fired_events {
            if let FiredEvent::Crossing(c) = event {
                directions.push(c.direction);
            }
        }
    }
    h.engine.drain().await;

    assert_eq!(directions, vec![CrossingDirection::Entry, CrossingDirection::Exit]);
    let persisted = h
        .drain_records()
        .into_iter()
        .filter(|r| matches!(r, PersistenceRecord::Crossing(_)))
        .count();
    assert_eq!(persisted, 2);
    assert_eq!(h.engine.metrics().crossings, 2);
}

#[tokio::test]
async fn test_malformed_observations_do_not_poison_batch() {
    let verifier = ScriptedVerifier::returning(Verdict::known("Alice", 92.0));
    let h = Harness::new(verifier, EngineConfig::default());

    let anonymous = ObservationBuilder::new().centred_at(10.0, 10.0).build();
    let degenerate = ObservationBuilder::new().track(2).tlwh(0.0, 0.0, 0.0, 0.0).build();
    let reports = h.frame_at(0.0, vec![anonymous, person(1, 100.0, 100.0), degenerate]);

    assert_eq!(reports.len(), 1);
    assert_eq!(h.engine.metrics().dropped_observations, 2);
    h.engine.drain().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_streams_with_sweeps() {
    let verifier = ScriptedVerifier::returning(Verdict::known("Alice", 92.0));
    let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
    let (sink, mut records) = ChannelSink::new(65_536);
    let config = EngineConfig {
        session: SessionConfig {
            grace_period_secs: 2.0,
            merge_window_secs: 10.0,
            min_idle_secs: 0.5,
            ..SessionConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = Engine::with_clock(config, verifier, Arc::new(sink), clock.clone()).unwrap();
    let closed: Arc<Mutex<HashSet<SessionId>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut streams = Vec::new();
    for stream in 0..4u32 {
        let engine = engine.clone();
        streams.push(tokio::spawn(async move {
            for frame in 0..300u64 {
                // New tracker id every 40 frames, with periodic detector misses.
                if frame % 7 != 3 {
                    let obs = ObservationBuilder::new()
                        .stream(StreamId(stream))
                        .track(frame / 40)
                        .centred_at(100.0 + (frame % 40) as f32, 200.0)
                        .crop(vec![1u8; 8])
                        .build();
                    engine.process_frame(vec![obs]);
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    let sweeper = {
        let engine = engine.clone();
        let clock = clock.clone();
        let closed = Arc::clone(&closed);
        tokio::spawn(async move {
            for _ in 0..600 {
                clock.advance(Duration::from_millis(50));
                for record in engine.sweep() {
                    assert!(closed.lock().insert(record.session_id), "session closed twice");
                }

                let open = engine.open_sessions();
                let keys: HashSet<_> = open.iter().map(|s| s.key).collect();
                assert_eq!(keys.len(), open.len());
                assert!(open.iter().all(|s| s.is_open()));
                {
                    let closed = closed.lock();
                    assert!(open.iter().all(|s| !closed.contains(&s.session_id)));
                }
                tokio::task::yield_now().await;
            }
        })
    };

    for stream in streams {
        stream.await.unwrap();
    }
    sweeper.await.unwrap();
    engine.drain().await;

    clock.advance(Duration::from_secs(60));
    for record in engine.sweep() {
        assert!(closed.lock().insert(record.session_id), "session closed twice");
    }
    assert_eq!(engine.active_session_count(), 0);

    let closed = closed.lock().len() as u64;
    let metrics = engine.metrics();
    assert_eq!(metrics.sessions_closed, closed);
    // Every completed call either reached an open session or was discarded.
    assert_eq!(
        metrics.verification_successes,
        metrics.results_applied + metrics.results_discarded
    );

    let mut persisted = 0;
    while let Ok(record) = records.try_recv() {
        if matches!(record, PersistenceRecord::SessionClosed(_)) {
            persisted += 1;
        }
    }
    assert_eq!(persisted, closed);
}

#[derive(Debug, Clone)]
enum Step {
    Frame(Vec<(u64, u16)>),
    Advance(u16),
    Sweep,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => prop::collection::vec((0u64..6, 0u16..1200), 0..6).prop_map(Step::Frame),
        2 => (1u16..20_000).prop_map(Step::Advance),
        1 => Just(Step::Sweep),
    ]
}

proptest! {
    #[test]
    fn prop_one_open_session_per_key(steps in prop::collection::vec(step(), 1..60)) {
        let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
        let (sink, _records) = ChannelSink::new(4096);
        let engine = Engine::with_clock(
            EngineConfig::default(),
            ScriptedVerifier::failing(),
            Arc::new(sink),
            clock.clone(),
        )
        .unwrap();

        let mut closed_ids: HashSet<SessionId> = HashSet::new();
        for step in steps {
            match step {
                Step::Frame(tracks) => {
                    // No crops: exercises the lifecycle without dispatching calls.
                    let batch = tracks
                        .into_iter()
                        .map(|(id, x)| {
                            ObservationBuilder::new().track(id).centred_at(x as f32, 200.0).build()
                        })
                        .collect();
                    engine.process_frame(batch);
                }
                Step::Advance(ms) => clock.advance(Duration::from_millis(ms as u64)),
                Step::Sweep => {
                    for closed in engine.sweep() {
                        prop_assert!(closed_ids.insert(closed.session_id), "session closed twice");
                    }
                }
            }

            let open = engine.open_sessions();
            let keys: HashSet<_> = open.iter().map(|s| s.key).collect();
            let ids: HashSet<_> = open.iter().map(|s| s.session_id).collect();
            prop_assert_eq!(keys.len(), open.len());
            prop_assert_eq!(ids.len(), open.len());
            prop_assert!(ids.is_disjoint(&closed_ids));
        }
    }
}
