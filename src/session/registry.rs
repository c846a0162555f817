//! Track session registry: owns every open session and drives
//! merge-on-reappearance.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::Timestamp;
use crate::config::SessionConfig;
use crate::session::lifecycle::{ClosedSession, Session, SessionId};
use crate::session::matching::{self, CandidateOrigin, MergeCandidate};
use crate::session::observation::{Observation, TrackKey, TrackedObservation, dedup_batch};

/// Shared handle to an open session. The registry's map shard lock is always
/// taken before the session lock.
pub type SessionHandle = Arc<Mutex<Session>>;

/// How an observation was attached to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// An idle open session previously fed by another track was re-keyed.
    Idle(TrackKey),
    /// A closed session was resumed under a new session id.
    Retired(SessionId),
}

/// Outcome of one observation in [`TrackSessionRegistry::update`].
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub observation: TrackedObservation,
    pub session_id: SessionId,
    pub session: SessionHandle,
    pub is_new_session: bool,
    pub merged_from: Option<MergeSource>,
}

pub struct TrackSessionRegistry {
    open: DashMap<TrackKey, SessionHandle>,
    /// Sessions closed by the reaper, kept for reappearance merges until
    /// they fall out of the merge window.
    retired: Mutex<Vec<ClosedSession>>,
    next_session_id: AtomicU64,
    dropped_observations: AtomicU64,
    config: SessionConfig,
}

impl TrackSessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            open: DashMap::new(),
            retired: Mutex::new(Vec::new()),
            next_session_id: AtomicU64::new(0),
            dropped_observations: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn next_id(&self) -> SessionId {
        SessionId(self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Attach one frame batch of observations to sessions.
    ///
    /// Malformed observations are dropped and counted. Duplicates of a track
    /// within the batch collapse to the highest-scoring one.
    pub fn update(&self, observations: Vec<Observation>, now: Timestamp) -> Vec<SessionUpdate> {
        let mut valid = Vec::with_capacity(observations.len());
        for obs in observations {
            match TrackedObservation::try_from(obs) {
                Ok(o) => valid.push(o),
                Err(e) => {
                    self.dropped_observations.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "dropping malformed observation");
                }
            }
        }
        let batch = dedup_batch(valid);

        let mut updates = Vec::with_capacity(batch.len());
        let mut unmatched = Vec::new();

        // Step 1: continue sessions already open under the same key. Holding the
        // shard guard excludes a concurrent reaper removal of this key.
        for obs in batch {
            let continued = self.open.get(&obs.key).map(|entry| {
                let handle = Arc::clone(entry.value());
                let session_id = {
                    let mut session = handle.lock();
                    session.observe(&obs, now);
                    session.session_id
                };
                (handle, session_id)
            });

            match continued {
                Some((session, session_id)) => updates.push(SessionUpdate {
                    observation: obs,
                    session_id,
                    session,
                    is_new_session: false,
                    merged_from: None,
                }),
                None => unmatched.push(obs),
            }
        }

        if unmatched.is_empty() {
            return updates;
        }

        // Step 2: match the rest against idle and retired sessions.
        let candidates = self.merge_candidates(now);
        let assignment = if candidates.is_empty() {
            vec![None; unmatched.len()]
        } else {
            let refs: Vec<&TrackedObservation> = unmatched.iter().collect();
            let costs = matching::merge_costs(
                &refs,
                &candidates,
                now,
                self.config.merge_radius,
                self.config.min_idle(),
                self.config.merge_window(),
            );
            matching::assign(&costs)
        };

        // Step 3: attach, merging where a candidate was assigned.
        for (obs, slot) in unmatched.into_iter().zip(assignment) {
            let candidate = slot.map(|j| &candidates[j]);
            updates.push(self.attach(obs, candidate, now));
        }

        updates
    }

    fn merge_candidates(&self, now: Timestamp) -> Vec<MergeCandidate> {
        let window = self.config.merge_window();
        let min_idle = self.config.min_idle();
        let mut candidates: Vec<MergeCandidate> = self
            .open
            .iter()
            .filter_map(|entry| {
                let session = entry.value().lock();
                let gap = session.idle_for(now);
                let idle = session.last_seen_at < now && gap >= min_idle && gap <= window;
                idle.then(|| MergeCandidate {
                    origin: CandidateOrigin::Idle { key: *entry.key() },
                    session_id: session.session_id,
                    stream_id: session.key.stream_id,
                    last_seen_at: session.last_seen_at,
                    position: session.last_centroid,
                })
            })
            .collect();

        let retired = self.retired.lock();
        candidates.extend(retired.iter().filter_map(|closed| {
            (now.saturating_since(closed.last_seen_at) <= window).then(|| MergeCandidate {
                origin: CandidateOrigin::Retired,
                session_id: closed.session_id,
                stream_id: closed.stream_id,
                last_seen_at: closed.last_seen_at,
                position: closed.last_centroid(),
            })
        }));
        candidates
    }

    fn attach(
        &self,
        obs: TrackedObservation,
        candidate: Option<&MergeCandidate>,
        now: Timestamp,
    ) -> SessionUpdate {
        let mut resumed_record = None;
        let (session, merged_from) = match candidate.map(|c| (c.origin, c)) {
            Some((CandidateOrigin::Idle { key }, c)) => match self.take_idle(key, c.last_seen_at) {
                Some(handle) => {
                    handle.lock().rekey(&obs, now);
                    (handle, Some(MergeSource::Idle(key)))
                }
                None => (self.fresh(&obs, now), None),
            },
            Some((CandidateOrigin::Retired, c)) => match self.take_retired(c.session_id) {
                Some(closed) => {
                    let resumed = Session::resume(self.next_id(), &closed, &obs, now);
                    let from = MergeSource::Retired(closed.session_id);
                    resumed_record = Some(closed);
                    (Arc::new(Mutex::new(resumed)), Some(from))
                }
                None => (self.fresh(&obs, now), None),
            },
            None => (self.fresh(&obs, now), None),
        };

        let winner = match self.open.entry(obs.key) {
            Entry::Vacant(v) => {
                v.insert(Arc::clone(&session));
                None
            }
            Entry::Occupied(o) => {
                // Another batch opened this key first; feed its session instead.
                let winner = Arc::clone(o.get());
                winner.lock().observe(&obs, now);
                Some(winner)
            }
        };

        if let Some(winner) = winner {
            // Undo the merge that lost the race.
            if let Some(MergeSource::Idle(old_key)) = merged_from {
                self.open.entry(old_key).or_insert(session);
            }
            if let Some(closed) = resumed_record {
                self.retired.lock().push(closed);
            }
            let session_id = winner.lock().session_id;
            return SessionUpdate {
                observation: obs,
                session_id,
                session: winner,
                is_new_session: false,
                merged_from: None,
            };
        }

        let (session_id, label) = {
            let s = session.lock();
            (s.session_id, s.label.clone())
        };
        match merged_from {
            Some(MergeSource::Idle(from)) => {
                info!(session = %session_id, from = %from, to = %obs.key, "re-keyed idle session")
            }
            Some(MergeSource::Retired(from)) => {
                info!(session = %session_id, resumed = %from, track = %obs.key, label = %label, "resumed closed session")
            }
            None => debug!(session = %session_id, track = %obs.key, "opened session"),
        }

        SessionUpdate {
            observation: obs,
            session_id,
            session,
            is_new_session: !matches!(merged_from, Some(MergeSource::Idle(_))),
            merged_from,
        }
    }

    fn fresh(&self, obs: &TrackedObservation, now: Timestamp) -> SessionHandle {
        Arc::new(Mutex::new(Session::new(self.next_id(), obs, now)))
    }

    /// Remove an idle session from its old key if nothing touched it since the snapshot.
    fn take_idle(&self, key: TrackKey, seen_at: Timestamp) -> Option<SessionHandle> {
        self.open
            .remove_if(&key, |_, handle| {
                let s = handle.lock();
                s.is_open() && s.last_seen_at == seen_at
            })
            .map(|(_, handle)| handle)
    }

    fn take_retired(&self, session_id: SessionId) -> Option<ClosedSession> {
        let mut retired = self.retired.lock();
        let idx = retired.iter().position(|c| c.session_id == session_id)?;
        Some(retired.swap_remove(idx))
    }

    /// Close every open session idle for longer than `grace`.
    ///
    /// Removal and closure happen under the key's shard lock, so a concurrent
    /// `update` either refreshes the session first (and it survives) or finds
    /// the key vacant afterwards and opens a new one.
    pub(crate) fn close_idle(&self, now: Timestamp) -> Vec<ClosedSession> {
        let grace = self.config.grace_period();
        let keys: Vec<TrackKey> = self.open.iter().map(|entry| *entry.key()).collect();

        let mut closed = Vec::new();
        for key in keys {
            let mut record = None;
            self.open.remove_if(&key, |_, handle| {
                let mut s = handle.lock();
                if s.is_open() && s.idle_for(now) > grace {
                    record = Some(s.close(now));
                    true
                } else {
                    false
                }
            });
            if let Some(record) = record {
                closed.push(record);
            }
        }

        if !closed.is_empty() {
            self.retired.lock().extend(closed.iter().cloned());
        }
        closed
    }

    /// Drop retired sessions that can no longer be merged. Returns how many were dropped.
    pub(crate) fn prune_retired(&self, now: Timestamp) -> usize {
        let window = self.config.merge_window();
        let mut retired = self.retired.lock();
        let before = retired.len();
        retired.retain(|c| now.saturating_since(c.last_seen_at) <= window);
        before - retired.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.open.len()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    pub fn dropped_observations(&self) -> u64 {
        self.dropped_observations.load(Ordering::Relaxed)
    }

    /// Snapshot of the open session for `key`.
    pub fn session(&self, key: &TrackKey) -> Option<Session> {
        let handle = self.open.get(key).map(|entry| Arc::clone(entry.value()))?;
        let session = handle.lock().clone();
        Some(session)
    }

    /// Snapshot of all open sessions.
    pub fn open_sessions(&self) -> Vec<Session> {
        let handles: Vec<SessionHandle> = self
            .open
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        handles.iter().map(|h| h.lock().clone()).collect()
    }
}
