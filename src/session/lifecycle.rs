//! Application-level session for one physical entity's visit.

use std::fmt;
use std::time::Duration;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::session::observation::{CropRef, StreamId, TrackKey, TrackedObservation};
use crate::verify::{Label, VerificationResult};
use crate::zone::TrackZoneState;

/// Session identifier. Allocated by the registry, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// One open session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    /// Cache key shared by every session of the same physical entity. Equals
    /// `session_id` unless this session resumed a closed one.
    pub identity: SessionId,
    /// Track currently feeding this session
    pub key: TrackKey,
    pub label: Label,
    /// Confidence of `label`, 0-100
    pub confidence: f32,
    pub object_class: String,
    pub started_at: Timestamp,
    pub last_seen_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub last_centroid: Point2<f32>,
    /// Number of frames that updated this session
    pub observations: u64,
    pub resumed_from: Option<SessionId>,
    /// Track ids this session was previously known under
    pub previous_tracks: Vec<u64>,
    pub zone: TrackZoneState,
    pub latest_crop: Option<CropRef>,
}

impl Session {
    pub(crate) fn new(session_id: SessionId, obs: &TrackedObservation, now: Timestamp) -> Self {
        Self {
            session_id,
            identity: session_id,
            key: obs.key,
            label: Label::Unknown,
            confidence: 0.0,
            object_class: obs.object_class.clone(),
            started_at: now,
            last_seen_at: now,
            closed_at: None,
            last_centroid: obs.centroid,
            observations: 1,
            resumed_from: None,
            previous_tracks: Vec::new(),
            zone: TrackZoneState::default(),
            latest_crop: obs.crop.clone(),
        }
    }

    /// Continue a closed session under a fresh id, keeping its identity and label.
    pub(crate) fn resume(
        session_id: SessionId,
        closed: &ClosedSession,
        obs: &TrackedObservation,
        now: Timestamp,
    ) -> Self {
        let mut session = Self::new(session_id, obs, now);
        session.identity = closed.identity;
        session.label = closed.label.clone();
        session.confidence = closed.confidence;
        session.resumed_from = Some(closed.session_id);
        session.previous_tracks.push(closed.last_track_id);
        session
    }

    pub(crate) fn observe(&mut self, obs: &TrackedObservation, now: Timestamp) {
        self.last_seen_at = self.last_seen_at.max(now);
        self.last_centroid = obs.centroid;
        self.observations += 1;
        if obs.crop.is_some() {
            self.latest_crop = obs.crop.clone();
        }
    }

    /// Move an idle session onto a new track id.
    pub(crate) fn rekey(&mut self, obs: &TrackedObservation, now: Timestamp) {
        if self.key != obs.key {
            self.previous_tracks.push(self.key.track_id);
            self.key = obs.key;
        }
        self.observe(obs, now);
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    #[inline]
    pub fn idle_for(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.last_seen_at)
    }

    /// Apply a verification result.
    ///
    /// Only confirmed results (resolved label, confidence at or above
    /// `min_confidence`) change the label, and a resolved label is never
    /// replaced by a lower-confidence one. Returns whether the label changed.
    pub fn apply_result(&mut self, result: &VerificationResult, min_confidence: f32) -> bool {
        if !self.is_open() || !result.is_confirmed(min_confidence) {
            return false;
        }
        if self.label.is_resolved() && result.confidence < self.confidence {
            return false;
        }
        let changed = self.label != result.label;
        self.label = result.label.clone();
        self.confidence = result.confidence;
        changed
    }

    pub(crate) fn close(&mut self, now: Timestamp) -> ClosedSession {
        let closed_at = *self.closed_at.get_or_insert(now);
        ClosedSession {
            session_id: self.session_id,
            identity: self.identity,
            stream_id: self.key.stream_id,
            last_track_id: self.key.track_id,
            previous_tracks: self.previous_tracks.clone(),
            object_class: self.object_class.clone(),
            label: self.label.clone(),
            confidence: self.confidence,
            started_at: self.started_at,
            last_seen_at: self.last_seen_at,
            closed_at,
            duration: self.last_seen_at.saturating_since(self.started_at),
            observations: self.observations,
            last_position: [self.last_centroid.x, self.last_centroid.y],
            resumed_from: self.resumed_from,
        }
    }
}

/// Frozen terminal record of a session, handed to persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedSession {
    pub session_id: SessionId,
    pub identity: SessionId,
    pub stream_id: StreamId,
    pub last_track_id: u64,
    pub previous_tracks: Vec<u64>,
    pub object_class: String,
    pub label: Label,
    pub confidence: f32,
    pub started_at: Timestamp,
    pub last_seen_at: Timestamp,
    pub closed_at: Timestamp,
    /// Visible duration, first to last observation
    pub duration: Duration,
    pub observations: u64,
    pub last_position: [f32; 2],
    pub resumed_from: Option<SessionId>,
}

impl ClosedSession {
    pub fn last_centroid(&self) -> Point2<f32> {
        Point2::from(self.last_position)
    }
}
