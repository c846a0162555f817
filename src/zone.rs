//! Zone logic: one-shot verification trigger and directional line counting.

mod crossing;
mod region;
mod trigger;

pub use crossing::{CrossingDirection, CrossingLine, LineCounter};
pub use region::{Axis, Region};
pub use trigger::{OneShotTrigger, TriggerState};

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::config::ZoneConfig;
use crate::session::{SessionId, TrackKey};

/// Emitted when a session issues its first verification request inside the gate region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateEvent {
    pub session_id: SessionId,
    pub track: TrackKey,
    pub fired: bool,
    pub fired_at: Timestamp,
}

/// Emitted when a track's centroid changes side of a counting line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossingEvent {
    pub session_id: SessionId,
    pub track: TrackKey,
    pub line: String,
    pub direction: CrossingDirection,
    pub at: Timestamp,
}

/// Zone state carried by each session.
#[derive(Debug, Clone, Default)]
pub struct TrackZoneState {
    trigger: OneShotTrigger,
    /// Track the line counters are baselined on
    track: Option<TrackKey>,
    counters: Vec<LineCounter>,
}

impl TrackZoneState {
    pub fn trigger(&self) -> &OneShotTrigger {
        &self.trigger
    }
}

/// Result of feeding one centroid through the zone machines.
#[derive(Debug, Clone, Default)]
pub struct ZoneObservation {
    pub in_gate: bool,
    pub crossings: Vec<CrossingEvent>,
}

/// Shared, immutable zone configuration; per-track state lives in [`TrackZoneState`].
#[derive(Debug, Clone, Default)]
pub struct ZoneTrigger {
    gate: Region,
    lines: Vec<CrossingLine>,
    deadband: f32,
}

impl ZoneTrigger {
    pub fn new(gate: Region, lines: Vec<CrossingLine>, deadband: f32) -> Self {
        Self {
            gate,
            lines,
            deadband,
        }
    }

    pub fn from_config(config: &ZoneConfig) -> Self {
        Self::new(
            config.gate.clone().unwrap_or_default(),
            config.lines.clone(),
            config.crossing_deadband,
        )
    }

    pub fn gate(&self) -> &Region {
        &self.gate
    }

    pub fn lines(&self) -> &[CrossingLine] {
        &self.lines
    }

    /// Update both machines with the latest centroid of `track`.
    ///
    /// A track change (re-keyed session) resets line baselines but keeps the
    /// one-shot trigger, which belongs to the session.
    pub fn observe(
        &self,
        state: &mut TrackZoneState,
        session_id: SessionId,
        track: TrackKey,
        centroid: &Point2<f32>,
        now: Timestamp,
    ) -> ZoneObservation {
        if state.counters.len() != self.lines.len() {
            state.counters = vec![LineCounter::default(); self.lines.len()];
        } else if state.track != Some(track) {
            state.counters.iter_mut().for_each(LineCounter::reset);
        }
        state.track = Some(track);

        let in_gate = self.gate.contains(centroid);
        state.trigger.observe(in_gate);

        let crossings = self
            .lines
            .iter()
            .zip(state.counters.iter_mut())
            .filter_map(|(line, counter)| {
                let offset = line.signed_offset(centroid);
                counter
                    .observe(offset, self.deadband)
                    .map(|direction| CrossingEvent {
                        session_id,
                        track,
                        line: line.name.clone(),
                        direction,
                        at: now,
                    })
            })
            .collect();

        ZoneObservation { in_gate, crossings }
    }

    /// Fire the one-shot trigger for the session's first verification request.
    pub fn fire(
        &self,
        state: &mut TrackZoneState,
        session_id: SessionId,
        track: TrackKey,
        now: Timestamp,
    ) -> Option<GateEvent> {
        state.trigger.fire(now).then(|| GateEvent {
            session_id,
            track,
            fired: true,
            fired_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StreamId;

    fn key(track_id: u64) -> TrackKey {
        TrackKey::new(StreamId(0), track_id)
    }

    fn t(frame: u64) -> Timestamp {
        Timestamp::from_millis(frame * 33)
    }

    #[test]
    fn test_fifty_frames_in_zone_fire_once() {
        let zones = ZoneTrigger::new(
            Region::Band {
                axis: Axis::Y,
                min: 0.0,
                max: 100.0,
            },
            vec![],
            0.0,
        );
        let mut state = TrackZoneState::default();
        let sid = SessionId(1);

        let mut fired = 0;
        for frame in 0..50 {
            let obs = zones.observe(&mut state, sid, key(4), &Point2::new(10.0, 50.0), t(frame));
            assert!(obs.in_gate);
            if zones.fire(&mut state, sid, key(4), t(frame)).is_some() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_leave_and_reenter_same_session() {
        let zones = ZoneTrigger::new(
            Region::Band {
                axis: Axis::X,
                min: 0.0,
                max: 10.0,
            },
            vec![],
            0.0,
        );
        let mut state = TrackZoneState::default();
        let sid = SessionId(1);

        zones.observe(&mut state, sid, key(1), &Point2::new(5.0, 0.0), t(0));
        assert!(zones.fire(&mut state, sid, key(1), t(0)).is_some());

        zones.observe(&mut state, sid, key(1), &Point2::new(50.0, 0.0), t(1));
        assert_eq!(state.trigger().state(), TriggerState::Outside);
        assert!(zones.fire(&mut state, sid, key(1), t(1)).is_none());

        zones.observe(&mut state, sid, key(1), &Point2::new(5.0, 0.0), t(2));
        assert_eq!(state.trigger().state(), TriggerState::InsideFired);
        assert!(zones.fire(&mut state, sid, key(1), t(2)).is_none());
    }

    #[test]
    fn test_crossing_events() {
        let zones = ZoneTrigger::new(
            Region::Everywhere,
            vec![CrossingLine::new("door", [0.0, 0.0], [100.0, 0.0])],
            0.0,
        );
        let mut state = TrackZoneState::default();
        let sid = SessionId(9);

        let first = zones.observe(&mut state, sid, key(2), &Point2::new(50.0, -10.0), t(0));
        assert!(first.crossings.is_empty());

        let entry = zones.observe(&mut state, sid, key(2), &Point2::new(50.0, 10.0), t(1));
        assert_eq!(entry.crossings.len(), 1);
        assert_eq!(entry.crossings[0].direction, CrossingDirection::Entry);
        assert_eq!(entry.crossings[0].line, "door");

        let exit = zones.observe(&mut state, sid, key(2), &Point2::new(50.0, -10.0), t(2));
        assert_eq!(exit.crossings.len(), 1);
        assert_eq!(exit.crossings[0].direction, CrossingDirection::Exit);
    }

    #[test]
    fn test_first_observation_on_positive_side() {
        let zones = ZoneTrigger::new(
            Region::Everywhere,
            vec![CrossingLine::new("door", [0.0, 0.0], [100.0, 0.0])],
            0.0,
        );
        let mut state = TrackZoneState::default();
        let obs = zones.observe(&mut state, SessionId(1), key(3), &Point2::new(50.0, 10.0), t(0));
        assert!(obs.crossings.is_empty());
    }

    #[test]
    fn test_track_change_resets_baseline() {
        let zones = ZoneTrigger::new(
            Region::Everywhere,
            vec![CrossingLine::new("door", [0.0, 0.0], [100.0, 0.0])],
            0.0,
        );
        let mut state = TrackZoneState::default();
        let sid = SessionId(1);

        zones.observe(&mut state, sid, key(7), &Point2::new(50.0, -10.0), t(0));
        // Same session continues under a new track id on the other side.
        let obs = zones.observe(&mut state, sid, key(9), &Point2::new(50.0, 10.0), t(1));
        assert!(obs.crossings.is_empty());
    }
}
