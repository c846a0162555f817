//! One-shot verification trigger.

use crate::clock::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerState {
    /// Centroid outside the gate region
    #[default]
    Outside,
    /// Inside the region, no verification issued yet this session
    InsideUnfired,
    /// Inside the region, verification already issued this session
    InsideFired,
}

/// Per-session trigger. Fires at most once for the whole session, no matter
/// how often the track leaves and re-enters the region.
#[derive(Debug, Clone, Default)]
pub struct OneShotTrigger {
    state: TriggerState,
    fired_at: Option<Timestamp>,
}

impl OneShotTrigger {
    pub fn observe(&mut self, inside: bool) -> TriggerState {
        self.state = match (inside, self.fired_at) {
            (false, _) => TriggerState::Outside,
            (true, None) => TriggerState::InsideUnfired,
            (true, Some(_)) => TriggerState::InsideFired,
        };
        self.state
    }

    /// Mark the first verification request. Returns `true` only on the transition.
    pub fn fire(&mut self, now: Timestamp) -> bool {
        if self.state != TriggerState::InsideUnfired {
            return false;
        }
        self.state = TriggerState::InsideFired;
        self.fired_at = Some(now);
        true
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn fired_at(&self) -> Option<Timestamp> {
        self.fired_at
    }
}
