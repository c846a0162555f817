//! Directional line-crossing counter.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// A counting line. The positive side is to the left of `start -> end`
/// in image coordinates (the sign of the 2D cross product).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossingLine {
    pub name: String,
    pub start: [f32; 2],
    pub end: [f32; 2],
}

impl CrossingLine {
    pub fn new(name: impl Into<String>, start: [f32; 2], end: [f32; 2]) -> Self {
        Self {
            name: name.into(),
            start,
            end,
        }
    }

    /// Signed perpendicular distance from the line.
    pub fn signed_offset(&self, p: &Point2<f32>) -> f32 {
        let a = Point2::from(self.start);
        let b = Point2::from(self.end);
        let dir = b - a;
        let len = dir.norm();
        if len <= f32::EPSILON {
            return 0.0;
        }
        dir.perp(&(p - a)) / len
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.start.iter().chain(self.end.iter()).any(|v| !v.is_finite()) {
            return Err(format!("line `{}` has non-finite endpoints", self.name));
        }
        let a = Point2::from(self.start);
        let b = Point2::from(self.end);
        if nalgebra::distance(&a, &b) <= f32::EPSILON {
            return Err(format!("line `{}` has coincident endpoints", self.name));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrossingDirection {
    /// Negative side to positive side.
    Entry,
    /// Positive side to negative side.
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Negative,
    Positive,
}

/// Side-of-line memory for one track against one line.
#[derive(Debug, Clone, Default)]
pub struct LineCounter {
    side: Option<Side>,
}

impl LineCounter {
    /// Feed the next offset. The first offset only sets the baseline.
    pub fn observe(&mut self, offset: f32, deadband: f32) -> Option<CrossingDirection> {
        if !offset.is_finite() || offset.abs() <= deadband {
            return None;
        }
        let side = if offset > 0.0 {
            Side::Positive
        } else {
            Side::Negative
        };

        let previous = self.side.replace(side)?;
        match (previous, side) {
            (Side::Negative, Side::Positive) => Some(CrossingDirection::Entry),
            (Side::Positive, Side::Negative) => Some(CrossingDirection::Exit),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.side = None;
    }
}
