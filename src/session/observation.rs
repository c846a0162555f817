//! Tracker feed records and their validation.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::error::ObservationError;
use crate::session::rect::Rect;

/// Camera stream identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam{}", self.0)
    }
}

/// Track IDs are only unique within one camera stream, so every per-track
/// structure is keyed by the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackKey {
    pub stream_id: StreamId,
    pub track_id: u64,
}

impl TrackKey {
    pub fn new(stream_id: StreamId, track_id: u64) -> Self {
        Self {
            stream_id,
            track_id,
        }
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.track_id)
    }
}

/// Shared handle to an encoded image crop.
#[derive(Clone, PartialEq, Eq)]
pub struct CropRef(Arc<[u8]>);

impl CropRef {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for CropRef {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for CropRef {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for CropRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CropRef({} bytes)", self.0.len())
    }
}

/// One object in one frame, as delivered by the tracker feed.
#[derive(Debug, Clone)]
pub struct Observation {
    pub stream_id: StreamId,
    /// `None` when the tracker failed to assign an id; such records are dropped.
    pub track_id: Option<u64>,
    pub frame_timestamp: Timestamp,
    pub bbox: Rect,
    /// Detection confidence score
    pub score: f32,
    pub object_class: String,
    pub crop: Option<CropRef>,
}

/// A validated observation.
#[derive(Debug, Clone)]
pub struct TrackedObservation {
    pub key: TrackKey,
    pub frame_timestamp: Timestamp,
    pub bbox: Rect,
    pub centroid: Point2<f32>,
    pub score: f32,
    pub object_class: String,
    pub crop: Option<CropRef>,
}

impl TryFrom<Observation> for TrackedObservation {
    type Error = ObservationError;

    fn try_from(obs: Observation) -> Result<Self, Self::Error> {
        let track_id = obs.track_id.ok_or(ObservationError::MissingTrackId)?;
        if !obs.bbox.is_finite() {
            return Err(ObservationError::NonFiniteBox);
        }
        if obs.bbox.width <= 0.0 || obs.bbox.height <= 0.0 {
            return Err(ObservationError::EmptyBox {
                width: obs.bbox.width,
                height: obs.bbox.height,
            });
        }

        Ok(Self {
            key: TrackKey::new(obs.stream_id, track_id),
            frame_timestamp: obs.frame_timestamp,
            centroid: obs.bbox.centroid(),
            bbox: obs.bbox,
            score: if obs.score.is_finite() { obs.score } else { 0.0 },
            object_class: obs.object_class,
            crop: obs.crop,
        })
    }
}

/// Collapse duplicate observations of the same track within one batch.
///
/// The highest detection score wins; equal scores keep the later frame.
/// Output order follows each key's first appearance in the batch.
pub fn dedup_batch(observations: Vec<TrackedObservation>) -> Vec<TrackedObservation> {
    let mut slots: HashMap<TrackKey, usize> = HashMap::with_capacity(observations.len());
    let mut kept: Vec<TrackedObservation> = Vec::with_capacity(observations.len());

    for obs in observations {
        match slots.entry(obs.key) {
            Entry::Vacant(v) => {
                v.insert(kept.len());
                kept.push(obs);
            }
            Entry::Occupied(o) => {
                let current = &mut kept[*o.get()];
                let better = obs.score > current.score
                    || (obs.score == current.score && obs.frame_timestamp > current.frame_timestamp);
                if better {
                    *current = obs;
                }
            }
        }
    }

    kept
}
