//! Builder for creating Observation objects from various tracker output formats.

use crate::clock::Timestamp;
use crate::session::observation::{CropRef, Observation, StreamId};
use crate::session::rect::Rect;

/// Builder for creating `Observation` objects from various input formats.
#[derive(Debug, Clone)]
pub struct ObservationBuilder {
    stream_id: StreamId,
    track_id: Option<u64>,
    frame_timestamp: Timestamp,
    bbox: Rect,
    score: f32,
    object_class: String,
    crop: Option<CropRef>,
}

impl Default for ObservationBuilder {
    fn default() -> Self {
        Self {
            stream_id: StreamId::default(),
            track_id: None,
            frame_timestamp: Timestamp::ZERO,
            bbox: Rect::default(),
            score: 1.0,
            object_class: "object".to_string(),
            crop: None,
        }
    }
}

impl ObservationBuilder {
    /// Create a new observation builder.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(mut self, stream_id: StreamId) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn track(mut self, track_id: u64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn at(mut self, frame_timestamp: Timestamp) -> Self {
        self.frame_timestamp = frame_timestamp;
        self
    }

    /// Set bounding box in TLBR format (x1, y1, x2, y2).
    pub fn tlbr(mut self, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        self.bbox = Rect::from_tlbr(x1, y1, x2, y2);
        self
    }

    /// Set bounding box in XYWH format (center_x, center_y, width, height).
    pub fn xywh(mut self, cx: f32, cy: f32, w: f32, h: f32) -> Self {
        self.bbox = Rect::from_xywh(cx, cy, w, h);
        self
    }

    /// Set bounding box in TLWH format (left, top, width, height).
    pub fn tlwh(mut self, x: f32, y: f32, w: f32, h: f32) -> Self {
        self.bbox = Rect::new(x, y, w, h);
        self
    }

    /// Place a small box centred on `(cx, cy)`.
    pub fn centred_at(self, cx: f32, cy: f32) -> Self {
        self.xywh(cx, cy, 40.0, 80.0)
    }

    /// Set the confidence score.
    pub fn score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    pub fn class(mut self, object_class: impl Into<String>) -> Self {
        self.object_class = object_class.into();
        self
    }

    pub fn crop(mut self, crop: impl Into<CropRef>) -> Self {
        self.crop = Some(crop.into());
        self
    }

    /// Build the final `Observation`.
    pub fn build(self) -> Observation {
        Observation {
            stream_id: self.stream_id,
            track_id: self.track_id,
            frame_timestamp: self.frame_timestamp,
            bbox: self.bbox,
            score: self.score,
            object_class: self.object_class,
            crop: self.crop,
        }
    }
}
