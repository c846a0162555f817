mod builder;
mod lifecycle;
mod matching;
mod observation;
mod rect;
mod registry;

pub use builder::ObservationBuilder;
pub use lifecycle::{ClosedSession, Session, SessionId};
pub use observation::{CropRef, Observation, StreamId, TrackKey, TrackedObservation, dedup_batch};
pub use rect::{Rect, distance_batch};
pub use registry::{MergeSource, SessionHandle, SessionUpdate, TrackSessionRegistry};
