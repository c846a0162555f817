//! Track lifecycle and verification-result cache engine.
//!
//! Sits behind a multi-object tracker (such as ByteTrack) and turns its
//! per-frame track IDs into application-level sessions: it decides when an
//! expensive external verification is worth paying for, caches the answer
//! for the entity's visible lifetime, merges identities across short
//! disappearances and closes every session exactly once.

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod persist;
pub mod reaper;
pub mod session;
pub mod verify;
pub mod zone;

pub use cache::{CacheStats, Claim, Lookup, VerificationCache};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{CacheConfig, EngineConfig, GateConfig, SessionConfig, ZoneConfig};
pub use engine::{Engine, FiredEvent, TrackReport};
pub use error::{ConfigError, ObservationError, VerificationError};
pub use gate::{Admission, CallGate};
pub use metrics::{EngineMetrics, MetricsSummary};
pub use persist::{ChannelSink, PersistenceRecord, PersistenceSink};
pub use reaper::SessionReaper;
pub use session::{
    ClosedSession, CropRef, MergeSource, Observation, ObservationBuilder, Rect, Session,
    SessionId, SessionUpdate, StreamId, TrackKey, TrackSessionRegistry, TrackedObservation,
};
pub use verify::{
    HttpVerifier, Label, LocalVerifier, ResultSource, Verdict, VerificationResult, Verifier,
};
pub use zone::{Axis, CrossingDirection, CrossingEvent, CrossingLine, GateEvent, Region, ZoneTrigger};
