//! Hand-off to the persistence collaborator.
//!
//! Submission is fire-and-forget from the engine's point of view. Retrying
//! failed writes is the collaborator's job; the sink only guarantees a record
//! is never dropped without a log line.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::session::ClosedSession;
use crate::zone::{CrossingEvent, GateEvent};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PersistenceRecord {
    SessionClosed(ClosedSession),
    Gate(GateEvent),
    Crossing(CrossingEvent),
}

impl PersistenceRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistenceRecord::SessionClosed(_) => "session_closed",
            PersistenceRecord::Gate(_) => "gate",
            PersistenceRecord::Crossing(_) => "crossing",
        }
    }
}

pub trait PersistenceSink: Send + Sync {
    fn submit(&self, record: PersistenceRecord);
}

/// Forwards records over a tokio channel to the persistence task.
pub struct ChannelSink {
    tx: mpsc::Sender<PersistenceRecord>,
}

impl ChannelSink {
    /// Create the sink and the receiver the persistence task should drain.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PersistenceRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl PersistenceSink for ChannelSink {
    fn submit(&self, record: PersistenceRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                // Back-pressure: hand the send to the runtime rather than block the frame loop.
                warn!(kind = record.kind(), "persistence channel full, deferring record");
                let tx = self.tx.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(e) = tx.send(record).await {
                                error!(kind = e.0.kind(), "persistence receiver dropped, record lost");
                            }
                        });
                    }
                    Err(_) => error!(kind = record.kind(), "no runtime to defer record, record lost"),
                }
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                error!(kind = record.kind(), "persistence receiver dropped, record lost");
            }
        }
    }
}
