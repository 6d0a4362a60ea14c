use std::sync::Arc;

use serde::Serialize;
use sy_core::protocol::ServerFrame;
use sy_core::types::{OutputChunk, RecordStatus, SessionId};
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::event_bus::TranscriptEvent;
use crate::registry::SessionRegistry;

/// Whether a chunk ends its record, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finality {
    Partial,
    Completed,
    Failed,
}

impl Finality {
    fn status(self) -> Option<RecordStatus> {
        match self {
            Finality::Partial => None,
            Finality::Completed => Some(RecordStatus::Completed),
            Finality::Failed => Some(RecordStatus::Failed),
        }
    }
}

/// What happened to a frame after it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Queued to the session's live owner.
    Delivered,
    /// No owner right now; the record keeps it for the next replay.
    Buffered,
}

/// Appends command output to session history, then forwards it live.
///
/// The append and the push happen under the session lock, in that order, so a
/// chunk is either part of the replay a new owner receives or arrives after it
/// as a live frame. Never both, never neither.
#[derive(Clone)]
pub struct OutputMultiplexer {
    registry: Arc<SessionRegistry>,
}

impl OutputMultiplexer {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Record `text` against `(session_id, seq)` and deliver it to the owner.
    ///
    /// Fails if the session is closed or unknown, if the record does not
    /// exist, or if the record already reached a terminal status.
    pub fn emit(
        &self,
        session_id: SessionId,
        seq: u64,
        text: impl Into<String>,
        finality: Finality,
    ) -> Result<Delivery> {
        let chunk = OutputChunk::now(text);
        let status = finality.status();
        self.registry.with_session(session_id, |s| {
            {
                let record = s
                    .record_mut(seq)
                    .ok_or(SessionError::UnknownRecord { session_id, seq })?;
                if record.status.is_terminal() {
                    return Err(SessionError::RecordFinished {
                        session_id,
                        seq,
                        status: record.status,
                    });
                }
                record.chunks.push(chunk.clone());
                if let Some(status) = status {
                    record.status = status;
                }
            }

            let delivery = s.push_to_owner(ServerFrame::Output {
                session_id,
                seq,
                chunk: chunk.clone(),
                status,
            });
            self.registry.bus().publish(TranscriptEvent::Chunk {
                session_id,
                seq,
                chunk,
                status,
            });
            debug!(%session_id, seq, ?finality, ?delivery, "output recorded");
            Ok(delivery)
        })
    }

    pub fn partial(&self, session_id: SessionId, seq: u64, text: impl Into<String>) -> Result<Delivery> {
        self.emit(session_id, seq, text, Finality::Partial)
    }

    pub fn complete(&self, session_id: SessionId, seq: u64, text: impl Into<String>) -> Result<Delivery> {
        self.emit(session_id, seq, text, Finality::Completed)
    }

    pub fn fail(&self, session_id: SessionId, seq: u64, text: impl Into<String>) -> Result<Delivery> {
        self.emit(session_id, seq, text, Finality::Failed)
    }
}
