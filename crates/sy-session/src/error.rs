use sy_core::types::{ConnectionId, RecordStatus, SessionId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session never existed or has been closed.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session {session_id} is owned by live connection {owner}")]
    AlreadyOwned {
        session_id: SessionId,
        owner: ConnectionId,
    },

    #[error("session {0} is not attached to this connection")]
    NotAttached(SessionId),

    #[error("session {session_id} has no record {seq}")]
    UnknownRecord { session_id: SessionId, seq: u64 },

    #[error("record {seq} of session {session_id} is already {status}")]
    RecordFinished {
        session_id: SessionId,
        seq: u64,
        status: RecordStatus,
    },
}

pub type Result<T> = std::result::Result<T, SessionError>;
