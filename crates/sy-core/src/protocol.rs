//! Client transport frames.
//!
//! Every frame is a JSON object. Client frames are tagged by `kind`
//! (`input` or `control`), server frames by `type`.

use serde::{Deserialize, Serialize};

use crate::types::{
    Classification, CommandRecord, ConnectionId, OutputChunk, RecordStatus, SessionId,
    SessionSummary,
};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Input delta for a session. Lines are assembled by the gateway.
    Input {
        session_id: SessionId,
        payload: String,
    },
    /// Session open/attach/close/rename and connection housekeeping.
    Control {
        #[serde(default)]
        session_id: Option<SessionId>,
        payload: ControlRequest,
    },
}

impl ClientFrame {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            ClientFrame::Input { session_id, .. } => Some(*session_id),
            ClientFrame::Control { session_id, .. } => *session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Create a session and attach it to this connection.
    Open {
        #[serde(default)]
        title: Option<String>,
    },
    Attach,
    Detach,
    Close,
    Rename { title: String },
    /// List open sessions; only this connection's when `owned` is set.
    List {
        #[serde(default)]
        owned: bool,
    },
    Ping,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Frame-level error codes. Command failures never use these; they arrive as
/// output chunks on the failing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionUnknown,
    AlreadyOwned,
    NotAttached,
    MalformedFrame,
    /// A command record the frame acted on could not be updated.
    RecordRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Hello {
        connection_id: ConnectionId,
    },
    Attached {
        session: SessionSummary,
    },
    /// Transcript snapshot delivered on attach, before any new output.
    Replay {
        session_id: SessionId,
        records: Vec<CommandRecord>,
    },
    Issued {
        session_id: SessionId,
        seq: u64,
        input: String,
        classification: Classification,
    },
    Output {
        session_id: SessionId,
        seq: u64,
        chunk: OutputChunk,
        /// Present on the chunk that terminates the record.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<RecordStatus>,
    },
    Detached {
        session_id: SessionId,
    },
    Closed {
        session_id: SessionId,
        cancelled: Vec<u64>,
    },
    Renamed {
        session_id: SessionId,
        title: String,
    },
    SessionList {
        sessions: Vec<SessionSummary>,
    },
    Pong,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        code: ErrorCode,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(session_id: Option<SessionId>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            session_id,
            code,
            message: message.into(),
        }
    }
}
