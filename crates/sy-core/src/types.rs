use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque session identity, stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used for default titles and log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport-level connection identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of an agent backend (`claude`, `gemini`, ...). Also the method prefix
/// used on the wire: `<kind>/complete`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentKind(String);

impl AgentKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// JSON-RPC method for a completion request to this agent.
    pub fn complete_method(&self) -> String {
        format!("{}/complete", self.0)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Detached,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Detached => write!(f, "detached"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Command records
// ---------------------------------------------------------------------------

/// How an input line was dispatched.
///
/// Serialized as `"local"`, `"control"` or `"agent:<kind>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Classification {
    Local,
    Agent(AgentKind),
    Control,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Local => write!(f, "local"),
            Classification::Control => write!(f, "control"),
            Classification::Agent(kind) => write!(f, "agent:{kind}"),
        }
    }
}

impl From<Classification> for String {
    fn from(c: Classification) -> Self {
        c.to_string()
    }
}

impl TryFrom<String> for Classification {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "local" => Ok(Classification::Local),
            "control" => Ok(Classification::Control),
            other => match other.strip_prefix("agent:") {
                Some(kind) if !kind.is_empty() => Ok(Classification::Agent(AgentKind::new(kind))),
                _ => Err(format!("unknown classification: {other}")),
            },
        }
    }
}

/// Terminal status of a [`CommandRecord`].
///
/// `Pending` is the only non-terminal state; there is no transition out of a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Pending => write!(f, "pending"),
            RecordStatus::Completed => write!(f, "completed"),
            RecordStatus::Failed => write!(f, "failed"),
            RecordStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One piece of output, stamped on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub text: String,
    pub at: DateTime<Utc>,
}

impl OutputChunk {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            at: Utc::now(),
        }
    }
}

/// The unit of transcript history: one issued command and its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Monotonically increasing, scoped to the owning session, starting at 1.
    pub seq: u64,
    pub input: String,
    pub classification: Classification,
    pub chunks: Vec<OutputChunk>,
    pub status: RecordStatus,
    pub issued_at: DateTime<Utc>,
}

impl CommandRecord {
    pub fn new(seq: u64, input: impl Into<String>, classification: Classification) -> Self {
        Self {
            seq,
            input: input.into(),
            classification,
            chunks: Vec::new(),
            status: RecordStatus::Pending,
            issued_at: Utc::now(),
        }
    }

    /// All chunk text concatenated in arrival order.
    pub fn output_text(&self) -> String {
        self.chunks.iter().map(|c| c.text.as_str()).collect()
    }
}

/// Point-in-time view of a session, as reported to clients and the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub state: SessionState,
    pub owner: Option<ConnectionId>,
    pub records: usize,
    pub pending: usize,
    pub created_at: DateTime<Utc>,
}
