use std::time::Duration;

use sy_core::types::AgentKind;
use thiserror::Error;

/// Failures of an agent request. Every one of them ends up as the final
/// output chunk of the command record that issued the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("no agent registered for kind '{0}'")]
    UnknownKind(AgentKind),

    /// The endpoint could not accept or deliver the request.
    #[error("{kind} agent unreachable: {reason}")]
    Unreachable { kind: AgentKind, reason: String },

    #[error("{kind} agent did not reply within {}s", .after.as_secs())]
    Timeout { kind: AgentKind, after: Duration },

    /// The agent replied with an error, or with something unusable.
    #[error("{kind} agent error {code}: {message}")]
    Protocol {
        kind: AgentKind,
        code: i64,
        message: String,
    },

    /// The correlation table is full. Nothing was sent.
    #[error("{kind} agent overloaded: {limit} requests already outstanding")]
    Overloaded { kind: AgentKind, limit: usize },

    #[error("invalid agent configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_surface_agent_text_verbatim() {
        let err = AgentError::Protocol {
            kind: AgentKind::new("claude"),
            code: -32000,
            message: "rate limited: try again".into(),
        };
        assert_eq!(err.to_string(), "claude agent error -32000: rate limited: try again");
    }

    #[test]
    fn timeout_reports_whole_seconds() {
        let err = AgentError::Timeout {
            kind: AgentKind::new("gemini"),
            after: Duration::from_secs(120),
        };
        assert_eq!(err.to_string(), "gemini agent did not reply within 120s");
    }
}
