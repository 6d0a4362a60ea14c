//! JSON-RPC 2.0 messages exchanged with agent endpoints.
//!
//! Requests are always `<kind>/complete` calls. The correlation id is a
//! plain integer; agents must echo it back unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sy_core::types::AgentKind;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes, plus the ones this crate synthesizes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Reply carried neither `result` nor `error`.
    pub const EMPTY_REPLY: i64 = -32001;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteParams {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: CompleteParams,
}

impl RpcRequest {
    pub fn complete(id: u64, kind: &AgentKind, prompt: impl Into<String>, max_tokens: Option<u32>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: kind.complete_method(),
            params: CompleteParams {
                prompt: prompt.into(),
                max_tokens,
            },
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// What a reply means for the command that is waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Completion(String),
    Failure { code: i64, message: String },
}

impl RpcReply {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(Value::from(id)),
            result: Some(result),
            error: None,
        }
    }

    pub fn completion(id: u64, text: impl Into<String>) -> Self {
        Self::success(id, serde_json::json!({ "completion": text.into() }))
    }

    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(Value::from(id)),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// The correlation id, accepting a number or a numeric string.
    pub fn correlation_id(&self) -> Option<u64> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// `result.completion` when present; a string result as-is; any other
    /// result as compact JSON. An `error` member always wins.
    pub fn outcome(&self) -> ReplyOutcome {
        if let Some(err) = &self.error {
            return ReplyOutcome::Failure {
                code: err.code,
                message: err.message.clone(),
            };
        }
        match &self.result {
            Some(Value::String(s)) => ReplyOutcome::Completion(s.clone()),
            Some(result) => match result.get("completion").and_then(Value::as_str) {
                Some(text) => ReplyOutcome::Completion(text.to_string()),
                None => ReplyOutcome::Completion(result.to_string()),
            },
            None => ReplyOutcome::Failure {
                code: error_codes::EMPTY_REPLY,
                message: "reply carried neither result nor error".into(),
            },
        }
    }
}

/// Parse one line of agent output. Blank lines yield `None`.
pub fn parse_reply_line(line: &str) -> Option<serde_json::Result<RpcReply>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let req = RpcRequest::complete(7, &AgentKind::new("claude"), "refactor foo", Some(1000));
        let v: Value = serde_json::from_str(&req.to_line().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "claude/complete",
                "params": { "prompt": "refactor foo", "max_tokens": 1000 }
            })
        );
    }

    #[test]
    fn max_tokens_omitted_when_unset() {
        let req = RpcRequest::complete(1, &AgentKind::new("gemini"), "", None);
        assert!(!req.to_line().unwrap().contains("max_tokens"));
    }

    #[test]
    fn completion_outcome() {
        let reply: RpcReply =
            serde_json::from_str(r#"{"id":3,"result":{"completion":"done","usage":{}}}"#).unwrap();
        assert_eq!(reply.correlation_id(), Some(3));
        assert_eq!(reply.outcome(), ReplyOutcome::Completion("done".into()));
    }

    #[test]
    fn result_without_completion_is_rendered_as_json() {
        let reply = RpcReply::success(1, json!({"text": "hi"}));
        assert_eq!(reply.outcome(), ReplyOutcome::Completion(r#"{"text":"hi"}"#.into()));
    }

    #[test]
    fn error_outcome_wins() {
        let reply: RpcReply = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"12","error":{"code":-32602,"message":"prompt too long"}}"#,
        )
        .unwrap();
        assert_eq!(reply.correlation_id(), Some(12));
        assert_eq!(
            reply.outcome(),
            ReplyOutcome::Failure {
                code: error_codes::INVALID_PARAMS,
                message: "prompt too long".into()
            }
        );
    }

    #[test]
    fn empty_reply_is_a_failure() {
        let reply: RpcReply = serde_json::from_str(r#"{"id":1}"#).unwrap();
        assert!(matches!(reply.outcome(), ReplyOutcome::Failure { code, .. } if code == error_codes::EMPTY_REPLY));
    }

    #[test]
    fn odd_ids_do_not_correlate() {
        let reply: RpcReply = serde_json::from_str(r#"{"id":null,"result":"x"}"#).unwrap();
        assert_eq!(reply.correlation_id(), None);
        let reply: RpcReply = serde_json::from_str(r#"{"id":-4,"result":"x"}"#).unwrap();
        assert_eq!(reply.correlation_id(), None);
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(parse_reply_line("   ").is_none());
        assert!(parse_reply_line("not json").unwrap().is_err());
        assert!(parse_reply_line(r#"{"id":1,"result":"ok"}"#).unwrap().is_ok());
    }
}
