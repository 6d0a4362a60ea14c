use async_trait::async_trait;
use serde::Serialize;

use crate::protocol::{RpcReply, RpcRequest};

// ---------------------------------------------------------------------------
// Endpoint errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint not connected")]
    NotConnected,

    #[error("failed to start agent process: {0}")]
    Spawn(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// EndpointKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Stdio,
    Http,
    InProcess,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Stdio => write!(f, "stdio"),
            EndpointKind::Http => write!(f, "http"),
            EndpointKind::InProcess => write!(f, "in-process"),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// Everything an endpoint reports back to the pool, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A reply as the agent sent it. Correlation happens in the pool.
    Reply(RpcReply),
    /// The request with this id was accepted but can never be answered.
    Undeliverable { id: u64, reason: String },
    /// The endpoint lost its agent; nothing outstanding will be answered.
    Disconnected { reason: String },
}

pub type InboundSink = flume::Sender<Inbound>;

/// A fresh channel for an endpoint to report on.
pub fn inbound_channel() -> (InboundSink, flume::Receiver<Inbound>) {
    flume::unbounded()
}

// ---------------------------------------------------------------------------
// AgentEndpoint
// ---------------------------------------------------------------------------

/// The connection to one agent backend.
///
/// `dispatch` only hands the request over; it never waits for the answer.
/// Replies come back on the [`InboundSink`] the endpoint was built with, so
/// a persistent channel and a one-shot HTTP call look the same to the pool.
#[async_trait]
pub trait AgentEndpoint: Send + Sync + 'static {
    fn transport(&self) -> EndpointKind;

    async fn dispatch(&self, request: RpcRequest) -> Result<(), EndpointError>;

    /// Release the underlying process or client. Idempotent.
    async fn shutdown(&self);
}
