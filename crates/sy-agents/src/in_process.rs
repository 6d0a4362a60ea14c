use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::endpoint::{AgentEndpoint, EndpointError, EndpointKind, Inbound, InboundSink};
use crate::protocol::{RpcReply, RpcRequest};

/// An endpoint whose agent lives in the same process, backed by flume
/// channels. The other half is an [`AgentPeer`].
pub struct InProcessEndpoint {
    requests: flume::Sender<RpcRequest>,
    closed: AtomicBool,
}

/// The agent side of an [`InProcessEndpoint`]: receives requests, answers
/// through the pool's inbound sink.
pub struct AgentPeer {
    requests: flume::Receiver<RpcRequest>,
    sink: InboundSink,
}

impl InProcessEndpoint {
    pub fn pair(sink: InboundSink) -> (Self, AgentPeer) {
        let (tx, rx) = flume::unbounded();
        (
            Self {
                requests: tx,
                closed: AtomicBool::new(false),
            },
            AgentPeer { requests: rx, sink },
        )
    }
}

#[async_trait]
impl AgentEndpoint for InProcessEndpoint {
    fn transport(&self) -> EndpointKind {
        EndpointKind::InProcess
    }

    async fn dispatch(&self, request: RpcRequest) -> Result<(), EndpointError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EndpointError::NotConnected);
        }
        self.requests
            .send_async(request)
            .await
            .map_err(|_| EndpointError::SendFailed("agent peer dropped".into()))
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl AgentPeer {
    /// Wait for the next request. `None` once the endpoint is gone.
    pub async fn next_request(&self) -> Option<RpcRequest> {
        self.requests.recv_async().await.ok()
    }

    pub fn try_next_request(&self) -> Option<RpcRequest> {
        self.requests.try_recv().ok()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn reply(&self, id: u64, completion: impl Into<String>) {
        self.send(Inbound::Reply(RpcReply::completion(id, completion)));
    }

    pub fn reply_result(&self, id: u64, result: Value) {
        self.send(Inbound::Reply(RpcReply::success(id, result)));
    }

    pub fn reply_error(&self, id: u64, code: i64, message: impl Into<String>) {
        self.send(Inbound::Reply(RpcReply::error(id, code, message)));
    }

    pub fn disconnect(&self, reason: impl Into<String>) {
        self.send(Inbound::Disconnected {
            reason: reason.into(),
        });
    }

    pub fn send(&self, inbound: Inbound) {
        let _ = self.sink.send(inbound);
    }
}
