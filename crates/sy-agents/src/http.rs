use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sy_core::types::AgentKind;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::endpoint::{AgentEndpoint, EndpointError, EndpointKind, Inbound, InboundSink};
use crate::protocol::{error_codes, RpcReply, RpcRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Agent endpoint that POSTs each JSON-RPC request and treats the response
/// body as the reply. Every request runs in its own task, so a slow call
/// never holds up the next one.
pub struct HttpEndpoint {
    kind: AgentKind,
    url: String,
    client: reqwest::Client,
    sink: InboundSink,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpEndpoint {
    pub fn new(kind: AgentKind, url: impl Into<String>, sink: InboundSink) -> Result<Self, EndpointError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| EndpointError::Spawn(e.to_string()))?;
        Ok(Self::with_client(kind, url, client, sink))
    }

    pub fn with_client(kind: AgentKind, url: impl Into<String>, client: reqwest::Client, sink: InboundSink) -> Self {
        Self {
            kind,
            url: url.into(),
            client,
            sink,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| {
            warn!("http endpoint task list lock poisoned, recovering");
            e.into_inner()
        })
    }
}

/// POST one request and turn whatever comes back into a reply. Only
/// connect and transfer failures are errors; an unusable body becomes a
/// protocol-error reply for the request that produced it.
async fn call(client: &reqwest::Client, url: &str, request: &RpcRequest) -> Result<RpcReply, reqwest::Error> {
    let response = client.post(url).json(request).send().await?;
    let status = response.status();
    let body = response.bytes().await?;

    let reply = match serde_json::from_slice::<RpcReply>(&body) {
        Ok(reply) if status.is_success() || reply.error.is_some() => reply,
        Ok(_) => RpcReply::error(
            request.id,
            error_codes::INTERNAL_ERROR,
            format!("agent answered HTTP {status}"),
        ),
        Err(e) => RpcReply::error(
            request.id,
            error_codes::PARSE_ERROR,
            format!("malformed reply (HTTP {status}): {e}"),
        ),
    };
    Ok(reply)
}

#[async_trait]
impl AgentEndpoint for HttpEndpoint {
    fn transport(&self) -> EndpointKind {
        EndpointKind::Http
    }

    async fn dispatch(&self, request: RpcRequest) -> Result<(), EndpointError> {
        let client = self.client.clone();
        let url = self.url.clone();
        let sink = self.sink.clone();
        let kind = self.kind.clone();

        let handle = tokio::spawn(async move {
            let id = request.id;
            let inbound = match call(&client, &url, &request).await {
                Ok(mut reply) => {
                    // One request per call: a reply without an id still belongs to it.
                    if reply.id.is_none() {
                        reply.id = Some(Value::from(id));
                    }
                    debug!(%kind, id, "agent http reply");
                    Inbound::Reply(reply)
                }
                Err(e) => {
                    warn!(%kind, id, error = %e, "agent http call failed");
                    Inbound::Undeliverable {
                        id,
                        reason: e.to_string(),
                    }
                }
            };
            let _ = sink.send(inbound);
        });

        let mut tasks = self.tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        Ok(())
    }

    async fn shutdown(&self) {
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}
