use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use ahash::AHashMap;
use dashmap::DashMap;
use sy_core::config::{AgentConfig, AgentTransportConfig};
use sy_core::types::{AgentKind, SessionId};
use sy_session::{Finality, OutputMultiplexer};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::correlation::{CorrelationTable, PendingRequest};
use crate::endpoint::{inbound_channel, AgentEndpoint, EndpointKind, Inbound};
use crate::error::{AgentError, Result};
use crate::http::HttpEndpoint;
use crate::protocol::{ReplyOutcome, RpcRequest};
use crate::stdio::StdioEndpoint;

// ---------------------------------------------------------------------------
// Per-agent settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub kind: AgentKind,
    pub display_name: String,
    pub timeout: Duration,
    pub max_outstanding: usize,
    pub max_tokens: Option<u32>,
}

impl AgentSettings {
    pub fn new(kind: impl Into<String>) -> Self {
        let kind = AgentKind::new(kind);
        Self {
            display_name: kind.to_string(),
            kind,
            timeout: Duration::from_secs(120),
            max_outstanding: 256,
            max_tokens: None,
        }
    }
}

impl From<&AgentConfig> for AgentSettings {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            kind: AgentKind::new(cfg.kind.clone()),
            display_name: cfg.display_name().to_string(),
            timeout: cfg.timeout(),
            max_outstanding: cfg.max_outstanding,
            max_tokens: cfg.max_tokens,
        }
    }
}

/// One logical client: an endpoint plus the requests outstanding on it.
struct AgentClient {
    settings: AgentSettings,
    endpoint: Arc<dyn AgentEndpoint>,
    table: CorrelationTable,
    /// Deadline task per outstanding id, aborted when the id retires early.
    timers: DashMap<u64, AbortHandle>,
}

impl AgentClient {
    fn cancel_timer(&self, id: u64) {
        if let Some((_, timer)) = self.timers.remove(&id) {
            timer.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// AgentPool
// ---------------------------------------------------------------------------

struct PoolInner {
    clients: AHashMap<AgentKind, Arc<AgentClient>>,
    mux: OutputMultiplexer,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

/// Routes agent requests out and correlates replies back.
///
/// `submit` returns as soon as the request is handed to the endpoint. The
/// reply, a timeout, or an endpoint failure later settles the command record
/// through the [`OutputMultiplexer`], exactly once per request. Failures are
/// always written to the record before `submit` or the reply path returns.
#[derive(Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

pub struct AgentPoolBuilder {
    mux: OutputMultiplexer,
    clients: Vec<(Arc<AgentClient>, flume::Receiver<Inbound>)>,
}

impl AgentPoolBuilder {
    /// Add an agent kind. `inbound` is the receiving end of the sink the
    /// endpoint reports on.
    pub fn register(
        mut self,
        settings: AgentSettings,
        endpoint: Arc<dyn AgentEndpoint>,
        inbound: flume::Receiver<Inbound>,
    ) -> Result<Self> {
        if self.clients.iter().any(|(c, _)| c.settings.kind == settings.kind) {
            return Err(AgentError::Config(format!(
                "agent kind '{}' registered twice",
                settings.kind
            )));
        }
        let client = AgentClient {
            table: CorrelationTable::new(settings.max_outstanding),
            settings,
            endpoint,
            timers: DashMap::new(),
        };
        self.clients.push((Arc::new(client), inbound));
        Ok(self)
    }

    /// Start one reply pump per agent. Must run inside a tokio runtime.
    pub fn build(self) -> AgentPool {
        let mut clients = AHashMap::new();
        let mut receivers = Vec::new();
        for (client, inbound) in self.clients {
            receivers.push((client.settings.kind.clone(), inbound));
            clients.insert(client.settings.kind.clone(), client);
        }
        let inner = Arc::new(PoolInner {
            clients,
            mux: self.mux,
            pumps: Mutex::new(Vec::new()),
        });

        let pumps: Vec<JoinHandle<()>> = receivers
            .into_iter()
            .map(|(kind, inbound)| tokio::spawn(pump(Arc::downgrade(&inner), kind, inbound)))
            .collect();
        *lock_pumps(&inner.pumps) = pumps;

        AgentPool { inner }
    }
}

/// Feed endpoint events into the pool until the endpoint or the pool is gone.
async fn pump(pool: Weak<PoolInner>, kind: AgentKind, inbound: flume::Receiver<Inbound>) {
    while let Ok(event) = inbound.recv_async().await {
        let Some(inner) = pool.upgrade() else { break };
        AgentPool { inner }.deliver(&kind, event);
    }
    debug!(%kind, "agent reply pump ended");
}

fn lock_pumps(m: &Mutex<Vec<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    m.lock().unwrap_or_else(|e| {
        warn!("agent pool lock poisoned, recovering");
        e.into_inner()
    })
}

impl AgentPool {
    pub fn builder(mux: OutputMultiplexer) -> AgentPoolBuilder {
        AgentPoolBuilder {
            mux,
            clients: Vec::new(),
        }
    }

    /// Build stdio and HTTP endpoints for every configured agent.
    pub fn from_config(agents: &[AgentConfig], mux: OutputMultiplexer) -> Result<Self> {
        let mut builder = Self::builder(mux);
        for cfg in agents {
            let kind = AgentKind::new(cfg.kind.clone());
            let (sink, inbound) = inbound_channel();
            let endpoint: Arc<dyn AgentEndpoint> = match &cfg.transport {
                AgentTransportConfig::Stdio { command, args } => Arc::new(StdioEndpoint::new(
                    kind.clone(),
                    command.clone(),
                    args.clone(),
                    sink,
                )),
                AgentTransportConfig::Http { url } => Arc::new(
                    HttpEndpoint::new(kind.clone(), url.clone(), sink)
                        .map_err(|e| AgentError::Config(format!("{kind}: {e}")))?,
                ),
            };
            info!(%kind, transport = %endpoint.transport(), keyword = %cfg.keyword, "agent registered");
            builder = builder.register(AgentSettings::from(cfg), endpoint, inbound)?;
        }
        Ok(builder.build())
    }

    fn client(&self, kind: &AgentKind) -> Result<&Arc<AgentClient>> {
        self.inner
            .clients
            .get(kind)
            .ok_or_else(|| AgentError::UnknownKind(kind.clone()))
    }

    /// Send `argument` to the `kind` agent on behalf of record `seq` of
    /// `session_id`. Returns the correlation id.
    ///
    /// Fails with `UnknownKind`, `Overloaded` or `Unreachable`; in each case
    /// the record has already been marked failed.
    pub async fn submit(
        &self,
        kind: &AgentKind,
        session_id: SessionId,
        seq: u64,
        argument: &str,
        deadline: Instant,
    ) -> Result<u64> {
        let result = self.try_submit(kind, session_id, seq, argument, deadline).await;
        if let Err(err) = &result {
            warn!(%kind, %session_id, seq, error = %err, "agent request rejected");
            let label = self
                .client(kind)
                .map(|c| c.settings.display_name.clone())
                .unwrap_or_else(|_| kind.to_string());
            self.record_failure(&label, session_id, seq, err);
        }
        result
    }

    async fn try_submit(
        &self,
        kind: &AgentKind,
        session_id: SessionId,
        seq: u64,
        argument: &str,
        deadline: Instant,
    ) -> Result<u64> {
        let client = self.client(kind)?.clone();
        let id = client
            .table
            .reserve(session_id, seq, deadline)
            .ok_or_else(|| AgentError::Overloaded {
                kind: kind.clone(),
                limit: client.table.capacity(),
            })?;

        // Armed before dispatch so a fast reply always finds a timer to cancel.
        self.arm_deadline(client.clone(), id, deadline);
        let request = RpcRequest::complete(id, kind, argument, client.settings.max_tokens);
        if let Err(e) = client.endpoint.dispatch(request).await {
            client.table.resolve(id);
            client.cancel_timer(id);
            return Err(AgentError::Unreachable {
                kind: kind.clone(),
                reason: e.to_string(),
            });
        }

        info!(%kind, id, %session_id, seq, "agent request submitted");
        Ok(id)
    }

    fn arm_deadline(&self, client: Arc<AgentClient>, id: u64, deadline: Instant) {
        let pool = Arc::downgrade(&self.inner);
        let timer_client = client.clone();
        let task = tokio::spawn(async move {
            let client = timer_client;
            tokio::time::sleep_until(deadline).await;
            let resolved = client.table.resolve(id);
            client.timers.remove(&id);
            let Some(request) = resolved else {
                return;
            };
            let Some(inner) = pool.upgrade() else {
                return;
            };
            let kind = client.settings.kind.clone();
            if request.discard {
                debug!(%kind, id, "deadline passed for discarded request");
                return;
            }
            let err = AgentError::Timeout {
                kind: kind.clone(),
                after: request.deadline.saturating_duration_since(request.submitted_at),
            };
            warn!(%kind, id, session_id = %request.session_id, seq = request.seq, "agent request timed out");
            AgentPool { inner }.record_failure(
                &client.settings.display_name,
                request.session_id,
                request.seq,
                &err,
            );
        });
        client.timers.insert(id, task.abort_handle());
        // An already-expired deadline may have fired before the insert.
        if !client.table.contains(id) {
            client.timers.remove(&id);
        }
    }

    /// Handle one event from the `kind` endpoint.
    pub fn deliver(&self, kind: &AgentKind, inbound: Inbound) {
        let Ok(client) = self.client(kind) else {
            warn!(%kind, "event from unregistered agent kind dropped");
            return;
        };
        match inbound {
            Inbound::Reply(reply) => {
                let Some(id) = reply.correlation_id() else {
                    warn!(%kind, id = ?reply.id, "agent reply without a usable id dropped");
                    return;
                };
                let Some(request) = self.retire(client, id) else {
                    return;
                };
                match reply.outcome() {
                    ReplyOutcome::Completion(text) => {
                        debug!(%kind, id, session_id = %request.session_id, seq = request.seq, "agent reply");
                        if let Err(e) = self.inner.mux.emit(
                            request.session_id,
                            request.seq,
                            text,
                            Finality::Completed,
                        ) {
                            debug!(%kind, id, error = %e, "agent reply not recorded");
                        }
                    }
                    ReplyOutcome::Failure { code, message } => {
                        let err = AgentError::Protocol {
                            kind: kind.clone(),
                            code,
                            message,
                        };
                        self.settle_failed(client, &request, &err);
                    }
                }
            }
            Inbound::Undeliverable { id, reason } => {
                let Some(request) = self.retire(client, id) else {
                    return;
                };
                let err = AgentError::Unreachable {
                    kind: kind.clone(),
                    reason,
                };
                self.settle_failed(client, &request, &err);
            }
            Inbound::Disconnected { reason } => {
                let drained = client.table.drain();
                for (id, _) in &drained {
                    client.cancel_timer(*id);
                }
                warn!(%kind, %reason, outstanding = drained.len(), "agent endpoint disconnected");
                for (_, request) in drained.into_iter().filter(|(_, r)| !r.discard) {
                    let err = AgentError::Unreachable {
                        kind: kind.clone(),
                        reason: reason.clone(),
                    };
                    self.settle_failed(client, &request, &err);
                }
            }
        }
    }

    /// Remove `id` from the table. `None` for unknown, retired, and
    /// discard-on-arrival requests.
    fn retire(&self, client: &AgentClient, id: u64) -> Option<PendingRequest> {
        let kind = &client.settings.kind;
        let Some(request) = client.table.resolve(id) else {
            warn!(%kind, id, "reply for unknown or retired correlation id dropped");
            return None;
        };
        client.cancel_timer(id);
        if request.discard {
            debug!(%kind, id, session_id = %request.session_id, "reply for closed session discarded");
            return None;
        }
        Some(request)
    }

    fn settle_failed(&self, client: &AgentClient, request: &PendingRequest, err: &AgentError) {
        self.record_failure(&client.settings.display_name, request.session_id, request.seq, err);
    }

    fn record_failure(&self, label: &str, session_id: SessionId, seq: u64, err: &AgentError) {
        if let Err(e) = self
            .inner
            .mux
            .emit(session_id, seq, format!("[{label}] {err}"), Finality::Failed)
        {
            debug!(%session_id, seq, error = %e, "agent failure not recorded");
        }
    }

    /// Mark every request of a closed session for discard-on-arrival.
    pub fn discard_session(&self, session_id: SessionId) -> usize {
        let marked: usize = self
            .inner
            .clients
            .values()
            .map(|c| c.table.mark_discard(session_id))
            .sum();
        if marked > 0 {
            info!(%session_id, marked, "outstanding agent requests marked for discard");
        }
        marked
    }

    /// Requests currently awaiting a reply from `kind`.
    pub fn outstanding(&self, kind: &AgentKind) -> usize {
        self.client(kind).map(|c| c.table.len()).unwrap_or(0)
    }

    /// Live (not discarded) requests of one session across all agents.
    pub fn outstanding_for_session(&self, session_id: SessionId) -> usize {
        self.inner
            .clients
            .values()
            .map(|c| c.table.live_for_session(session_id))
            .sum()
    }

    /// `(kind, outstanding)` for every registered agent, sorted by kind.
    pub fn outstanding_by_kind(&self) -> Vec<(AgentKind, usize)> {
        let mut out: Vec<(AgentKind, usize)> = self
            .inner
            .clients
            .iter()
            .map(|(k, c)| (k.clone(), c.table.len()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn kinds(&self) -> Vec<AgentKind> {
        self.outstanding_by_kind().into_iter().map(|(k, _)| k).collect()
    }

    pub fn display_name(&self, kind: &AgentKind) -> Option<&str> {
        self.inner
            .clients
            .get(kind)
            .map(|c| c.settings.display_name.as_str())
    }

    pub fn transport(&self, kind: &AgentKind) -> Option<EndpointKind> {
        self.inner.clients.get(kind).map(|c| c.endpoint.transport())
    }

    pub fn timeout(&self, kind: &AgentKind) -> Option<Duration> {
        self.inner.clients.get(kind).map(|c| c.settings.timeout)
    }

    /// Stop the reply pumps and release every endpoint.
    pub async fn shutdown(&self) {
        for pump in lock_pumps(&self.inner.pumps).drain(..) {
            pump.abort();
        }
        for client in self.inner.clients.values() {
            client.endpoint.shutdown().await;
        }
        info!("agent pool shut down");
    }
}
