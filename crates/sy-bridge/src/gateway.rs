use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sy_agents::AgentPool;
use sy_core::protocol::{ClientFrame, ControlRequest, ErrorCode, ServerFrame};
use sy_core::types::{ConnectionId, SessionId};
use sy_session::{ConnectionHandle, Delivery, SessionError, SessionRegistry};
use tracing::{debug, info, warn};

use crate::line::LineAssembler;
use crate::router::CommandRouter;

/// Line assembly state is per (connection, session): a reattaching client
/// starts with a clean buffer.
type AssemblerKey = (ConnectionId, SessionId);

/// Owns every physical client connection and translates their frames into
/// registry, router and pool calls.
///
/// Frame-level problems (unknown session, ownership conflicts, garbage) are
/// answered with an `error` frame on the offending connection and never
/// affect anything else.
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    router: Arc<CommandRouter>,
    pool: AgentPool,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>, ahash::RandomState>,
    assemblers: DashMap<AssemblerKey, LineAssembler, ahash::RandomState>,
}

fn error_frame(session_id: Option<SessionId>, err: &SessionError) -> ServerFrame {
    let code = match err {
        SessionError::NotFound(_) => ErrorCode::SessionUnknown,
        SessionError::AlreadyOwned { .. } => ErrorCode::AlreadyOwned,
        SessionError::NotAttached(_) => ErrorCode::NotAttached,
        SessionError::UnknownRecord { .. } | SessionError::RecordFinished { .. } => {
            ErrorCode::RecordRejected
        }
    };
    ServerFrame::error(session_id, code, err.to_string())
}

impl Gateway {
    pub fn new(registry: Arc<SessionRegistry>, router: Arc<CommandRouter>, pool: AgentPool) -> Self {
        Self {
            registry,
            router,
            pool,
            connections: DashMap::with_hasher(ahash::RandomState::new()),
            assemblers: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    /// Register a new physical connection. The receiver is its outbound
    /// queue; exactly one writer should drain it. A `hello` frame is already
    /// queued.
    pub fn connect(&self) -> (Arc<ConnectionHandle>, flume::Receiver<ServerFrame>) {
        let (conn, outbound) = ConnectionHandle::new();
        conn.push(ServerFrame::Hello {
            connection_id: conn.id(),
        });
        self.connections.insert(conn.id(), conn.clone());
        info!(connection_id = %conn.id(), "connection opened");
        (conn, outbound)
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|c| c.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Record liveness for transport-level traffic (pings, pongs).
    pub fn touch(&self, connection_id: ConnectionId) {
        if let Some(conn) = self.connection(connection_id) {
            conn.touch();
        }
    }

    /// Parse and handle one text message.
    pub async fn on_text(&self, connection_id: ConnectionId, text: &str) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => self.on_frame(connection_id, frame).await,
            Err(e) => {
                debug!(%connection_id, error = %e, "malformed client frame");
                self.reply(
                    connection_id,
                    ServerFrame::error(None, ErrorCode::MalformedFrame, format!("malformed frame: {e}")),
                );
            }
        }
    }

    pub async fn on_frame(&self, connection_id: ConnectionId, frame: ClientFrame) {
        let Some(conn) = self.connection(connection_id) else {
            debug!(%connection_id, "frame for unknown connection ignored");
            return;
        };
        conn.touch();

        match frame {
            ClientFrame::Input {
                session_id,
                payload,
            } => self.on_input(&conn, session_id, &payload).await,
            ClientFrame::Control {
                session_id,
                payload,
            } => self.on_control(&conn, session_id, payload),
        }
    }

    async fn on_input(&self, conn: &Arc<ConnectionHandle>, session_id: SessionId, payload: &str) {
        if let Err(e) = self.registry.require_owner(session_id, conn.id()) {
            conn.push(error_frame(Some(session_id), &e));
            return;
        }
        let lines = self
            .assemblers
            .entry((conn.id(), session_id))
            .or_default()
            .push(payload);

        for line in lines {
            if let Err(e) = self.router.route(session_id, &line).await {
                conn.push(error_frame(Some(session_id), &e));
                return;
            }
        }
    }

    fn on_control(&self, conn: &Arc<ConnectionHandle>, session_id: Option<SessionId>, request: ControlRequest) {
        let result = match request {
            ControlRequest::Open { title } => {
                let sid = self.registry.create(title);
                self.registry.attach(sid, conn).map(|_| ())
            }
            ControlRequest::List { owned } => {
                let sessions = if owned {
                    self.registry.list_for_connection(conn.id())
                } else {
                    self.registry.list()
                };
                conn.push(ServerFrame::SessionList { sessions });
                Ok(())
            }
            ControlRequest::Ping => {
                conn.push(ServerFrame::Pong);
                Ok(())
            }
            request => {
                let Some(sid) = session_id else {
                    conn.push(ServerFrame::error(
                        None,
                        ErrorCode::MalformedFrame,
                        "this control request needs a session_id",
                    ));
                    return;
                };
                self.on_session_control(conn, sid, request)
            }
        };
        if let Err(e) = result {
            conn.push(error_frame(session_id, &e));
        }
    }

    fn on_session_control(
        &self,
        conn: &Arc<ConnectionHandle>,
        session_id: SessionId,
        request: ControlRequest,
    ) -> Result<(), SessionError> {
        match request {
            ControlRequest::Attach => {
                self.assemblers.remove(&(conn.id(), session_id));
                self.registry.attach(session_id, conn).map(|_| ())
            }
            ControlRequest::Detach => {
                self.assemblers.remove(&(conn.id(), session_id));
                self.registry.detach_from(session_id, conn.id())
            }
            ControlRequest::Close => {
                self.ensure_not_owned_elsewhere(conn, session_id)?;
                self.close_session(session_id).map(|_| ())
            }
            ControlRequest::Rename { title } => {
                self.ensure_not_owned_elsewhere(conn, session_id)?;
                self.registry.rename(session_id, title.clone())?;
                // The owner has already been told by the registry.
                if self.registry.owner_of(session_id)? != Some(conn.id()) {
                    conn.push(ServerFrame::Renamed { session_id, title });
                }
                Ok(())
            }
            ControlRequest::Open { .. } | ControlRequest::List { .. } | ControlRequest::Ping => Ok(()),
        }
    }

    /// Close and rename are allowed for the owner and for detached sessions.
    fn ensure_not_owned_elsewhere(&self, conn: &ConnectionHandle, session_id: SessionId) -> Result<(), SessionError> {
        match self.registry.require_owner(session_id, conn.id()) {
            Ok(()) | Err(SessionError::NotAttached(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Tear down a connection. Its sessions are detached, never closed.
    pub fn on_disconnect(&self, connection_id: ConnectionId) {
        let Some((_, conn)) = self.connections.remove(&connection_id) else {
            return;
        };
        conn.close();
        let owned = conn.owned_sessions();
        for sid in &owned {
            if let Err(e) = self.registry.detach_from(*sid, connection_id) {
                debug!(%connection_id, session_id = %sid, error = %e, "detach on disconnect skipped");
            }
        }
        self.assemblers.retain(|(cid, _), _| *cid != connection_id);
        info!(%connection_id, detached = owned.len(), "connection closed");
    }

    /// Emit a frame on behalf of a session: queued to the current owner, or
    /// dropped if the session is detached. History is the multiplexer's job.
    pub fn send(&self, session_id: SessionId, frame: ServerFrame) -> Result<Delivery, SessionError> {
        self.registry.deliver(session_id, frame)
    }

    /// Close a session everywhere: registry, outstanding agent requests, and
    /// per-session routing state.
    pub fn close_session(&self, session_id: SessionId) -> Result<Vec<u64>, SessionError> {
        let cancelled = self.registry.close(session_id)?;
        self.pool.discard_session(session_id);
        self.router.forget(session_id);
        self.assemblers.retain(|(_, sid), _| *sid != session_id);
        Ok(cancelled)
    }

    /// Disconnect every connection silent for longer than `grace`.
    pub fn sweep_stale(&self, grace: Duration) -> Vec<ConnectionId> {
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|c| !c.is_live(grace))
            .map(|c| *c.key())
            .collect();
        for id in &stale {
            warn!(connection_id = %id, "connection missed its liveness window");
            self.on_disconnect(*id);
        }
        stale
    }

    /// Close sessions that stayed detached for longer than `grace`.
    pub fn reap_detached(&self, grace: Duration) -> Vec<SessionId> {
        let expired = self.registry.expired_detached(grace);
        let mut closed = Vec::with_capacity(expired.len());
        for sid in expired {
            match self.close_session(sid) {
                Ok(cancelled) => {
                    info!(session_id = %sid, cancelled = cancelled.len(), "idle detached session reaped");
                    closed.push(sid);
                }
                Err(e) => debug!(session_id = %sid, error = %e, "reap skipped"),
            }
        }
        closed
    }

    fn reply(&self, connection_id: ConnectionId, frame: ServerFrame) {
        if let Some(conn) = self.connection(connection_id) {
            conn.push(frame);
        }
    }
}
