use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sy_core::protocol::ServerFrame;
use sy_core::types::{ConnectionId, SessionId};
use tokio::time::Instant;

use crate::lock;

/// The server-side half of one physical client connection.
///
/// Frames pushed here land on a single FIFO queue that exactly one writer
/// task drains onto the transport, so concurrent producers never interleave
/// partial writes. Pushing never blocks.
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: flume::Sender<ServerFrame>,
    last_seen: Mutex<Instant>,
    closed: AtomicBool,
    owned: Mutex<HashSet<SessionId>>,
    opened_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new() -> (Arc<Self>, flume::Receiver<ServerFrame>) {
        let (tx, rx) = flume::unbounded();
        let handle = Arc::new(Self {
            id: ConnectionId::new(),
            outbound: tx,
            last_seen: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            owned: Mutex::new(HashSet::new()),
            opened_at: Utc::now(),
        });
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Queue a frame for the writer task. Returns `false` if the connection
    /// is closed or its writer has gone away.
    pub fn push(&self, frame: ServerFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.send(frame).is_ok()
    }

    /// Record inbound activity (any frame, pong, or heartbeat).
    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    /// Live means not closed and heard from within `grace`.
    pub fn is_live(&self, grace: Duration) -> bool {
        !self.is_closed() && !self.outbound.is_disconnected() && self.idle_for() <= grace
    }

    /// Mark the connection closed. Returns `true` for the first caller only.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sessions this connection currently owns.
    pub fn owned_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = lock(&self.owned).iter().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn adopt(&self, session_id: SessionId) {
        lock(&self.owned).insert(session_id);
    }

    pub(crate) fn release(&self, session_id: SessionId) {
        lock(&self.owned).remove(&session_id);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("owned", &self.owned_sessions().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_is_fifo() {
        let (conn, rx) = ConnectionHandle::new();
        assert!(conn.push(ServerFrame::Pong));
        assert!(conn.push(ServerFrame::Hello {
            connection_id: conn.id()
        }));
        assert_eq!(rx.try_recv().unwrap(), ServerFrame::Pong);
        assert!(matches!(rx.try_recv().unwrap(), ServerFrame::Hello { .. }));
    }

    #[test]
    fn closed_connection_rejects_frames() {
        let (conn, rx) = ConnectionHandle::new();
        assert!(conn.close());
        assert!(!conn.close(), "second close reports false");
        assert!(!conn.push(ServerFrame::Pong));
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_live(Duration::from_secs(60)));
    }

    #[test]
    fn dropped_receiver_is_not_live() {
        let (conn, rx) = ConnectionHandle::new();
        drop(rx);
        assert!(!conn.is_live(Duration::from_secs(60)));
        assert!(!conn.push(ServerFrame::Pong));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_expires_without_activity() {
        let (conn, _rx) = ConnectionHandle::new();
        let grace = Duration::from_secs(90);
        assert!(conn.is_live(grace));

        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(!conn.is_live(grace));

        conn.touch();
        assert!(conn.is_live(grace));
    }
}
