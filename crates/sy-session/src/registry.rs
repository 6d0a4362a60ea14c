use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sy_core::protocol::ServerFrame;
use sy_core::types::{
    Classification, CommandRecord, ConnectionId, RecordStatus, SessionId, SessionState as Lifecycle,
    SessionSummary,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::connection::ConnectionHandle;
use crate::error::{Result, SessionError};
use crate::event_bus::{TranscriptBus, TranscriptEvent};
use crate::lock;
use crate::multiplexer::Delivery;

// ---------------------------------------------------------------------------
// Per-session state
// ---------------------------------------------------------------------------

/// Everything the registry knows about one session. Guarded by the session's
/// own mutex: ownership changes, record creation and output appends for a
/// session are serialized against each other, never against other sessions.
pub(crate) struct SessionState {
    pub(crate) id: SessionId,
    title: String,
    created_at: DateTime<Utc>,
    closed: bool,
    owner: Option<Arc<ConnectionHandle>>,
    detached_since: Option<Instant>,
    next_seq: u64,
    records: Vec<CommandRecord>,
}

impl SessionState {
    fn new(id: SessionId, title: String) -> Self {
        Self {
            id,
            title,
            created_at: Utc::now(),
            closed: false,
            owner: None,
            detached_since: Some(Instant::now()),
            next_seq: 1,
            records: Vec::new(),
        }
    }

    /// The owning connection, unless it has already been closed.
    pub(crate) fn live_owner(&self) -> Option<&Arc<ConnectionHandle>> {
        self.owner.as_ref().filter(|o| !o.is_closed())
    }

    /// Queue `frame` to the live owner, if there is one.
    pub(crate) fn push_to_owner(&self, frame: ServerFrame) -> Delivery {
        match self.live_owner() {
            Some(owner) if owner.push(frame) => Delivery::Delivered,
            _ => Delivery::Buffered,
        }
    }

    pub(crate) fn record_mut(&mut self, seq: u64) -> Option<&mut CommandRecord> {
        let idx = usize::try_from(seq.checked_sub(1)?).ok()?;
        self.records.get_mut(idx).filter(|r| r.seq == seq)
    }

    fn lifecycle(&self) -> Lifecycle {
        if self.closed {
            Lifecycle::Closed
        } else if self.live_owner().is_some() {
            Lifecycle::Active
        } else {
            Lifecycle::Detached
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            title: self.title.clone(),
            state: self.lifecycle(),
            owner: self.live_owner().map(|o| o.id()),
            records: self.records.len(),
            pending: self
                .records
                .iter()
                .filter(|r| r.status == RecordStatus::Pending)
                .count(),
            created_at: self.created_at,
        }
    }

    fn snapshot(&self) -> Session {
        Session {
            id: self.id,
            title: self.title.clone(),
            state: self.lifecycle(),
            owner: self.live_owner().map(|o| o.id()),
            records: self.records.clone(),
            created_at: self.created_at,
        }
    }

    fn replay(&self, limit: Option<usize>) -> Vec<CommandRecord> {
        let start = limit
            .map(|n| self.records.len().saturating_sub(n))
            .unwrap_or(0);
        self.records[start..].to_vec()
    }

    fn drop_owner(&mut self) -> Option<Arc<ConnectionHandle>> {
        let owner = self.owner.take()?;
        owner.release(self.id);
        self.detached_since = Some(Instant::now());
        Some(owner)
    }
}

/// A copy of a session, taken under its lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub state: Lifecycle,
    pub owner: Option<ConnectionId>,
    pub records: Vec<CommandRecord>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn latest(&self) -> Option<&CommandRecord> {
        self.records.last()
    }

    pub fn record(&self, seq: u64) -> Option<&CommandRecord> {
        self.records.iter().find(|r| r.seq == seq)
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Tracks every logical session, its transcript, and which connection owns it.
///
/// Ownership is the single source of truth for routing output. Attach,
/// detach and delivery all happen under the session lock, so no frame is
/// queued to a connection after it lost the session, and a new owner gets its
/// replay before any output produced after the handoff.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Mutex<SessionState>>>,
    liveness_grace: Duration,
    replay_limit: Option<usize>,
    bus: TranscriptBus,
}

impl SessionRegistry {
    /// `liveness_grace` decides whether a current owner still blocks attach.
    pub fn new(liveness_grace: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            liveness_grace,
            replay_limit: None,
            bus: TranscriptBus::new(),
        }
    }

    /// Replay only the most recent `limit` records on attach.
    pub fn with_replay_limit(mut self, limit: Option<usize>) -> Self {
        self.replay_limit = limit;
        self
    }

    pub fn bus(&self) -> &TranscriptBus {
        &self.bus
    }

    pub fn liveness_grace(&self) -> Duration {
        self.liveness_grace
    }

    fn cell(&self, session_id: SessionId) -> Result<Arc<Mutex<SessionState>>> {
        self.sessions
            .get(&session_id)
            .map(|c| c.value().clone())
            .ok_or(SessionError::NotFound(session_id))
    }

    /// Run `f` with the session locked. Closed sessions read as not found.
    pub(crate) fn with_session<R>(
        &self,
        session_id: SessionId,
        f: impl FnOnce(&mut SessionState) -> Result<R>,
    ) -> Result<R> {
        let cell = self.cell(session_id)?;
        let mut state = lock(&cell);
        if state.closed {
            return Err(SessionError::NotFound(session_id));
        }
        f(&mut state)
    }

    fn cells(&self) -> Vec<Arc<Mutex<SessionState>>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Create a detached session. The title defaults to `Terminal <short-id>`.
    pub fn create(&self, title: Option<String>) -> SessionId {
        let id = SessionId::new();
        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("Terminal {}", id.short()));
        info!(session_id = %id, %title, "session created");
        self.sessions
            .insert(id, Arc::new(Mutex::new(SessionState::new(id, title))));
        id
    }

    /// Make `conn` the owner of the session and queue `attached` + `replay`.
    ///
    /// Fails with [`SessionError::AlreadyOwned`] while another live connection
    /// owns the session. A stale owner is displaced. Re-attaching from the
    /// current owner is a no-op apart from a fresh `attached` frame.
    pub fn attach(
        &self,
        session_id: SessionId,
        conn: &Arc<ConnectionHandle>,
    ) -> Result<SessionSummary> {
        let replay_limit = self.replay_limit;
        let grace = self.liveness_grace;
        self.with_session(session_id, |s| {
            if let Some(owner) = &s.owner {
                if owner.id() == conn.id() && !owner.is_closed() {
                    let summary = s.summary();
                    conn.push(ServerFrame::Attached {
                        session: summary.clone(),
                    });
                    return Ok(summary);
                }
                if owner.is_live(grace) {
                    return Err(SessionError::AlreadyOwned {
                        session_id,
                        owner: owner.id(),
                    });
                }
            }
            if let Some(stale) = s.drop_owner() {
                info!(
                    %session_id,
                    stale_connection = %stale.id(),
                    connection_id = %conn.id(),
                    "taking over session from stale connection"
                );
                stale.push(ServerFrame::Detached { session_id });
            }

            s.owner = Some(conn.clone());
            s.detached_since = None;
            conn.adopt(session_id);

            let summary = s.summary();
            let records = s.replay(replay_limit);
            debug!(%session_id, replayed = records.len(), "replaying transcript on attach");
            conn.push(ServerFrame::Attached {
                session: summary.clone(),
            });
            conn.push(ServerFrame::Replay {
                session_id,
                records,
            });
            info!(%session_id, connection_id = %conn.id(), "session attached");
            Ok(summary)
        })
    }

    /// Drop whatever connection owns the session. The session stays open.
    pub fn detach(&self, session_id: SessionId) -> Result<()> {
        self.with_session(session_id, |s| {
            if let Some(owner) = s.drop_owner() {
                owner.push(ServerFrame::Detached { session_id });
                info!(%session_id, connection_id = %owner.id(), "session detached");
            }
            Ok(())
        })
    }

    /// Detach only if `connection_id` is the current owner.
    pub fn detach_from(&self, session_id: SessionId, connection_id: ConnectionId) -> Result<()> {
        self.with_session(session_id, |s| {
            let owned = s.owner.as_ref().is_some_and(|o| o.id() == connection_id);
            if !owned {
                return Err(SessionError::NotAttached(session_id));
            }
            if let Some(owner) = s.drop_owner() {
                owner.push(ServerFrame::Detached { session_id });
            }
            info!(%session_id, %connection_id, "session detached");
            Ok(())
        })
    }

    /// Close the session for good. Pending records become `cancelled`; their
    /// sequence numbers are returned so in-flight work can be discarded.
    pub fn close(&self, session_id: SessionId) -> Result<Vec<u64>> {
        let (_, cell) = self
            .sessions
            .remove(&session_id)
            .ok_or(SessionError::NotFound(session_id))?;
        let mut s = lock(&cell);
        if s.closed {
            return Err(SessionError::NotFound(session_id));
        }
        s.closed = true;

        let mut cancelled = Vec::new();
        for record in s.records.iter_mut() {
            if record.status == RecordStatus::Pending {
                record.status = RecordStatus::Cancelled;
                cancelled.push(record.seq);
            }
        }
        if let Some(owner) = s.owner.take() {
            owner.release(session_id);
            owner.push(ServerFrame::Closed {
                session_id,
                cancelled: cancelled.clone(),
            });
        }
        self.bus.publish(TranscriptEvent::Closed {
            session_id,
            cancelled: cancelled.clone(),
        });
        info!(%session_id, cancelled = cancelled.len(), "session closed");
        Ok(cancelled)
    }

    pub fn get(&self, session_id: SessionId) -> Result<Session> {
        self.with_session(session_id, |s| Ok(s.snapshot()))
    }

    pub fn summary(&self, session_id: SessionId) -> Result<SessionSummary> {
        self.with_session(session_id, |s| Ok(s.summary()))
    }

    /// Current status of one record. `NotFound` once the session is closed.
    pub fn record_status(&self, session_id: SessionId, seq: u64) -> Result<RecordStatus> {
        self.with_session(session_id, |s| {
            s.record_mut(seq)
                .map(|r| r.status)
                .ok_or(SessionError::UnknownRecord { session_id, seq })
        })
    }

    pub fn rename(&self, session_id: SessionId, title: String) -> Result<()> {
        self.with_session(session_id, |s| {
            s.title = title.clone();
            if let Some(owner) = s.live_owner() {
                owner.push(ServerFrame::Renamed { session_id, title });
            }
            Ok(())
        })
    }

    /// The live owner of the session, if any.
    pub fn owner_of(&self, session_id: SessionId) -> Result<Option<ConnectionId>> {
        self.with_session(session_id, |s| Ok(s.live_owner().map(|o| o.id())))
    }

    /// Succeeds only when `connection_id` currently owns the session.
    pub fn require_owner(&self, session_id: SessionId, connection_id: ConnectionId) -> Result<()> {
        let grace = self.liveness_grace;
        self.with_session(session_id, |s| match s.live_owner() {
            Some(o) if o.id() == connection_id => Ok(()),
            Some(o) if o.is_live(grace) => Err(SessionError::AlreadyOwned {
                session_id,
                owner: o.id(),
            }),
            _ => Err(SessionError::NotAttached(session_id)),
        })
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .cells()
            .iter()
            .map(|c| lock(c))
            .filter(|s| !s.closed)
            .map(|s| s.summary())
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub fn list_for_connection(&self, connection_id: ConnectionId) -> Vec<SessionSummary> {
        self.list()
            .into_iter()
            .filter(|s| s.owner == Some(connection_id))
            .collect()
    }

    /// Create a `pending` record for an input line and announce it to the
    /// owner. Returns the record's sequence number.
    pub fn begin_command(
        &self,
        session_id: SessionId,
        input: &str,
        classification: Classification,
    ) -> Result<u64> {
        self.with_session(session_id, |s| {
            let seq = s.next_seq;
            s.next_seq += 1;
            s.records
                .push(CommandRecord::new(seq, input, classification.clone()));
            if let Some(owner) = s.live_owner() {
                owner.push(ServerFrame::Issued {
                    session_id,
                    seq,
                    input: input.to_string(),
                    classification: classification.clone(),
                });
            }
            self.bus.publish(TranscriptEvent::Issued {
                session_id,
                seq,
                input: input.to_string(),
                classification,
            });
            debug!(%session_id, seq, "command record created");
            Ok(seq)
        })
    }

    /// Queue a frame to the session's owner. Detached sessions swallow it.
    pub fn deliver(&self, session_id: SessionId, frame: ServerFrame) -> Result<Delivery> {
        self.with_session(session_id, |s| Ok(s.push_to_owner(frame)))
    }

    /// Detached sessions whose grace period has run out.
    pub fn expired_detached(&self, grace: Duration) -> Vec<SessionId> {
        self.cells()
            .iter()
            .map(|c| lock(c))
            .filter(|s| !s.closed && s.owner.is_none())
            .filter(|s| s.detached_since.is_some_and(|t| t.elapsed() >= grace))
            .map(|s| s.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(90))
    }

    fn drain(rx: &flume::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        rx.try_iter().collect()
    }

    #[test]
    fn create_then_get() {
        let reg = registry();
        let id = reg.create(Some("build".into()));
        let s = reg.get(id).unwrap();
        assert_eq!(s.title, "build");
        assert_eq!(s.state, Lifecycle::Detached);
        assert!(s.owner.is_none());
        assert!(s.records.is_empty());
    }

    #[test]
    fn default_title_uses_short_id() {
        let reg = registry();
        let id = reg.create(None);
        assert_eq!(reg.get(id).unwrap().title, format!("Terminal {}", id.short()));
    }

    #[test]
    fn attach_sends_attached_then_replay() {
        let reg = registry();
        let id = reg.create(None);
        let (conn, rx) = ConnectionHandle::new();
        let summary = reg.attach(id, &conn).unwrap();
        assert_eq!(summary.state, Lifecycle::Active);
        assert_eq!(summary.owner, Some(conn.id()));
        assert_eq!(conn.owned_sessions(), vec![id]);

        let frames = drain(&rx);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], ServerFrame::Attached { .. }));
        assert!(matches!(frames[1], ServerFrame::Replay { ref records, .. } if records.is_empty()));
    }

    #[test]
    fn attach_to_unknown_session() {
        let reg = registry();
        let (conn, _rx) = ConnectionHandle::new();
        let missing = SessionId::new();
        assert_eq!(reg.attach(missing, &conn), Err(SessionError::NotFound(missing)));
    }

    #[test]
    fn attach_rejected_while_owner_live() {
        let reg = registry();
        let id = reg.create(None);
        let (c1, _rx1) = ConnectionHandle::new();
        let (c2, _rx2) = ConnectionHandle::new();
        reg.attach(id, &c1).unwrap();

        let err = reg.attach(id, &c2).unwrap_err();
        assert_eq!(
            err,
            SessionError::AlreadyOwned {
                session_id: id,
                owner: c1.id()
            }
        );
        assert_eq!(reg.owner_of(id).unwrap(), Some(c1.id()));
    }

    #[test]
    fn attach_takes_over_from_closed_owner() {
        let reg = registry();
        let id = reg.create(None);
        let (c1, _rx1) = ConnectionHandle::new();
        let (c2, _rx2) = ConnectionHandle::new();
        reg.attach(id, &c1).unwrap();
        c1.close();

        reg.attach(id, &c2).unwrap();
        assert_eq!(reg.owner_of(id).unwrap(), Some(c2.id()));
        assert!(c1.owned_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn attach_takes_over_from_silent_owner() {
        let reg = registry();
        let id = reg.create(None);
        let (c1, _rx1) = ConnectionHandle::new();
        reg.attach(id, &c1).unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        let (c2, _rx2) = ConnectionHandle::new();
        reg.attach(id, &c2).unwrap();
        assert_eq!(reg.owner_of(id).unwrap(), Some(c2.id()));
    }

    #[test]
    fn reattach_by_owner_does_not_replay_again() {
        let reg = registry();
        let id = reg.create(None);
        let (conn, rx) = ConnectionHandle::new();
        reg.attach(id, &conn).unwrap();
        drain(&rx);

        reg.attach(id, &conn).unwrap();
        let frames = drain(&rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerFrame::Attached { .. }));
    }

    #[test]
    fn sequence_numbers_are_gapless() {
        let reg = registry();
        let id = reg.create(None);
        for i in 0..5 {
            let seq = reg
                .begin_command(id, &format!("cmd {i}"), Classification::Local)
                .unwrap();
            assert_eq!(seq, i + 1);
        }
        let seqs: Vec<u64> = reg.get(id).unwrap().records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn detach_keeps_session_and_history() {
        let reg = registry();
        let id = reg.create(None);
        let (conn, rx) = ConnectionHandle::new();
        reg.attach(id, &conn).unwrap();
        reg.begin_command(id, "ls", Classification::Local).unwrap();
        drain(&rx);

        reg.detach(id).unwrap();
        assert!(matches!(drain(&rx)[..], [ServerFrame::Detached { .. }]));
        let s = reg.get(id).unwrap();
        assert_eq!(s.state, Lifecycle::Detached);
        assert_eq!(s.records.len(), 1);
        assert!(conn.owned_sessions().is_empty());
    }

    #[test]
    fn detach_from_requires_ownership() {
        let reg = registry();
        let id = reg.create(None);
        let (c1, _rx1) = ConnectionHandle::new();
        let (c2, _rx2) = ConnectionHandle::new();
        reg.attach(id, &c1).unwrap();
        assert_eq!(reg.detach_from(id, c2.id()), Err(SessionError::NotAttached(id)));
        assert!(reg.detach_from(id, c1.id()).is_ok());
    }

    #[test]
    fn close_is_terminal_and_cancels_pending() {
        let reg = registry();
        let id = reg.create(None);
        let (conn, rx) = ConnectionHandle::new();
        reg.attach(id, &conn).unwrap();
        let s1 = reg.begin_command(id, "claude hi", Classification::Local).unwrap();
        let s2 = reg.begin_command(id, "sleep 10", Classification::Local).unwrap();
        drain(&rx);

        let cancelled = reg.close(id).unwrap();
        assert_eq!(cancelled, vec![s1, s2]);
        assert!(matches!(
            drain(&rx)[..],
            [ServerFrame::Closed { ref cancelled, .. }] if cancelled.len() == 2
        ));
        assert_eq!(reg.get(id), Err(SessionError::NotFound(id)));
        assert_eq!(reg.attach(id, &conn), Err(SessionError::NotFound(id)));
        assert_eq!(reg.close(id), Err(SessionError::NotFound(id)));
        assert!(conn.owned_sessions().is_empty());
        assert!(reg.is_empty());
    }

    #[test]
    fn record_status_tracks_the_record() {
        let reg = registry();
        let id = reg.create(None);
        let seq = reg.begin_command(id, "ls", Classification::Local).unwrap();
        assert_eq!(reg.record_status(id, seq), Ok(RecordStatus::Pending));
        assert_eq!(
            reg.record_status(id, seq + 1),
            Err(SessionError::UnknownRecord { session_id: id, seq: seq + 1 })
        );

        reg.close(id).unwrap();
        assert_eq!(reg.record_status(id, seq), Err(SessionError::NotFound(id)));
    }

    #[test]
    fn list_for_connection_filters_by_owner() {
        let reg = registry();
        let (c1, _rx1) = ConnectionHandle::new();
        let (c2, _rx2) = ConnectionHandle::new();
        let a = reg.create(None);
        let b = reg.create(None);
        let c = reg.create(None);
        reg.attach(a, &c1).unwrap();
        reg.attach(b, &c1).unwrap();
        reg.attach(c, &c2).unwrap();

        let mine: Vec<SessionId> = reg.list_for_connection(c1.id()).iter().map(|s| s.id).collect();
        assert_eq!(mine.len(), 2);
        assert!(mine.contains(&a) && mine.contains(&b));
        assert_eq!(reg.list().len(), 3);
    }

    #[test]
    fn require_owner_distinguishes_cases() {
        let reg = registry();
        let id = reg.create(None);
        let (c1, _rx1) = ConnectionHandle::new();
        let (c2, _rx2) = ConnectionHandle::new();
        assert_eq!(reg.require_owner(id, c1.id()), Err(SessionError::NotAttached(id)));
        reg.attach(id, &c1).unwrap();
        assert!(reg.require_owner(id, c1.id()).is_ok());
        assert!(matches!(
            reg.require_owner(id, c2.id()),
            Err(SessionError::AlreadyOwned { .. })
        ));
    }

    #[test]
    fn replay_limit_sends_recent_window() {
        let reg = registry().with_replay_limit(Some(2));
        let id = reg.create(None);
        for i in 0..4 {
            reg.begin_command(id, &format!("c{i}"), Classification::Local)
                .unwrap();
        }
        let (conn, rx) = ConnectionHandle::new();
        reg.attach(id, &conn).unwrap();
        let frames = drain(&rx);
        match &frames[1] {
            ServerFrame::Replay { records, .. } => {
                let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
                assert_eq!(seqs, vec![3, 4]);
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_detached_respects_grace() {
        let reg = registry();
        let (conn, _rx) = ConnectionHandle::new();
        let idle = reg.create(None);
        let attached = reg.create(None);
        reg.attach(attached, &conn).unwrap();

        let grace = Duration::from_secs(1800);
        assert!(reg.expired_detached(grace).is_empty());

        tokio::time::advance(Duration::from_secs(1801)).await;
        assert_eq!(reg.expired_detached(grace), vec![idle]);
    }

    #[test]
    fn rename_notifies_owner() {
        let reg = registry();
        let id = reg.create(None);
        let (conn, rx) = ConnectionHandle::new();
        reg.attach(id, &conn).unwrap();
        drain(&rx);
        reg.rename(id, "deploy".into()).unwrap();
        assert_eq!(reg.get(id).unwrap().title, "deploy");
        assert!(matches!(
            drain(&rx)[..],
            [ServerFrame::Renamed { ref title, .. }] if title == "deploy"
        ));
    }

    #[test]
    fn bus_sees_issue_and_close() {
        let reg = registry();
        let events = reg.bus().subscribe();
        let id = reg.create(None);
        reg.begin_command(id, "pwd", Classification::Local).unwrap();
        reg.close(id).unwrap();
        let got: Vec<TranscriptEvent> = events.try_iter().collect();
        assert!(matches!(got[0], TranscriptEvent::Issued { seq: 1, .. }));
        assert!(matches!(got[1], TranscriptEvent::Closed { ref cancelled, .. } if cancelled == &vec![1]));
    }
}
