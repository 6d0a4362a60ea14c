use std::sync::{Arc, Mutex};

use serde::Serialize;
use sy_core::types::{Classification, OutputChunk, RecordStatus, SessionId};

use crate::lock;

/// A change to some session's transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    Issued {
        session_id: SessionId,
        seq: u64,
        input: String,
        classification: Classification,
    },
    Chunk {
        session_id: SessionId,
        seq: u64,
        chunk: OutputChunk,
        status: Option<RecordStatus>,
    },
    Closed {
        session_id: SessionId,
        cancelled: Vec<u64>,
    },
}

/// A broadcast-style bus for transcript events, built on flume channels.
///
/// Events for one session are published while that session is locked, so a
/// subscriber sees them in the same order they entered history. Durable
/// storage and audit logging hang off this bus without touching the core.
#[derive(Clone, Default)]
pub struct TranscriptBus {
    inner: Arc<Mutex<Vec<flume::Sender<TranscriptEvent>>>>,
}

impl TranscriptBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<TranscriptEvent> {
        let (tx, rx) = flume::unbounded();
        lock(&self.inner).push(tx);
        rx
    }

    /// Publish an event to all current subscribers, pruning dropped ones.
    pub fn publish(&self, event: TranscriptEvent) {
        let mut senders = lock(&self.inner);
        if senders.is_empty() {
            return;
        }
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).len()
    }
}
