//! Session state for switchyard: the registry of logical terminal sessions,
//! the handles of the physical connections that own them, and the output
//! multiplexer that records history before delivering it live.
//!
//! Key components:
//! - [`registry::SessionRegistry`]: session lifecycle, ownership, transcripts
//! - [`connection::ConnectionHandle`]: a connection's ordered outbound queue and liveness
//! - [`multiplexer::OutputMultiplexer`]: append-then-deliver for command output
//! - [`event_bus::TranscriptBus`]: broadcast of transcript changes to subscribers

pub mod connection;
pub mod error;
pub mod event_bus;
pub mod multiplexer;
pub mod registry;

pub use connection::ConnectionHandle;
pub use error::SessionError;
pub use multiplexer::{Delivery, Finality, OutputMultiplexer};
pub use registry::{Session, SessionRegistry};

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| {
        tracing::warn!("session lock was poisoned, recovering");
        e.into_inner()
    })
}
