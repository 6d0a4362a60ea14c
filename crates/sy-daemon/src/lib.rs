//! The switchyard daemon: wires the session registry, agent pool, command
//! router and connection gateway together, serves them over HTTP/WebSocket,
//! and runs the idle-session reaper and connection liveness sweep.

pub mod daemon;
pub mod shutdown;
