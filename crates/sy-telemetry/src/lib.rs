//! Logging setup shared by every switchyard binary and test harness.
//!
//! Output goes through `tracing-subscriber`, either human-readable or as JSON
//! lines for log shippers. `RUST_LOG` always wins over the configured level.

pub mod logging;
