//! Client-facing side of switchyard.
//!
//! Physical connections come in over WebSocket, the gateway assembles their
//! input into lines, and the router sends each line to a control word, an
//! agent or the local executor.
//!
//! Key modules:
//! - [`gateway`]: connection lifecycle and frame handling
//! - [`router`]: line classification and dispatch
//! - [`executor`]: local command execution
//! - [`http_api`]: Axum router (`/ws`, `/health`, `/api/sessions`)
//! - [`ws`]: WebSocket reader/writer loop

pub mod api_error;
pub mod executor;
pub mod gateway;
pub mod http_api;
pub mod line;
pub mod router;
pub mod ws;

pub use api_error::ApiError;
pub use executor::{ExecError, ExecOutput, LocalExecutor, ShellExecutor};
pub use gateway::Gateway;
pub use http_api::{api_router, ApiState};
pub use line::LineAssembler;
pub use router::{CommandRouter, ControlWord, Route};
