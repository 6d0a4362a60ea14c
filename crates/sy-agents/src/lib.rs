//! Agent client pool for switchyard.
//!
//! One logical client per agent kind. Each client owns an endpoint (a child
//! process over stdio, an HTTP URL, or an in-process peer) and a correlation
//! table that ties every outstanding JSON-RPC request back to the session and
//! command record that issued it.

pub mod correlation;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod in_process;
pub mod keywords;
pub mod pool;
pub mod protocol;
pub mod stdio;

pub use endpoint::{inbound_channel, AgentEndpoint, EndpointError, EndpointKind, Inbound, InboundSink};
pub use error::AgentError;
pub use in_process::{AgentPeer, InProcessEndpoint};
pub use keywords::{AgentRoute, KeywordTable};
pub use pool::{AgentPool, AgentPoolBuilder, AgentSettings};
