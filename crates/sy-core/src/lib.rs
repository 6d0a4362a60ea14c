//! Shared vocabulary for switchyard: identifiers, transcript types, client
//! transport frames, and the TOML configuration model.

pub mod config;
pub mod protocol;
pub mod types;
