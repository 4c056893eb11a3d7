//! MCP protocol types for the client side of upstream sessions

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// MCP protocol version sent in `initialize`
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Versions this client can speak, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Pick the version to use for a session given the server's answer.
///
/// Returns the server's version if supported, `None` otherwise.
#[must_use]
pub fn negotiate_version(server_version: &str) -> Option<&'static str> {
    SUPPORTED_VERSIONS
        .iter()
        .find(|v| **v == server_version)
        .copied()
}
