//! Error types for the hub bridge

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias for the hub bridge
pub type Result<T> = std::result::Result<T, Error>;

/// Which URL rule a [`Error::PolicyViolation`] tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// URL could not be parsed
    InvalidUrl,
    /// Scheme not in the allowed set
    Protocol,
    /// Username or password embedded in the URL
    Credentials,
    /// Host not covered by the host rules
    Host,
    /// Explicit non-default port
    Port,
    /// Traversal, encoded separator, bad encoding or prefix mismatch
    Path,
    /// Query parameter not permitted
    Query,
    /// Rejected by a profile-specific validator
    Custom,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidUrl => "invalid-url",
            Self::Protocol => "protocol",
            Self::Credentials => "credentials",
            Self::Host => "host",
            Self::Port => "port",
            Self::Path => "path",
            Self::Query => "query",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Hub bridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// URL rejected by a policy
    #[error("URL policy violation ({kind}): {reason}")]
    PolicyViolation {
        /// Rule that failed
        kind: ViolationKind,
        /// Human-readable reason
        reason: String,
    },

    /// Destination resolves to an internal or reserved address
    #[error("Address blocked for {host}: {reason}")]
    AddressBlocked {
        /// Hostname or literal that was checked
        host: String,
        /// Human-readable reason
        reason: String,
    },

    /// Redirect budget exhausted
    #[error("Redirect limit of {max} exceeded at {url}")]
    RedirectLimitExceeded {
        /// Configured maximum
        max: u32,
        /// URL that answered with the extra redirect
        url: String,
    },

    /// 3xx response without a usable Location header
    #[error("Redirect from {0} has no Location header")]
    RedirectLocationMissing(String),

    /// Wall-clock budget elapsed
    #[error("Request timed out after {0:?}")]
    RequestTimeout(std::time::Duration),

    /// Caller cancelled the request
    #[error("Request aborted by caller")]
    RequestAborted,

    /// Upstream answered with an empty or malformed catalog, schema or envelope
    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// Discovery for one proxy source failed
    #[error("Discovery failed for source {source_id}: {reason}")]
    DiscoverySourceFailure {
        /// Source identifier
        source_id: String,
        /// Human-readable reason
        reason: String,
    },

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error returned by an upstream
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a policy violation
    pub fn policy(kind: ViolationKind, reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            kind,
            reason: reason.into(),
        }
    }

    /// Create an address-blocked error
    pub fn blocked(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AddressBlocked {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Whether this error came from a destination-safety check.
    ///
    /// These are never retried.
    #[must_use]
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            Self::PolicyViolation { .. }
                | Self::AddressBlocked { .. }
                | Self::RedirectLimitExceeded { .. }
        )
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::PolicyViolation { .. } | Self::AddressBlocked { .. } => {
                rpc_codes::INVALID_PARAMS
            }
            Self::RequestAborted => rpc_codes::REQUEST_CANCELLED,
            Self::RedirectLimitExceeded { .. }
            | Self::RedirectLocationMissing(_)
            | Self::RequestTimeout(_)
            | Self::UpstreamProtocol(_)
            | Self::DiscoverySourceFailure { .. }
            | Self::Transport(_)
            | Self::Http(_) => rpc_codes::SERVER_ERROR_START,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Request cancelled (LSP/MCP convention)
    pub const REQUEST_CANCELLED: i32 = -32800;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_rejections_are_flagged() {
        assert!(Error::policy(ViolationKind::Host, "nope").is_security_rejection());
        assert!(Error::blocked("10.0.0.1", "private").is_security_rejection());
        assert!(
            Error::RedirectLimitExceeded {
                max: 1,
                url: "https://a.example/".into()
            }
            .is_security_rejection()
        );
        assert!(!Error::RequestAborted.is_security_rejection());
        assert!(!Error::Transport("reset".into()).is_security_rejection());
    }

    #[test]
    fn rpc_codes_distinguish_timeout_and_abort() {
        let timeout = Error::RequestTimeout(std::time::Duration::from_secs(1));
        assert_eq!(timeout.to_rpc_code(), rpc_codes::SERVER_ERROR_START);
        assert_eq!(Error::RequestAborted.to_rpc_code(), rpc_codes::REQUEST_CANCELLED);
    }

    #[test]
    fn violation_display_names_rule() {
        let err = Error::policy(ViolationKind::Path, "dot segment");
        assert_eq!(err.to_string(), "URL policy violation (path): dot segment");
    }
}
