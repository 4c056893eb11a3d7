//! MCP Hub Bridge Library
//!
//! The outbound security boundary of an MCP tool server: every request made on
//! behalf of a partially trusted caller goes through here.
//!
//! # Layers
//!
//! - **Address classifier** and **rebinding guard** (`security`): reserved
//!   ranges and double DNS resolution
//! - **URL policies** and **named profiles** (`security`): pure validation
//!   before any byte is sent
//! - **Safe fetcher** (`transport`): manual redirects, every hop re-validated
//! - **Proxy registry** (`proxy`): operator sources flattened into one catalog
//! - **Call bridge** (`bridge`): one upstream session per forwarded call

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod proxy;
pub mod security;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber.with(fmt::layer().with_writer(std::io::stderr)).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
