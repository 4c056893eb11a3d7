//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// SSRF-hardened outbound bridge for MCP tool servers
#[derive(Parser, Debug)]
#[command(name = "mcp-hub-bridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_HUB_BRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MCP_HUB_BRIDGE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_HUB_BRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover proxy tools from the configured sources
    Discover {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Validate a URL against a named profile without sending anything
    CheckUrl {
        /// URL to validate
        url: String,

        /// Profile name
        #[arg(short, long, default_value = "external-https-only")]
        profile: String,
    },

    /// Fetch a URL under a named profile and print the body
    Fetch {
        /// URL to fetch
        url: String,

        /// Profile name
        #[arg(short, long, default_value = "external-https-only")]
        profile: String,
    },

    /// Call a proxy tool by outward name
    Call {
        /// Outward tool name
        tool: String,

        /// JSON arguments
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// List the tools of an interactive app (URL or owner/name)
    AppTools {
        /// App URL or owner/name id
        app: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_check_url_with_profile() {
        let cli = Cli::parse_from(["mcp-hub-bridge", "check-url", "https://x.example", "--profile", "hub"]);
        match cli.command {
            Command::CheckUrl { url, profile } => {
                assert_eq!(url, "https://x.example");
                assert_eq!(profile, "hub");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["mcp-hub-bridge", "discover", "--log-level", "debug"]);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Command::Discover { .. }));
    }

    #[test]
    fn call_defaults_to_empty_arguments() {
        let cli = Cli::parse_from(["mcp-hub-bridge", "call", "search"]);
        match cli.command {
            Command::Call { tool, args } => {
                assert_eq!(tool, "search");
                assert_eq!(args, "{}");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
