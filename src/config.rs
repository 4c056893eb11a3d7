//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Hub and documentation hosts
    pub hub: HubConfig,
    /// Default outbound fetch budgets
    pub fetch: FetchConfig,
    /// Destination-safety settings
    pub security: SecurityConfig,
    /// Operator-configured proxy tool sources
    pub proxy: ProxyConfig,
    /// Request-time interactive app endpoints
    pub apps: AppConfig,
    /// Sticky routing to upstream replicas
    pub routing: RoutingConfig,
}

/// Hub hostnames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Hostnames of the central hub
    pub hostnames: Vec<String>,
    /// Third-party documentation hosts reachable through the docs profile
    pub docs_hostnames: Vec<String>,
    /// Path prefix required for docs on hub hostnames
    pub docs_path_prefix: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hostnames: vec!["huggingface.co".to_string(), "hf.co".to_string()],
            docs_hostnames: vec!["gradio.app".to_string(), "www.gradio.app".to_string()],
            docs_path_prefix: "/docs/".to_string(),
        }
    }
}

/// Default budgets for outbound fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Wall-clock budget for one logical request, redirects included
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum redirects followed per request
    pub max_redirects: u32,
    /// Connect timeout for each hop
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Largest response body read from any upstream
    pub max_body_bytes: usize,
    /// Largest single server-sent event
    pub max_event_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 5,
            connect_timeout: Duration::from_secs(10),
            max_body_bytes: 16 * 1024 * 1024,
            max_event_bytes: 1024 * 1024,
        }
    }
}

/// Destination-safety configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Hostnames allowed to resolve to internal addresses (`host` or `*.domain`)
    pub allowed_internal_hosts: Vec<String>,
    /// Extra headers stripped on cross-origin redirects, in addition to
    /// authorization, proxy-authorization and cookie
    pub sensitive_headers: Vec<String>,
    /// Connect external-only requests to the addresses the guard validated
    pub pin_resolved_addresses: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_internal_hosts: Vec::new(),
            sensitive_headers: vec!["x-hf-authorization".to_string()],
            pin_resolved_addresses: true,
        }
    }
}

/// Proxy tool source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Source list location: a local file path or an https URL
    pub sources: Option<String>,
    /// Hard timeout for one source's discovery
    #[serde(with = "humantime_serde")]
    pub discovery_timeout: Duration,
    /// Timeout for one forwarded tool call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Headers sent to every proxy source (supports `${VAR}` expansion)
    pub headers: HashMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            sources: None,
            discovery_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(120),
            headers: HashMap::new(),
        }
    }
}

/// Interactive app endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Domains whose subdomains host interactive apps
    pub host_suffixes: Vec<String>,
    /// Path serving an app's tool schema
    pub schema_path: String,
    /// Path prefix for an app's MCP endpoint
    pub call_path: String,
    /// Timeout for schema fetches
    #[serde(with = "humantime_serde")]
    pub schema_timeout: Duration,
    /// Timeout for one app tool call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host_suffixes: vec!["hf.space".to_string()],
            schema_path: "/gradio_api/mcp/schema".to_string(),
            call_path: "/gradio_api/mcp/".to_string(),
            schema_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(300),
        }
    }
}

/// Sticky routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Response header naming the serving replica
    pub replica_header: String,
    /// Path segment that pins a request to a replica
    pub replica_segment: String,
    /// Path prefix of same-origin API URLs that get rewritten
    pub api_path_prefix: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            replica_header: "x-proxied-replica".to_string(),
            replica_segment: "--replicas".to_string(),
            api_path_prefix: "/gradio_api/".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (MCP_HUB_BRIDGE_ prefix)
        figment = figment.merge(Env::prefixed("MCP_HUB_BRIDGE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be in the process environment before expansion
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Reject settings that would silently disable a safety check.
    fn validate(&self) -> Result<()> {
        if self.fetch.max_redirects > 20 {
            return Err(Error::Config(format!(
                "fetch.max_redirects must be at most 20, got {}",
                self.fetch.max_redirects
            )));
        }
        if self.fetch.max_body_bytes == 0 || self.fetch.max_event_bytes == 0 {
            return Err(Error::Config(
                "fetch.max_body_bytes and fetch.max_event_bytes must be positive".to_string(),
            ));
        }
        if self.fetch.timeout.is_zero() {
            return Err(Error::Config("fetch.timeout must be positive".to_string()));
        }
        if self.hub.hostnames.is_empty() {
            return Err(Error::Config("hub.hostnames must not be empty".to_string()));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for value in self.proxy.headers.values_mut() {
            *value = Self::expand_string(&re, value);
        }
        if let Some(sources) = self.proxy.sources.as_mut() {
            *sources = Self::expand_string(&re, sources);
        }

        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();

        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
