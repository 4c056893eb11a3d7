//! Composition root

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use super::tool_state::ToolStateBroadcaster;
use crate::app::AppClient;
use crate::bridge::{ProgressRelay, UpstreamCallBridge, UpstreamTarget};
use crate::config::Config;
use crate::protocol::{Tool, ToolsCallResult};
use crate::proxy::{ProxyToolDefinition, ProxyToolRegistry, RegistryOptions, SourceList};
use crate::security::{
    HostAllowlist, PROFILE_NAMES, ProfileSet, RebindingGuard, Resolver, SafeFetchProfile,
    SystemResolver,
};
use crate::stats::{BridgeStats, StatsSnapshot};
use crate::transport::{FetcherOptions, SafeFetchResult, SafeFetcher, SafeRequest};
use crate::{Error, Result};

/// Owns every long-lived piece of the outbound boundary.
pub struct Gateway {
    config: Config,
    stats: Arc<BridgeStats>,
    profiles: Arc<ProfileSet>,
    fetcher: Arc<SafeFetcher>,
    registry: ProxyToolRegistry,
    bridge: UpstreamCallBridge,
    apps: AppClient,
    tool_state: ToolStateBroadcaster,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Build from configuration with the system DNS resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    /// Build from configuration with a custom resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_resolver(config: Config, resolver: Arc<dyn Resolver>) -> Result<Self> {
        let stats = Arc::new(BridgeStats::new());
        let profiles = Arc::new(ProfileSet::from_config(&config));
        let guard = RebindingGuard::new(
            resolver,
            HostAllowlist::new(&config.security.allowed_internal_hosts),
        );
        let fetcher = Arc::new(SafeFetcher::new(
            guard,
            FetcherOptions::from(&config),
            Arc::clone(&stats),
        )?);

        let source_list = match &config.proxy.sources {
            Some(location) if !location.trim().is_empty() => {
                SourceList::Location(location.trim().to_string())
            }
            _ => SourceList::None,
        };
        let registry = ProxyToolRegistry::new(
            source_list,
            Arc::clone(&fetcher),
            Arc::clone(&profiles),
            RegistryOptions {
                discovery_timeout: config.proxy.discovery_timeout,
                headers: config.proxy.headers.clone(),
            },
        );
        let bridge = UpstreamCallBridge::new(
            Arc::clone(&fetcher),
            Arc::clone(&profiles),
            config.routing.clone(),
            Arc::clone(&stats),
        );
        let apps = AppClient::new(Arc::clone(&fetcher), Arc::clone(&profiles), config.apps.clone());

        info!(
            proxy_sources = config.proxy.sources.is_some(),
            allowlisted_hosts = config.security.allowed_internal_hosts.len(),
            pin_addresses = config.security.pin_resolved_addresses,
            "Gateway initialized"
        );

        Ok(Self {
            config,
            stats,
            profiles,
            fetcher,
            registry,
            bridge,
            apps,
            tool_state: ToolStateBroadcaster::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Replace the source list with in-memory sources. Used before first load.
    #[must_use]
    pub fn with_proxy_sources(mut self, sources: Vec<crate::proxy::ProxySource>) -> Self {
        self.registry = ProxyToolRegistry::new(
            SourceList::Inline(sources),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.profiles),
            RegistryOptions {
                discovery_timeout: self.config.proxy.discovery_timeout,
                headers: self.config.proxy.headers.clone(),
            },
        );
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Named profiles.
    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    /// Tool enable/disable propagation.
    pub fn tool_state(&self) -> &ToolStateBroadcaster {
        &self.tool_state
    }

    /// Token for one call; cancelled by the caller or by [`Self::shutdown`].
    pub fn call_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Enabled proxy tools, discovered on first use.
    pub async fn proxy_tools(&self) -> Vec<ProxyToolDefinition> {
        self.registry
            .load()
            .await
            .iter()
            .filter(|t| self.tool_state.is_enabled(&t.name))
            .cloned()
            .collect()
    }

    /// Forget discovered proxy tools.
    pub fn reset_proxy_tools(&self) {
        self.registry.reset();
    }

    /// Forward a call to a proxy tool by outward name.
    pub async fn call_proxy_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
        relay: Option<ProgressRelay>,
    ) -> ToolsCallResult {
        if self.shutdown.is_cancelled() {
            return ToolsCallResult::error("Gateway is shutting down");
        }
        if !self.tool_state.is_enabled(name) {
            return ToolsCallResult::error(format!("Tool {name} is disabled"));
        }
        let Some(tool) = self.registry.find(name).await else {
            warn!(tool = %name, "Call to unknown proxy tool");
            return ToolsCallResult::error(format!("Unknown tool: {name}"));
        };

        let target = UpstreamTarget::for_proxy_tool(
            &tool,
            self.config.proxy.headers.clone(),
            self.config.proxy.call_timeout,
        );
        self.bridge
            .invoke(&target, &tool.upstream_name, arguments, cancel, relay)
            .await
    }

    /// Tools offered by an interactive app.
    ///
    /// # Errors
    ///
    /// A rejected app location or any schema fetch error.
    pub async fn app_tools(&self, app: &str, cancel: &CancellationToken) -> Result<Vec<Tool>> {
        let app = self.apps.resolve(app)?;
        self.apps.fetch_tools(&app, cancel).await
    }

    /// Call a tool on an interactive app.
    pub async fn call_app_tool(
        &self,
        app: &str,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
        relay: Option<ProgressRelay>,
    ) -> ToolsCallResult {
        if self.shutdown.is_cancelled() {
            return ToolsCallResult::error("Gateway is shutting down");
        }
        let target = match self.apps.resolve(app).and_then(|url| self.apps.target(&url, Default::default())) {
            Ok(t) => t,
            Err(e) => {
                warn!(app = %app, tool = %tool, error = %e, "Rejected app call");
                self.stats.record_rejected_call();
                return ToolsCallResult::error(format!("Cannot call {tool} on {app}: {e}"));
            }
        };
        self.bridge.invoke(&target, tool, arguments, cancel, relay).await
    }

    /// Fetch a documentation page as text.
    ///
    /// # Errors
    ///
    /// A policy rejection, a fetch error, or a non-success status.
    pub async fn fetch_docs(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        let response = self
            .fetcher
            .fetch(url, self.profiles.docs(), SafeRequest::get(), cancel)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("{url} returned HTTP {status}")));
        }
        response.text().await
    }

    /// Fetch `url` under a fixed profile.
    ///
    /// # Errors
    ///
    /// An unknown profile name or any fetch error.
    pub async fn fetch(
        &self,
        url: &str,
        profile: &str,
        cancel: &CancellationToken,
    ) -> Result<SafeFetchResult> {
        let profile = self.profile(profile)?;
        self.fetcher.fetch(url, profile, SafeRequest::get(), cancel).await
    }

    /// Validate `url` against a fixed profile without any network I/O.
    ///
    /// # Errors
    ///
    /// An unknown profile name or a policy violation.
    pub fn check_url(&self, url: &str, profile: &str) -> Result<Url> {
        self.profile(profile)?.policy.validate(url)
    }

    fn profile(&self, name: &str) -> Result<&SafeFetchProfile> {
        self.profiles.by_name(name).ok_or_else(|| {
            Error::Config(format!(
                "unknown profile '{name}', expected one of: {}",
                PROFILE_NAMES.join(", ")
            ))
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Cancel every in-flight call made with [`Self::call_token`] and refuse
    /// new ones.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Gateway shutting down");
            self.shutdown.cancel();
        }
    }
}
