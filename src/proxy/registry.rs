//! Proxy tool registry
//!
//! Discovers tools from every configured source at most once and exposes a
//! flat, collision-free catalog. Discovery runs per source concurrently; one
//! failing source never affects its siblings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::source::{ProxySource, load_source_list};
use crate::protocol::Tool;
use crate::security::ProfileSet;
use crate::transport::{ResponseMode, SafeFetcher, SessionOptions, with_session};
use crate::{Error, Result};

/// One proxied tool as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyToolDefinition {
    /// Outward, unique name
    pub name: String,
    /// Name on the upstream server
    pub upstream_name: String,
    /// Owning source id
    pub source_id: String,
    /// Owning source endpoint
    pub source_url: Url,
    /// Response mode of the owning source
    pub response_mode: ResponseMode,
    /// Tool description
    pub description: Option<String>,
    /// Input JSON Schema
    pub input_schema: Value,
}

/// Where the registry gets its source list from.
#[derive(Debug, Clone)]
pub enum SourceList {
    /// No proxy sources configured
    None,
    /// Sources already in memory
    Inline(Vec<ProxySource>),
    /// Local path or https URL, loaded once
    Location(String),
}

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Hard timeout for one source's discovery
    pub discovery_timeout: Duration,
    /// Headers sent to every source
    pub headers: HashMap<String, String>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(10),
            headers: HashMap::new(),
        }
    }
}

type ToolCell = Arc<OnceCell<Arc<[ProxyToolDefinition]>>>;

/// Lazily discovered catalog of proxied tools.
pub struct ProxyToolRegistry {
    source_list: SourceList,
    sources: OnceCell<Arc<[ProxySource]>>,
    tools: RwLock<ToolCell>,
    fetcher: Arc<SafeFetcher>,
    profiles: Arc<ProfileSet>,
    options: RegistryOptions,
}

impl ProxyToolRegistry {
    /// Create a registry. Nothing is fetched until [`Self::load`].
    pub fn new(
        source_list: SourceList,
        fetcher: Arc<SafeFetcher>,
        profiles: Arc<ProfileSet>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            source_list,
            sources: OnceCell::new(),
            tools: RwLock::new(Arc::new(OnceCell::new())),
            fetcher,
            profiles,
            options,
        }
    }

    /// The tool catalog, discovered on first use.
    ///
    /// Concurrent first callers share one discovery.
    pub async fn load(&self) -> Arc<[ProxyToolDefinition]> {
        let cell = self.tools.read().clone();
        cell.get_or_init(|| self.discover()).await.clone()
    }

    /// Find a tool by outward name.
    pub async fn find(&self, name: &str) -> Option<ProxyToolDefinition> {
        self.load().await.iter().find(|t| t.name == name).cloned()
    }

    /// Drop the cached catalog; the next [`Self::load`] rediscovers.
    ///
    /// Callers already awaiting the previous discovery keep its result.
    pub fn reset(&self) {
        *self.tools.write() = Arc::new(OnceCell::new());
        debug!("Proxy tool registry reset");
    }

    /// Whether a discovery result is currently cached.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.tools.read().initialized()
    }

    /// The configured sources, loaded once per process.
    pub async fn sources(&self) -> Arc<[ProxySource]> {
        let result = self
            .sources
            .get_or_try_init(|| async {
                let list: Vec<ProxySource> = match &self.source_list {
                    SourceList::None => Vec::new(),
                    SourceList::Inline(sources) => sources.clone(),
                    SourceList::Location(location) => {
                        load_source_list(
                            location,
                            &self.fetcher,
                            self.profiles.external_https_only(),
                            &self.profiles.http_or_https().policy,
                        )
                        .await?
                    }
                };
                Ok::<_, Error>(Arc::from(list))
            })
            .await;

        match result {
            Ok(sources) => sources.clone(),
            Err(e) => {
                warn!(error = %e, "Failed to load proxy sources");
                Arc::from(Vec::new())
            }
        }
    }

    async fn discover(&self) -> Arc<[ProxyToolDefinition]> {
        let sources = self.sources().await;
        if sources.is_empty() {
            return Arc::from(Vec::new());
        }

        let started = Instant::now();
        let results = join_all(sources.iter().map(|s| self.discover_source(s))).await;

        let prefixed = sources.len() > 1;
        let mut seen = HashSet::new();
        let mut tools = Vec::new();
        let mut failed = 0usize;

        for (source, result) in sources.iter().zip(results) {
            let upstream_tools = match result {
                Ok(t) => t,
                Err(e) => {
                    failed += 1;
                    warn!(source = %source.id, host = ?source.url.host_str(), error = %e, "Proxy source discovery failed");
                    continue;
                }
            };

            for tool in upstream_tools {
                if let Err(reason) = validate_input_schema(&tool.input_schema) {
                    warn!(source = %source.id, tool = %tool.name, reason = %reason, "Rejecting proxy tool with invalid input schema");
                    continue;
                }
                let name = if prefixed {
                    format!("{}_{}", source.id, tool.name)
                } else {
                    tool.name.clone()
                };
                if !seen.insert(name.clone()) {
                    warn!(source = %source.id, tool = %name, "Dropping duplicate proxy tool name");
                    continue;
                }
                tools.push(ProxyToolDefinition {
                    name,
                    upstream_name: tool.name,
                    source_id: source.id.clone(),
                    source_url: source.url.clone(),
                    response_mode: source.response_mode,
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
            }
        }

        info!(
            sources = sources.len(),
            failed,
            tools = tools.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Proxy tool discovery complete"
        );
        Arc::from(tools)
    }

    /// List one source's tools under a hard timeout.
    async fn discover_source(&self, source: &ProxySource) -> Result<Vec<Tool>> {
        let timeout = self.options.discovery_timeout;
        let cancel = CancellationToken::new();
        let timer = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            }
        });

        let profile = self.profiles.http_or_https().clone().with_timeout(timeout);
        let options = SessionOptions {
            headers: self.options.headers.clone(),
            response_mode: source.response_mode,
            replica_header: None,
        };

        let result = with_session(
            Arc::clone(&self.fetcher),
            source.url.clone(),
            profile,
            options,
            cancel.clone(),
            |session| session.list_tools().boxed(),
        )
        .await;
        timer.abort();

        let reason = match result {
            Ok(tools) if tools.is_empty() => "no tools returned".to_string(),
            Ok(tools) => {
                debug!(source = %source.id, count = tools.len(), "Discovered proxy tools");
                return Ok(tools);
            }
            Err(Error::RequestAborted) if cancel.is_cancelled() => {
                format!("timed out after {}ms", timeout.as_millis())
            }
            Err(e) => e.to_string(),
        };

        Err(Error::DiscoverySourceFailure {
            source_id: source.id.clone(),
            reason,
        })
    }
}

/// An input schema must be a JSON object describing an object.
pub(crate) fn validate_input_schema(schema: &Value) -> std::result::Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Err("schema is not an object".to_string());
    };
    match obj.get("type") {
        None => {}
        Some(Value::String(t)) if t == "object" => {}
        Some(other) => return Err(format!("schema type must be \"object\", got {other}")),
    }
    match obj.get("properties") {
        None | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err("schema properties must be an object".to_string()),
    }
}
