//! Interactive app endpoints chosen at request time
//!
//! Apps live on subdomains of configured host suffixes. Their tool schema is
//! fetched through a profile pinned to the app host, and calls go through
//! [`crate::bridge`] with a call profile pinned to the same host.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::bridge::UpstreamTarget;
use crate::config::AppConfig;
use crate::error::ViolationKind;
use crate::protocol::Tool;
use crate::proxy::registry::validate_input_schema;
use crate::security::{ProfileSet, QueryRule, UrlPolicy};
use crate::transport::{ResponseMode, SafeFetcher, SafeRequest};
use crate::{Error, Result};

/// Resolves, inspects and targets interactive apps.
pub struct AppClient {
    fetcher: Arc<SafeFetcher>,
    profiles: Arc<ProfileSet>,
    config: AppConfig,
    policy: UrlPolicy,
}

impl AppClient {
    /// Create a client for the configured app hosts.
    pub fn new(fetcher: Arc<SafeFetcher>, profiles: Arc<ProfileSet>, config: AppConfig) -> Self {
        let policy = UrlPolicy::new(["https"])
            .allow_subdomains_of(&config.host_suffixes)
            .require_default_port()
            .query(QueryRule::AllowNone);
        Self {
            fetcher,
            profiles,
            config,
            policy,
        }
    }

    /// Turn an app URL, or an `owner/name` id, into the app's origin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyViolation`] unless the app lives under a
    /// configured host suffix.
    pub fn resolve(&self, app: &str) -> Result<Url> {
        let app = app.trim();
        let candidate = if app.contains("://") {
            app.to_string()
        } else if let Some((owner, name)) = app.split_once('/') {
            let suffix = self.config.host_suffixes.first().ok_or_else(|| {
                Error::Config("apps.host_suffixes is empty".to_string())
            })?;
            format!("https://{}-{}.{suffix}/", subdomain_part(owner), subdomain_part(name))
        } else {
            return Err(Error::policy(
                ViolationKind::InvalidUrl,
                format!("'{app}' is neither an app URL nor an owner/name id"),
            ));
        };

        let mut url = self.policy.validate(&candidate)?;
        url.set_path("/");
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    /// Fetch an app's tool schema.
    ///
    /// # Errors
    ///
    /// Any fetch error, a non-success status, or a schema in neither the
    /// object-map nor the array form.
    pub async fn fetch_tools(&self, app: &Url, cancel: &CancellationToken) -> Result<Vec<Tool>> {
        let profile =
            self.profiles
                .upstream_schema(app, &self.config.schema_path, self.config.schema_timeout)?;
        let schema_url = join_path(app, &self.config.schema_path)?;

        let response = self
            .fetcher
            .fetch(schema_url.as_str(), &profile, SafeRequest::get(), cancel)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "schema request to {schema_url} returned HTTP {status}"
            )));
        }

        let tools = parse_schema(response.json::<Value>().await?)?;
        debug!(app = %app, count = tools.len(), "Fetched app schema");
        Ok(tools)
    }

    /// Bridge target for calling tools on `app`.
    ///
    /// # Errors
    ///
    /// Returns an error if the call path cannot be joined onto the app URL.
    pub fn target(&self, app: &Url, headers: HashMap<String, String>) -> Result<UpstreamTarget> {
        Ok(UpstreamTarget {
            endpoint: join_path(app, &self.config.call_path)?,
            call_path: self.config.call_path.clone(),
            source_id: None,
            response_mode: ResponseMode::Sse,
            headers,
            timeout: self.config.call_timeout,
        })
    }
}

fn subdomain_part(part: &str) -> String {
    part.trim()
        .chars()
        .map(|c| match c {
            '_' | '.' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

fn join_path(base: &Url, path: &str) -> Result<Url> {
    base.join(path).map_err(|e| {
        Error::policy(ViolationKind::InvalidUrl, format!("cannot join '{path}' onto {base}: {e}"))
    })
}

/// Accepts `[{name, description, inputSchema}, ...]` or
/// `{name: {description, inputSchema | input_schema}, ...}`.
fn parse_schema(value: Value) -> Result<Vec<Tool>> {
    let entries: Vec<(String, Value)> = match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                let name = item
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (name, item)
            })
            .collect(),
        Value::Object(map) => map.into_iter().collect(),
        _ => {
            return Err(Error::UpstreamProtocol(
                "app schema is neither an object nor an array".to_string(),
            ));
        }
    };

    let tools = entries
        .into_iter()
        .filter(|(name, _)| !name.is_empty())
        .filter_map(|(name, entry)| {
            let description = entry
                .get("description")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            let input_schema = entry
                .get("inputSchema")
                .or_else(|| entry.get("input_schema"))
                .cloned()
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
            if let Err(reason) = validate_input_schema(&input_schema) {
                warn!(tool = %name, reason = %reason, "Skipping app tool with invalid input schema");
                return None;
            }
            Some(Tool {
                name,
                title: None,
                description,
                input_schema,
                output_schema: None,
                annotations: None,
            })
        })
        .collect();
    Ok(tools)
}
