//! Named fetch profiles.
//!
//! Every outbound call site selects one of these instead of assembling a
//! policy by hand. Fixed profiles are built once from [`Config`]; per-host
//! profiles are derived from an already-validated endpoint URL.

use std::collections::BTreeSet;
use std::time::Duration;

use url::Url;

use super::url_policy::{QueryRule, UrlPolicy, normalize_host};
use crate::config::Config;
use crate::error::ViolationKind;
use crate::{Error, Result};

/// A URL policy plus the operational budget for one call site.
#[derive(Debug, Clone)]
pub struct SafeFetchProfile {
    /// Profile name, used in logs
    pub name: String,
    /// URL rules applied to every hop
    pub policy: UrlPolicy,
    /// Wall-clock budget for the whole request
    pub timeout: Duration,
    /// Maximum redirects followed
    pub max_redirects: u32,
    /// Run the rebinding guard on every hop
    pub external_only: bool,
}

impl SafeFetchProfile {
    /// Create a profile.
    pub fn new(
        name: impl Into<String>,
        policy: UrlPolicy,
        timeout: Duration,
        max_redirects: u32,
        external_only: bool,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            timeout,
            max_redirects,
            external_only,
        }
    }

    /// Same profile with a different timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Profile names accepted by [`ProfileSet::by_name`].
pub const PROFILE_NAMES: &[&str] = &[
    "external-https-only",
    "http-or-https",
    "localhost-http",
    "hub",
    "docs",
];

/// The fixed table of profiles for one deployment.
#[derive(Debug, Clone)]
pub struct ProfileSet {
    external_https_only: SafeFetchProfile,
    http_or_https: SafeFetchProfile,
    localhost_http: SafeFetchProfile,
    hub: SafeFetchProfile,
    docs: SafeFetchProfile,
    default_timeout: Duration,
    max_redirects: u32,
}

impl ProfileSet {
    /// Build the fixed profiles from configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let timeout = config.fetch.timeout;
        let max_redirects = config.fetch.max_redirects;
        let hub_hosts: BTreeSet<String> =
            config.hub.hostnames.iter().map(|h| normalize_host(h)).collect();

        let external_https_only = SafeFetchProfile::new(
            "external-https-only",
            UrlPolicy::new(["https"]),
            timeout,
            max_redirects,
            true,
        );

        let http_or_https = SafeFetchProfile::new(
            "http-or-https",
            UrlPolicy::new(["http", "https"]),
            timeout,
            max_redirects,
            true,
        );

        let localhost_http = SafeFetchProfile::new(
            "localhost-http",
            UrlPolicy::new(["http", "https"]).allow_hosts(["localhost", "127.0.0.1", "::1"]),
            timeout,
            max_redirects,
            false,
        );

        let hub = SafeFetchProfile::new(
            "hub",
            UrlPolicy::new(["https"])
                .allow_hosts(&hub_hosts)
                .require_default_port(),
            timeout,
            max_redirects,
            true,
        );

        let docs_prefix = config.hub.docs_path_prefix.clone();
        let docs_hub_hosts = hub_hosts.clone();
        let docs = SafeFetchProfile::new(
            "docs",
            UrlPolicy::new(["https"])
                .allow_hosts(&hub_hosts)
                .allow_hosts(&config.hub.docs_hostnames)
                .require_default_port()
                .with_validator(move |url| {
                    let host = url.host_str().map(normalize_host).unwrap_or_default();
                    let base = docs_prefix.trim_end_matches('/');
                    let path = url.path();
                    let under_docs = path == base || path.starts_with(&format!("{base}/"));
                    if docs_hub_hosts.contains(&host) && !under_docs {
                        Err(format!("only {docs_prefix} paths are allowed on {host}"))
                    } else {
                        Ok(())
                    }
                }),
            timeout,
            max_redirects,
            true,
        );

        Self {
            external_https_only,
            http_or_https,
            localhost_http,
            hub,
            docs,
            default_timeout: timeout,
            max_redirects,
        }
    }

    /// https only, no credentials, any query; external addresses only.
    #[must_use]
    pub fn external_https_only(&self) -> &SafeFetchProfile {
        &self.external_https_only
    }

    /// http or https to any host; external addresses only unless allowlisted.
    #[must_use]
    pub fn http_or_https(&self) -> &SafeFetchProfile {
        &self.http_or_https
    }

    /// http or https to loopback hosts only.
    #[must_use]
    pub fn localhost_http(&self) -> &SafeFetchProfile {
        &self.localhost_http
    }

    /// https to the hub hostnames.
    #[must_use]
    pub fn hub(&self) -> &SafeFetchProfile {
        &self.hub
    }

    /// https to hub and docs-vendor hosts; `/docs/` required on hub hosts.
    #[must_use]
    pub fn docs(&self) -> &SafeFetchProfile {
        &self.docs
    }

    /// Look up a fixed profile by name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&SafeFetchProfile> {
        match name {
            "external-https-only" => Some(&self.external_https_only),
            "http-or-https" => Some(&self.http_or_https),
            "localhost-http" => Some(&self.localhost_http),
            "hub" => Some(&self.hub),
            "docs" => Some(&self.docs),
            _ => None,
        }
    }

    /// Profile for fetching a tool schema from one upstream endpoint.
    ///
    /// Host, scheme and port are pinned to `endpoint`; the path must start
    /// with `schema_path`; no query string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyViolation`] if `endpoint` has no host.
    pub fn upstream_schema(
        &self,
        endpoint: &Url,
        schema_path: &str,
        timeout: Duration,
    ) -> Result<SafeFetchProfile> {
        let policy = pinned_policy(endpoint)?
            .require_path_prefix(schema_path)
            .query(QueryRule::AllowNone);
        Ok(SafeFetchProfile::new(
            format!("upstream-schema:{}", endpoint.host_str().unwrap_or_default()),
            policy,
            timeout,
            self.max_redirects,
            true,
        ))
    }

    /// Profile for calling tools on one upstream endpoint.
    ///
    /// The scheme is the one negotiated when the endpoint was discovered, so a
    /// call never silently switches between http and https.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyViolation`] if `endpoint` has no host.
    pub fn upstream_call(
        &self,
        endpoint: &Url,
        call_path: &str,
        timeout: Duration,
    ) -> Result<SafeFetchProfile> {
        let policy = pinned_policy(endpoint)?.require_path_prefix(call_path);
        Ok(SafeFetchProfile::new(
            format!("upstream-call:{}", endpoint.host_str().unwrap_or_default()),
            policy,
            timeout,
            self.max_redirects,
            true,
        ))
    }

    /// Default timeout applied by fixed profiles.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

/// Scheme, host and port pinned to `endpoint`.
fn pinned_policy(endpoint: &Url) -> Result<UrlPolicy> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| Error::policy(ViolationKind::Host, "endpoint has no host"))?;
    let mut policy = UrlPolicy::new([endpoint.scheme()]).allow_hosts([host]);

    match endpoint.port() {
        None => policy = policy.require_default_port(),
        Some(port) => {
            policy = policy.with_validator(move |url| {
                if url.port() == Some(port) {
                    Ok(())
                } else {
                    Err(format!("port must be {port}"))
                }
            });
        }
    }

    Ok(policy)
}
