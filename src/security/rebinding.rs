//! DNS rebinding guard.
//!
//! Resolves a hostname, rejects it when any answer is internal or reserved,
//! then resolves it a second time and repeats the check. The second lookup
//! narrows the window in which a short-TTL answer can flip to an internal
//! address between validation and connection; it does not close it. Callers
//! that need the window closed pin the connection to the returned addresses
//! (see [`crate::transport::SafeFetcher`]).

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::address::{is_reserved_ip, parse_ip_literal};
use super::url_policy::normalize_host;
use crate::{Error, Result};

/// Hostname resolution seam.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve every address for `host`.
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the system resolver via [`tokio::net::lookup_host`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        ips.sort_unstable();
        ips.dedup();
        Ok(ips)
    }
}

/// One operator allowlist entry: `host.example` or `*.example`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Exact(String),
    Subdomains(String),
}

impl HostPattern {
    fn parse(raw: &str) -> Option<Self> {
        let pattern = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        if pattern.is_empty() {
            return None;
        }
        match pattern.strip_prefix("*.") {
            Some("") => None,
            Some(domain) => Some(Self::Subdomains(domain.to_string())),
            None => Some(Self::Exact(pattern)),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(exact) => host == exact,
            Self::Subdomains(domain) => host
                .strip_suffix(domain.as_str())
                .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1),
        }
    }
}

/// Operator-configured hostnames that may resolve to internal addresses.
#[derive(Debug, Clone, Default)]
pub struct HostAllowlist {
    patterns: Vec<HostPattern>,
}

impl HostAllowlist {
    /// Build from raw patterns; blank or malformed entries are dropped.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|p| {
                let parsed = HostPattern::parse(p.as_ref());
                if parsed.is_none() {
                    warn!(pattern = %p.as_ref(), "Ignoring malformed internal-host allow pattern");
                }
                parsed
            })
            .collect();
        Self { patterns }
    }

    /// Whether `host` matches any pattern.
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.patterns.iter().any(|p| p.matches(&host))
    }

    /// Whether the allowlist is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Outcome of a successful guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    /// Host matched the operator allowlist; no address check ran.
    Allowlisted,
    /// Every address from both lookups is external.
    External(Vec<IpAddr>),
}

impl GuardVerdict {
    /// Addresses validated by the second lookup, if any.
    #[must_use]
    pub fn addresses(&self) -> &[IpAddr] {
        match self {
            Self::Allowlisted => &[],
            Self::External(addrs) => addrs,
        }
    }
}

/// Resolves hostnames twice and rejects internal destinations.
#[derive(Clone)]
pub struct RebindingGuard {
    resolver: Arc<dyn Resolver>,
    allowlist: HostAllowlist,
}

impl std::fmt::Debug for RebindingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebindingGuard")
            .field("allowlist", &self.allowlist)
            .finish_non_exhaustive()
    }
}

impl RebindingGuard {
    /// Create a guard over the given resolver.
    pub fn new(resolver: Arc<dyn Resolver>, allowlist: HostAllowlist) -> Self {
        Self {
            resolver,
            allowlist,
        }
    }

    /// Guard using the system resolver.
    #[must_use]
    pub fn system(allowlist: HostAllowlist) -> Self {
        Self::new(Arc::new(SystemResolver), allowlist)
    }

    /// Assert that `host` only reaches external addresses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressBlocked`] when the host is an internal literal,
    /// does not resolve, resolves to nothing, or any answer of either lookup is
    /// internal or reserved.
    pub async fn assert_external(&self, host: &str) -> Result<GuardVerdict> {
        let host = normalize_host(host);

        if self.allowlist.matches(&host) {
            debug!(host = %host, "Host allowlisted for internal addresses");
            return Ok(GuardVerdict::Allowlisted);
        }

        if let Some(ip) = parse_ip_literal(&host) {
            if is_reserved_ip(ip) {
                warn!(host = %host, "Blocked internal address literal");
                return Err(Error::blocked(&host, format!("{ip} is internal or reserved")));
            }
            return Ok(GuardVerdict::External(vec![ip]));
        }

        self.resolve_and_check(&host).await?;
        // Second, independent lookup: a rebinding answer must pass twice.
        let addrs = self.resolve_and_check(&host).await?;
        Ok(GuardVerdict::External(addrs))
    }

    async fn resolve_and_check(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = self
            .resolver
            .resolve(host)
            .await
            .map_err(|e| Error::blocked(host, format!("DNS resolution failed: {e}")))?;

        if addrs.is_empty() {
            return Err(Error::blocked(host, "DNS resolution returned no addresses"));
        }

        if let Some(bad) = addrs.iter().find(|ip| is_reserved_ip(**ip)) {
            warn!(host = %host, address = %bad, "Hostname resolves to internal address");
            return Err(Error::blocked(
                host,
                format!("resolves to internal or reserved address {bad}"),
            ));
        }

        Ok(addrs)
    }
}
