//! Redirect-following HTTP engine that re-validates every hop.
//!
//! Transport-level redirects are disabled. Each hop is validated against the
//! profile's URL policy and, for external-only profiles, the rebinding guard
//! before a single byte is sent. 3xx responses are followed by hand:
//!
//! ```text
//! Init -> Validated -> Requesting -> Completed
//!                          |
//!                          +-> Redirecting -> Validated (next hop) -> ...
//!                          +-> Failed
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::sse::SseEvents;
use crate::error::ViolationKind;
use crate::security::{GuardVerdict, RebindingGuard, SafeFetchProfile, parse_ip_literal};
use crate::stats::BridgeStats;
use crate::{Error, Result};

/// Pinned clients kept before the cache is cleared.
const MAX_PINNED_CLIENTS: usize = 64;

/// Headers always removed when a redirect changes origin.
const ALWAYS_SENSITIVE: [HeaderName; 3] = [
    header::AUTHORIZATION,
    header::PROXY_AUTHORIZATION,
    header::COOKIE,
];

/// One logical outbound request.
#[derive(Debug, Clone)]
pub struct SafeRequest {
    /// HTTP method
    pub method: Method,
    /// Request headers
    pub headers: HeaderMap,
    /// Optional body
    pub body: Option<Bytes>,
}

impl SafeRequest {
    /// Bodyless GET.
    #[must_use]
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// POST with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn post_json<T: serde::Serialize>(value: &T) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(Self {
            method: Method::POST,
            headers,
            body: Some(Bytes::from(serde_json::to_vec(value)?)),
        })
    }

    /// Request with an arbitrary method and no body.
    #[must_use]
    pub fn with_method(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Add or replace a header. Invalid names or values are skipped.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            (Ok(k), Ok(v)) => {
                self.headers.insert(k, v);
            }
            _ => warn!(header = %name, "Skipping invalid request header"),
        }
        self
    }
}

/// Outcome of a completed fetch.
#[derive(Debug)]
pub struct SafeFetchResult {
    /// Final, non-redirect response
    pub response: Response,
    /// Last validated URL
    pub final_url: Url,
    /// Number of redirects followed
    pub redirects_followed: u32,
    deadline: Instant,
    timeout: Duration,
    cancel: CancellationToken,
    max_body_bytes: usize,
    max_event_bytes: usize,
    received: usize,
}

impl SafeFetchResult {
    /// Response status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    /// Read the next body chunk, still bounded by the request deadline, the
    /// caller's cancellation and the body size cap.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        let deadline = self.deadline;
        let timeout = self.timeout;
        let cancel = self.cancel.clone();
        let chunk = bounded(
            async {
                self.response
                    .chunk()
                    .await
                    .map_err(|e| Error::Transport(format!("Failed to read body: {e}")))
            },
            deadline,
            timeout,
            &cancel,
        )
        .await?;

        if let Some(chunk) = &chunk {
            self.received = self.received.saturating_add(chunk.len());
            if self.received > self.max_body_bytes {
                return Err(self.too_large());
            }
        }
        Ok(chunk)
    }

    /// Read the whole body.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let declared = self.response.content_length().unwrap_or(0);
        if !usize::try_from(declared).is_ok_and(|len| len <= self.max_body_bytes) {
            return Err(self.too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(body))
    }

    fn too_large(&self) -> Error {
        Error::UpstreamProtocol(format!(
            "response body from {} exceeds {} bytes",
            self.final_url, self.max_body_bytes
        ))
    }

    /// Read the whole body as UTF-8 (lossy).
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read and deserialize a JSON body.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Decode the body as a server-sent event stream.
    #[must_use]
    pub fn events(self) -> SseEvents {
        let max_event_bytes = self.max_event_bytes;
        SseEvents::new(self, max_event_bytes)
    }
}

/// Options for [`SafeFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherOptions {
    /// Extra headers treated as sensitive on cross-origin redirects
    pub sensitive_headers: Vec<String>,
    /// Connect to the guard-validated addresses for external-only profiles
    pub pin_resolved_addresses: bool,
    /// Per-hop connect timeout
    pub connect_timeout: Duration,
    /// Cap on bytes read from one response body
    pub max_body_bytes: usize,
    /// Cap on one server-sent event
    pub max_event_bytes: usize,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            sensitive_headers: Vec::new(),
            pin_resolved_addresses: true,
            connect_timeout: Duration::from_secs(10),
            max_body_bytes: 16 * 1024 * 1024,
            max_event_bytes: 1024 * 1024,
        }
    }
}

impl From<&crate::config::Config> for FetcherOptions {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            sensitive_headers: config.security.sensitive_headers.clone(),
            pin_resolved_addresses: config.security.pin_resolved_addresses,
            connect_timeout: config.fetch.connect_timeout,
            max_body_bytes: config.fetch.max_body_bytes,
            max_event_bytes: config.fetch.max_event_bytes,
        }
    }
}

/// The current hop of a redirect chain.
#[derive(Debug, Clone)]
struct RedirectHop {
    url: Url,
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl RedirectHop {
    /// Advance to `next` after a `status` redirect.
    fn follow(mut self, status: StatusCode, next: Url, sensitive: &[HeaderName]) -> Self {
        let downgrade = (status == StatusCode::SEE_OTHER && self.method != Method::HEAD)
            || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                && self.method == Method::POST);

        if downgrade {
            self.method = Method::GET;
            self.body = None;
            self.headers.remove(header::CONTENT_LENGTH);
            self.headers.remove(header::CONTENT_TYPE);
        }

        if self.url.origin() != next.origin() {
            for name in sensitive {
                self.headers.remove(name);
            }
        }

        self.url = next;
        self
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Race `fut` against the deadline and the caller's cancellation.
async fn bounded<T>(
    fut: impl Future<Output = Result<T>>,
    deadline: Instant,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::RequestAborted),
        () = tokio::time::sleep_until(deadline) => Err(Error::RequestTimeout(timeout)),
        result = fut => result,
    }
}

/// Executes requests under a [`SafeFetchProfile`].
pub struct SafeFetcher {
    client: Client,
    /// Clients pinned to vetted addresses, keyed by host and address set
    pinned_clients: DashMap<String, Client>,
    guard: RebindingGuard,
    sensitive: Vec<HeaderName>,
    options: FetcherOptions,
    stats: Arc<BridgeStats>,
}

impl SafeFetcher {
    /// Create a fetcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(guard: RebindingGuard, options: FetcherOptions, stats: Arc<BridgeStats>) -> Result<Self> {
        let client = Self::client_builder(&options)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let mut sensitive: Vec<HeaderName> = ALWAYS_SENSITIVE.to_vec();
        for name in &options.sensitive_headers {
            match name.to_ascii_lowercase().parse::<HeaderName>() {
                Ok(h) if !sensitive.contains(&h) => sensitive.push(h),
                Ok(_) => {}
                Err(_) => warn!(header = %name, "Ignoring invalid sensitive header name"),
            }
        }

        Ok(Self {
            client,
            pinned_clients: DashMap::new(),
            guard,
            sensitive,
            options,
            stats,
        })
    }

    fn client_builder(options: &FetcherOptions) -> reqwest::ClientBuilder {
        Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(options.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .user_agent(concat!("mcp-hub-bridge/", env!("CARGO_PKG_VERSION")))
    }

    /// Statistics shared with this fetcher.
    #[must_use]
    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    /// Execute `request` against `url` under `profile`.
    ///
    /// # Errors
    ///
    /// Any [`Error::PolicyViolation`] or [`Error::AddressBlocked`] for any hop,
    /// [`Error::RedirectLimitExceeded`], [`Error::RedirectLocationMissing`],
    /// [`Error::RequestTimeout`], [`Error::RequestAborted`], or a transport
    /// error. None of these are retried.
    #[tracing::instrument(
        skip(self, profile, request, cancel),
        fields(profile = %profile.name, method = %request.method)
    )]
    pub async fn fetch(
        &self,
        url: &str,
        profile: &SafeFetchProfile,
        request: SafeRequest,
        cancel: &CancellationToken,
    ) -> Result<SafeFetchResult> {
        let deadline = Instant::now() + profile.timeout;
        let result = self.run(url, profile, request, cancel, deadline).await;

        match &result {
            Ok(done) => {
                debug!(
                    url = %done.final_url,
                    status = %done.status(),
                    redirects = done.redirects_followed,
                    "Fetch completed"
                );
                self.stats.record_fetch_success(done.redirects_followed);
            }
            Err(e) => {
                if e.is_security_rejection() {
                    warn!(url = %url, error = %e, "Outbound request rejected");
                } else {
                    debug!(url = %url, error = %e, "Outbound request failed");
                }
                self.stats.record_fetch_failure(e);
            }
        }

        result
    }

    async fn run(
        &self,
        url: &str,
        profile: &SafeFetchProfile,
        request: SafeRequest,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<SafeFetchResult> {
        let first = profile.policy.validate(url)?;
        let mut hop = RedirectHop {
            url: first,
            method: request.method,
            headers: request.headers,
            body: request.body,
        };
        let mut redirects = 0u32;

        loop {
            let pinned = self.check_destination(&hop.url, profile, deadline, cancel).await?;
            let response = self.exchange(&hop, pinned, profile, deadline, cancel).await?;
            let status = response.status();

            if !is_redirect(status) {
                return Ok(SafeFetchResult {
                    response,
                    final_url: hop.url,
                    redirects_followed: redirects,
                    deadline,
                    timeout: profile.timeout,
                    cancel: cancel.clone(),
                    max_body_bytes: self.options.max_body_bytes,
                    max_event_bytes: self.options.max_event_bytes,
                    received: 0,
                });
            }

            if redirects >= profile.max_redirects {
                return Err(Error::RedirectLimitExceeded {
                    max: profile.max_redirects,
                    url: hop.url.to_string(),
                });
            }

            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::RedirectLocationMissing(hop.url.to_string()))?;

            let next = hop.url.join(location).map_err(|e| {
                Error::policy(
                    ViolationKind::InvalidUrl,
                    format!("bad redirect location '{location}': {e}"),
                )
            })?;
            // Same policy for every hop
            profile.policy.validate_url(&next)?;

            debug!(from = %hop.url, to = %next, status = %status, "Following redirect");
            hop = hop.follow(status, next, &self.sensitive);
            redirects += 1;
        }
    }

    /// Run the rebinding guard when the profile demands it; returns the
    /// socket addresses to pin the connection to, if any.
    async fn check_destination(
        &self,
        url: &Url,
        profile: &SafeFetchProfile,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<SocketAddr>>> {
        if !profile.external_only {
            return Ok(None);
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::policy(ViolationKind::Host, "URL has no host"))?;

        let verdict = bounded(
            self.guard.assert_external(host),
            deadline,
            profile.timeout,
            cancel,
        )
        .await?;

        let pin = match verdict {
            GuardVerdict::External(addrs)
                if self.options.pin_resolved_addresses && parse_ip_literal(host).is_none() =>
            {
                let port = url.port_or_known_default().unwrap_or(443);
                Some(addrs.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
            }
            _ => None,
        };
        Ok(pin)
    }

    /// Client that resolves `host` only to `addrs`, reused across requests.
    fn pinned_client(&self, host: &str, addrs: &[SocketAddr]) -> Result<Client> {
        let mut sorted = addrs.to_vec();
        sorted.sort_unstable();
        let key = sorted.iter().fold(host.to_ascii_lowercase(), |mut key, addr| {
            key.push('|');
            key.push_str(&addr.to_string());
            key
        });

        if let Some(client) = self.pinned_clients.get(&key) {
            return Ok(client.clone());
        }

        let client = Self::client_builder(&self.options)
            .resolve_to_addrs(host, &sorted)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        if self.pinned_clients.len() >= MAX_PINNED_CLIENTS {
            debug!("Pinned client cache full, clearing");
            self.pinned_clients.clear();
        }
        self.pinned_clients.insert(key, client.clone());
        Ok(client)
    }

    /// One HTTP exchange for the current hop.
    async fn exchange(
        &self,
        hop: &RedirectHop,
        pinned: Option<Vec<SocketAddr>>,
        profile: &SafeFetchProfile,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let client = match pinned {
            Some(addrs) => self.pinned_client(hop.url.host_str().unwrap_or_default(), &addrs)?,
            None => self.client.clone(),
        };

        let mut builder = client
            .request(hop.method.clone(), hop.url.clone())
            .headers(hop.headers.clone());
        if let Some(body) = &hop.body {
            builder = builder.body(body.clone());
        }

        debug!(url = %hop.url, method = %hop.method, "Sending request");
        bounded(
            async {
                builder
                    .send()
                    .await
                    .map_err(|e| Error::Transport(format!("Request to {} failed: {e}", hop.url)))
            },
            deadline,
            profile.timeout,
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(method: Method, url: &str) -> RedirectHop {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(header::COOKIE, HeaderValue::from_static("a=b"));
        headers.insert("x-hf-authorization", HeaderValue::from_static("Bearer u"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("2"));
        RedirectHop {
            url: Url::parse(url).unwrap(),
            method,
            headers,
            body: Some(Bytes::from_static(b"{}")),
        }
    }

    fn sensitive() -> Vec<HeaderName> {
        let mut names = ALWAYS_SENSITIVE.to_vec();
        names.push(HeaderName::from_static("x-hf-authorization"));
        names
    }

    #[test]
    fn see_other_downgrades_post_to_bodyless_get() {
        let next = Url::parse("https://a.example/done").unwrap();
        let h = hop(Method::POST, "https://a.example/submit").follow(StatusCode::SEE_OTHER, next, &sensitive());
        assert_eq!(h.method, Method::GET);
        assert!(h.body.is_none());
        assert!(h.headers.get(header::CONTENT_TYPE).is_none());
        assert!(h.headers.get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn found_after_post_downgrades() {
        let next = Url::parse("https://a.example/x").unwrap();
        let h = hop(Method::POST, "https://a.example/").follow(StatusCode::FOUND, next, &sensitive());
        assert_eq!(h.method, Method::GET);
        assert!(h.body.is_none());
    }

    #[test]
    fn found_after_put_keeps_method() {
        let next = Url::parse("https://a.example/x").unwrap();
        let h = hop(Method::PUT, "https://a.example/").follow(StatusCode::FOUND, next, &sensitive());
        assert_eq!(h.method, Method::PUT);
        assert!(h.body.is_some());
    }

    #[test]
    fn temporary_and_permanent_redirects_preserve_method_and_body() {
        for status in [StatusCode::TEMPORARY_REDIRECT, StatusCode::PERMANENT_REDIRECT] {
            let next = Url::parse("https://a.example/y").unwrap();
            let h = hop(Method::POST, "https://a.example/").follow(status, next, &sensitive());
            assert_eq!(h.method, Method::POST);
            assert_eq!(h.body.as_deref(), Some(&b"{}"[..]));
            assert!(h.headers.get(header::CONTENT_TYPE).is_some());
        }
    }

    #[test]
    fn cross_origin_strips_sensitive_headers() {
        let next = Url::parse("https://b.example/").unwrap();
        let h = hop(Method::GET, "https://a.example/").follow(StatusCode::FOUND, next, &sensitive());
        assert!(h.headers.get(header::AUTHORIZATION).is_none());
        assert!(h.headers.get(header::COOKIE).is_none());
        assert!(h.headers.get("x-hf-authorization").is_none());
    }

    #[test]
    fn port_or_scheme_change_is_cross_origin() {
        for target in ["https://a.example:8443/", "http://a.example/"] {
            let next = Url::parse(target).unwrap();
            let h = hop(Method::GET, "https://a.example/").follow(StatusCode::FOUND, next, &sensitive());
            assert!(h.headers.get(header::AUTHORIZATION).is_none(), "{target}");
        }
    }

    #[test]
    fn same_origin_keeps_sensitive_headers() {
        let next = Url::parse("https://a.example:443/other").unwrap();
        let h = hop(Method::GET, "https://a.example/").follow(StatusCode::FOUND, next, &sensitive());
        assert!(h.headers.get(header::AUTHORIZATION).is_some());
        assert!(h.headers.get("x-hf-authorization").is_some());
    }

    #[test]
    fn redirect_statuses() {
        for code in [301, 302, 303, 307, 308] {
            assert!(is_redirect(StatusCode::from_u16(code).unwrap()));
        }
        for code in [200, 300, 304, 404] {
            assert!(!is_redirect(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[tokio::test]
    async fn bounded_distinguishes_timeout_and_abort() {
        let cancel = CancellationToken::new();
        let never = std::future::pending::<Result<()>>();
        let err = bounded(never, Instant::now(), Duration::from_millis(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout(_)));

        cancel.cancel();
        let never = std::future::pending::<Result<()>>();
        let err = bounded(
            never,
            Instant::now() + Duration::from_secs(60),
            Duration::from_secs(60),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::RequestAborted));
    }

    #[test]
    fn pinned_clients_are_reused_per_host_and_addresses() {
        use crate::security::HostAllowlist;

        let fetcher = SafeFetcher::new(
            RebindingGuard::system(HostAllowlist::new(Vec::<String>::new())),
            FetcherOptions::default(),
            Arc::default(),
        )
        .unwrap();
        let a: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let b: SocketAddr = "93.184.216.35:443".parse().unwrap();

        fetcher.pinned_client("example.com", &[a, b]).unwrap();
        fetcher.pinned_client("EXAMPLE.com", &[b, a]).unwrap();
        assert_eq!(fetcher.pinned_clients.len(), 1);

        fetcher.pinned_client("example.com", &[a]).unwrap();
        fetcher.pinned_client("other.example", &[a]).unwrap();
        assert_eq!(fetcher.pinned_clients.len(), 3);
    }

    #[test]
    fn pinned_client_cache_is_bounded() {
        use crate::security::HostAllowlist;

        let fetcher = SafeFetcher::new(
            RebindingGuard::system(HostAllowlist::new(Vec::<String>::new())),
            FetcherOptions::default(),
            Arc::default(),
        )
        .unwrap();
        let addr: SocketAddr = "93.184.216.34:443".parse().unwrap();
        for i in 0..=MAX_PINNED_CLIENTS {
            fetcher.pinned_client(&format!("h{i}.example"), &[addr]).unwrap();
        }
        assert!(fetcher.pinned_clients.len() <= MAX_PINNED_CLIENTS);
    }
}
