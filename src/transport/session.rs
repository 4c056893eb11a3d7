//! Short-lived MCP client session over Streamable HTTP
//!
//! Every request goes through [`SafeFetcher`] with the session's profile, so
//! redirects, address checks and deadlines apply to protocol traffic exactly
//! as they do to plain fetches.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use reqwest::Method;
use reqwest::header::{self, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::safe_fetch::{SafeFetchResult, SafeFetcher, SafeRequest};
use crate::protocol::{
    InitializeResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION, RequestId, Tool, ToolsCallParams, ToolsCallResult, ToolsListResult,
    negotiate_version,
};
use crate::security::SafeFetchProfile;
use crate::{Error, Result};

const SESSION_HEADER: &str = "mcp-session-id";
const VERSION_HEADER: &str = "mcp-protocol-version";
const MAX_LIST_PAGES: usize = 50;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How an upstream prefers to answer requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseMode {
    /// Buffered `application/json`
    #[default]
    Json,
    /// `text/event-stream`
    Sse,
}

impl ResponseMode {
    fn accept(self) -> &'static str {
        match self {
            Self::Json => "application/json, text/event-stream",
            Self::Sse => "text/event-stream, application/json",
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.pad("JSON"),
            Self::Sse => f.pad("SSE"),
        }
    }
}

impl FromStr for ResponseMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "JSON" => Ok(Self::Json),
            "SSE" => Ok(Self::Sse),
            other => Err(Error::Config(format!("unknown response type '{other}'"))),
        }
    }
}

/// Receives server notifications that arrive while a request is in flight.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Handle one notification. Must not fail the request.
    async fn notify(&self, notification: JsonRpcNotification);
}

/// Per-session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Extra headers sent with every request
    pub headers: HashMap<String, String>,
    /// Preferred response mode
    pub response_mode: ResponseMode,
    /// Response header carrying the backend replica id
    pub replica_header: Option<String>,
}

/// An initialized MCP session to one upstream endpoint.
pub struct UpstreamSession {
    fetcher: Arc<SafeFetcher>,
    endpoint: Url,
    profile: SafeFetchProfile,
    options: SessionOptions,
    replica_header: Option<HeaderName>,
    cancel: CancellationToken,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<String>,
    replica_id: RwLock<Option<String>>,
    request_id: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("endpoint", &self.endpoint.as_str())
            .field("profile", &self.profile.name)
            .field("session_id", &*self.session_id.read())
            .finish_non_exhaustive()
    }
}

impl UpstreamSession {
    /// Open a session: `initialize`, version check, `notifications/initialized`.
    ///
    /// # Errors
    ///
    /// Any fetch error, a JSON-RPC error from `initialize`, or an unsupported
    /// protocol version.
    pub async fn connect(
        fetcher: Arc<SafeFetcher>,
        endpoint: Url,
        profile: SafeFetchProfile,
        options: SessionOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let replica_header = options
            .replica_header
            .as_deref()
            .and_then(|h| h.to_ascii_lowercase().parse::<HeaderName>().ok());

        let session = Self {
            fetcher,
            endpoint,
            profile,
            options,
            replica_header,
            cancel,
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(PROTOCOL_VERSION.to_string()),
            replica_id: RwLock::new(None),
            request_id: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        if let Err(e) = session.initialize().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mcp-hub-bridge",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let result = self.request("initialize", Some(params), None).await?.into_result()?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| Error::UpstreamProtocol(format!("invalid initialize result: {e}")))?;

        let version = negotiate_version(&init.protocol_version).ok_or_else(|| {
            Error::UpstreamProtocol(format!(
                "unsupported protocol version '{}'",
                init.protocol_version
            ))
        })?;
        *self.protocol_version.write() = version.to_string();

        self.notify("notifications/initialized", None).await?;
        self.connected.store(true, Ordering::Relaxed);

        debug!(
            url = %self.endpoint,
            version = %version,
            server = ?init.server_info.as_ref().map(|i| i.name.as_str()),
            "Upstream session initialized"
        );
        Ok(())
    }

    /// List all tools, following pagination cursors.
    ///
    /// # Errors
    ///
    /// Any request error, or [`Error::UpstreamProtocol`] for a malformed result.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request("tools/list", params, None).await?.into_result()?;
            let page: ToolsListResult = serde_json::from_value(result)
                .map_err(|e| Error::UpstreamProtocol(format!("invalid tools/list result: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        warn!(url = %self.endpoint, "tools/list pagination limit reached");
        Ok(tools)
    }

    /// Call one tool. With a sink, a progress token is attached and
    /// progress notifications are forwarded to it.
    ///
    /// # Errors
    ///
    /// Any request error, a JSON-RPC error, or a malformed result.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        sink: Option<&dyn NotificationSink>,
    ) -> Result<ToolsCallResult> {
        let meta = sink.map(|_| json!({ "progressToken": uuid::Uuid::new_v4().to_string() }));
        let params = ToolsCallParams {
            name: name.to_string(),
            arguments,
            meta,
        };

        let result = self
            .request("tools/call", Some(serde_json::to_value(&params)?), sink)
            .await?
            .into_result()?;
        serde_json::from_value(result)
            .map_err(|e| Error::UpstreamProtocol(format!("invalid tools/call result: {e}")))
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// Any fetch error, a non-success HTTP status, or a body that carries no
    /// matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        sink: Option<&dyn NotificationSink>,
    ) -> Result<JsonRpcResponse> {
        let id = RequestId::Number(
            i64::try_from(self.request_id.fetch_add(1, Ordering::Relaxed) + 1).unwrap_or(i64::MAX),
        );
        let request = JsonRpcRequest::new(id.clone(), method, params);
        let response = self.post(&request).await?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            self.read_event_stream(response, &id, sink).await
        } else {
            response
                .json::<JsonRpcResponse>()
                .await
                .map_err(|e| Error::UpstreamProtocol(format!("invalid {method} response: {e}")))
        }
    }

    /// Send a notification.
    ///
    /// # Errors
    ///
    /// Returns a fetch error. A non-success status is logged, not returned.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let response = self.send(SafeRequest::post_json(&notification)?).await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), url = %self.endpoint, method, "Notification rejected");
        }
        Ok(())
    }

    /// Terminate the session with `DELETE`. Best effort; errors are logged.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let Some(session_id) = self.session_id.read().clone() else {
            return;
        };

        let request = SafeRequest::with_method(Method::DELETE).header(SESSION_HEADER, &session_id);
        let profile = self
            .profile
            .clone()
            .with_timeout(CLOSE_TIMEOUT.min(self.profile.timeout));
        // The caller's token may already be cancelled; teardown still runs.
        let cancel = CancellationToken::new();

        match self
            .fetcher
            .fetch(self.endpoint.as_str(), &profile, request, &cancel)
            .await
        {
            Ok(resp) => debug!(url = %self.endpoint, status = %resp.status(), "Upstream session closed"),
            Err(e) => debug!(url = %self.endpoint, error = %e, "Upstream session close failed"),
        }
    }

    /// Whether `initialize` completed and the session is not closed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Session id assigned by the upstream, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn protocol_version(&self) -> String {
        self.protocol_version.read().clone()
    }

    /// Replica id captured from the configured response header, if any.
    #[must_use]
    pub fn replica_id(&self) -> Option<String> {
        self.replica_id.read().clone()
    }

    /// The endpoint this session talks to.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, request: &JsonRpcRequest) -> Result<SafeFetchResult> {
        let safe = SafeRequest::post_json(request)?.header("accept", self.options.response_mode.accept());
        debug!(url = %self.endpoint, method = %request.method, id = %request.id, "Sending upstream request");
        let response = self.send(safe).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(256).collect();
            return Err(Error::Transport(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }

    async fn send(&self, mut request: SafeRequest) -> Result<SafeFetchResult> {
        for (key, value) in &self.options.headers {
            if let (Ok(k), Ok(v)) = (key.parse::<HeaderName>(), HeaderValue::from_str(value)) {
                request.headers.insert(k, v);
            }
        }
        request = request.header(VERSION_HEADER, &self.protocol_version.read().clone());
        if let Some(id) = self.session_id.read().clone() {
            request = request.header(SESSION_HEADER, &id);
        }

        let response = self
            .fetcher
            .fetch(self.endpoint.as_str(), &self.profile, request, &self.cancel)
            .await?;
        self.capture_headers(&response);
        Ok(response)
    }

    fn capture_headers(&self, response: &SafeFetchResult) {
        if self.session_id.read().is_none() {
            if let Some(id) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
                debug!(session_id = %id, url = %self.endpoint, "Stored upstream session id");
                *self.session_id.write() = Some(id.to_string());
            }
        }

        if let Some(name) = &self.replica_header {
            if let Some(replica) = response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                let mut current = self.replica_id.write();
                if current.as_deref() != Some(replica) {
                    info!(replica = %replica, url = %self.endpoint, "Captured upstream replica");
                    *current = Some(replica.to_string());
                }
            }
        }
    }

    async fn read_event_stream(
        &self,
        response: SafeFetchResult,
        id: &RequestId,
        sink: Option<&dyn NotificationSink>,
    ) -> Result<JsonRpcResponse> {
        let mut events = response.events();

        while let Some(event) = events.next().await? {
            if event.event.as_deref().is_some_and(|e| e != "message") {
                continue;
            }
            let message: JsonRpcMessage = match serde_json::from_str(&event.data) {
                Ok(m) => m,
                Err(e) => {
                    debug!(error = %e, "Skipping non JSON-RPC event");
                    continue;
                }
            };

            match message {
                JsonRpcMessage::Response(resp) if resp.id.as_ref() == Some(id) => return Ok(resp),
                JsonRpcMessage::Response(resp) => {
                    debug!(id = ?resp.id, "Ignoring response for another request");
                }
                JsonRpcMessage::Notification(note) => {
                    if let Some(sink) = sink {
                        sink.notify(note).await;
                    }
                }
                JsonRpcMessage::Request(req) => {
                    debug!(method = %req.method, "Ignoring server-initiated request");
                }
            }
        }

        Err(Error::UpstreamProtocol(
            "event stream ended without a response".to_string(),
        ))
    }
}

/// Open a session, run `f` on it, and close it on every exit path.
///
/// A panic inside `f` is caught, the session is still closed, and the panic
/// surfaces as [`Error::Internal`].
///
/// # Errors
///
/// Any error from connecting or from `f`.
pub async fn with_session<T, F>(
    fetcher: Arc<SafeFetcher>,
    endpoint: Url,
    profile: SafeFetchProfile,
    options: SessionOptions,
    cancel: CancellationToken,
    f: F,
) -> Result<T>
where
    F: for<'s> FnOnce(&'s UpstreamSession) -> BoxFuture<'s, Result<T>>,
{
    let session = UpstreamSession::connect(fetcher, endpoint, profile, options, cancel).await?;
    let outcome = std::panic::AssertUnwindSafe(f(&session)).catch_unwind().await;
    session.close().await;

    match outcome {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::Internal(format!("upstream session handler panicked: {message}")))
        }
    }
}
