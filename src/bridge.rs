//! Upstream call bridge
//!
//! One forwarded tool call = one short-lived upstream session. The session is
//! torn down on every exit path and any failure comes back as an `isError`
//! result rather than an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RoutingConfig;
use crate::protocol::{Content, JsonRpcNotification, ProgressParams, ToolsCallResult};
use crate::proxy::ProxyToolDefinition;
use crate::security::ProfileSet;
use crate::stats::BridgeStats;
use crate::transport::{NotificationSink, ResponseMode, SafeFetcher, SessionOptions, with_session};
use crate::{Error, Result};

/// Characters escaped in a replica id path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'\\')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Where and how to forward one call.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    /// MCP endpoint
    pub endpoint: Url,
    /// Path prefix every hop must stay under
    pub call_path: String,
    /// Proxy source id, `None` for request-time endpoints
    pub source_id: Option<String>,
    /// Preferred response mode
    pub response_mode: ResponseMode,
    /// Extra request headers
    pub headers: HashMap<String, String>,
    /// Budget for the whole call
    pub timeout: Duration,
}

impl UpstreamTarget {
    /// Target for a discovered proxy tool.
    pub fn for_proxy_tool(
        tool: &ProxyToolDefinition,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint: tool.source_url.clone(),
            call_path: tool.source_url.path().to_string(),
            source_id: Some(tool.source_id.clone()),
            response_mode: tool.response_mode,
            headers,
            timeout,
        }
    }

    fn host(&self) -> &str {
        self.endpoint.host_str().unwrap_or_default()
    }
}

/// Forwards upstream progress to the caller.
///
/// The first delivery failure is logged once and disables the relay; a relay
/// never fails the call it belongs to.
#[derive(Debug)]
pub struct ProgressRelay {
    token: Value,
    sender: mpsc::Sender<JsonRpcNotification>,
    disabled: AtomicBool,
    cancel: CancellationToken,
}

impl ProgressRelay {
    /// Relay to `sender`, tagging events with the caller's `token`.
    pub fn new(
        token: Value,
        sender: mpsc::Sender<JsonRpcNotification>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            token,
            sender,
            disabled: AtomicBool::new(false),
            cancel,
        }
    }

    /// Try to deliver one progress event. Returns whether it was delivered.
    pub async fn attempt(&self, event: ProgressParams) -> bool {
        if self.is_disabled() {
            return false;
        }

        let params = ProgressParams {
            progress_token: self.token.clone(),
            ..event
        };
        let notification = match serde_json::to_value(&params) {
            Ok(p) => JsonRpcNotification::new("notifications/progress", Some(p)),
            Err(e) => {
                self.fail(&e.to_string());
                return false;
            }
        };

        // Never wait on the caller: a full channel drops the event.
        match self.sender.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Progress receiver is full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.fail("receiver closed");
                false
            }
        }
    }

    /// Stop relaying. Idempotent.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Relaxed);
    }

    /// Whether events are being dropped.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed) || self.cancel.is_cancelled()
    }

    fn fail(&self, reason: &str) {
        if !self.disabled.swap(true, Ordering::Relaxed) {
            warn!(reason, "Progress relay failed, disabling");
        }
    }
}

#[async_trait]
impl NotificationSink for ProgressRelay {
    async fn notify(&self, notification: JsonRpcNotification) {
        if notification.method != "notifications/progress" {
            debug!(method = %notification.method, "Dropping upstream notification");
            return;
        }
        match notification
            .params
            .map(serde_json::from_value::<ProgressParams>)
        {
            Some(Ok(event)) => {
                self.attempt(event).await;
            }
            _ => debug!("Dropping malformed progress notification"),
        }
    }
}

/// Forwards tool calls to upstream MCP endpoints.
pub struct UpstreamCallBridge {
    fetcher: Arc<SafeFetcher>,
    profiles: Arc<ProfileSet>,
    routing: RoutingConfig,
    stats: Arc<BridgeStats>,
}

impl UpstreamCallBridge {
    /// Create a bridge.
    pub fn new(
        fetcher: Arc<SafeFetcher>,
        profiles: Arc<ProfileSet>,
        routing: RoutingConfig,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            fetcher,
            profiles,
            routing,
            stats,
        }
    }

    /// Call `tool` on `target`. Never fails: errors become an `isError` result.
    pub async fn invoke(
        &self,
        target: &UpstreamTarget,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
        relay: Option<ProgressRelay>,
    ) -> ToolsCallResult {
        let started = Instant::now();
        let source = target.source_id.as_deref();
        // Request-time endpoints are tallied by host.
        let usage_source = source.or(Some(target.host()));
        let result = self.forward(target, tool, arguments, cancel, relay).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(result) => {
                self.stats.record_call(usage_source, tool, !result.is_error);
                info!(
                    source = source.unwrap_or("-"),
                    host = %target.host(),
                    tool = %tool,
                    is_error = result.is_error,
                    elapsed_ms,
                    "Forwarded tool call"
                );
                result
            }
            Err(e) => {
                self.stats.record_call(usage_source, tool, false);
                warn!(
                    source = source.unwrap_or("-"),
                    host = %target.host(),
                    tool = %tool,
                    error = %e,
                    elapsed_ms,
                    "Forwarded tool call failed"
                );
                ToolsCallResult {
                    structured_content: Some(failure_details(tool, &e)),
                    ..ToolsCallResult::error(describe_failure(tool, target.host(), &e))
                }
            }
        }
    }

    async fn forward(
        &self,
        target: &UpstreamTarget,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
        relay: Option<ProgressRelay>,
    ) -> Result<ToolsCallResult> {
        let profile =
            self.profiles
                .upstream_call(&target.endpoint, &target.call_path, target.timeout)?;
        profile.policy.validate_url(&target.endpoint)?;

        let replica_header = Some(self.routing.replica_header.clone()).filter(|h| !h.is_empty());
        let options = SessionOptions {
            headers: target.headers.clone(),
            response_mode: target.response_mode,
            replica_header,
        };
        let tool_name = tool.to_string();

        let (mut result, replica) = with_session(
            Arc::clone(&self.fetcher),
            target.endpoint.clone(),
            profile,
            options,
            cancel.clone(),
            move |session| {
                async move {
                    let sink = relay.as_ref().map(|r| r as &dyn NotificationSink);
                    let outcome = session.call_tool(&tool_name, arguments, sink).await;
                    if let Some(relay) = &relay {
                        relay.disable();
                    }
                    Ok((outcome?, session.replica_id()))
                }
                .boxed()
            },
        )
        .await?;

        if let Some(replica) = replica {
            let origin = target.endpoint.origin().ascii_serialization();
            rewrite_replica_urls(&mut result, &origin, &replica, &self.routing);
        }
        Ok(result)
    }
}

/// Pin same-origin API URLs in text content to `replica`.
pub fn rewrite_replica_urls(
    result: &mut ToolsCallResult,
    origin: &str,
    replica: &str,
    routing: &RoutingConfig,
) {
    let api = format!("/{}/", routing.api_path_prefix.trim_matches('/'));
    let needle = format!("{origin}{api}");
    let replacement = format!(
        "{origin}/{}/{}{api}",
        routing.replica_segment.trim_matches('/'),
        utf8_percent_encode(replica, SEGMENT)
    );

    for content in &mut result.content {
        if let Content::Text { text, .. } = content {
            if text.contains(&needle) {
                *text = text.replace(&needle, &replacement);
            }
        }
    }
}

fn describe_failure(tool: &str, host: &str, error: &Error) -> String {
    match error {
        Error::RequestAborted => format!("Call to {tool} on {host} was cancelled"),
        Error::RequestTimeout(d) => {
            format!("Call to {tool} on {host} timed out after {}s", d.as_secs())
        }
        Error::JsonRpc { code, message, .. } => {
            format!("Upstream error calling {tool} on {host} ({code}): {message}")
        }
        other => format!("Error calling {tool} on {host}: {other}"),
    }
}

fn failure_details(tool: &str, error: &Error) -> Value {
    json!({
        "tool": tool,
        "code": error.to_rpc_code(),
        "securityRejection": error.is_security_rejection(),
        "message": error.to_string(),
    })
}
