//! Outbound traffic statistics
//!
//! Lock-free counters for fetches, security rejections and forwarded tool calls.
//! One instance is owned by the composition root and shared by reference.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Distinct tools tracked in the usage table; later ones only hit the totals.
pub const MAX_TRACKED_TOOLS: usize = 1024;

/// Counters for the outbound boundary
pub struct BridgeStats {
    fetch_success: AtomicU64,
    fetch_failure: AtomicU64,
    policy_rejections: AtomicU64,
    address_rejections: AtomicU64,
    redirects_followed: AtomicU64,
    call_success: AtomicU64,
    call_failure: AtomicU64,
    /// Per-tool call counts (key = "source:tool"), at most `MAX_TRACKED_TOOLS`
    tool_usage: DashMap<String, AtomicU64>,
}

impl BridgeStats {
    /// Create new statistics tracker
    #[must_use]
    pub fn new() -> Self {
        Self {
            fetch_success: AtomicU64::new(0),
            fetch_failure: AtomicU64::new(0),
            policy_rejections: AtomicU64::new(0),
            address_rejections: AtomicU64::new(0),
            redirects_followed: AtomicU64::new(0),
            call_success: AtomicU64::new(0),
            call_failure: AtomicU64::new(0),
            tool_usage: DashMap::new(),
        }
    }

    /// Record a completed fetch and the redirects it followed
    pub fn record_fetch_success(&self, redirects: u32) {
        self.fetch_success.fetch_add(1, Ordering::Relaxed);
        self.redirects_followed
            .fetch_add(u64::from(redirects), Ordering::Relaxed);
    }

    /// Record a failed fetch, classifying security rejections
    pub fn record_fetch_failure(&self, error: &crate::Error) {
        self.fetch_failure.fetch_add(1, Ordering::Relaxed);
        match error {
            crate::Error::PolicyViolation { .. } => {
                self.policy_rejections.fetch_add(1, Ordering::Relaxed);
            }
            crate::Error::AddressBlocked { .. } => {
                self.address_rejections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Record a forwarded tool call
    pub fn record_call(&self, source: Option<&str>, tool: &str, ok: bool) {
        if ok {
            self.call_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.call_failure.fetch_add(1, Ordering::Relaxed);
        }
        let key = format!("{}:{tool}", source.unwrap_or("-"));
        if let Some(count) = self.tool_usage.get(&key) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.tool_usage.len() >= MAX_TRACKED_TOOLS {
            debug!(key = %key, "Tool usage table full, not tracking");
            return;
        }
        self.tool_usage
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call refused before it reached any upstream
    pub fn record_rejected_call(&self) {
        self.call_failure.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of distinct tools in the usage table
    pub fn tracked_tools(&self) -> usize {
        self.tool_usage.len()
    }

    /// Get call count for a specific tool
    pub fn tool_usage(&self, source: Option<&str>, tool: &str) -> u64 {
        let key = format!("{}:{tool}", source.unwrap_or("-"));
        self.tool_usage
            .get(&key)
            .map_or(0, |entry| entry.load(Ordering::Relaxed))
    }

    /// Get snapshot of current statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut tool_counts: Vec<(String, u64)> = self
            .tool_usage
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        tool_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        tool_counts.truncate(10);

        let top_tools = tool_counts
            .into_iter()
            .map(|(name, count)| {
                let (source, tool) = name.split_once(':').unwrap_or(("-", name.as_str()));
                TopTool {
                    source: source.to_string(),
                    tool: tool.to_string(),
                    count,
                }
            })
            .collect();

        StatsSnapshot {
            fetch_success: self.fetch_success.load(Ordering::Relaxed),
            fetch_failure: self.fetch_failure.load(Ordering::Relaxed),
            policy_rejections: self.policy_rejections.load(Ordering::Relaxed),
            address_rejections: self.address_rejections.load(Ordering::Relaxed),
            redirects_followed: self.redirects_followed.load(Ordering::Relaxed),
            call_success: self.call_success.load(Ordering::Relaxed),
            call_failure: self.call_failure.load(Ordering::Relaxed),
            top_tools,
        }
    }
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of outbound statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Fetches that produced a final response
    pub fetch_success: u64,
    /// Fetches that failed for any reason
    pub fetch_failure: u64,
    /// Failures caused by a URL policy
    pub policy_rejections: u64,
    /// Failures caused by the address guard
    pub address_rejections: u64,
    /// Redirect hops followed by successful fetches
    pub redirects_followed: u64,
    /// Forwarded calls that returned a result
    pub call_success: u64,
    /// Forwarded calls that ended in an error result
    pub call_failure: u64,
    /// Top 10 most-called tools
    pub top_tools: Vec<TopTool>,
}

/// Top tool usage entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopTool {
    /// Proxy source id, or the app host for request-time endpoints
    pub source: String,
    /// Tool name
    pub tool: String,
    /// Call count
    pub count: u64,
}
