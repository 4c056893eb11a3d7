//! Tool enable/disable propagation
//!
//! The configuration side flips a tool on or off; every subscribed session
//! handle receives the change over a broadcast channel.

use std::collections::HashSet;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// One enable/disable change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStateChange {
    /// Outward tool name
    pub tool: String,
    /// New state
    pub enabled: bool,
}

/// Tracks disabled tools and fans changes out to subscribers.
pub struct ToolStateBroadcaster {
    tx: broadcast::Sender<ToolStateChange>,
    disabled: RwLock<HashSet<String>>,
}

impl ToolStateBroadcaster {
    /// Create a broadcaster buffering up to `capacity` changes per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            disabled: RwLock::new(HashSet::new()),
        }
    }

    /// Receive future changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ToolStateChange> {
        self.tx.subscribe()
    }

    /// Enable or disable a tool. Returns how many subscribers were notified;
    /// an unchanged state notifies nobody.
    pub fn set_enabled(&self, tool: &str, enabled: bool) -> usize {
        let changed = {
            let mut disabled = self.disabled.write();
            if enabled {
                disabled.remove(tool)
            } else {
                disabled.insert(tool.to_string())
            }
        };
        if !changed {
            return 0;
        }

        info!(tool = %tool, enabled, "Tool state changed");
        let change = ToolStateChange {
            tool: tool.to_string(),
            enabled,
        };
        match self.tx.send(change) {
            Ok(n) => n,
            Err(_) => {
                debug!(tool = %tool, "No tool state subscribers");
                0
            }
        }
    }

    /// Whether `tool` is currently enabled.
    pub fn is_enabled(&self, tool: &str) -> bool {
        !self.disabled.read().contains(tool)
    }

    /// Currently disabled tools, sorted.
    pub fn disabled_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = self.disabled.read().iter().cloned().collect();
        tools.sort();
        tools
    }
}

impl Default for ToolStateBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}
