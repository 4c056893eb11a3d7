//! Composition root and tool-state propagation

mod server;
mod tool_state;

pub use server::Gateway;
pub use tool_state::{ToolStateBroadcaster, ToolStateChange};
