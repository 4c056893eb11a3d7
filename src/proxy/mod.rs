//! Operator-configured proxy tool sources and their discovered tools

pub mod registry;
pub mod source;

pub use registry::{ProxyToolDefinition, ProxyToolRegistry, RegistryOptions, SourceList};
pub use source::{ProxySource, load_source_list, parse_source_list};
