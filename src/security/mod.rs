//! Outbound security boundary.
//!
//! Address classification, DNS-rebinding checks, declarative URL policies and
//! the named profiles every outbound call site selects from.

pub mod address;
pub mod profiles;
pub mod rebinding;
pub mod url_policy;

pub use address::{is_reserved_ip, is_reserved_or_internal, parse_ip_literal};
pub use profiles::{PROFILE_NAMES, ProfileSet, SafeFetchProfile};
pub use rebinding::{GuardVerdict, HostAllowlist, RebindingGuard, Resolver, SystemResolver};
pub use url_policy::{CustomValidator, QueryRule, UrlPolicy};
