//! Outbound HTTP: the redirect-validating fetcher and MCP sessions built on it

mod safe_fetch;
mod session;
mod sse;

pub use self::safe_fetch::{FetcherOptions, SafeFetchResult, SafeFetcher, SafeRequest};
pub use self::session::{
    NotificationSink, ResponseMode, SessionOptions, UpstreamSession, with_session,
};
pub use self::sse::{SseDecoder, SseEvent, SseEvents};
