//! Safe request engine integration tests

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_hub_bridge::Error;
use mcp_hub_bridge::config::Config;
use mcp_hub_bridge::security::{SafeFetchProfile, UrlPolicy};
use mcp_hub_bridge::transport::SafeRequest;

fn loopback_profile(max_redirects: u32, timeout: Duration) -> SafeFetchProfile {
    SafeFetchProfile::new(
        "test",
        UrlPolicy::new(["http"]).allow_hosts(["127.0.0.1"]),
        timeout,
        max_redirects,
        false,
    )
}

fn redirect_to(location: &str) -> ResponseTemplate {
    ResponseTemplate::new(302).insert_header("location", location)
}

#[tokio::test]
async fn test_redirect_limit_stops_before_extra_request() {
    let server = MockServer::start().await;
    Mock::given(path("/loop"))
        .respond_with(redirect_to("/loop"))
        .mount(&server)
        .await;

    let fetcher = common::fetcher(&Config::default());
    let err = fetcher
        .fetch(
            &format!("{}/loop", server.uri()),
            &loopback_profile(2, Duration::from_secs(5)),
            SafeRequest::get(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RedirectLimitExceeded { max: 2, .. }));
    // The initial request plus two followed redirects.
    assert_eq!(common::requests(&server).await.len(), 3);
}

#[tokio::test]
async fn test_redirect_within_limit_reports_final_url() {
    let server = MockServer::start().await;
    Mock::given(path("/a"))
        .respond_with(redirect_to("/b"))
        .mount(&server)
        .await;
    Mock::given(path("/b"))
        .respond_with(ResponseTemplate::new(200).set_body_string("landed"))
        .mount(&server)
        .await;

    let fetcher = common::fetcher(&Config::default());
    let result = fetcher
        .fetch(
            &format!("{}/a", server.uri()),
            &loopback_profile(5, Duration::from_secs(5)),
            SafeRequest::get(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.redirects_followed, 1);
    assert_eq!(result.final_url.path(), "/b");
    assert_eq!(result.text().await.unwrap(), "landed");
    assert_eq!(fetcher.stats().snapshot().fetch_success, 1);
}

#[tokio::test]
async fn test_redirect_to_disallowed_host_is_not_followed() {
    let server = MockServer::start().await;
    Mock::given(path("/start"))
        .respond_with(redirect_to("http://example.com/steal"))
        .mount(&server)
        .await;

    let fetcher = common::fetcher(&Config::default());
    let err = fetcher
        .fetch(
            &format!("{}/start", server.uri()),
            &loopback_profile(5, Duration::from_secs(5)),
            SafeRequest::get(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PolicyViolation { .. }));
    assert!(err.is_security_rejection());
    assert_eq!(common::requests(&server).await.len(), 1);
}

#[tokio::test]
async fn test_see_other_after_post_becomes_bodyless_get() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(303).insert_header("location", "/result"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/result"))
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .mount(&server)
        .await;

    let fetcher = common::fetcher(&Config::default());
    let result = fetcher
        .fetch(
            &format!("{}/submit", server.uri()),
            &loopback_profile(5, Duration::from_secs(5)),
            SafeRequest::post_json(&json!({"q": 1})).unwrap(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.text().await.unwrap(), "done");

    let requests = common::requests(&server).await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].method.as_str(), "GET");
    assert!(requests[1].body.is_empty());
    assert!(requests[1].headers.get("content-type").is_none());
}

#[tokio::test]
async fn test_temporary_redirect_keeps_method_and_body() {
    let server = MockServer::start().await;
    Mock::given(path("/old"))
        .respond_with(ResponseTemplate::new(307).insert_header("location", "/new"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fetcher = common::fetcher(&Config::default());
    fetcher
        .fetch(
            &format!("{}/old", server.uri()),
            &loopback_profile(5, Duration::from_secs(5)),
            SafeRequest::post_json(&json!({"q": 1})).unwrap(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let requests = common::requests(&server).await;
    assert_eq!(requests[1].method.as_str(), "POST");
    assert_eq!(requests[1].body, br#"{"q":1}"#.to_vec());
}

#[tokio::test]
async fn test_cross_origin_redirect_strips_credentials() {
    let origin = MockServer::start().await;
    let other = MockServer::start().await;
    Mock::given(path("/start"))
        .respond_with(redirect_to(&format!("{}/landing", other.uri())))
        .mount(&origin)
        .await;
    Mock::given(path("/landing"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&other)
        .await;

    let fetcher = common::fetcher(&Config::default());
    let request = SafeRequest::get()
        .header("authorization", "Bearer secret")
        .header("x-hf-authorization", "Bearer other")
        .header("cookie", "session=1")
        .header("x-trace", "kept");
    fetcher
        .fetch(
            &format!("{}/start", origin.uri()),
            &loopback_profile(5, Duration::from_secs(5)),
            request,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let first = &common::requests(&origin).await[0];
    assert!(first.headers.get("authorization").is_some());

    let landed = &common::requests(&other).await[0];
    assert!(landed.headers.get("authorization").is_none());
    assert!(landed.headers.get("x-hf-authorization").is_none());
    assert!(landed.headers.get("cookie").is_none());
    assert_eq!(landed.headers.get("x-trace").unwrap(), "kept");
}

#[tokio::test]
async fn test_same_origin_redirect_keeps_credentials() {
    let server = MockServer::start().await;
    Mock::given(path("/a"))
        .respond_with(redirect_to("/b"))
        .mount(&server)
        .await;
    Mock::given(path("/b"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fetcher = common::fetcher(&Config::default());
    fetcher
        .fetch(
            &format!("{}/a", server.uri()),
            &loopback_profile(5, Duration::from_secs(5)),
            SafeRequest::get().header("authorization", "Bearer secret"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let requests = common::requests(&server).await;
    assert_eq!(requests[1].headers.get("authorization").unwrap(), "Bearer secret");
}

#[tokio::test]
async fn test_redirect_without_location_fails() {
    let server = MockServer::start().await;
    Mock::given(path("/nowhere"))
        .respond_with(ResponseTemplate::new(301))
        .mount(&server)
        .await;

    let fetcher = common::fetcher(&Config::default());
    let err = fetcher
        .fetch(
            &format!("{}/nowhere", server.uri()),
            &loopback_profile(5, Duration::from_secs(5)),
            SafeRequest::get(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RedirectLocationMissing(_)));
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let fetcher = common::fetcher(&Config::default());
    let err = fetcher
        .fetch(
            &format!("{}/slow", server.uri()),
            &loopback_profile(5, Duration::from_millis(200)),
            SafeRequest::get(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RequestTimeout(d) if d == Duration::from_millis(200)));
    assert_eq!(fetcher.stats().snapshot().fetch_failure, 1);
}

#[tokio::test]
async fn test_caller_cancellation_is_distinct_from_timeout() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let fetcher = common::fetcher(&Config::default());
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        }
    });

    let err = fetcher
        .fetch(
            &format!("{}/slow", server.uri()),
            &loopback_profile(5, Duration::from_secs(30)),
            SafeRequest::get(),
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RequestAborted));
}

#[tokio::test]
async fn test_external_only_profile_blocks_loopback() {
    let server = MockServer::start().await;
    Mock::given(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = Config::default();
    let profiles = common::profiles(&config);
    let fetcher = common::fetcher(&config);
    let err = fetcher
        .fetch(
            &format!("{}/", server.uri()),
            profiles.http_or_https(),
            SafeRequest::get(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AddressBlocked { .. }));
    assert!(common::requests(&server).await.is_empty());
    assert_eq!(fetcher.stats().snapshot().address_rejections, 1);
}

#[tokio::test]
async fn test_allowlisted_host_passes_external_only_profile() {
    let server = MockServer::start().await;
    Mock::given(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let config = common::loopback_config();
    let profiles = common::profiles(&config);
    let fetcher = common::fetcher(&config);
    let result = fetcher
        .fetch(
            &format!("{}/", server.uri()),
            profiles.http_or_https(),
            SafeRequest::get(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_body_over_limit_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(path("/big"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.fetch.max_body_bytes = 1024;
    let fetcher = common::fetcher(&config);
    let result = fetcher
        .fetch(
            &format!("{}/big", server.uri()),
            &loopback_profile(5, Duration::from_secs(5)),
            SafeRequest::get(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let err = result.text().await.unwrap_err();
    assert!(matches!(err, Error::UpstreamProtocol(ref m) if m.contains("1024")));
}

#[tokio::test]
async fn test_streamed_chunks_count_against_limit() {
    let server = MockServer::start().await;
    Mock::given(path("/big"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.fetch.max_body_bytes = 1024;
    let fetcher = common::fetcher(&config);
    let mut result = fetcher
        .fetch(
            &format!("{}/big", server.uri()),
            &loopback_profile(5, Duration::from_secs(5)),
            SafeRequest::get(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let err = loop {
        match result.chunk().await {
            Ok(Some(_)) => {}
            Ok(None) => panic!("body should exceed the limit"),
            Err(err) => break err,
        }
    };
    assert!(matches!(err, Error::UpstreamProtocol(_)));
}

#[tokio::test]
async fn test_event_stream_over_limit_is_rejected() {
    let server = MockServer::start().await;
    let body = format!("data: {}\n\n", "x".repeat(4096));
    Mock::given(path("/events"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.fetch.max_event_bytes = 512;
    let fetcher = common::fetcher(&config);
    let result = fetcher
        .fetch(
            &format!("{}/events", server.uri()),
            &loopback_profile(5, Duration::from_secs(5)),
            SafeRequest::get(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut events = result.events();
    let err = events.next().await.unwrap_err();
    assert!(matches!(err, Error::UpstreamProtocol(_)));
}
