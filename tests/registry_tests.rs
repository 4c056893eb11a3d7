//! Proxy tool registry integration tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_hub_bridge::proxy::{ProxySource, ProxyToolRegistry, RegistryOptions, SourceList};
use mcp_hub_bridge::transport::ResponseMode;

fn source(id: &str, server: &MockServer) -> ProxySource {
    ProxySource {
        id: id.to_string(),
        url: Url::parse(&format!("{}/mcp", server.uri())).unwrap(),
        response_mode: ResponseMode::Json,
    }
}

fn registry(sources: Vec<ProxySource>) -> ProxyToolRegistry {
    let config = common::loopback_config();
    ProxyToolRegistry::new(
        SourceList::Inline(sources),
        common::fetcher(&config),
        common::profiles(&config),
        RegistryOptions {
            discovery_timeout: Duration::from_secs(2),
            ..RegistryOptions::default()
        },
    )
}

async fn search_server() -> MockServer {
    let server = MockServer::start().await;
    common::mount_session(&server, "sess-search").await;
    common::mount_tools(
        &server,
        json!([{
            "name": "search",
            "description": "Search the web",
            "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
        }]),
    )
    .await;
    server
}

#[tokio::test]
async fn test_single_source_keeps_upstream_names() {
    let server = search_server().await;
    let registry = registry(vec![source("web", &server)]);

    let tools = registry.load().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "search");
    assert_eq!(tools[0].upstream_name, "search");
    assert_eq!(tools[0].source_id, "web");
    assert_eq!(tools[0].description.as_deref(), Some("Search the web"));

    // Discovery closes its session.
    assert_eq!(common::count_method(&server, "DELETE").await, 1);
}

#[tokio::test]
async fn test_concurrent_loads_share_one_discovery() {
    let server = search_server().await;
    let registry = Arc::new(registry(vec![source("web", &server)]));

    let loads = (0..8).map(|_| {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.load().await.len() })
    });
    for handle in futures::future::join_all(loads).await {
        assert_eq!(handle.unwrap(), 1);
    }

    assert_eq!(common::count_rpc(&server, "tools/list").await, 1);
    assert!(registry.is_loaded());
}

#[tokio::test]
async fn test_failing_source_does_not_affect_others() {
    let good = search_server().await;
    let bad = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&bad)
        .await;

    let registry = registry(vec![source("web", &good), source("broken", &bad)]);
    let tools = registry.load().await;

    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["web_search"]);
    assert_eq!(tools[0].upstream_name, "search");
}

#[tokio::test]
async fn test_source_with_no_tools_contributes_nothing() {
    let good = search_server().await;
    let empty = MockServer::start().await;
    common::mount_session(&empty, "sess-empty").await;
    common::mount_tools(&empty, json!([])).await;

    let registry = registry(vec![source("web", &good), source("empty", &empty)]);
    let tools = registry.load().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].source_id, "web");
}

#[tokio::test]
async fn test_slow_source_times_out_and_is_closed() {
    let good = search_server().await;
    let docs = search_server().await;
    let slow = MockServer::start().await;
    common::mount_session(&slow, "sess-slow").await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(wiremock::matchers::body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&slow)
        .await;

    let config = common::loopback_config();
    let registry = ProxyToolRegistry::new(
        SourceList::Inline(vec![
            source("web", &good),
            source("slow", &slow),
            source("docs", &docs),
        ]),
        common::fetcher(&config),
        common::profiles(&config),
        RegistryOptions {
            discovery_timeout: Duration::from_millis(500),
            ..RegistryOptions::default()
        },
    );

    let started = std::time::Instant::now();
    let tools = registry.load().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    let mut names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["docs_search", "web_search"]);
    assert_eq!(common::count_method(&slow, "DELETE").await, 1);
}

#[tokio::test]
async fn test_invalid_input_schemas_are_dropped() {
    let server = MockServer::start().await;
    common::mount_session(&server, "sess-1").await;
    common::mount_tools(
        &server,
        json!([
            {"name": "good", "inputSchema": {"type": "object"}},
            {"name": "bad_type", "inputSchema": {"type": "string"}},
            {"name": "bad_props", "inputSchema": {"type": "object", "properties": [1, 2]}}
        ]),
    )
    .await;

    let registry = registry(vec![source("only", &server)]);
    let tools = registry.load().await;
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["good"]);
}

#[tokio::test]
async fn test_reset_triggers_rediscovery() {
    let server = search_server().await;
    let registry = registry(vec![source("web", &server)]);

    assert!(registry.find("search").await.is_some());
    assert!(registry.find("search").await.is_some());
    assert_eq!(common::count_rpc(&server, "tools/list").await, 1);

    registry.reset();
    assert!(!registry.is_loaded());
    assert!(registry.find("search").await.is_some());
    assert_eq!(common::count_rpc(&server, "tools/list").await, 2);
}

#[tokio::test]
async fn test_no_sources_yields_empty_catalog() {
    let config = common::loopback_config();
    let registry = ProxyToolRegistry::new(
        SourceList::None,
        common::fetcher(&config),
        common::profiles(&config),
        RegistryOptions::default(),
    );
    assert!(registry.load().await.is_empty());
    assert!(registry.find("anything").await.is_none());
}

#[tokio::test]
async fn test_source_list_loaded_from_file() {
    let server = search_server().await;
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("sources.csv");
    std::fs::write(
        &list,
        format!("id,url,mode\nweb,{}/mcp,json\n", server.uri()),
    )
    .unwrap();

    let config = common::loopback_config();
    let registry = ProxyToolRegistry::new(
        SourceList::Location(list.display().to_string()),
        common::fetcher(&config),
        common::profiles(&config),
        RegistryOptions::default(),
    );

    let sources = registry.sources().await;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].id, "web");
    assert_eq!(registry.load().await[0].name, "search");
}
