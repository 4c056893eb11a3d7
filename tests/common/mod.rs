//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use mcp_hub_bridge::config::Config;
use mcp_hub_bridge::security::{HostAllowlist, ProfileSet, RebindingGuard};
use mcp_hub_bridge::transport::{FetcherOptions, SafeFetcher};

/// Config that lets external-only profiles reach the loopback mock servers.
pub fn loopback_config() -> Config {
    let mut config = Config::default();
    config.security.allowed_internal_hosts = vec!["127.0.0.1".to_string()];
    config
}

pub fn fetcher(config: &Config) -> Arc<SafeFetcher> {
    let guard = RebindingGuard::system(HostAllowlist::new(&config.security.allowed_internal_hosts));
    Arc::new(SafeFetcher::new(guard, FetcherOptions::from(config), Arc::default()).unwrap())
}

pub fn profiles(config: &Config) -> Arc<ProfileSet> {
    Arc::new(ProfileSet::from_config(config))
}

pub fn rpc_result(id: u64, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

/// Mount `initialize`, `notifications/initialized` and `DELETE` on `/mcp`.
pub async fn mount_session(server: &MockServer, session_id: &str) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", session_id)
                .set_body_json(rpc_result(
                    1,
                    json!({
                        "protocolVersion": "2025-06-18",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "mock", "version": "1.0"}
                    }),
                )),
        )
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// Mount a `tools/list` answer on `/mcp`.
pub async fn mount_tools(server: &MockServer, tools: Value) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(2, json!({"tools": tools}))))
        .mount(server)
        .await;
}

pub async fn requests(server: &MockServer) -> Vec<Request> {
    server.received_requests().await.unwrap_or_default()
}

/// Number of JSON-RPC requests with `rpc_method` the server has seen.
pub async fn count_rpc(server: &MockServer, rpc_method: &str) -> usize {
    requests(server)
        .await
        .iter()
        .filter(|r| {
            serde_json::from_slice::<Value>(&r.body)
                .ok()
                .is_some_and(|b| b["method"] == rpc_method)
        })
        .count()
}

pub async fn count_method(server: &MockServer, http_method: &str) -> usize {
    requests(server)
        .await
        .iter()
        .filter(|r| r.method.as_str() == http_method)
        .count()
}
