use std::collections::HashMap;
use std::sync::Arc;

use iam_server::config::ResourceProviderConfig;
use iam_server::resource_provider::{RemoteResourceSource, ResourceProviderClient, UpstreamError};
use iam_server::{RemoteResourceCache, SharedCache};
use serde_json::json;
use wiremock::matchers::{basic_auth, body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RESOURCE_PATH: &str = "/api/v1/resources";

fn client_for(server: &MockServer, token: Option<&str>) -> ResourceProviderClient {
    let mut providers = HashMap::new();
    providers.insert(
        "bk_cmdb".to_string(),
        ResourceProviderConfig {
            base_url: format!("{}/", server.uri()),
            path: RESOURCE_PATH.to_string(),
            token: token.map(str::to_string),
            timeout_ms: 2000,
        },
    );
    ResourceProviderClient::new(providers, "x-tenant-id")
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test]
async fn fetch_sends_instance_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(RESOURCE_PATH))
        .and(header("x-tenant-id", "tenant-a"))
        .and(basic_auth("bk_iam", "t0ken"))
        .and(body_json(json!({
            "type": "host",
            "method": "fetch_instance_info",
            "filter": {"ids": ["1", "2"], "attrs": ["id", "name"]}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "message": "ok",
            "data": [
                {"id": "1", "name": "host-1"},
                {"id": "2", "name": "host-2"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, Some("t0ken"));
    let list = client
        .fetch(
            "tenant-a",
            "bk_cmdb",
            "host",
            &strings(&["1", "2"]),
            &strings(&["id", "name"]),
        )
        .await
        .expect("fetch should succeed");

    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["name"], json!("host-1"));
    assert_eq!(list[1]["id"], json!("2"));
}

#[tokio::test]
async fn provider_error_code_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1902404,
            "message": "resource type not found",
            "data": null
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let err = client
        .fetch("", "bk_cmdb", "module", &strings(&["1"]), &strings(&["id"]))
        .await
        .unwrap_err();

    match err {
        UpstreamError::Provider { code, message, .. } => {
            assert_eq!(code, 1902404);
            assert_eq!(message, "resource type not found");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn http_failure_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let err = client
        .fetch("", "bk_cmdb", "host", &strings(&["1"]), &strings(&["id"]))
        .await
        .unwrap_err();

    assert!(matches!(err, UpstreamError::Status { status: 500, .. }));
}

#[tokio::test]
async fn undecodable_body_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let client = client_for(&server, None);
    let err = client
        .fetch("", "bk_cmdb", "host", &strings(&["1"]), &strings(&["id"]))
        .await
        .unwrap_err();

    assert!(matches!(err, UpstreamError::Decode { .. }));
}

#[tokio::test]
async fn cache_in_front_of_provider_calls_it_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(RESOURCE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "message": "ok",
            "data": [{"id": "1", "name": "host-1"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cache = RemoteResourceCache::new(
        SharedCache::new_local(),
        Arc::new(client_for(&server, None)),
    );
    for _ in 0..3 {
        let list = cache
            .list_remote_resources("", "bk_cmdb", "host", &strings(&["1"]), &strings(&["id", "name"]))
            .await
            .expect("lookup should succeed");
        assert_eq!(list[0]["name"], json!("host-1"));
    }
}
