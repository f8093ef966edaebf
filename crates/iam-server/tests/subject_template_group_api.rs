use std::sync::Arc;

use iam_core::{MembershipKey, TenantId};
use iam_db_memory::InMemoryStorage;
use iam_server::{AppConfig, ServerBuilder, StorageBackend};
use iam_storage::MembershipStorage;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

const COLLECTION: &str = "/api/v1/web/subject-template-groups";

struct TestServer {
    base: String,
    storage: Arc<InMemoryStorage>,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

async fn start_server(mut cfg: AppConfig) -> TestServer {
    cfg.storage.backend = StorageBackend::Memory;
    let storage = Arc::new(InMemoryStorage::new());
    let server = ServerBuilder::new()
        .with_config(cfg)
        .with_storage(storage.clone())
        .build()
        .await
        .expect("build server");
    let app = server.router();

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        base: format!("http://{addr}"),
        storage,
        shutdown: tx,
        handle,
    }
}

fn membership(id: &str, template_id: i64, group_id: i64, expired_at: i64) -> Value {
    json!({
        "type": "user",
        "id": id,
        "template_id": template_id,
        "group_id": group_id,
        "expired_at": expired_at,
    })
}

fn key(id: &str, template_id: i64, group_id: i64) -> MembershipKey {
    MembershipKey {
        subject_type: "user".into(),
        subject_id: id.into(),
        template_id,
        group_id,
    }
}

#[tokio::test]
async fn batch_endpoints_round_trip() {
    let server = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new("tenant-a");

    // POST creates the batch
    let resp = client
        .post(server.url(COLLECTION))
        .header("x-tenant-id", "tenant-a")
        .json(&json!([membership("alice", 1, 10, 100), membership("bob", 1, 10, 100)]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"code": 0, "message": "ok", "data": {}}));
    assert_eq!(server.storage.len().await, 2);

    // PUT moves the expiry
    let resp = client
        .put(server.url(&format!("{COLLECTION}/expired-at")))
        .header("x-tenant-id", "tenant-a")
        .json(&json!([membership("alice", 1, 10, 500)]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let row = server
        .storage
        .get(&tenant, &key("alice", 1, 10))
        .await
        .unwrap()
        .expect("alice still granted");
    assert_eq!(row.expired_at, 500);

    // DELETE removes one membership
    let resp = client
        .delete(server.url(COLLECTION))
        .header("x-tenant-id", "tenant-a")
        .json(&json!([membership("bob", 1, 10, 100)]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 0);
    assert!(
        server
            .storage
            .get(&tenant, &key("bob", 1, 10))
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(server.storage.len().await, 1);

    server.stop().await;
}

#[tokio::test]
async fn invalid_bodies_are_rejected() {
    let server = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();

    // Empty array
    let resp = client
        .post(server.url(COLLECTION))
        .json(&json!([]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 1901400);
    assert_eq!(body["data"], Value::Null);
    assert!(body["message"].as_str().unwrap().contains("at least 1 item"));

    // Malformed JSON
    let resp = client
        .post(server.url(COLLECTION))
        .header("content-type", "application/json")
        .body("[{\"type\": \"user\",")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 1901400);

    // Missing field
    let resp = client
        .delete(server.url(COLLECTION))
        .json(&json!([{"type": "user", "id": "alice", "template_id": 1, "group_id": 10}]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Invalid item
    let resp = client
        .put(server.url(&format!("{COLLECTION}/expired-at")))
        .json(&json!([membership("alice", 0, 10, 100)]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("template_id"));

    assert!(server.storage.is_empty().await);
    server.stop().await;
}

#[tokio::test]
async fn storage_failures_map_to_system_error() {
    let server = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();
    let batch = json!([membership("alice", 1, 10, 100)]);

    let resp = client
        .post(server.url(COLLECTION))
        .json(&batch)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Creating the same membership again violates the natural key
    let resp = client
        .post(server.url(COLLECTION))
        .json(&batch)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 1901500);
    assert_eq!(body["message"], "system error");
    assert_eq!(server.storage.len().await, 1);

    server.stop().await;
}

#[tokio::test]
async fn tenants_are_isolated() {
    let server = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();

    for tenant in ["tenant-a", "tenant-b"] {
        let resp = client
            .post(server.url(COLLECTION))
            .header("x-tenant-id", tenant)
            .json(&json!([membership("alice", 1, 10, 100)]))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "create for {tenant}");
    }

    let resp = client
        .delete(server.url(COLLECTION))
        .header("x-tenant-id", "tenant-a")
        .json(&json!([membership("alice", 1, 10, 100)]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let alice = key("alice", 1, 10);
    assert!(
        server
            .storage
            .get(&TenantId::new("tenant-a"), &alice)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        server
            .storage
            .get(&TenantId::new("tenant-b"), &alice)
            .await
            .unwrap()
            .is_some()
    );

    server.stop().await;
}

#[tokio::test]
async fn enforced_tenant_header_is_required() {
    let mut cfg = AppConfig::default();
    cfg.tenant.enforce = true;
    let server = start_server(cfg).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url(COLLECTION))
        .json(&json!([membership("alice", 1, 10, 100)]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 1901400);
    assert!(server.storage.is_empty().await);

    // Health endpoints are outside the tenant scope
    let resp = client.get(server.url("/healthz")).send().await.unwrap();
    assert!(resp.status().is_success());

    server.stop().await;
}

#[tokio::test]
async fn health_and_request_id() {
    let server = start_server(AppConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client.get(server.url("/healthz")).send().await.unwrap();
    assert!(resp.status().is_success());
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client
        .get(server.url("/readyz"))
        .header("x-request-id", "req-42")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(resp.headers()["x-request-id"], "req-42");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["cache"]["mode"], "local");

    server.stop().await;
}
