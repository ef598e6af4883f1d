use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use switchboard_bridge::{app, BridgeState};
use switchboard_core::{
    Coordinator, CoordinatorConfig, DeliveryTransport, MessageEnvelope, TransportError,
};

/// Accepts every delivery.
struct AcceptAll;

#[async_trait]
impl DeliveryTransport for AcceptAll {
    async fn deliver(
        &self,
        _endpoint: &str,
        _envelope: &MessageEnvelope,
        _attempt: u32,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Bridge served on an ephemeral localhost port.
struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    coordinator: Coordinator,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_test_server() -> TestServer {
    let config = CoordinatorConfig {
        transport_timeout: Duration::from_millis(500),
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(config, Arc::new(AcceptAll)).unwrap();
    let router = app(BridgeState::from_coordinator(&coordinator));

    let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server exited cleanly");
    });

    TestServer {
        addr,
        client: reqwest::Client::new(),
        coordinator,
        handle,
    }
}

async fn call(
    server: &TestServer,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut req = server
        .client
        .request(method, format!("http://{}{}", server.addr, path));
    if let Some(v) = body {
        req = req.json(&v);
    }
    let resp = req.send().await.expect("request reaches bridge");
    let status = resp.status();
    let bytes = resp.bytes().await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn agent(id: &str, caps: &[&str]) -> Value {
    json!({
        "id": id,
        "name": format!("{id} agent"),
        "capabilities": caps,
        "endpoints": [format!("http://{id}.test/inbox")],
    })
}

#[tokio::test]
async fn test_health_reports_ok() {
    let server = start_test_server().await;
    let (status, body) = call(&server, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["agents"], 0);
}

#[tokio::test]
async fn test_register_heartbeat_deregister() {
    let server = start_test_server().await;

    let (status, body) = call(&server, Method::POST, "/register", Some(agent("a1", &["billing"]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "a1");
    assert_eq!(body["health"], "healthy");

    let (status, body) = call(&server, Method::POST, "/heartbeat/a1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["heartbeat_deadline"].is_string());

    let (status, _) = call(&server, Method::DELETE, "/deregister/a1", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&server, Method::POST, "/heartbeat/a1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_register_rejects_bad_input() {
    let server = start_test_server().await;

    let (status, body) = call(&server, Method::POST, "/register", Some(agent("a1", &[]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let (status, body) = call(&server, Method::POST, "/register", Some(json!({"id": 7}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn test_discover_filters_by_tags() {
    let server = start_test_server().await;
    call(&server, Method::POST, "/register", Some(agent("a1", &["billing"]))).await;
    call(&server, Method::POST, "/register", Some(agent("a2", &["billing", "refunds"]))).await;

    let (status, body) = call(&server, Method::GET, "/discover?capabilities=billing,refunds", None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["a2"]);

    let (status, body) = call(&server, Method::GET, "/discover?capabilities=billing&limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = call(&server, Method::GET, "/discover?capabilities=billing&minHealth=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&server, Method::GET, "/discover", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_send_then_query_status() {
    let server = start_test_server().await;
    call(&server, Method::POST, "/register", Some(agent("a1", &["billing"]))).await;

    let envelope = json!({
        "message_id": "m-1",
        "from": "client",
        "to": {"capability": {"capabilities": ["billing"]}},
        "priority": "critical",
        "ttl": 5.0,
        "message_type": "request",
        "payload": {"invoice": 17},
    });
    let (status, body) = call(&server, Method::POST, "/send", Some(envelope)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["message_id"], "m-1");
    assert_eq!(body["recipients"], json!(["a1"]));

    let router = server.coordinator.router.clone();
    let mut delivered = false;
    for _ in 0..50 {
        if router
            .status("m-1")
            .map(|r| r[0].status.is_terminal())
            .unwrap_or(false)
        {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered);

    let (status, body) = call(&server, Method::GET, "/messages/m-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["status"], "delivered");
    assert_eq!(body[0]["recipient"], "a1");

    let (status, _) = call(&server, Method::GET, "/messages/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&server, Method::DELETE, "/messages/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_send_failures_carry_status_and_kind() {
    let server = start_test_server().await;

    let unknown = json!({
        "from": "client",
        "to": {"agent": "ghost"},
        "ttl": 5.0,
        "message_type": "event",
    });
    let (status, body) = call(&server, Method::POST, "/send", Some(unknown)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["accepted"], false);
    assert_eq!(body["kind"], "not_found");

    call(&server, Method::POST, "/register", Some(agent("a1", &["billing"]))).await;
    let stale = json!({
        "from": "client",
        "to": {"agent": "a1"},
        "ttl": 1.0,
        "created_at": (chrono::Utc::now() - chrono::Duration::seconds(5)).to_rfc3339(),
        "message_type": "event",
    });
    let (status, body) = call(&server, Method::POST, "/send", Some(stale)).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["kind"], "expired");

    let no_ttl = json!({
        "from": "client",
        "to": {"agent": "a1"},
        "ttl": 0,
        "message_type": "event",
    });
    let (status, body) = call(&server, Method::POST, "/send", Some(no_ttl)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn test_compliance_endpoints() {
    let server = start_test_server().await;

    let (status, body) = call(&server, Method::GET, "/compliance", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agents"], 0);

    let (status, body) = call(&server, Method::GET, "/compliance/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}
