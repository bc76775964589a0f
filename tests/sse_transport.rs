//! Event-stream transport against a live listener.
//!
//! The router runs without an upstream, so accepted messages echo back;
//! enough to watch the full wire contract: endpoint event, 202 on POST,
//! reply as a `message` event, and the error envelopes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use mcpguard::config::SecurityConfig;
use mcpguard::router::Router;
use mcpguard::session::{AgentIdentity, SessionManager, SessionManagerConfig};
use mcpguard::transport::sse::SseServer;
use mcpguard::transport::Transport;

struct TestGateway {
    server: SseServer,
    base_url: String,
    sessions: Arc<SessionManager>,
}

async fn start_gateway(security: SecurityConfig) -> TestGateway {
    let sessions = SessionManager::new(SessionManagerConfig::default());
    let router = Arc::new(Router::new());
    let server = SseServer::new(
        "127.0.0.1:0".to_string(),
        security,
        AgentIdentity {
            id: "agent-a".to_string(),
            ..Default::default()
        },
        Arc::clone(&sessions),
        router,
    );
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    TestGateway {
        server,
        base_url: format!("http://{addr}"),
        sessions,
    }
}

/// Reads SSE frames off a byte stream until one complete event arrives.
struct EventReader<S> {
    stream: S,
    buffer: String,
}

impl<S> EventReader<S>
where
    S: futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: String::new(),
        }
    }

    async fn next_event(&mut self) -> Option<(String, String)> {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let frame: String = self.buffer.drain(..pos + 2).collect();
                let mut event = String::new();
                let mut data = String::new();
                for line in frame.lines() {
                    if let Some(rest) = line.strip_prefix("event:") {
                        event = rest.trim().to_string();
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        data.push_str(rest.trim());
                    }
                }
                if event.is_empty() && data.is_empty() {
                    continue;
                }
                return Some((event, data));
            }

            let chunk = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .ok()??
                .ok()?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
}

async fn open_stream(
    base_url: &str,
) -> (
    EventReader<impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin>,
    String,
) {
    let response = reqwest::Client::new()
        .get(base_url)
        .header("Accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut reader = EventReader::new(Box::pin(response.bytes_stream()));
    let (event, data) = reader.next_event().await.unwrap();
    assert_eq!(event, "endpoint");
    assert!(data.starts_with("/message?sessionId="));
    (reader, data)
}

#[tokio::test]
async fn full_request_cycle_over_the_stream() {
    let gw = start_gateway(SecurityConfig::default()).await;
    let (mut reader, endpoint) = open_stream(&gw.base_url).await;

    let body = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
    let response = reqwest::Client::new()
        .post(format!("{}{endpoint}", gw.base_url))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let (event, data) = reader.next_event().await.unwrap();
    assert_eq!(event, "message");
    // No upstream configured: the gateway echoes the request.
    let json: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(json["id"], 1);
    assert_eq!(json["method"], "ping");

    gw.server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn missing_session_id_is_rejected() {
    let gw = start_gateway(SecurityConfig::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/message", gw.base_url))
        .header("Content-Type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["jsonrpc"], "2.0");
    assert!(json["id"].is_null());
    assert_eq!(json["error"]["code"], -32600);
    assert_eq!(json["error"]["message"], "Missing sessionId parameter");

    gw.server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn unknown_session_is_rejected() {
    let gw = start_gateway(SecurityConfig::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/message?sessionId=sess_missing", gw.base_url))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["error"]["code"], -32600);

    gw.server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn invalid_json_body_is_rejected() {
    let gw = start_gateway(SecurityConfig::default()).await;
    let (_reader, endpoint) = open_stream(&gw.base_url).await;

    let response = reqwest::Client::new()
        .post(format!("{}{endpoint}", gw.base_url))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["error"]["code"], -32700);

    gw.server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn security_headers_present_on_responses() {
    let gw = start_gateway(SecurityConfig::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/message", gw.base_url))
        .body("{}")
        .send()
        .await
        .unwrap();
    let headers = response.headers();
    assert_eq!(headers.get("X-Content-Type-Options").unwrap(), "nosniff");
    assert_eq!(headers.get("X-Frame-Options").unwrap(), "DENY");
    assert_eq!(
        headers.get("Referrer-Policy").unwrap(),
        "strict-origin-when-cross-origin"
    );

    gw.server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn stream_carries_cache_and_cors_headers() {
    let gw = start_gateway(SecurityConfig {
        security_headers: true,
        cors_allowed_origins: vec!["https://app.example.com".to_string()],
    })
    .await;

    let response = reqwest::Client::new()
        .get(&gw.base_url)
        .header("Accept", "text/event-stream")
        .header("Origin", "https://app.example.com")
        .send()
        .await
        .unwrap();
    let headers = response.headers();
    assert_eq!(
        headers.get("Cache-Control").unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(
        headers.get("Access-Control-Allow-Origin").unwrap(),
        "https://app.example.com"
    );

    gw.server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn session_cap_rejects_new_streams() {
    let sessions = SessionManager::new(SessionManagerConfig {
        max_sessions: 1,
        ..Default::default()
    });
    let server = SseServer::new(
        "127.0.0.1:0".to_string(),
        SecurityConfig::default(),
        AgentIdentity::default(),
        Arc::clone(&sessions),
        Arc::new(Router::new()),
    );
    server.start().await.unwrap();
    let base_url = format!("http://{}", server.local_addr().unwrap());

    let (_reader, _endpoint) = open_stream(&base_url).await;

    let response = reqwest::Client::new()
        .get(&base_url)
        .header("Accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn start_twice_fails_and_stop_is_idempotent() {
    let gw = start_gateway(SecurityConfig::default()).await;
    assert!(gw.server.start().await.is_err());
    gw.server.stop(Duration::from_secs(2)).await.unwrap();
    gw.server.stop(Duration::from_secs(2)).await.unwrap();
    assert_eq!(gw.sessions.active_count(), 0);
}
