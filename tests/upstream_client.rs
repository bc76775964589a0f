//! Upstream client against a mock MCP backend.
//!
//! The backend speaks the same wire shape the gateway serves: an event
//! stream announcing its message endpoint, then `message` events carrying
//! replies correlated by id.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use mcpguard::config::{Backoff, CircuitBreakerConfig, PoolConfig, RetryConfig, UpstreamConfig};
use mcpguard::upstream::{UpstreamClient, UpstreamError};

#[derive(Clone)]
struct BackendState {
    /// Frames fanned out to every connected stream.
    frames: broadcast::Sender<String>,
}

/// Mock backend: GET `/` streams `endpoint` then broadcast frames;
/// POST `/rpc` echoes a result for the posted id unless the tool is
/// `hang`, in which case no reply is ever emitted.
async fn spawn_backend() -> (SocketAddr, BackendState) {
    let (frames, _) = broadcast::channel(64);
    let state = BackendState { frames };

    let app = AxumRouter::new()
        .route("/", get(stream_handler))
        .route("/rpc", post(rpc_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

async fn stream_handler(State(state): State<BackendState>) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    let mut frames = state.frames.subscribe();
    tokio::spawn(async move {
        if tx
            .send(Ok(Event::default().event("endpoint").data("/rpc")))
            .await
            .is_err()
        {
            return;
        }
        while let Ok(frame) = frames.recv().await {
            if tx
                .send(Ok(Event::default().event("message").data(frame)))
                .await
                .is_err()
            {
                return;
            }
        }
    });
    Sse::new(ReceiverStream::new(rx))
}

async fn rpc_handler(State(state): State<BackendState>, body: Bytes) -> StatusCode {
    let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let tool = request["params"]["name"].as_str().unwrap_or_default();
    if tool != "hang" {
        let reply = serde_json::json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {"echo": tool},
        });
        let _ = state.frames.send(reply.to_string());
    }
    StatusCode::ACCEPTED
}

fn client_config(addr: SocketAddr, timeout: Duration) -> UpstreamConfig {
    UpstreamConfig {
        url: format!("http://{addr}"),
        timeout,
        pool: PoolConfig::default(),
        retry: RetryConfig {
            enabled: false,
            max_attempts: 0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff: Backoff::Exponential,
        },
        circuit_breaker: CircuitBreakerConfig {
            enabled: false,
            threshold: 5,
            timeout: Duration::from_secs(30),
        },
    }
}

async fn connected_client(addr: SocketAddr, timeout: Duration) -> Arc<UpstreamClient> {
    let client = UpstreamClient::new(client_config(addr, timeout)).unwrap();
    client.connect().await.unwrap();

    // Connected only once the endpoint event lands.
    for _ in 0..200 {
        if client.is_connected() {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("client never became connected");
}

fn request(id: i64, tool: &str) -> Vec<u8> {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": tool},
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn send_correlates_reply_by_id() {
    let (addr, _state) = spawn_backend().await;
    let client = connected_client(addr, Duration::from_secs(5)).await;

    assert_eq!(
        client.message_url().unwrap(),
        format!("http://{addr}/rpc")
    );

    let reply = client.send(&request(1, "read_file")).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(json["id"], 1);
    assert_eq!(json["result"]["echo"], "read_file");

    client.disconnect();
}

#[tokio::test]
async fn concurrent_sends_each_get_their_own_reply() {
    let (addr, _state) = spawn_backend().await;
    let client = connected_client(addr, Duration::from_secs(5)).await;

    let mut handles = Vec::new();
    for id in 1..=20i64 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            let reply = client.send(&request(id, "echo_tool")).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&reply).unwrap();
            assert_eq!(json["id"], id);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    client.disconnect();
}

#[tokio::test]
async fn send_times_out_when_backend_never_replies() {
    let (addr, _state) = spawn_backend().await;
    let client = connected_client(addr, Duration::from_millis(200)).await;

    let err = client.send(&request(7, "hang")).await.unwrap_err();
    assert_eq!(err, UpstreamError::Timeout);

    client.disconnect();
}

#[tokio::test]
async fn duplicate_in_flight_id_is_rejected() {
    let (addr, _state) = spawn_backend().await;
    let client = connected_client(addr, Duration::from_secs(2)).await;

    let first = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send(&request(9, "hang")).await })
    };
    // Give the first send time to register its slot.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client.send(&request(9, "other")).await.unwrap_err();
    assert_eq!(err, UpstreamError::DuplicateRequestId);

    client.disconnect();
    let first = first.await.unwrap();
    assert!(first.is_err());
}

#[tokio::test]
async fn send_before_connect_fails() {
    let (addr, _state) = spawn_backend().await;
    let client = UpstreamClient::new(client_config(addr, Duration::from_secs(1))).unwrap();
    assert_eq!(
        client.send(&request(1, "x")).await.unwrap_err(),
        UpstreamError::NotConnected
    );
}

#[tokio::test]
async fn disconnect_fails_pending_sends() {
    let (addr, _state) = spawn_backend().await;
    let client = connected_client(addr, Duration::from_secs(10)).await;

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send(&request(3, "hang")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.disconnect();
    let result = pending.await.unwrap();
    assert_eq!(result.unwrap_err(), UpstreamError::Disconnected);
}

#[tokio::test]
async fn circuit_breaker_opens_after_consecutive_failures() {
    let (addr, _state) = spawn_backend().await;
    let mut cfg = client_config(addr, Duration::from_millis(100));
    cfg.circuit_breaker = CircuitBreakerConfig {
        enabled: true,
        threshold: 2,
        timeout: Duration::from_secs(60),
    };
    let client = UpstreamClient::new(cfg).unwrap();
    client.connect().await.unwrap();
    for _ in 0..200 {
        if client.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Two timeouts trip the breaker.
    assert_eq!(
        client.send(&request(1, "hang")).await.unwrap_err(),
        UpstreamError::Timeout
    );
    assert_eq!(
        client.send(&request(2, "hang")).await.unwrap_err(),
        UpstreamError::Timeout
    );

    // Fast-fail while open, even for a request the backend would answer.
    assert_eq!(
        client.send(&request(3, "ok")).await.unwrap_err(),
        UpstreamError::CircuitOpen
    );

    client.disconnect();
}
