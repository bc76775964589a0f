//! Event-stream transport.
//!
//! `GET /` opens a stream: the server creates a session, emits one
//! `endpoint` event naming the message URL, then multiplexes per-session
//! outbound frames as `message` events with a `ping` keepalive every 30
//! seconds. `POST /message?sessionId=<id>` accepts JSON bodies up to 1 MiB,
//! dispatches them to the handler, and returns 202; the reply travels over
//! the stream.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, State};
use axum::http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, ORIGIN, USER_AGENT};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SecurityConfig;
use crate::error::GatewayError;
use crate::router::jsonrpc::{CODE_INVALID_REQUEST, CODE_PARSE_ERROR};
use crate::session::{AgentIdentity, SessionManager};
use crate::transport::{MessageHandler, Transport};

/// Maximum accepted message body.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Keepalive cadence on the event stream.
const PING_INTERVAL: Duration = Duration::from_secs(30);

struct AppState {
    sessions: Arc<SessionManager>,
    handler: Arc<dyn MessageHandler>,
    agent: AgentIdentity,
    security: SecurityConfig,
}

/// Event-stream transport server.
pub struct SseServer {
    listen_addr: String,
    state: Arc<AppState>,
    started: AtomicBool,
    shutdown: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl SseServer {
    pub fn new(
        listen_addr: String,
        security: SecurityConfig,
        agent: AgentIdentity,
        sessions: Arc<SessionManager>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            listen_addr,
            state: Arc::new(AppState {
                sessions,
                handler,
                agent,
                security,
            }),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            serve_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Bound address once started; useful when the port was 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr lock poisoned")
    }

    fn router(state: Arc<AppState>) -> AxumRouter {
        AxumRouter::new()
            .route("/", get(handle_stream))
            .route("/message", post(handle_message))
            // Above the protocol limit so the handler owns the 1 MiB
            // boundary and its error shape.
            .layer(DefaultBodyLimit::max(2 * MAX_MESSAGE_SIZE))
            .with_state(state)
    }
}

#[async_trait]
impl Transport for SseServer {
    async fn start(&self) -> Result<(), GatewayError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Transport("server already started".into()));
        }

        let listener = tokio::net::TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| {
                GatewayError::Transport(format!("failed to listen on {}: {e}", self.listen_addr))
            })?;
        let local = listener.local_addr().ok();
        *self.local_addr.lock().expect("addr lock poisoned") = local;

        info!(address = %self.listen_addr, transport = "sse", "event-stream server listening");

        let app = Self::router(Arc::clone(&self.state))
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "event-stream server error");
            }
        });
        *self.serve_task.lock().expect("task lock poisoned") = Some(handle);

        Ok(())
    }

    async fn stop(&self, deadline: Duration) -> Result<(), GatewayError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();
        let handle = self.serve_task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("event-stream server stop timed out");
            }
        }
        info!("event-stream server stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sse"
    }
}

/// GET `/`: open the event stream for a new session.
async fn handle_stream(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let session = match state.sessions.create() {
        Ok(session) => session,
        Err(err) => {
            warn!(error = %err, "failed to create session");
            let mut response =
                (StatusCode::SERVICE_UNAVAILABLE, "Failed to create session").into_response();
            apply_security_headers(response.headers_mut(), &state.security);
            return response;
        }
    };

    session.set_agent(state.agent.clone());
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    session.set_client_info(peer.to_string(), user_agent);

    info!(session_id = %session.id, remote_addr = %peer, "event-stream connection established");

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    let sessions = Arc::clone(&state.sessions);
    let pump_session = Arc::clone(&session);
    tokio::spawn(async move {
        let endpoint = format!("/message?sessionId={}", pump_session.id);
        if tx
            .send(Ok(Event::default().event("endpoint").data(endpoint)))
            .await
            .is_err()
        {
            sessions.delete(&pump_session.id);
            return;
        }

        let Some(mut outbound) = pump_session.take_outbound() else {
            // A second stream for the same session; refuse to double-pump.
            sessions.delete(&pump_session.id);
            return;
        };

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = pump_session.closed() => break,
                message = outbound.recv() => {
                    match message {
                        Some(bytes) => {
                            let data = String::from_utf8_lossy(&bytes).into_owned();
                            if tx.send(Ok(Event::default().event("message").data(data))).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping.tick() => {
                    if tx.send(Ok(Event::default().event("ping").data(""))).await.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(session_id = %pump_session.id, request_count = pump_session.request_count(), "event stream closed");
        sessions.delete(&pump_session.id);
    });

    let mut response = Sse::new(ReceiverStream::new(rx)).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response_headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    apply_security_headers(response_headers, &state.security);
    apply_cors_headers(response_headers, headers.get(ORIGIN), &state.security);
    response
}

/// POST `/message?sessionId=<id>`: dispatch one message; the reply is
/// delivered over the stream.
async fn handle_message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query.get("sessionId").filter(|id| !id.is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            CODE_INVALID_REQUEST,
            "Missing sessionId parameter",
            &state.security,
        );
    };

    let Some(session) = state.sessions.get(session_id) else {
        return error_response(
            StatusCode::NOT_FOUND,
            CODE_INVALID_REQUEST,
            "Session not found or expired",
            &state.security,
        );
    };

    if body.len() > MAX_MESSAGE_SIZE {
        return error_response(
            StatusCode::BAD_REQUEST,
            CODE_PARSE_ERROR,
            "Message too large",
            &state.security,
        );
    }

    if serde_json::from_slice::<serde::de::IgnoredAny>(&body).is_err() {
        return error_response(
            StatusCode::BAD_REQUEST,
            CODE_PARSE_ERROR,
            "Invalid JSON",
            &state.security,
        );
    }

    session.increment_request_count();
    debug!(
        session_id = %session.id,
        body_size = body.len(),
        request_count = session.request_count(),
        "received message"
    );

    if let Some(reply) = state.handler.handle(Arc::clone(&session), body).await {
        if !session.send_message(reply) {
            warn!(session_id = %session.id, "reply dropped: session closed or queue full");
        }
    }

    let mut response = StatusCode::ACCEPTED.into_response();
    apply_security_headers(response.headers_mut(), &state.security);
    response
}

fn error_response(
    status: StatusCode,
    code: i32,
    message: &str,
    security: &SecurityConfig,
) -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": code, "message": message},
    });
    let mut response = (status, body.to_string()).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    apply_security_headers(headers, security);
    response
}

fn apply_security_headers(headers: &mut HeaderMap, security: &SecurityConfig) {
    if !security.security_headers {
        return;
    }
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "Permissions-Policy",
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
}

/// Same-origin by default: no CORS header unless an allow-list is
/// configured. `*` allows any origin; otherwise the request origin is
/// echoed only on an exact case-insensitive match.
fn apply_cors_headers(
    headers: &mut HeaderMap,
    origin: Option<&HeaderValue>,
    security: &SecurityConfig,
) {
    if security.cors_allowed_origins.is_empty() {
        return;
    }

    if security.cors_allowed_origins.iter().any(|o| o == "*") {
        headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
        return;
    }

    let Some(origin) = origin.and_then(|v| v.to_str().ok()) else {
        return;
    };

    if security
        .cors_allowed_origins
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(origin))
    {
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert("Access-Control-Allow-Origin", value);
            headers.insert("Vary", HeaderValue::from_static("Origin"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn security() -> SecurityConfig {
        SecurityConfig {
            security_headers: true,
            cors_allowed_origins: Vec::new(),
        }
    }

    #[test]
    fn security_headers_applied() {
        let mut headers = HeaderMap::new();
        apply_security_headers(&mut headers, &security());
        assert_eq!(headers.get("X-Content-Type-Options").unwrap(), "nosniff");
        assert_eq!(headers.get("X-Frame-Options").unwrap(), "DENY");
        assert_eq!(
            headers.get("Referrer-Policy").unwrap(),
            "strict-origin-when-cross-origin"
        );
        assert!(headers.contains_key("Permissions-Policy"));
    }

    #[test]
    fn security_headers_can_be_disabled() {
        let mut headers = HeaderMap::new();
        apply_security_headers(
            &mut headers,
            &SecurityConfig {
                security_headers: false,
                cors_allowed_origins: Vec::new(),
            },
        );
        assert!(headers.is_empty());
    }

    #[test]
    fn cors_default_is_same_origin() {
        let mut headers = HeaderMap::new();
        let origin = HeaderValue::from_static("https://evil.example.com");
        apply_cors_headers(&mut headers, Some(&origin), &security());
        assert!(!headers.contains_key("Access-Control-Allow-Origin"));
    }

    #[test]
    fn cors_wildcard_allows_any() {
        let mut headers = HeaderMap::new();
        let cfg = SecurityConfig {
            security_headers: true,
            cors_allowed_origins: vec!["*".to_string()],
        };
        apply_cors_headers(&mut headers, None, &cfg);
        assert_eq!(headers.get("Access-Control-Allow-Origin").unwrap(), "*");
    }

    #[test]
    fn cors_allowlist_echoes_matching_origin() {
        let mut headers = HeaderMap::new();
        let cfg = SecurityConfig {
            security_headers: true,
            cors_allowed_origins: vec!["https://app.example.com".to_string()],
        };

        let origin = HeaderValue::from_static("https://app.example.com");
        apply_cors_headers(&mut headers, Some(&origin), &cfg);
        assert_eq!(
            headers.get("Access-Control-Allow-Origin").unwrap(),
            "https://app.example.com"
        );
        assert_eq!(headers.get("Vary").unwrap(), "Origin");

        let mut headers = HeaderMap::new();
        let other = HeaderValue::from_static("https://other.example.com");
        apply_cors_headers(&mut headers, Some(&other), &cfg);
        assert!(!headers.contains_key("Access-Control-Allow-Origin"));
    }
}
