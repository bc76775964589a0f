//! Upstream MCP client.
//!
//! Holds one long-lived event stream from the backend plus a POST path for
//! requests. The backend announces its message endpoint in the first
//! `endpoint` event; only after that does the client count as connected.
//! Replies arrive asynchronously on the stream and are correlated to
//! waiting senders by JSON-RPC `id` through a table of one-shot slots.
//!
//! On stream loss every pending slot is failed immediately and, when retry
//! is configured, reconnection proceeds with capped exponential backoff and
//! jitter. A consecutive-failure breaker fails sends fast while open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Backoff, UpstreamConfig};

/// Upstream failures. Display strings are what clients may see inside
/// `-32004` replies, so they carry no URLs or backend detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("not connected to upstream")]
    NotConnected,
    #[error("timeout waiting for upstream response")]
    Timeout,
    #[error("upstream returned status {status}")]
    Status { status: u16 },
    #[error("upstream request failed")]
    Request,
    #[error("upstream disconnected")]
    Disconnected,
    #[error("duplicate in-flight request id")]
    DuplicateRequestId,
    #[error("upstream temporarily unavailable")]
    CircuitOpen,
}

type ResponseSlot = oneshot::Sender<Result<Vec<u8>, UpstreamError>>;

#[derive(Default)]
struct ConnState {
    connected: bool,
    message_url: Option<String>,
}

#[derive(Default)]
struct Breaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental server-sent-event frame parser. Fed raw chunks, yields
/// complete events on blank-line boundaries.
#[derive(Default)]
pub(crate) struct EventStreamParser {
    buf: Vec<u8>,
    event: String,
    data: String,
}

impl EventStreamParser {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.event.is_empty() || !self.data.is_empty() {
                    events.push(SseEvent {
                        event: std::mem::take(&mut self.event),
                        data: std::mem::take(&mut self.data),
                    });
                }
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.event = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(rest.trim());
            }
            // Comment lines and unknown fields are ignored.
        }

        events
    }
}

/// Client for the upstream MCP server.
pub struct UpstreamClient {
    cfg: UpstreamConfig,
    http: reqwest::Client,
    state: RwLock<ConnState>,
    pending: Mutex<HashMap<String, ResponseSlot>>,
    breaker: Mutex<Breaker>,
    shutdown: CancellationToken,
}

impl UpstreamClient {
    pub fn new(cfg: UpstreamConfig) -> Result<Arc<Self>, UpstreamError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(cfg.pool.max_idle)
            .pool_idle_timeout(cfg.pool.idle_timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                error!(error = %e, "failed to build upstream HTTP client");
                UpstreamError::Request
            })?;

        Ok(Arc::new(Self {
            cfg,
            http,
            state: RwLock::new(ConnState::default()),
            pending: Mutex::new(HashMap::new()),
            breaker: Mutex::new(Breaker::default()),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Opens the event stream. Returns once the HTTP stream is established;
    /// the client becomes connected when the `endpoint` event arrives.
    ///
    /// Boxed to break the `connect` -> `read_events` -> `handle_disconnect`
    /// -> `reconnect_with_backoff` -> `connect` async recursion cycle, which
    /// otherwise defeats the compiler's `Send` inference on the opaque
    /// future type.
    pub fn connect<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), UpstreamError>> + Send + 'a>>
    {
        Box::pin(self.connect_inner())
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<(), UpstreamError> {
        let response = self
            .http
            .get(&self.cfg.url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to connect to upstream");
                UpstreamError::Request
            })?;

        if response.status() != StatusCode::OK {
            return Err(UpstreamError::Status {
                status: response.status().as_u16(),
            });
        }

        info!(url = %self.cfg.url, "connected to upstream event stream");

        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.read_events(response).await;
        });

        Ok(())
    }

    /// Tears down the connection and fails every pending request.
    pub fn disconnect(&self) {
        self.shutdown.cancel();
        {
            let mut state = self.state.write().expect("state lock poisoned");
            state.connected = false;
        }
        self.fail_pending(UpstreamError::Disconnected);
        info!("disconnected from upstream");
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().expect("state lock poisoned").connected
    }

    pub fn message_url(&self) -> Option<String> {
        self.state
            .read()
            .expect("state lock poisoned")
            .message_url
            .clone()
    }

    /// Sends a request and awaits the correlated reply.
    ///
    /// The response slot is registered before the POST and removed on every
    /// exit path, including caller cancellation, which drops the guard.
    pub async fn send(&self, message: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        self.check_breaker()?;

        let url = {
            let state = self.state.read().expect("state lock poisoned");
            if !state.connected {
                return Err(UpstreamError::NotConnected);
            }
            state.message_url.clone().ok_or(UpstreamError::NotConnected)?
        };

        let key = request_id_key(message).ok_or(UpstreamError::Request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            if pending.contains_key(&key) {
                return Err(UpstreamError::DuplicateRequestId);
            }
            pending.insert(key.clone(), tx);
        }
        let _slot = SlotGuard {
            pending: &self.pending,
            key: &key,
        };

        if let Err(err) = self.post(&url, message).await {
            self.record_failure();
            return Err(err);
        }

        match tokio::time::timeout(self.cfg.timeout, rx).await {
            Ok(Ok(Ok(data))) => {
                self.record_success();
                Ok(data)
            }
            Ok(Ok(Err(err))) => {
                self.record_failure();
                Err(err)
            }
            // Sender dropped without a reply: the connection went away.
            Ok(Err(_)) => {
                self.record_failure();
                Err(UpstreamError::Disconnected)
            }
            Err(_) => {
                self.record_failure();
                Err(UpstreamError::Timeout)
            }
        }
    }

    /// Sends a notification; no reply is expected or awaited.
    pub async fn send_notification(&self, message: &[u8]) -> Result<(), UpstreamError> {
        self.check_breaker()?;

        let url = {
            let state = self.state.read().expect("state lock poisoned");
            if !state.connected {
                return Err(UpstreamError::NotConnected);
            }
            state.message_url.clone().ok_or(UpstreamError::NotConnected)?
        };

        match self.post(&url, message).await {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    async fn post(&self, url: &str, message: &[u8]) -> Result<(), UpstreamError> {
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .body(message.to_vec())
            .timeout(self.cfg.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    warn!(error = %e, "upstream POST failed");
                    UpstreamError::Request
                }
            })?;

        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(()),
            status => Err(UpstreamError::Status {
                status: status.as_u16(),
            }),
        }
    }

    /// Event-stream read loop. Exits on shutdown or stream loss; the latter
    /// fails pending requests and kicks off reconnection when configured.
    async fn read_events(self: Arc<Self>, response: reqwest::Response) {
        let mut stream = Box::pin(response.bytes_stream());
        let mut parser = EventStreamParser::default();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for event in parser.push(&bytes) {
                                self.handle_event(event);
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "error reading upstream event stream");
                            self.handle_disconnect().await;
                            return;
                        }
                        None => {
                            self.handle_disconnect().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    fn handle_event(&self, event: SseEvent) {
        match event.event.as_str() {
            "endpoint" => {
                let url = if event.data.starts_with('/') {
                    format!("{}{}", self.cfg.url.trim_end_matches('/'), event.data)
                } else {
                    event.data.clone()
                };
                let mut state = self.state.write().expect("state lock poisoned");
                state.message_url = Some(url.clone());
                state.connected = true;
                drop(state);
                debug!(message_url = %url, "received upstream message endpoint");
            }
            "message" => {
                let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&event.data) else {
                    warn!("failed to parse upstream message frame");
                    return;
                };
                let key = id_key(parsed.get("id"));
                let slot = self
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&key);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(Ok(event.data.into_bytes()));
                    }
                    None => {
                        debug!(id = %key, "response for unknown request id discarded");
                    }
                }
            }
            "ping" => {}
            other => {
                debug!(event = %other, "unknown upstream event type");
            }
        }
    }

    async fn handle_disconnect(self: &Arc<Self>) {
        let was_connected = {
            let mut state = self.state.write().expect("state lock poisoned");
            let was = state.connected;
            state.connected = false;
            was
        };

        if !was_connected {
            return;
        }

        warn!("upstream connection lost");
        self.fail_pending(UpstreamError::Disconnected);

        if self.cfg.retry.enabled && !self.shutdown.is_cancelled() {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                client.reconnect_with_backoff().await;
            });
        }
    }

    /// Bounded backoff with jitter, shaped by the retry config.
    async fn reconnect_with_backoff(self: Arc<Self>) {
        for attempt in 1..=self.cfg.retry.max_attempts {
            let base = match self.cfg.retry.backoff {
                Backoff::Exponential => self
                    .cfg
                    .retry
                    .initial_delay
                    .saturating_mul(1u32 << (attempt - 1).min(16)),
                Backoff::Linear => self.cfg.retry.initial_delay.saturating_mul(attempt),
                Backoff::Constant => self.cfg.retry.initial_delay,
            };
            let capped = base.min(self.cfg.retry.max_delay);
            let jitter = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) / 2);
            let delay = capped + Duration::from_millis(jitter as u64);

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            info!(attempt, "reconnecting to upstream");
            match self.connect().await {
                Ok(()) => return,
                Err(e) => warn!(attempt, error = %e, "upstream reconnect failed"),
            }
        }

        error!(
            attempts = self.cfg.retry.max_attempts,
            "upstream reconnection exhausted"
        );
    }

    fn fail_pending(&self, err: UpstreamError) {
        let drained: Vec<ResponseSlot> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn check_breaker(&self) -> Result<(), UpstreamError> {
        if !self.cfg.circuit_breaker.enabled {
            return Ok(());
        }
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        if let Some(open_until) = breaker.open_until {
            if Instant::now() < open_until {
                return Err(UpstreamError::CircuitOpen);
            }
            // Half-open: allow the next attempt through.
            breaker.open_until = None;
        }
        Ok(())
    }

    fn record_failure(&self) {
        if !self.cfg.circuit_breaker.enabled {
            return;
        }
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        breaker.consecutive_failures += 1;
        if breaker.consecutive_failures >= self.cfg.circuit_breaker.threshold {
            breaker.open_until = Some(Instant::now() + self.cfg.circuit_breaker.timeout);
            warn!(
                failures = breaker.consecutive_failures,
                "upstream circuit breaker opened"
            );
        }
    }

    fn record_success(&self) {
        if !self.cfg.circuit_breaker.enabled {
            return;
        }
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        breaker.consecutive_failures = 0;
        breaker.open_until = None;
    }
}

/// Removes a pending slot on every exit path, including cancellation.
/// Double removal after the reader already dispatched is a no-op.
struct SlotGuard<'a> {
    pending: &'a Mutex<HashMap<String, ResponseSlot>>,
    key: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(self.key);
    }
}

/// Correlation key for an outbound request; `None` when the message is not
/// a JSON object.
fn request_id_key(message: &[u8]) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_slice(message).ok()?;
    if !parsed.is_object() {
        return None;
    }
    Some(id_key(parsed.get("id")))
}

/// Canonical key for a JSON-RPC id: its JSON text, so `1` and `"1"` stay
/// distinct.
fn id_key(id: Option<&serde_json::Value>) -> String {
    match id {
        Some(value) => serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()),
        None => "null".to_string(),
    }
}
