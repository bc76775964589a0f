//! Health and metrics.
//!
//! A process-local Prometheus registry collects request, policy, session,
//! and audit counters; readiness aggregates registered component checkers.
//! When enabled, a small HTTP server exposes `/metrics`, `/healthz`, and
//! `/readyz`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router as AxumRouter;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ObservabilityConfig;
use crate::error::GatewayError;

/// Gateway metrics, all registered on one registry.
pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub policy_decisions_total: IntCounterVec,
    pub policy_cache_hits_total: IntCounter,
    pub policy_cache_misses_total: IntCounter,
    pub sessions_active: IntGauge,
    pub sessions_created_total: IntCounter,
    pub audit_written_total: IntCounter,
    pub audit_dropped_total: IntCounter,
    pub upstream_connected: IntGauge,
}

impl Metrics {
    pub fn new(namespace: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Requests processed").namespace(namespace),
            &["method", "tool", "allowed"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Request latency")
                .namespace(namespace),
            &["method"],
        )?;
        let policy_decisions_total = IntCounterVec::new(
            Opts::new("policy_decisions_total", "Policy decisions").namespace(namespace),
            &["matched_rule", "mode", "allowed"],
        )?;
        let policy_cache_hits_total = IntCounter::with_opts(
            Opts::new("policy_cache_hits_total", "Decision cache hits").namespace(namespace),
        )?;
        let policy_cache_misses_total = IntCounter::with_opts(
            Opts::new("policy_cache_misses_total", "Decision cache misses").namespace(namespace),
        )?;
        let sessions_active = IntGauge::with_opts(
            Opts::new("sessions_active", "Active sessions").namespace(namespace),
        )?;
        let sessions_created_total = IntCounter::with_opts(
            Opts::new("sessions_created_total", "Sessions created").namespace(namespace),
        )?;
        let audit_written_total = IntCounter::with_opts(
            Opts::new("audit_written_total", "Audit records written").namespace(namespace),
        )?;
        let audit_dropped_total = IntCounter::with_opts(
            Opts::new("audit_dropped_total", "Audit records dropped").namespace(namespace),
        )?;
        let upstream_connected = IntGauge::with_opts(
            Opts::new("upstream_connected", "Upstream connection state").namespace(namespace),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(policy_decisions_total.clone()))?;
        registry.register(Box::new(policy_cache_hits_total.clone()))?;
        registry.register(Box::new(policy_cache_misses_total.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(sessions_created_total.clone()))?;
        registry.register(Box::new(audit_written_total.clone()))?;
        registry.register(Box::new(audit_dropped_total.clone()))?;
        registry.register(Box::new(upstream_connected.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            policy_decisions_total,
            policy_cache_hits_total,
            policy_cache_misses_total,
            sessions_active,
            sessions_created_total,
            audit_written_total,
            audit_dropped_total,
            upstream_connected,
        })
    }

    pub fn record_request(&self, method: &str, tool: &str, allowed: bool, duration_secs: f64) {
        let tool = if tool.is_empty() { "unknown" } else { tool };
        self.requests_total
            .with_label_values(&[method, tool, bool_label(allowed)])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[method])
            .observe(duration_secs);
    }

    pub fn record_policy_decision(&self, matched_rule: &str, mode: &str, allowed: bool) {
        self.policy_decisions_total
            .with_label_values(&[matched_rule, mode, bool_label(allowed)])
            .inc();
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.policy_cache_hits_total.inc();
        } else {
            self.policy_cache_misses_total.inc();
        }
    }

    /// Renders the registry in the Prometheus text format.
    pub fn gather(&self) -> String {
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metrics, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

type Checker = Box<dyn Fn() -> bool + Send + Sync>;

/// Liveness/readiness state.
pub struct Health {
    version: String,
    ready: AtomicBool,
    checkers: RwLock<Vec<(String, Checker)>>,
}

impl Health {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            ready: AtomicBool::new(false),
            checkers: RwLock::new(Vec::new()),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn register_checker(
        &self,
        name: &str,
        checker: impl Fn() -> bool + Send + Sync + 'static,
    ) {
        self.checkers
            .write()
            .expect("checkers lock poisoned")
            .push((name.to_string(), Box::new(checker)));
    }

    /// Readiness: the ready flag plus every registered checker.
    pub fn check(&self) -> (bool, Vec<(String, bool)>) {
        let results: Vec<(String, bool)> = self
            .checkers
            .read()
            .expect("checkers lock poisoned")
            .iter()
            .map(|(name, checker)| (name.clone(), checker()))
            .collect();
        let ready =
            self.ready.load(Ordering::SeqCst) && results.iter().all(|(_, healthy)| *healthy);
        (ready, results)
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

struct ObsState {
    metrics: Arc<Metrics>,
    health: Arc<Health>,
}

/// HTTP server exposing metrics and health.
pub struct ObservabilityServer {
    config: ObservabilityConfig,
    state: Arc<ObsState>,
    shutdown: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ObservabilityServer {
    pub fn new(config: ObservabilityConfig, metrics: Arc<Metrics>, health: Arc<Health>) -> Self {
        Self {
            config,
            state: Arc::new(ObsState { metrics, health }),
            shutdown: CancellationToken::new(),
            serve_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr lock poisoned")
    }

    pub async fn start(&self) -> Result<(), GatewayError> {
        if !self.config.enabled {
            return Ok(());
        }

        let app = AxumRouter::new()
            .route(&self.config.metrics_path, get(metrics_handler))
            .route(&self.config.liveness_path, get(liveness_handler))
            .route(&self.config.readiness_path, get(readiness_handler))
            .with_state(Arc::clone(&self.state));

        let addr = format!(
            "{}:{}",
            self.config.listen.address, self.config.listen.port
        );
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            GatewayError::Transport(format!("failed to bind observability server on {addr}: {e}"))
        })?;
        *self.local_addr.lock().expect("addr lock poisoned") = listener.local_addr().ok();

        info!(address = %addr, "observability server listening");

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "observability server error");
            }
        });
        *self.serve_task.lock().expect("task lock poisoned") = Some(handle);
        Ok(())
    }

    pub async fn stop(&self, deadline: Duration) {
        self.shutdown.cancel();
        let handle = self.serve_task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(deadline, handle).await;
        }
    }
}

async fn metrics_handler(State(state): State<Arc<ObsState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        state.metrics.gather(),
    )
}

async fn liveness_handler(State(state): State<Arc<ObsState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "status": "alive",
            "version": state.health.version(),
        })),
    )
}

async fn readiness_handler(State(state): State<Arc<ObsState>>) -> impl IntoResponse {
    let (ready, checks) = state.health.check();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let checks: serde_json::Map<String, serde_json::Value> = checks
        .into_iter()
        .map(|(name, healthy)| (name, serde_json::Value::Bool(healthy)))
        .collect();
    (
        status,
        axum::Json(serde_json::json!({
            "ready": ready,
            "checks": checks,
        })),
    )
}
