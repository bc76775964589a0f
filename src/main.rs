//! mcpguard entry point: configuration, component wiring, and lifecycle.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mcpguard::audit::{AuditStore, AuditWriter, Record, StoreConfig, WriterConfig};
use mcpguard::config::{self, Config, TransportKind};
use mcpguard::error::GatewayError;
use mcpguard::observability::{Health, Metrics, ObservabilityServer};
use mcpguard::policy::{
    CacheConfig, Engine, EngineConfig, InputBuilder, Loader, PolicyError,
};
use mcpguard::router::context::RequestContext;
use mcpguard::router::{AuditSink, PolicyEvaluator, Router, UpstreamSender, Verdict};
use mcpguard::session::{AgentIdentity, Session, SessionManager, SessionManagerConfig};
use mcpguard::transport::sse::SseServer;
use mcpguard::transport::stdio::StdioServer;
use mcpguard::transport::Transport;
use mcpguard::upstream::{UpstreamClient, UpstreamError};

#[derive(Debug, Parser)]
#[command(name = "mcpguard", version, about = "Security gateway for MCP agent traffic")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "MCPGUARD_CONFIG", default_value = "config/gateway.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting mcpguard"
    );

    let app = match Application::new(&config) {
        Ok(app) => app,
        Err(err) => {
            error!(error = %err, "failed to initialize components");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = app.start(&config).await {
        error!(error = %err, "failed to start");
        return ExitCode::FAILURE;
    }

    info!(
        transport = app.transport.name(),
        upstream = %config.upstream.url,
        policy_mode = config.policy.mode.as_str(),
        "gateway ready"
    );

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    match tokio::time::timeout(config.server.graceful_shutdown, app.stop(&config)).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(_) => {
            error!(
                deadline_secs = config.server.graceful_shutdown.as_secs(),
                "shutdown deadline exceeded"
            );
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));

    if config.logging.format == "text" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// All long-lived components, wired together.
struct Application {
    sessions: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
    upstream: Option<Arc<UpstreamClient>>,
    policy_engine: Option<Arc<Engine>>,
    audit_store: Option<Arc<AuditStore>>,
    audit_writer: Option<Arc<AuditWriter>>,
    metrics: Arc<Metrics>,
    health: Arc<Health>,
    obs_server: ObservabilityServer,
    background: CancellationToken,
}

impl Application {
    fn new(config: &Config) -> Result<Self, GatewayError> {
        let metrics = Arc::new(
            Metrics::new("mcpguard")
                .map_err(|e| GatewayError::Internal(format!("metrics registry: {e}")))?,
        );
        let health = Arc::new(Health::new(env!("CARGO_PKG_VERSION")));

        let sessions = SessionManager::new(SessionManagerConfig {
            session_ttl: config.session.ttl,
            cleanup_interval: config.session.cleanup_interval,
            max_sessions: config.max_sessions(),
        });

        let upstream = if config.upstream.url.is_empty() {
            None
        } else {
            Some(UpstreamClient::new(config.upstream.clone())?)
        };

        let policy_engine = if config.policy.enabled {
            let engine = Arc::new(Engine::new(EngineConfig {
                enabled: true,
                mode: config.policy.mode,
                cache: CacheConfig {
                    enabled: config.policy.cache.enabled,
                    ttl: config.policy.cache.ttl,
                    max_entries: config.policy.cache.max_entries,
                },
            }));
            Some(engine)
        } else {
            None
        };

        let (audit_store, audit_writer) = if config.audit.enabled {
            let store = Arc::new(AuditStore::new(StoreConfig {
                db_path: config.audit.db_path.clone(),
            })?);
            let writer = AuditWriter::new(
                Arc::clone(&store),
                WriterConfig {
                    buffer_size: config.audit.buffer_size,
                    flush_interval: config.audit.flush_interval,
                },
            );
            (Some(store), Some(writer))
        } else {
            (None, None)
        };

        let mut router = Router::new().with_audit_sink(Arc::new(AuditLogger {
            writer: audit_writer.clone(),
            metrics: Arc::clone(&metrics),
            capture_arguments: config.audit.capture.request_arguments,
            environment: config.policy.environment.clone(),
        }));

        if let Some(engine) = &policy_engine {
            router = router.with_policy_evaluator(Arc::new(EnginePolicyEvaluator {
                engine: Arc::clone(engine),
                eval_timeout: config.policy.evaluation.timeout,
                environment: config.policy.environment.clone(),
                region: config.server.listen.address.clone(),
                metrics: Arc::clone(&metrics),
            }));
        }

        if let Some(client) = &upstream {
            router = router.with_upstream(Arc::new(UpstreamForwarder {
                client: Arc::clone(client),
            }));
        }

        let router = Arc::new(router);

        let agent = AgentIdentity {
            id: config.agent.id.clone(),
            name: config.agent.name.clone(),
            capabilities: config.agent.capabilities.clone(),
            model: config.agent.model.clone(),
            publisher: config.agent.publisher.clone(),
            tags: config.agent.tags.clone(),
        };

        let transport: Arc<dyn Transport> = match config.server.transport {
            TransportKind::Sse => Arc::new(SseServer::new(
                format!(
                    "{}:{}",
                    config.server.listen.address, config.server.listen.port
                ),
                config.server.security.clone(),
                agent,
                Arc::clone(&sessions),
                router,
            )),
            TransportKind::Stdio => Arc::new(StdioServer::new(
                agent,
                Arc::clone(&sessions),
                router,
            )),
            TransportKind::Http => {
                // Rejected by config validation; kept exhaustive.
                return Err(GatewayError::Transport(
                    "http transport is not implemented".into(),
                ));
            }
        };

        // Readiness checkers per component.
        if let Some(engine) = &policy_engine {
            let engine = Arc::clone(engine);
            health.register_checker("policy_engine", move || engine.is_ready());
        }
        if let Some(client) = &upstream {
            let client = Arc::clone(client);
            health.register_checker("upstream", move || client.is_connected());
        }
        if let Some(store) = &audit_store {
            let store = Arc::clone(store);
            health.register_checker("audit_store", move || store.ping().is_ok());
        }

        let obs_server = ObservabilityServer::new(
            config.observability.clone(),
            Arc::clone(&metrics),
            Arc::clone(&health),
        );

        Ok(Self {
            sessions,
            transport,
            upstream,
            policy_engine,
            audit_store,
            audit_writer,
            metrics,
            health,
            obs_server,
            background: CancellationToken::new(),
        })
    }

    async fn start(&self, config: &Config) -> Result<(), GatewayError> {
        if let Some(engine) = &self.policy_engine {
            let loader = Loader::new(&config.policy.modules_dir, &config.policy.data_file);
            loader.load_and_initialize(engine)?;
            engine.cache().spawn_cleanup(self.background.child_token());
            info!(
                modules_dir = %config.policy.modules_dir,
                data_file = %config.policy.data_file,
                mode = config.policy.mode.as_str(),
                "policy engine initialized"
            );
        }

        if let Some(writer) = &self.audit_writer {
            writer.start();
            info!(db_path = %config.audit.db_path, "audit logging enabled");
        }

        if let (Some(store), true) = (&self.audit_store, config.audit.retention_days > 0) {
            self.spawn_retention_sweeper(Arc::clone(store), config.audit.retention_days);
        }

        self.sessions.start();
        self.spawn_session_gauge();

        if let Some(client) = &self.upstream {
            if let Err(err) = client.connect().await {
                // The gateway can still serve in standalone mode; the
                // readiness probe reports the missing upstream.
                warn!(error = %err, "failed to connect to upstream, continuing standalone");
            }
        }

        self.transport.start().await?;
        self.obs_server.start().await?;
        self.health.set_ready(true);
        Ok(())
    }

    async fn stop(&self, config: &Config) {
        info!("starting graceful shutdown");
        self.health.set_ready(false);
        self.background.cancel();

        self.obs_server.stop(Duration::from_secs(2)).await;

        if let Err(err) = self.transport.stop(config.server.graceful_shutdown).await {
            error!(error = %err, "error stopping transport");
        }

        if let Some(client) = &self.upstream {
            client.disconnect();
        }

        self.sessions.stop();

        if let Some(writer) = &self.audit_writer {
            let stats = writer.stop().await;
            self.metrics.audit_written_total.inc_by(stats.written);
            self.metrics.audit_dropped_total.inc_by(stats.dropped);
        }
        // The audit store closes when its last Arc drops.
    }

    /// Daily prune of audit rows past the retention window.
    fn spawn_retention_sweeper(&self, store: Arc<AuditStore>, retention_days: u32) {
        let token = self.background.child_token();
        tokio::spawn(async move {
            let retention = Duration::from_secs(u64::from(retention_days) * 24 * 3600);
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 3600));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        let store = Arc::clone(&store);
                        let result = tokio::task::spawn_blocking(move || store.prune(retention)).await;
                        match result {
                            Ok(Ok(deleted)) if deleted > 0 => {
                                info!(deleted, retention_days, "pruned audit records");
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(err)) => error!(error = %err, "audit prune failed"),
                            Err(err) => error!(error = %err, "audit prune task failed"),
                        }
                    }
                }
            }
        });
    }

    /// Keeps the session gauges current without coupling the fabric to the
    /// metrics registry.
    fn spawn_session_gauge(&self) {
        let sessions = Arc::clone(&self.sessions);
        let metrics = Arc::clone(&self.metrics);
        let token = self.background.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        metrics.sessions_active.set(sessions.active_count() as i64);
                        let created = sessions.total_created();
                        let counted = metrics.sessions_created_total.get();
                        if created > counted {
                            metrics.sessions_created_total.inc_by(created - counted);
                        }
                    }
                }
            }
        });
    }
}

/// Bridges the router's policy seam to the engine: builds the structured
/// input from session and request state, runs the evaluation on a blocking
/// thread under the configured timeout, and maps the result back.
struct EnginePolicyEvaluator {
    engine: Arc<Engine>,
    eval_timeout: Duration,
    environment: String,
    region: String,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl PolicyEvaluator for EnginePolicyEvaluator {
    async fn evaluate(
        &self,
        session: &Session,
        ctx: &RequestContext,
    ) -> Result<Verdict, PolicyError> {
        let snapshot = session.snapshot();
        let name = if snapshot.agent.name.is_empty() {
            snapshot.agent.id.clone()
        } else {
            snapshot.agent.name.clone()
        };

        let input = InputBuilder::new()
            .agent(&snapshot.agent.id, &name, &snapshot.agent.capabilities)
            .agent_details(
                &snapshot.agent.model,
                &snapshot.agent.publisher,
                &snapshot.agent.tags,
            )
            .request(
                &ctx.method,
                &ctx.tool,
                ctx.arguments.clone().unwrap_or_default(),
            )
            .session(
                &snapshot.id,
                snapshot.request_count,
                snapshot.created_at,
                snapshot.cumulative_reads,
                snapshot.cumulative_writes,
            )
            .identity(snapshot.identity_verified, &snapshot.did)
            .environment(&snapshot.source_addr, &self.environment, &self.region)
            .build();

        let engine = Arc::clone(&self.engine);
        let result = tokio::time::timeout(
            self.eval_timeout,
            tokio::task::spawn_blocking(move || engine.evaluate(input)),
        )
        .await
        .map_err(|_| PolicyError::Evaluation {
            details: "evaluation timed out".to_string(),
        })?
        .map_err(|e| PolicyError::Evaluation {
            details: format!("evaluation task failed: {e}"),
        })??;

        self.metrics.record_cache_lookup(result.cache_hit);

        Ok(Verdict {
            allow: result.decision.allow,
            violations: result.decision.violations,
            matched_rule: result.decision.matched_rule,
            policy_mode: result.policy_mode.as_str().to_string(),
            obligations: result.decision.obligations,
        })
    }
}

/// Bridges the router's forwarding seam to the upstream client.
struct UpstreamForwarder {
    client: Arc<UpstreamClient>,
}

#[async_trait]
impl UpstreamSender for UpstreamForwarder {
    async fn send(&self, message: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        self.client.send(message).await
    }

    async fn send_notification(&self, message: &[u8]) -> Result<(), UpstreamError> {
        self.client.send_notification(message).await
    }
}

/// Builds the audit row for one completed request, records metrics, and
/// hands the row to the write-behind pipeline.
struct AuditLogger {
    writer: Option<Arc<AuditWriter>>,
    metrics: Arc<Metrics>,
    capture_arguments: bool,
    environment: String,
}

#[async_trait]
impl AuditSink for AuditLogger {
    async fn record(
        &self,
        session: &Session,
        ctx: &RequestContext,
        verdict: Option<&Verdict>,
        _response: &[u8],
        latency: Duration,
    ) {
        let snapshot = session.snapshot();
        let allowed = verdict.map(|v| v.allow).unwrap_or(true);

        self.metrics.record_request(
            &ctx.method,
            &ctx.tool,
            allowed,
            latency.as_secs_f64(),
        );
        if let Some(verdict) = verdict {
            self.metrics.record_policy_decision(
                &verdict.matched_rule,
                &verdict.policy_mode,
                verdict.allow,
            );
        }

        info!(
            request_id = %ctx.request_id,
            session_id = %session.id,
            agent_id = %snapshot.agent.id,
            method = %ctx.method,
            tool = %ctx.tool,
            allowed,
            latency_ms = latency.as_secs_f64() * 1000.0,
            "request processed"
        );

        let Some(writer) = &self.writer else {
            return;
        };

        let capabilities =
            serde_json::to_string(&snapshot.agent.capabilities).unwrap_or_default();
        let arguments = match (&ctx.arguments, self.capture_arguments) {
            (Some(args), true) => serde_json::to_string(args).unwrap_or_default(),
            _ => String::new(),
        };

        let (matched_rule, violations, policy_mode) = match verdict {
            Some(v) => (
                v.matched_rule.clone(),
                v.violations.join("; "),
                v.policy_mode.clone(),
            ),
            None => (String::new(), String::new(), String::new()),
        };

        writer.write(Record {
            request_id: ctx.request_id.clone(),
            session_id: snapshot.id,
            latency_ms: latency.as_secs_f64() * 1000.0,
            agent_id: snapshot.agent.id,
            agent_name: snapshot.agent.name,
            capabilities,
            method: ctx.method.clone(),
            tool: ctx.tool.clone(),
            resource_uri: ctx.resource_uri.clone(),
            arguments,
            identity_verified: snapshot.identity_verified,
            did: snapshot.did,
            allowed,
            matched_rule,
            violations,
            policy_mode,
            source_ip: snapshot.source_addr,
            environment: self.environment.clone(),
            ..Record::new()
        });
    }
}
