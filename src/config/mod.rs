//! Configuration schema.
//!
//! Loaded from a YAML file; every field has a sensible default so a minimal
//! config can name only a transport and an upstream. Durations are
//! humantime strings (`30s`, `5m`).

pub mod duration_format;
mod loader;

pub use loader::load;

use std::time::Duration;

use serde::Deserialize;

use crate::policy::Mode;

/// Configuration load/validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config file is empty")]
    Empty,
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inbound transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Sse,
    Stdio,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: TransportKind,
    pub listen: ListenConfig,
    /// Cap on concurrent sessions; also the session-fabric cap unless
    /// `session.max_sessions` overrides it.
    pub max_connections: usize,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub graceful_shutdown: Duration,
    pub security: SecurityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Sse,
            listen: ListenConfig::default(),
            max_connections: 10_000,
            graceful_shutdown: Duration::from_secs(30),
            security: SecurityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub security_headers: bool,
    /// Empty list means same-origin only (no CORS header emitted);
    /// `["*"]` allows any origin.
    pub cors_allowed_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            security_headers: true,
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the upstream MCP server; empty runs the gateway in
    /// standalone echo mode.
    pub url: String,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub timeout: Duration,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(30),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle: usize,
    pub max_open: usize,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 32,
            max_open: 64,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Exponential,
    Linear,
    Constant,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub initial_delay: Duration,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures before the breaker opens.
    pub threshold: u32,
    /// How long the breaker stays open.
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Default agent identity stamped onto new sessions when no verified
/// credential overrides it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub model: String,
    pub publisher: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub ttl: Duration,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub cleanup_interval: Duration,
    /// Overrides `server.max_connections` as the session cap when set.
    pub max_sessions: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(2 * 60 * 60),
            cleanup_interval: Duration::from_secs(60),
            max_sessions: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub enabled: bool,
    pub mode: Mode,
    pub modules_dir: String,
    pub data_file: String,
    /// Environment tag fed to policy input and audit rows.
    pub environment: String,
    pub cache: PolicyCacheConfig,
    pub evaluation: EvaluationConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: Mode::Enforce,
            modules_dir: "policies".to_string(),
            data_file: "policies/data.json".to_string(),
            environment: "development".to_string(),
            cache: PolicyCacheConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyCacheConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for PolicyCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(5 * 60),
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub timeout: Duration,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub db_path: String,
    pub buffer_size: usize,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub flush_interval: Duration,
    /// 0 keeps records indefinitely.
    pub retention_days: u32,
    pub capture: CaptureConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: "audit.db".to_string(),
            buffer_size: 100,
            flush_interval: Duration::from_secs(1),
            retention_days: 0,
            capture: CaptureConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub request_arguments: bool,
    pub response_summary: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            request_arguments: true,
            response_summary: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub enabled: bool,
    pub listen: ListenConfig,
    pub metrics_path: String,
    pub liveness_path: String,
    pub readiness_path: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: ListenConfig {
                address: "127.0.0.1".to_string(),
                port: 9090,
            },
            metrics_path: "/metrics".to_string(),
            liveness_path: "/healthz".to_string(),
            readiness_path: "/readyz".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// `json` or `text`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Config {
    /// The effective session cap.
    pub fn max_sessions(&self) -> usize {
        self.session.max_sessions.unwrap_or(self.server.max_connections)
    }

    /// Semantic checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.transport == TransportKind::Http {
            return Err(ConfigError::Validation(
                "http transport is not implemented; use sse or stdio".to_string(),
            ));
        }
        if self.server.transport == TransportKind::Sse && self.server.listen.port == 0 {
            return Err(ConfigError::Validation(
                "server.listen.port must be set for the sse transport".to_string(),
            ));
        }
        if !self.upstream.url.is_empty()
            && !self.upstream.url.starts_with("http://")
            && !self.upstream.url.starts_with("https://")
        {
            return Err(ConfigError::Validation(format!(
                "upstream.url must be an http(s) URL, got '{}'",
                self.upstream.url
            )));
        }
        if self.policy.enabled && self.policy.modules_dir.is_empty() {
            return Err(ConfigError::Validation(
                "policy.modules_dir is required when policy is enabled".to_string(),
            ));
        }
        if self.audit.enabled && self.audit.db_path.is_empty() {
            return Err(ConfigError::Validation(
                "audit.db_path is required when audit is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
