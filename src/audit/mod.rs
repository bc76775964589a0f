//! Audit records and query types.

pub mod store;
pub mod writer;

pub use store::{AuditStore, StoreConfig};
pub use writer::{AuditWriter, WriterConfig, WriterStats};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit store error: {0}")]
    Store(String),
    #[error("invalid order by column: {0}")]
    InvalidOrderBy(String),
}

impl From<rusqlite::Error> for AuditError {
    fn from(err: rusqlite::Error) -> Self {
        AuditError::Store(err.to_string())
    }
}

/// One flat audit row; list-valued fields arrive JSON-stringified.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Record {
    pub id: i64,
    pub request_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,

    pub agent_id: String,
    pub agent_name: String,
    /// JSON array as a string.
    pub capabilities: String,

    pub method: String,
    pub tool: String,
    pub resource_uri: String,
    /// JSON object as a string; empty when argument capture is off.
    pub arguments: String,

    pub identity_verified: bool,
    pub did: String,

    pub allowed: bool,
    pub matched_rule: String,
    /// Violations joined with `"; "`.
    pub violations: String,
    pub policy_mode: String,

    pub source_ip: String,
    pub environment: String,
}

impl Record {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            ..Default::default()
        }
    }
}

/// Filters for [`AuditStore::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub method: Option<String>,
    pub tool: Option<String>,
    pub allowed: Option<bool>,
    pub limit: usize,
    pub offset: usize,
    /// Must name a whitelisted column; defaults to `timestamp`.
    pub order_by: Option<String>,
    pub order_desc: bool,
}

/// Aggregate statistics over the audit log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub total_requests: i64,
    pub allowed_requests: i64,
    pub denied_requests: i64,
    pub unique_agents: i64,
    pub unique_sessions: i64,
    pub avg_latency_ms: f64,
}
