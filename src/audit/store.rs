//! SQLite-backed audit storage.
//!
//! A single connection behind a mutex; SQLite allows one writer, and batch
//! inserts already amortize the lock. WAL journaling keeps readers off the
//! writer's back. `ORDER BY` columns are validated against a closed
//! whitelist; every filter value travels as a bound parameter.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params_from_iter, Connection};
use tracing::info;

use super::{AuditError, QueryOptions, Record, Stats};

/// Columns that may appear in `ORDER BY`.
const ORDER_BY_WHITELIST: &[&str] = &[
    "id",
    "timestamp",
    "agent_id",
    "session_id",
    "method",
    "tool",
    "allowed",
    "latency_ms",
    "source_ip",
];

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    latency_ms REAL,

    agent_id TEXT NOT NULL,
    agent_name TEXT,
    capabilities TEXT,

    method TEXT NOT NULL,
    tool TEXT,
    resource_uri TEXT,
    arguments TEXT,

    identity_verified INTEGER DEFAULT 0,
    did TEXT,

    allowed INTEGER NOT NULL,
    matched_rule TEXT,
    violations TEXT,
    policy_mode TEXT,

    source_ip TEXT,
    environment TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_agent_id ON audit_log(agent_id);
CREATE INDEX IF NOT EXISTS idx_audit_session_id ON audit_log(session_id);
CREATE INDEX IF NOT EXISTS idx_audit_method ON audit_log(method);
CREATE INDEX IF NOT EXISTS idx_audit_allowed ON audit_log(allowed);
CREATE INDEX IF NOT EXISTS idx_audit_tool ON audit_log(tool);
"#;

const INSERT_SQL: &str = "INSERT INTO audit_log (
    request_id, session_id, timestamp, latency_ms,
    agent_id, agent_name, capabilities,
    method, tool, resource_uri, arguments,
    identity_verified, did,
    allowed, matched_rule, violations, policy_mode,
    source_ip, environment
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)";

const SELECT_COLUMNS: &str = "id, request_id, session_id, timestamp, latency_ms, \
    agent_id, agent_name, capabilities, \
    method, tool, resource_uri, arguments, \
    identity_verified, did, \
    allowed, matched_rule, violations, policy_mode, \
    source_ip, environment";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the database file; `:memory:` for an in-memory store.
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "audit.db".to_string(),
        }
    }
}

/// SQLite audit store. All methods block; callers on async tasks go
/// through `spawn_blocking`.
pub struct AuditStore {
    conn: Mutex<Connection>,
    db_path: String,
}

impl AuditStore {
    pub fn new(cfg: StoreConfig) -> Result<Self, AuditError> {
        let conn = Connection::open(&cfg.db_path)?;
        conn.busy_timeout(Duration::from_millis(5_000))?;
        // WAL keeps concurrent readers from stalling the flush path. The
        // in-memory store used by tests does not support it; ignore there.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: cfg.db_path,
        })
    }

    /// Appends a single record.
    pub fn insert(&self, record: &Record) -> Result<(), AuditError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let params = record_params(record);
        conn.execute(INSERT_SQL, params_from_iter(params.iter().map(|p| p.as_ref())))?;
        Ok(())
    }

    /// Appends a batch inside one transaction; all-or-nothing.
    pub fn insert_batch(&self, records: &[Record]) -> Result<(), AuditError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_SQL)?;
            for record in records {
                let params = record_params(record);
                stmt.execute(params_from_iter(params.iter().map(|p| p.as_ref())))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Retrieves records matching the filters.
    pub fn query(&self, opts: &QueryOptions) -> Result<Vec<Record>, AuditError> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(start) = &opts.start_time {
            conditions.push("timestamp >= ?");
            args.push(Box::new(encode_time(start)));
        }
        if let Some(end) = &opts.end_time {
            conditions.push("timestamp <= ?");
            args.push(Box::new(encode_time(end)));
        }
        if let Some(agent_id) = &opts.agent_id {
            conditions.push("agent_id = ?");
            args.push(Box::new(agent_id.clone()));
        }
        if let Some(session_id) = &opts.session_id {
            conditions.push("session_id = ?");
            args.push(Box::new(session_id.clone()));
        }
        if let Some(method) = &opts.method {
            conditions.push("method = ?");
            args.push(Box::new(method.clone()));
        }
        if let Some(tool) = &opts.tool {
            conditions.push("tool = ?");
            args.push(Box::new(tool.clone()));
        }
        if let Some(allowed) = opts.allowed {
            conditions.push("allowed = ?");
            args.push(Box::new(allowed));
        }

        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM audit_log");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let order_by = match opts.order_by.as_deref() {
            None | Some("") => "timestamp",
            Some(column) if ORDER_BY_WHITELIST.contains(&column) => column,
            Some(column) => return Err(AuditError::InvalidOrderBy(column.to_string())),
        };
        let direction = if opts.order_desc { "DESC" } else { "ASC" };
        sql.push_str(&format!(" ORDER BY {order_by} {direction}"));

        if opts.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", opts.limit));
        }
        if opts.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", opts.offset));
        }

        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter().map(|b| b.as_ref())), row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Aggregate counters, optionally bounded to rows at or after `since`.
    pub fn stats(&self, since: Option<DateTime<Utc>>) -> Result<Stats, AuditError> {
        let mut sql = String::from(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN allowed = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN allowed = 0 THEN 1 ELSE 0 END), 0),
                COUNT(DISTINCT agent_id),
                COUNT(DISTINCT session_id),
                COALESCE(AVG(latency_ms), 0.0)
             FROM audit_log",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(since) = since {
            sql.push_str(" WHERE timestamp >= ?");
            args.push(Box::new(encode_time(&since)));
        }

        let conn = self.conn.lock().expect("store lock poisoned");
        let stats = conn.query_row(
            &sql,
            params_from_iter(args.iter().map(|b| b.as_ref())),
            |row| {
                Ok(Stats {
                    total_requests: row.get(0)?,
                    allowed_requests: row.get(1)?,
                    denied_requests: row.get(2)?,
                    unique_agents: row.get(3)?,
                    unique_sessions: row.get(4)?,
                    avg_latency_ms: row.get(5)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Deletes records older than the given duration; returns the count.
    pub fn prune(&self, older_than: Duration) -> Result<usize, AuditError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let conn = self.conn.lock().expect("store lock poisoned");
        let deleted = conn.execute(
            "DELETE FROM audit_log WHERE timestamp < ?1",
            [encode_time(&cutoff)],
        )?;
        Ok(deleted)
    }

    /// Connectivity check.
    pub fn ping(&self) -> Result<(), AuditError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn close(self) {
        info!(path = %self.db_path, "closing audit store");
        // Connection closes on drop.
    }
}

fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn record_params(record: &Record) -> Vec<Box<dyn rusqlite::ToSql>> {
    vec![
        Box::new(record.request_id.clone()),
        Box::new(record.session_id.clone()),
        Box::new(encode_time(&record.timestamp)),
        Box::new(record.latency_ms),
        Box::new(record.agent_id.clone()),
        Box::new(record.agent_name.clone()),
        Box::new(record.capabilities.clone()),
        Box::new(record.method.clone()),
        Box::new(record.tool.clone()),
        Box::new(record.resource_uri.clone()),
        Box::new(record.arguments.clone()),
        Box::new(record.identity_verified),
        Box::new(record.did.clone()),
        Box::new(record.allowed),
        Box::new(record.matched_rule.clone()),
        Box::new(record.violations.clone()),
        Box::new(record.policy_mode.clone()),
        Box::new(record.source_ip.clone()),
        Box::new(record.environment.clone()),
    ]
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let timestamp: String = row.get(3)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(Record {
        id: row.get(0)?,
        request_id: row.get(1)?,
        session_id: row.get(2)?,
        timestamp,
        latency_ms: row.get(4)?,
        agent_id: row.get(5)?,
        agent_name: row.get(6)?,
        capabilities: row.get(7)?,
        method: row.get(8)?,
        tool: row.get(9)?,
        resource_uri: row.get(10)?,
        arguments: row.get(11)?,
        identity_verified: row.get(12)?,
        did: row.get(13)?,
        allowed: row.get(14)?,
        matched_rule: row.get(15)?,
        violations: row.get(16)?,
        policy_mode: row.get(17)?,
        source_ip: row.get(18)?,
        environment: row.get(19)?,
    })
}
