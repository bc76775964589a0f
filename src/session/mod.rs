//! Client session state.
//!
//! A session pairs a bounded outbound message queue with identity and
//! activity bookkeeping. Closing is idempotent; once closed a session never
//! reopens and enqueue attempts report the drop instead of blocking.

mod manager;

pub use manager::{SessionManager, SessionManagerConfig};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the per-session outbound queue. Overflow drops the message
/// rather than blocking the router.
const OUTBOUND_QUEUE_CAPACITY: usize = 100;

/// Session fabric errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The configured session cap is reached.
    #[error("maximum sessions limit reached")]
    MaxSessionsReached,
    /// Operation attempted on a closed session.
    #[error("session is closed")]
    Closed,
}

/// Default agent identity stamped onto new sessions.
#[derive(Debug, Clone, Default)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub model: String,
    pub publisher: String,
    pub tags: Vec<String>,
}

/// Mutable session fields guarded by one lock so that activity updates are
/// observed atomically with the request counter.
#[derive(Debug)]
struct SessionState {
    last_activity: Instant,
    agent: AgentIdentity,
    identity_verified: bool,
    did: String,
    source_addr: String,
    user_agent: String,
    cumulative_reads: u64,
    cumulative_writes: u64,
}

/// Read-only view of session state for policy input and audit records.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub request_count: u64,
    pub agent: AgentIdentity,
    pub identity_verified: bool,
    pub did: String,
    pub source_addr: String,
    pub user_agent: String,
    pub cumulative_reads: u64,
    pub cumulative_writes: u64,
}

/// An active client connection.
pub struct Session {
    /// Unique identifier (`sess_` + UUID v4; 122 bits of entropy).
    pub id: String,
    created_at: DateTime<Utc>,
    created: Instant,
    request_count: AtomicU64,
    state: RwLock<SessionState>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    /// Taken once by the transport that pumps the event stream.
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    closed: CancellationToken,
}

impl Session {
    pub(crate) fn new(id: String) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        Self {
            id,
            created_at: Utc::now(),
            created: Instant::now(),
            request_count: AtomicU64::new(0),
            state: RwLock::new(SessionState {
                last_activity: Instant::now(),
                agent: AgentIdentity::default(),
                identity_verified: false,
                did: String::new(),
                source_addr: String::new(),
                user_agent: String::new(),
                cumulative_reads: 0,
                cumulative_writes: 0,
            }),
            outbound_tx: tx,
            outbound_rx: Mutex::new(Some(rx)),
            closed: CancellationToken::new(),
        }
    }

    /// Bumps the monotonic request counter and the activity timestamp
    /// together; returns the new count.
    pub fn increment_request_count(&self) -> u64 {
        let mut state = self.state.write().expect("session state poisoned");
        state.last_activity = Instant::now();
        self.request_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn set_agent(&self, agent: AgentIdentity) {
        self.state.write().expect("session state poisoned").agent = agent;
    }

    pub fn set_identity(&self, verified: bool, did: impl Into<String>) {
        let mut state = self.state.write().expect("session state poisoned");
        state.identity_verified = verified;
        state.did = did.into();
    }

    pub fn set_client_info(&self, source_addr: impl Into<String>, user_agent: impl Into<String>) {
        let mut state = self.state.write().expect("session state poisoned");
        state.source_addr = source_addr.into();
        state.user_agent = user_agent.into();
    }

    /// Accounts a read- or write-flavored tool invocation for policy input.
    pub fn record_io(&self, reads: u64, writes: u64) {
        let mut state = self.state.write().expect("session state poisoned");
        state.cumulative_reads += reads;
        state.cumulative_writes += writes;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read().expect("session state poisoned");
        SessionSnapshot {
            id: self.id.clone(),
            created_at: self.created_at,
            request_count: self.request_count(),
            agent: state.agent.clone(),
            identity_verified: state.identity_verified,
            did: state.did.clone(),
            source_addr: state.source_addr.clone(),
            user_agent: state.user_agent.clone(),
            cumulative_reads: state.cumulative_reads,
            cumulative_writes: state.cumulative_writes,
        }
    }

    /// Non-blocking enqueue onto the outbound queue. Returns `false` when
    /// the session is closed or the queue is full; the message is dropped.
    pub fn send_message(&self, message: Vec<u8>) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.outbound_tx.try_send(message).is_ok()
    }

    /// Hands the outbound receiver to the streaming transport. Yields
    /// `Some` exactly once.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.outbound_rx.lock().expect("outbound lock poisoned").take()
    }

    /// Idempotent close. Wakes the streaming transport and fails future
    /// enqueues.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the session closes.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.state
            .read()
            .expect("session state poisoned")
            .last_activity
            .elapsed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("request_count", &self.request_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
