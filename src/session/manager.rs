//! Session lifecycle management.
//!
//! The manager owns the session map and the counters behind the capacity
//! check. A background sweep evicts closed, expired, and idle sessions once
//! a minute without blocking concurrent create/get/delete traffic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Session, SessionError};

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub session_ttl: Duration,
    pub cleanup_interval: Duration,
    pub max_sessions: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(2 * 60 * 60),
            cleanup_interval: Duration::from_secs(60),
            max_sessions: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    active: usize,
    total_created: u64,
}

/// Creates, looks up, and evicts sessions.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    /// Guards the capacity check and insert together so the cap cannot be
    /// overshot by concurrent creates.
    counters: Mutex<Counters>,
    config: SessionManagerConfig,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            counters: Mutex::new(Counters::default()),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawns the periodic sweep. Runs until [`SessionManager::stop`].
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so the initial
            // sweep happens one interval after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => manager.sweep(),
                }
            }
        });

        info!(
            session_ttl_secs = self.config.session_ttl.as_secs(),
            max_sessions = self.config.max_sessions,
            "session manager started"
        );
    }

    /// Stops the sweeper and closes every remaining session.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.sessions.retain(|_, session| {
            session.close();
            false
        });
        let mut counters = self.counters.lock().expect("counters poisoned");
        counters.active = 0;
        info!("session manager stopped");
    }

    /// Creates a session, enforcing the configured cap.
    pub fn create(&self) -> Result<Arc<Session>, SessionError> {
        let mut counters = self.counters.lock().expect("counters poisoned");
        if counters.active >= self.config.max_sessions {
            warn!(max = self.config.max_sessions, "max sessions limit reached");
            return Err(SessionError::MaxSessionsReached);
        }

        let id = format!("sess_{}", Uuid::new_v4());
        let session = Arc::new(Session::new(id.clone()));
        self.sessions.insert(id.clone(), Arc::clone(&session));
        counters.active += 1;
        counters.total_created += 1;
        drop(counters);

        debug!(session_id = %id, "session created");
        Ok(session)
    }

    /// Returns the session only if it is still open. Closed entries are
    /// lazily removed on lookup.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(session_id).map(|s| Arc::clone(&s))?;
        if session.is_closed() {
            self.delete(session_id);
            return None;
        }
        Some(session)
    }

    /// Closes and removes a session. Idempotent.
    pub fn delete(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.close();
            let mut counters = self.counters.lock().expect("counters poisoned");
            counters.active = counters.active.saturating_sub(1);
            drop(counters);
            debug!(session_id = %session_id, "session deleted");
        }
    }

    pub fn active_count(&self) -> usize {
        self.counters.lock().expect("counters poisoned").active
    }

    pub fn total_created(&self) -> u64 {
        self.counters.lock().expect("counters poisoned").total_created
    }

    /// Evicts closed sessions, sessions older than the TTL, and sessions
    /// idle for more than half the TTL.
    fn sweep(&self) {
        let ttl = self.config.session_ttl;
        let idle_cutoff = ttl / 2;
        let mut expired = 0usize;
        let mut idle = 0usize;

        let candidates: Vec<(String, Arc<Session>)> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value();
                if session.is_closed() || session.age() > ttl || session.idle_time() > idle_cutoff {
                    Some((entry.key().clone(), Arc::clone(session)))
                } else {
                    None
                }
            })
            .collect();

        for (id, session) in candidates {
            if !session.is_closed() {
                if session.age() > ttl {
                    expired += 1;
                    debug!(session_id = %id, age_secs = session.age().as_secs(), "session expired");
                } else {
                    idle += 1;
                    debug!(session_id = %id, idle_secs = session.idle_time().as_secs(), "session idle timeout");
                }
            }
            self.delete(&id);
        }

        if expired > 0 || idle > 0 {
            info!(expired, idle, active = self.active_count(), "session cleanup completed");
        }
    }

    /// Forces one sweep pass; exposed for tests.
    #[cfg(test)]
    pub(crate) fn sweep_now(&self) {
        self.sweep();
    }
}
