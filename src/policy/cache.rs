//! Decision cache.
//!
//! A single bounded tier keyed by agent, tool, and a digest of the agent's
//! capability set. Entries expire on wall-clock TTL; a background task
//! sweeps expired entries once a minute. The tier is labelled `L2` to leave
//! room for a per-request tier in front of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::{PolicyDecision, PolicyInput};

/// Cache tier name reported on hits.
pub const CACHE_TIER: &str = "L2";

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(5 * 60),
            max_entries: 10_000,
        }
    }
}

struct CacheEntry {
    decision: PolicyDecision,
    expires_at: Instant,
}

/// Cache performance counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evicted: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

/// Bounded TTL cache for policy decisions.
pub struct DecisionCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
}

impl DecisionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: config.ttl,
            max_entries: config.max_entries.max(1),
            enabled: config.enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Spawns the periodic expired-entry sweep; stops with the token.
    pub fn spawn_cleanup(self: &Arc<Self>, shutdown: CancellationToken) {
        if !self.enabled {
            return;
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => cache.remove_expired(),
                }
            }
        });
    }

    /// Returns the cached decision if present and not expired.
    pub fn get(&self, key: &str) -> Option<PolicyDecision> {
        if !self.enabled {
            return None;
        }

        let entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.decision.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts a decision with the configured TTL. At capacity, expired
    /// entries go first; if that is not enough, an arbitrary tenth of the
    /// map is evicted.
    pub fn set(&self, key: String, decision: PolicyDecision) {
        if !self.enabled {
            return;
        }

        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if entries.len() >= self.max_entries {
            let now = Instant::now();
            let before = entries.len();
            entries.retain(|_, entry| now < entry.expires_at);
            self.evicted
                .fetch_add((before - entries.len()) as u64, Ordering::Relaxed);

            if entries.len() >= self.max_entries {
                let to_remove = (self.max_entries / 10).max(1);
                let victims: Vec<String> =
                    entries.keys().take(to_remove).cloned().collect();
                for victim in victims {
                    entries.remove(&victim);
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                decision,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Clears every entry; used on policy or data reload.
    pub fn invalidate(&self) {
        if !self.enabled {
            return;
        }
        self.entries.lock().expect("cache lock poisoned").clear();
    }

    /// Cache key: `agent_id ":" tool ":" first8(sha256(sorted capabilities))`.
    pub fn compute_key(&self, input: &PolicyInput) -> String {
        let mut caps = input.agent.capabilities.clone();
        caps.sort();
        let digest = Sha256::digest(caps.join(",").as_bytes());
        let caps_hash = hex::encode(digest);
        format!(
            "{}:{}:{}",
            input.agent.id,
            input.request.tool,
            &caps_hash[..8]
        )
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().expect("cache lock poisoned").len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            evicted: self.evicted.load(Ordering::Relaxed),
            entries,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn remove_expired(&self) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        self.evicted
            .fetch_add((before - entries.len()) as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::InputBuilder;

    fn allow() -> PolicyDecision {
        PolicyDecision {
            allow: true,
            violations: Vec::new(),
            matched_rule: "ok".into(),
            obligations: Vec::new(),
        }
    }

    fn cache(ttl: Duration, max: usize) -> DecisionCache {
        DecisionCache::new(CacheConfig {
            enabled: true,
            ttl,
            max_entries: max,
        })
    }

    #[test]
    fn set_then_get_hits() {
        let cache = cache(Duration::from_secs(60), 10);
        cache.set("k".into(), allow());
        assert_eq!(cache.get("k"), Some(allow()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = cache(Duration::ZERO, 10);
        cache.set("k".into(), allow());
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn invalidate_clears_entries() {
        let cache = cache(Duration::from_secs(60), 10);
        cache.set("k".into(), allow());
        cache.invalidate();
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn capacity_evicts_a_share() {
        let cache = cache(Duration::from_secs(60), 10);
        for i in 0..10 {
            cache.set(format!("k{i}"), allow());
        }
        cache.set("overflow".into(), allow());

        let stats = cache.stats();
        assert!(stats.entries <= 10);
        assert!(stats.evicted >= 1);
        assert_eq!(cache.get("overflow"), Some(allow()));
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = DecisionCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.set("k".into(), allow());
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn key_is_stable_under_capability_order() {
        let cache = cache(Duration::from_secs(60), 10);
        let a = InputBuilder::new()
            .agent("agent", "A", &["write:files".into(), "read:files".into()])
            .request("tools/call", "read_file", Default::default())
            .build();
        let b = InputBuilder::new()
            .agent("agent", "A", &["read:files".into(), "write:files".into()])
            .request("tools/call", "read_file", Default::default())
            .build();

        let key_a = cache.compute_key(&a);
        let key_b = cache.compute_key(&b);
        assert_eq!(key_a, key_b);
        assert!(key_a.starts_with("agent:read_file:"));
        // agent id, tool, and an 8-hex-char capability digest
        let hash = key_a.rsplit(':').next().unwrap();
        assert_eq!(hash.len(), 8);
    }

    #[test]
    fn different_capabilities_produce_different_keys() {
        let cache = cache(Duration::from_secs(60), 10);
        let a = InputBuilder::new()
            .agent("agent", "A", &["read:files".into()])
            .request("tools/call", "read_file", Default::default())
            .build();
        let b = InputBuilder::new()
            .agent("agent", "A", &["write:files".into()])
            .request("tools/call", "read_file", Default::default())
            .build();
        assert_ne!(cache.compute_key(&a), cache.compute_key(&b));
    }
}
