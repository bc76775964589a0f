//! Embedded Rego policy engine.
//!
//! Rule modules compile into a [`regorus`] engine snapshot held behind an
//! atomic swap, so reloads never stall in-flight evaluations: each
//! evaluation clones the current snapshot, sets its input, and queries
//! `data.mcp.policy.decision`. Replacing the data document invalidates the
//! decision cache and recompiles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use serde_json::Value;
use tracing::{debug, info};

use super::cache::{CacheConfig, CacheStats, DecisionCache, CACHE_TIER};
use super::{parse_decision, PolicyDecision, PolicyError, PolicyInput};

/// Rego query every evaluation runs.
const DECISION_QUERY: &str = "data.mcp.policy.decision";

/// Enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Enforce,
    Audit,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Enforce => "enforce",
            Mode::Audit => "audit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub enabled: bool,
    pub mode: Mode,
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: Mode::Enforce,
            cache: CacheConfig::default(),
        }
    }
}

/// Module and data sources kept for recompilation.
#[derive(Default)]
struct Sources {
    modules: BTreeMap<String, String>,
    data: Option<Value>,
}

/// Full result of one evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub decision: PolicyDecision,
    pub input: PolicyInput,
    pub eval_time: Duration,
    pub cache_hit: bool,
    /// Tier that served a hit (empty on miss).
    pub cache_tier: &'static str,
    pub policy_mode: Mode,
}

/// Aggregate engine counters.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub evaluations: u64,
    pub eval_errors: u64,
    pub avg_eval_time_ms: f64,
    pub cache: CacheStats,
}

/// Policy engine; share behind an `Arc`.
pub struct Engine {
    sources: Mutex<Sources>,
    compiled: ArcSwapOption<regorus::Engine>,
    cache: Arc<DecisionCache>,
    mode: Mode,
    enabled: bool,
    evaluations: AtomicU64,
    eval_errors: AtomicU64,
    total_eval_ns: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            sources: Mutex::new(Sources::default()),
            compiled: ArcSwapOption::empty(),
            cache: Arc::new(DecisionCache::new(config.cache)),
            mode: config.mode,
            enabled: config.enabled,
            evaluations: AtomicU64::new(0),
            eval_errors: AtomicU64::new(0),
            total_eval_ns: AtomicU64::new(0),
        }
    }

    /// Compiles and installs a set of named rule modules.
    pub fn load_modules(&self, modules: BTreeMap<String, String>) -> Result<(), PolicyError> {
        let mut sources = self.sources.lock().expect("sources lock poisoned");
        sources.modules = modules;
        self.compile(&sources)?;
        info!(modules = sources.modules.len(), "policy modules loaded");
        Ok(())
    }

    /// Replaces the data document. Invalidates the decision cache and
    /// recompiles if modules are present.
    pub fn replace_data(&self, data: Value) -> Result<(), PolicyError> {
        let mut sources = self.sources.lock().expect("sources lock poisoned");
        sources.data = Some(data);
        self.cache.invalidate();
        if !sources.modules.is_empty() {
            self.compile(&sources)?;
        }
        Ok(())
    }

    /// Builds a fresh snapshot from the current sources and swaps it in.
    /// Called with the sources lock held.
    fn compile(&self, sources: &Sources) -> Result<(), PolicyError> {
        if sources.modules.is_empty() {
            self.compiled.store(None);
            return Ok(());
        }

        let mut engine = regorus::Engine::new();
        for (name, content) in &sources.modules {
            engine
                .add_policy(name.clone(), content.clone())
                .map_err(|e| PolicyError::Compile {
                    details: format!("{name}: {e}"),
                })?;
        }

        if let Some(data) = &sources.data {
            let json = serde_json::to_string(data).map_err(|e| PolicyError::Data {
                details: e.to_string(),
            })?;
            engine.add_data_json(&json).map_err(|e| PolicyError::Data {
                details: e.to_string(),
            })?;
        }

        self.compiled.store(Some(Arc::new(engine)));
        Ok(())
    }

    /// Evaluates one input and returns the decision with cache and timing
    /// detail. A disabled engine short-circuits to allow.
    pub fn evaluate(&self, input: PolicyInput) -> Result<EvaluationResult, PolicyError> {
        let start = Instant::now();

        if !self.enabled {
            return Ok(EvaluationResult {
                decision: PolicyDecision {
                    allow: true,
                    violations: Vec::new(),
                    matched_rule: "policy_disabled".to_string(),
                    obligations: Vec::new(),
                },
                input,
                eval_time: start.elapsed(),
                cache_hit: false,
                cache_tier: "",
                policy_mode: self.mode,
            });
        }

        let key = self.cache.compute_key(&input);
        if let Some(decision) = self.cache.get(&key) {
            return Ok(EvaluationResult {
                decision,
                input,
                eval_time: start.elapsed(),
                cache_hit: true,
                cache_tier: CACHE_TIER,
                policy_mode: self.mode,
            });
        }

        let decision = match self.evaluate_uncached(&input) {
            Ok(decision) => decision,
            Err(err) => {
                self.eval_errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        let eval_time = start.elapsed();
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        self.total_eval_ns
            .fetch_add(eval_time.as_nanos() as u64, Ordering::Relaxed);

        self.cache.set(key, decision.clone());

        Ok(EvaluationResult {
            decision,
            input,
            eval_time,
            cache_hit: false,
            cache_tier: "",
            policy_mode: self.mode,
        })
    }

    fn evaluate_uncached(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError> {
        let Some(snapshot) = self.compiled.load_full() else {
            return Err(PolicyError::Evaluation {
                details: "no policy modules loaded".to_string(),
            });
        };

        let input_json = serde_json::to_string(input).map_err(|e| PolicyError::Evaluation {
            details: format!("failed to serialize input: {e}"),
        })?;

        // Snapshots are immutable once installed; evaluation needs a
        // mutable engine, so each call works on its own clone.
        let mut engine = (*snapshot).clone();
        engine
            .set_input_json(&input_json)
            .map_err(|e| PolicyError::Evaluation {
                details: format!("invalid input: {e}"),
            })?;

        let results = engine
            .eval_query(DECISION_QUERY.to_string(), false)
            .map_err(|e| PolicyError::Evaluation {
                details: e.to_string(),
            })?;

        let results = serde_json::to_value(&results).map_err(|e| PolicyError::Evaluation {
            details: e.to_string(),
        })?;

        let Some(value) = results
            .get("result")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
            .and_then(|r| r.get("expressions"))
            .and_then(Value::as_array)
            .and_then(|e| e.first())
            .and_then(|e| e.get("value"))
        else {
            debug!("policy query returned no result");
            return Ok(PolicyDecision::no_result());
        };

        parse_decision(value)
    }

    /// Convenience wrapper: in enforce mode the bool tracks the decision;
    /// in audit mode it is always true while the decision is still returned
    /// for logging.
    pub fn is_allowed(&self, input: PolicyInput) -> Result<(bool, EvaluationResult), PolicyError> {
        let result = self.evaluate(input)?;
        let allowed = match self.mode {
            Mode::Audit => true,
            Mode::Enforce => result.decision.allow,
        };
        Ok((allowed, result))
    }

    /// Disabled engines are always ready; enabled ones need at least one
    /// compiled module.
    pub fn is_ready(&self) -> bool {
        !self.enabled || self.compiled.load().is_some()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    pub fn stats(&self) -> EngineStats {
        let evaluations = self.evaluations.load(Ordering::Relaxed);
        let total_ns = self.total_eval_ns.load(Ordering::Relaxed);
        EngineStats {
            evaluations,
            eval_errors: self.eval_errors.load(Ordering::Relaxed),
            avg_eval_time_ms: if evaluations > 0 {
                total_ns as f64 / evaluations as f64 / 1e6
            } else {
                0.0
            },
            cache: self.cache.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::InputBuilder;

    const CAPABILITY_POLICY: &str = r#"
package mcp.policy

import rego.v1

default decision := {
    "allow": false,
    "matched_rule": "default_deny",
    "violations": ["No rule matched"],
}

decision := {"allow": true, "matched_rule": "read_allowed", "violations": []} if {
    input.request.tool == "read_file"
    "read:files" in input.agent.capabilities
}

decision := {
    "allow": false,
    "matched_rule": "missing_capability",
    "violations": [sprintf("Agent '%s' lacks capability 'read:files' for tool '%s'", [input.agent.id, input.request.tool])],
} if {
    input.request.tool == "read_file"
    not "read:files" in input.agent.capabilities
}
"#;

    fn engine_with_policy(mode: Mode) -> Engine {
        let engine = Engine::new(EngineConfig {
            enabled: true,
            mode,
            cache: CacheConfig::default(),
        });
        engine
            .load_modules(BTreeMap::from([(
                "capability.rego".to_string(),
                CAPABILITY_POLICY.to_string(),
            )]))
            .unwrap();
        engine
    }

    fn read_input(capabilities: &[&str]) -> PolicyInput {
        let caps: Vec<String> = capabilities.iter().map(|s| s.to_string()).collect();
        InputBuilder::new()
            .agent("agent-a", "Agent A", &caps)
            .request("tools/call", "read_file", Default::default())
            .build()
    }

    #[test]
    fn disabled_engine_allows_everything() {
        let engine = Engine::new(EngineConfig {
            enabled: false,
            ..Default::default()
        });
        let result = engine.evaluate(read_input(&[])).unwrap();
        assert!(result.decision.allow);
        assert_eq!(result.decision.matched_rule, "policy_disabled");
        assert!(engine.is_ready());
    }

    #[test]
    fn enabled_engine_not_ready_until_modules_load() {
        let engine = Engine::new(EngineConfig::default());
        assert!(!engine.is_ready());
        engine
            .load_modules(BTreeMap::from([(
                "p.rego".to_string(),
                CAPABILITY_POLICY.to_string(),
            )]))
            .unwrap();
        assert!(engine.is_ready());
    }

    #[test]
    fn capability_grant_allows() {
        let engine = engine_with_policy(Mode::Enforce);
        let result = engine.evaluate(read_input(&["read:files"])).unwrap();
        assert!(result.decision.allow);
        assert_eq!(result.decision.matched_rule, "read_allowed");
    }

    #[test]
    fn missing_capability_denies_with_violation() {
        let engine = engine_with_policy(Mode::Enforce);
        let result = engine.evaluate(read_input(&["exec:tools"])).unwrap();
        assert!(!result.decision.allow);
        assert_eq!(result.decision.matched_rule, "missing_capability");
        assert_eq!(
            result.decision.violations[0],
            "Agent 'agent-a' lacks capability 'read:files' for tool 'read_file'"
        );
    }

    #[test]
    fn repeated_evaluation_hits_cache_with_equal_decision() {
        let engine = engine_with_policy(Mode::Enforce);
        let first = engine.evaluate(read_input(&["read:files"])).unwrap();
        assert!(!first.cache_hit);

        let second = engine.evaluate(read_input(&["read:files"])).unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.cache_tier, "L2");
        assert_eq!(first.decision, second.decision);
    }

    #[test]
    fn replace_data_invalidates_cache() {
        let engine = engine_with_policy(Mode::Enforce);
        let _ = engine.evaluate(read_input(&["read:files"])).unwrap();
        assert!(engine.evaluate(read_input(&["read:files"])).unwrap().cache_hit);

        engine
            .replace_data(serde_json::json!({"blocked_tools": []}))
            .unwrap();

        let after = engine.evaluate(read_input(&["read:files"])).unwrap();
        assert!(!after.cache_hit);
        // Stable rules: the decision itself is unchanged.
        assert!(after.decision.allow);
    }

    #[test]
    fn audit_mode_allows_but_reports_decision() {
        let engine = engine_with_policy(Mode::Audit);
        let (allowed, result) = engine.is_allowed(read_input(&[])).unwrap();
        assert!(allowed);
        assert!(!result.decision.allow);
        assert!(!result.decision.violations.is_empty());
    }

    #[test]
    fn enforce_mode_tracks_decision() {
        let engine = engine_with_policy(Mode::Enforce);
        let (allowed, _) = engine.is_allowed(read_input(&[])).unwrap();
        assert!(!allowed);
        let (allowed, _) = engine.is_allowed(read_input(&["read:files"])).unwrap();
        assert!(allowed);
    }

    #[test]
    fn data_document_is_visible_to_rules() {
        let engine = Engine::new(EngineConfig::default());
        engine
            .replace_data(serde_json::json!({"blocked_tools": ["shell_exec"]}))
            .unwrap();
        engine
            .load_modules(BTreeMap::from([(
                "blocklist.rego".to_string(),
                r#"
package mcp.policy

import rego.v1

default decision := {"allow": true, "matched_rule": "not_blocked", "violations": []}

decision := {
    "allow": false,
    "matched_rule": "blocked_tool",
    "violations": [sprintf("Tool '%s' is blocked", [input.request.tool])],
} if {
    input.request.tool in data.blocked_tools
}
"#
                .to_string(),
            )]))
            .unwrap();

        let input = InputBuilder::new()
            .agent("a", "A", &[])
            .request("tools/call", "shell_exec", Default::default())
            .build();
        let result = engine.evaluate(input).unwrap();
        assert!(!result.decision.allow);
        assert_eq!(result.decision.matched_rule, "blocked_tool");
    }

    #[test]
    fn bad_module_fails_compile() {
        let engine = Engine::new(EngineConfig::default());
        let err = engine
            .load_modules(BTreeMap::from([(
                "broken.rego".to_string(),
                "this is not rego".to_string(),
            )]))
            .unwrap_err();
        assert!(matches!(err, PolicyError::Compile { .. }));
    }

    #[test]
    fn evaluating_without_modules_is_an_error() {
        let engine = Engine::new(EngineConfig::default());
        let err = engine.evaluate(read_input(&[])).unwrap_err();
        assert!(matches!(err, PolicyError::Evaluation { .. }));
    }

    #[test]
    fn stats_track_evaluations() {
        let engine = engine_with_policy(Mode::Enforce);
        let _ = engine.evaluate(read_input(&["read:files"])).unwrap();
        let _ = engine.evaluate(read_input(&["read:files"])).unwrap(); // cache hit

        let stats = engine.stats();
        assert_eq!(stats.evaluations, 1);
        assert_eq!(stats.cache.hits, 1);
    }
}
