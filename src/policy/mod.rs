//! Policy evaluation types.
//!
//! The engine consumes a structured [`PolicyInput`] and produces a
//! [`PolicyDecision`]. Rule modules are a black box to the rest of the
//! gateway; only the decision document's shape is a contract.

pub mod cache;
pub mod engine;
pub mod loader;

pub use cache::{CacheConfig, CacheStats, DecisionCache};
pub use engine::{Engine, EngineConfig, EngineStats, EvaluationResult, Mode};
pub use loader::Loader;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Policy subsystem errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    /// Rule modules failed to compile.
    #[error("failed to compile policies: {details}")]
    Compile { details: String },
    /// The data document was rejected.
    #[error("invalid policy data: {details}")]
    Data { details: String },
    /// Modules or data could not be read from disk.
    #[error("failed to load policies: {details}")]
    Load { details: String },
    /// Evaluation itself failed.
    #[error("policy evaluation failed: {details}")]
    Evaluation { details: String },
}

/// Structured view of one request handed to the engine.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    pub agent: AgentBlock,
    pub request: RequestBlock,
    pub session: SessionBlock,
    pub identity: IdentityBlock,
    pub context: ContextBlock,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentBlock {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub model: String,
    pub publisher: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestBlock {
    pub method: String,
    pub tool: String,
    pub arguments: Map<String, Value>,
    pub intent: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionBlock {
    pub id: String,
    pub request_count: u64,
    pub started_at: DateTime<Utc>,
    pub cumulative_reads: u64,
    pub cumulative_writes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityBlock {
    pub verified: bool,
    pub did: String,
    pub signature_alg: String,
    pub issued_at: DateTime<Utc>,
    pub has_log_proof: bool,
}

impl Default for IdentityBlock {
    fn default() -> Self {
        Self {
            verified: false,
            did: String::new(),
            signature_alg: String::new(),
            issued_at: Utc::now(),
            has_log_proof: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextBlock {
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub environment: String,
    pub proxy_region: String,
}

/// Output of one policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub allow: bool,
    pub violations: Vec<String>,
    pub matched_rule: String,
    pub obligations: Vec<Obligation>,
}

impl PolicyDecision {
    /// The normalized decision when the engine yields nothing.
    pub fn no_result() -> Self {
        Self {
            allow: false,
            violations: vec!["No policy decision returned".to_string()],
            matched_rule: "no_result".to_string(),
            obligations: Vec::new(),
        }
    }
}

/// Side-effect hint attached to a decision (`log`, `alert`, `rate_limit`).
/// Ordering is preserved from the rule output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obligation {
    pub action: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Parses the engine's raw decision document.
///
/// Required `allow: bool` (missing defaults to deny); `violations`,
/// `matched_rule`, and `obligations` are optional. Unexpected fields and
/// non-string violation entries are ignored.
pub fn parse_decision(value: &Value) -> Result<PolicyDecision, PolicyError> {
    let map = value.as_object().ok_or_else(|| PolicyError::Evaluation {
        details: format!("unexpected decision type: {value}"),
    })?;

    let allow = map.get("allow").and_then(Value::as_bool).unwrap_or(false);

    let violations = map
        .get("violations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let matched_rule = map
        .get("matched_rule")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let obligations = map
        .get("obligations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let obj = item.as_object()?;
                    let action = obj.get("action")?.as_str()?.to_string();
                    let params = obj
                        .get("params")
                        .and_then(Value::as_object)
                        .map(|p| {
                            p.iter()
                                .filter_map(|(k, v)| {
                                    v.as_str().map(|s| (k.clone(), s.to_string()))
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    Some(Obligation { action, params })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(PolicyDecision {
        allow,
        violations,
        matched_rule,
        obligations,
    })
}

/// Incremental construction of a [`PolicyInput`].
#[derive(Debug)]
pub struct InputBuilder {
    input: PolicyInput,
}

impl InputBuilder {
    pub fn new() -> Self {
        Self {
            input: PolicyInput {
                agent: AgentBlock::default(),
                request: RequestBlock::default(),
                session: SessionBlock {
                    id: String::new(),
                    request_count: 0,
                    started_at: Utc::now(),
                    cumulative_reads: 0,
                    cumulative_writes: 0,
                },
                identity: IdentityBlock::default(),
                context: ContextBlock {
                    timestamp: Utc::now(),
                    source_ip: String::new(),
                    environment: String::new(),
                    proxy_region: String::new(),
                },
            },
        }
    }

    pub fn agent(mut self, id: &str, name: &str, capabilities: &[String]) -> Self {
        self.input.agent.id = id.to_string();
        self.input.agent.name = name.to_string();
        self.input.agent.capabilities = capabilities.to_vec();
        self
    }

    pub fn agent_details(mut self, model: &str, publisher: &str, tags: &[String]) -> Self {
        self.input.agent.model = model.to_string();
        self.input.agent.publisher = publisher.to_string();
        self.input.agent.tags = tags.to_vec();
        self
    }

    pub fn request(mut self, method: &str, tool: &str, arguments: Map<String, Value>) -> Self {
        self.input.request.method = method.to_string();
        self.input.request.tool = tool.to_string();
        self.input.request.arguments = arguments;
        self
    }

    pub fn session(
        mut self,
        id: &str,
        request_count: u64,
        started_at: DateTime<Utc>,
        reads: u64,
        writes: u64,
    ) -> Self {
        self.input.session.id = id.to_string();
        self.input.session.request_count = request_count;
        self.input.session.started_at = started_at;
        self.input.session.cumulative_reads = reads;
        self.input.session.cumulative_writes = writes;
        self
    }

    pub fn identity(mut self, verified: bool, did: &str) -> Self {
        self.input.identity.verified = verified;
        self.input.identity.did = did.to_string();
        self
    }

    pub fn environment(mut self, source_ip: &str, environment: &str, region: &str) -> Self {
        self.input.context.source_ip = source_ip.to_string();
        self.input.context.environment = environment.to_string();
        self.input.context.proxy_region = region.to_string();
        self
    }

    pub fn build(self) -> PolicyInput {
        self.input
    }
}

impl Default for InputBuilder {
    fn default() -> Self {
        Self::new()
    }
}
