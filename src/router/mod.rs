//! Per-request orchestration.
//!
//! [`Router::route`] drives one message through parse → classify →
//! evaluate → forward → reply → audit. The policy engine, upstream sender,
//! and audit sink are seams injected as trait objects so the router can be
//! exercised without a network or a database.
//!
//! Concurrency: `route` runs independently per inbound message; several
//! calls may be in flight on the same session. Shared session mutation goes
//! through the session's own synchronized methods.

pub mod context;
pub mod jsonrpc;
pub mod parser;
pub mod response;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::session::Session;
use context::{HandlerKind, LogLevel, RequestContext};
use jsonrpc::JsonRpcId;
use parser::Parser;
use response::ResponseBuilder;

/// Outcome of one policy evaluation, as the router consumes it.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub allow: bool,
    pub violations: Vec<String>,
    pub matched_rule: String,
    /// `"enforce"`, `"audit"`, or `"disabled"`.
    pub policy_mode: String,
    /// Side-effect hints, surfaced in order for the audit trail.
    pub obligations: Vec<crate::policy::Obligation>,
}

/// Evaluates policy for a classified request.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        session: &Session,
        ctx: &RequestContext,
    ) -> Result<Verdict, crate::policy::PolicyError>;
}

/// Forwards raw messages to the backend.
#[async_trait]
pub trait UpstreamSender: Send + Sync {
    /// Sends a request and awaits the correlated reply.
    async fn send(&self, message: &[u8]) -> Result<Vec<u8>, crate::upstream::UpstreamError>;

    /// Sends a notification; no reply will ever arrive.
    async fn send_notification(
        &self,
        message: &[u8],
    ) -> Result<(), crate::upstream::UpstreamError>;
}

/// Consumes one audit record per completed request. Implementations must
/// not block the request path.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(
        &self,
        session: &Session,
        ctx: &RequestContext,
        verdict: Option<&Verdict>,
        response: &[u8],
        latency: Duration,
    );
}

/// Hook applied to list results before the reply is emitted.
///
/// The shipped implementation passes results through unchanged; a
/// capability-aware filter can be plugged in here without touching the
/// state machine.
pub trait ResponseFilter: Send + Sync {
    fn filter(&self, ctx: &RequestContext, response: Vec<u8>) -> Vec<u8>;
}

/// Default list filter: pass through unchanged.
#[derive(Debug, Default)]
pub struct PassthroughFilter;

impl ResponseFilter for PassthroughFilter {
    fn filter(&self, _ctx: &RequestContext, response: Vec<u8>) -> Vec<u8> {
        response
    }
}

/// Message router. Cheap to share behind an `Arc`.
pub struct Router {
    parser: Parser,
    response: ResponseBuilder,
    evaluator: Option<Arc<dyn PolicyEvaluator>>,
    upstream: Option<Arc<dyn UpstreamSender>>,
    audit: Option<Arc<dyn AuditSink>>,
    filter: Arc<dyn ResponseFilter>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            response: ResponseBuilder::new(),
            evaluator: None,
            upstream: None,
            audit: None,
            filter: Arc::new(PassthroughFilter),
        }
    }

    pub fn with_policy_evaluator(mut self, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_upstream(mut self, upstream: Arc<dyn UpstreamSender>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_response_filter(mut self, filter: Arc<dyn ResponseFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Routes one inbound message and returns the serialized reply, or
    /// `None` when the message is a notification; notifications never
    /// receive a reply, even on error.
    pub async fn route(&self, session: &Arc<Session>, message: &[u8]) -> Option<Vec<u8>> {
        let start = Instant::now();

        // PARSE. Failures terminate without consulting policy, forwarding,
        // or auditing.
        let request = match self.parser.parse(message) {
            Ok(request) => request,
            Err(err) => {
                let reply = self.response.from_parse_error(&err, None);
                return Some(self.response.marshal(&reply));
            }
        };

        let is_notification = request.is_notification();
        let reply_id = request.id.clone().unwrap_or(JsonRpcId::Null);
        let mut ctx = RequestContext::new(request, start);

        // Method-specific extraction. Parameter errors echo the request id;
        // a broken notification simply vanishes.
        if let Err(err) = self.extract_details(&mut ctx) {
            if is_notification {
                return None;
            }
            let reply = self.response.from_parse_error(&err, Some(reply_id));
            return Some(self.response.marshal(&reply));
        }

        if ctx.agentfacts_token.is_none() {
            if let Some(params) = ctx.request.params.as_ref() {
                ctx.agentfacts_token = self.parser.extract_agentfacts(params);
            }
        }

        debug!(
            request_id = %ctx.request_id,
            session_id = %session.id,
            method = %ctx.method,
            tool = %ctx.tool,
            handler = ctx.config.handler.as_str(),
            "routing request"
        );

        // CLASSIFY → handler-specific path.
        let (response, verdict) = match ctx.config.handler {
            HandlerKind::Passthrough => (self.forward(session, &ctx, message).await, None),
            HandlerKind::Enforce => self.handle_enforce(session, &ctx, message, &reply_id).await,
            HandlerKind::Filter => {
                let forwarded = self.forward(session, &ctx, message).await;
                let filtered = forwarded.map(|bytes| self.filter.filter(&ctx, bytes));
                (
                    filtered,
                    Some(Verdict {
                        allow: true,
                        violations: Vec::new(),
                        matched_rule: "passthrough".to_string(),
                        policy_mode: "filter".to_string(),
                        obligations: Vec::new(),
                    }),
                )
            }
        };

        let latency = start.elapsed();

        // AUDIT runs after the reply is computed; its failure or loss never
        // affects the reply.
        if ctx.config.log_level != LogLevel::None {
            if let Some(audit) = &self.audit {
                let response_bytes = response.as_deref().unwrap_or_default();
                audit
                    .record(session, &ctx, verdict.as_ref(), response_bytes, latency)
                    .await;
            }
        }

        let allowed = verdict.as_ref().map(|v| v.allow).unwrap_or(true);
        debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            latency_ms = latency.as_secs_f64() * 1000.0,
            allowed,
            "request completed"
        );

        if is_notification {
            None
        } else {
            response
        }
    }

    /// EVALUATE → FORWARD for Enforce-classified methods.
    async fn handle_enforce(
        &self,
        session: &Arc<Session>,
        ctx: &RequestContext,
        message: &[u8],
        reply_id: &JsonRpcId,
    ) -> (Option<Vec<u8>>, Option<Verdict>) {
        let verdict = match &self.evaluator {
            Some(evaluator) => match evaluator.evaluate(session, ctx).await {
                Ok(verdict) => verdict,
                Err(err) => {
                    error!(
                        request_id = %ctx.request_id,
                        error = %err,
                        "policy evaluation error"
                    );
                    let reply = self
                        .response
                        .internal_error(reply_id.clone(), "Policy evaluation failed");
                    return (Some(self.response.marshal(&reply)), None);
                }
            },
            // No evaluator wired: treated as a disabled engine.
            None => Verdict {
                allow: true,
                violations: Vec::new(),
                matched_rule: "no_policy".to_string(),
                policy_mode: "disabled".to_string(),
                obligations: Vec::new(),
            },
        };

        if !verdict.obligations.is_empty() {
            // Obligations are recorded, not acted on; order is preserved
            // for the audit trail.
            debug!(
                request_id = %ctx.request_id,
                obligations = ?verdict.obligations.iter().map(|o| o.action.as_str()).collect::<Vec<_>>(),
                "policy obligations attached"
            );
        }

        if !verdict.allow {
            let snapshot = session.snapshot();
            if verdict.policy_mode == "enforce" {
                let reply = self.response.policy_violation(
                    reply_id.clone(),
                    ctx,
                    &snapshot.agent.id,
                    &snapshot.agent.capabilities,
                    &verdict.violations,
                    &verdict.policy_mode,
                );
                return (Some(self.response.marshal(&reply)), Some(verdict));
            }
            // Audit mode: record the violation but let the request through.
            warn!(
                request_id = %ctx.request_id,
                agent_id = %snapshot.agent.id,
                violations = ?verdict.violations,
                "policy violation (audit mode)"
            );
        }

        (self.forward(session, ctx, message).await, Some(verdict))
    }

    /// FORWARD. Without an upstream the request is echoed back, which keeps
    /// local testing possible. Upstream failures become `-32004` replies.
    async fn forward(
        &self,
        _session: &Arc<Session>,
        ctx: &RequestContext,
        message: &[u8],
    ) -> Option<Vec<u8>> {
        let Some(upstream) = &self.upstream else {
            return if ctx.request.is_notification() {
                None
            } else {
                Some(message.to_vec())
            };
        };

        if ctx.request.is_notification() {
            if let Err(err) = upstream.send_notification(message).await {
                warn!(request_id = %ctx.request_id, error = %err, "notification forward failed");
            }
            return None;
        }

        match upstream.send(message).await {
            Ok(response) => Some(response),
            Err(err) => {
                warn!(request_id = %ctx.request_id, error = %err, "upstream send failed");
                let id = ctx.request.id.clone().unwrap_or(JsonRpcId::Null);
                let reply = self.response.upstream_error(id, err.to_string());
                Some(self.response.marshal(&reply))
            }
        }
    }

    /// Fills in tool/resource details for methods that carry them.
    fn extract_details(&self, ctx: &mut RequestContext) -> Result<(), parser::ParseError> {
        match ctx.method.as_str() {
            "tools/call" => {
                let params = self.parser.parse_tool_call(&ctx.request)?;
                ctx.tool = params.name;
                ctx.arguments = params.arguments;
                ctx.agentfacts_token = params.agentfacts;
            }
            "resources/read" => {
                let params = self.parser.parse_resource_read(&ctx.request)?;
                ctx.resource_uri = params.uri;
                ctx.agentfacts_token = params.agentfacts;
            }
            _ => {}
        }
        Ok(())
    }

    /// Builds a serialized error reply outside the routing flow; used by
    /// transports for their own failures.
    pub fn build_error_response(&self, id: JsonRpcId, code: i32, message: &str) -> Vec<u8> {
        self.response.marshal(&self.response.error(id, code, message))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
