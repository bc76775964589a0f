//! JSON-RPC response construction.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use super::context::RequestContext;
use super::jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcResponse, CODE_INTERNAL_ERROR, CODE_INVALID_PARAMS,
    CODE_INVALID_REQUEST, CODE_METHOD_NOT_FOUND, CODE_PARSE_ERROR, CODE_POLICY_VIOLATION,
    CODE_UPSTREAM_ERROR,
};
use super::parser::ParseError;

/// Structured payload attached to policy-violation replies.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyViolationData {
    pub request_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub agent_capabilities: Vec<String>,
    pub violations: Vec<String>,
    pub policy_mode: String,
    pub timestamp: String,
}

/// Builds responses; stateless, shared by value.
#[derive(Debug, Default)]
pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn success(&self, id: JsonRpcId, result: Value) -> JsonRpcResponse {
        JsonRpcResponse::success(id, result)
    }

    pub fn error(&self, id: JsonRpcId, code: i32, message: impl Into<String>) -> JsonRpcResponse {
        JsonRpcResponse::error(
            id,
            JsonRpcError {
                code,
                message: message.into(),
                data: None,
            },
        )
    }

    pub fn error_with_data(
        &self,
        id: JsonRpcId,
        code: i32,
        message: impl Into<String>,
        data: Value,
    ) -> JsonRpcResponse {
        JsonRpcResponse::error(
            id,
            JsonRpcError {
                code,
                message: message.into(),
                data: Some(data),
            },
        )
    }

    pub fn parse_error(&self, message: impl Into<String>) -> JsonRpcResponse {
        self.error(JsonRpcId::Null, CODE_PARSE_ERROR, message)
    }

    pub fn invalid_request(&self, id: JsonRpcId, message: impl Into<String>) -> JsonRpcResponse {
        self.error(id, CODE_INVALID_REQUEST, message)
    }

    pub fn method_not_found(&self, id: JsonRpcId, method: &str) -> JsonRpcResponse {
        self.error(id, CODE_METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(&self, id: JsonRpcId, message: impl Into<String>) -> JsonRpcResponse {
        self.error(id, CODE_INVALID_PARAMS, message)
    }

    pub fn internal_error(&self, id: JsonRpcId, message: impl Into<String>) -> JsonRpcResponse {
        self.error(id, CODE_INTERNAL_ERROR, message)
    }

    pub fn upstream_error(&self, id: JsonRpcId, message: impl Into<String>) -> JsonRpcResponse {
        self.error(id, CODE_UPSTREAM_ERROR, message)
    }

    /// Builds the blocked-request reply. The user-visible message is the
    /// first violation when present, else a generic marker.
    pub fn policy_violation(
        &self,
        id: JsonRpcId,
        ctx: &RequestContext,
        agent_id: &str,
        capabilities: &[String],
        violations: &[String],
        policy_mode: &str,
    ) -> JsonRpcResponse {
        let data = PolicyViolationData {
            request_id: ctx.request_id.clone(),
            agent_id: agent_id.to_string(),
            tool: ctx.tool.clone(),
            agent_capabilities: capabilities.to_vec(),
            violations: violations.to_vec(),
            policy_mode: policy_mode.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        };

        let message = violations
            .first()
            .cloned()
            .unwrap_or_else(|| "Policy violation".to_string());

        self.error_with_data(
            id,
            CODE_POLICY_VIOLATION,
            message,
            serde_json::to_value(data).unwrap_or(Value::Null),
        )
    }

    pub fn from_parse_error(&self, err: &ParseError, id: Option<JsonRpcId>) -> JsonRpcResponse {
        self.error(id.unwrap_or(JsonRpcId::Null), err.code, err.message.clone())
    }

    /// Serializes a response. Construction guarantees serializable content,
    /// so failure here indicates a logic bug; callers get a minimal internal
    /// error body rather than a panic.
    pub fn marshal(&self, response: &JsonRpcResponse) -> Vec<u8> {
        serde_json::to_vec(response).unwrap_or_else(|_| {
            br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#
                .to_vec()
        })
    }
}
