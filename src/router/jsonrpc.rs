//! JSON-RPC 2.0 wire types.
//!
//! Requests distinguish an absent `id` (a notification that must never
//! receive a reply) from an explicit `"id": null` (a request whose reply
//! echoes the null). Responses always carry an `id` field, serialized as
//! `null` when the request id is unknown.
//!
//! # Security note
//!
//! These types decode untrusted input. Size limits are enforced by the
//! transports before bytes reach this module.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Protocol version constant; the only accepted value on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC 2.0 error codes.
pub const CODE_PARSE_ERROR: i32 = -32700;
pub const CODE_INVALID_REQUEST: i32 = -32600;
pub const CODE_METHOD_NOT_FOUND: i32 = -32601;
pub const CODE_INVALID_PARAMS: i32 = -32602;
pub const CODE_INTERNAL_ERROR: i32 = -32603;

// Gateway-specific codes.
pub const CODE_POLICY_VIOLATION: i32 = -32001;
pub const CODE_IDENTITY_ERROR: i32 = -32002;
pub const CODE_RATE_LIMITED: i32 = -32003;
pub const CODE_UPSTREAM_ERROR: i32 = -32004;

/// JSON-RPC 2.0 request id.
///
/// The wire allows string, integer, or null ids. The exact type is preserved
/// so a reply carries the same id the request sent; `"id": 1` is never
/// coerced to `"id": "1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonRpcId {
    /// Integer id (`"id": 1`).
    Number(i64),
    /// String id (`"id": "abc-123"`).
    String(String),
    /// Explicit null id. Valid per the protocol, though unusual.
    Null,
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Number(n) => serializer.serialize_i64(*n),
            JsonRpcId::String(s) => serializer.serialize_str(s),
            JsonRpcId::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(JsonRpcId::Number)
                .ok_or_else(|| serde::de::Error::custom("JSON-RPC id must be an integer")),
            Value::String(s) => Ok(JsonRpcId::String(s)),
            Value::Null => Ok(JsonRpcId::Null),
            _ => Err(serde::de::Error::custom(
                "JSON-RPC id must be string, integer, or null",
            )),
        }
    }
}

/// Distinguishes a field that was absent from one present with value `null`.
#[derive(Debug, Clone, Default)]
enum MaybeNull<T> {
    #[default]
    Absent,
    Null,
    Present(T),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for MaybeNull<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            Ok(MaybeNull::Null)
        } else {
            T::deserialize(value)
                .map(MaybeNull::Present)
                .map_err(serde::de::Error::custom)
        }
    }
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<JsonRpcId>, D::Error>
where
    D: Deserializer<'de>,
{
    match MaybeNull::deserialize(deserializer)? {
        MaybeNull::Absent => Ok(None),
        MaybeNull::Null => Ok(Some(JsonRpcId::Null)),
        MaybeNull::Present(id) => Ok(Some(id)),
    }
}

/// JSON-RPC 2.0 request envelope.
///
/// All fields except `method` are optional at the serde level so that the
/// parser can produce precise error codes for malformed envelopes.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    /// Must equal `"2.0"`; validated by the parser.
    #[serde(default)]
    pub jsonrpc: Option<String>,
    /// `None` means the request is a notification.
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub id: Option<JsonRpcId>,
    #[serde(default)]
    pub method: Option<String>,
    /// Opaque params payload; method-specific extraction happens later.
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// A notification has no `id` and must never receive a reply.
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 response envelope.
///
/// `id` is always serialized; error replies for unparseable input carry
/// `"id": null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: JsonRpcId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: JsonRpcId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_id_type_preserved() {
        let json = serde_json::to_string(&JsonRpcId::Number(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn string_id_type_preserved() {
        let json = serde_json::to_string(&JsonRpcId::String("abc-123".into())).unwrap();
        assert_eq!(json, "\"abc-123\"");
    }

    #[test]
    fn null_id_serializes_as_null() {
        let json = serde_json::to_string(&JsonRpcId::Null).unwrap();
        assert_eq!(json, "null");
    }

    #[test]
    fn float_id_rejected() {
        let result: Result<JsonRpcId, _> = serde_json::from_str("1.5");
        assert!(result.is_err());
    }

    #[test]
    fn bool_id_rejected() {
        let result: Result<JsonRpcId, _> = serde_json::from_str("true");
        assert!(result.is_err());
    }

    #[test]
    fn missing_id_is_notification() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert!(req.is_notification());
        assert_eq!(req.id, None);
    }

    #[test]
    fn explicit_null_id_is_not_notification() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap();
        assert!(!req.is_notification());
        assert_eq!(req.id, Some(JsonRpcId::Null));
    }

    #[test]
    fn error_response_always_carries_id() {
        let resp = JsonRpcResponse::error(
            JsonRpcId::Null,
            JsonRpcError {
                code: CODE_PARSE_ERROR,
                message: "Parse error".into(),
                data: None,
            },
        );
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"id\":null"));
        assert!(json.contains("-32700"));
        assert!(!json.contains("\"result\""));
    }

    #[test]
    fn success_response_roundtrip() {
        let resp =
            JsonRpcResponse::success(JsonRpcId::Number(7), serde_json::json!({"ok": true}));
        let bytes = serde_json::to_vec(&resp).unwrap();
        let back: JsonRpcResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, JsonRpcId::Number(7));
        assert_eq!(back.result, Some(serde_json::json!({"ok": true})));
        assert!(back.error.is_none());
    }
}
