//! JSON-RPC envelope parsing and validation.
//!
//! The pipeline rejects, in order: empty input, malformed JSON, a wrong
//! protocol version, and an invalid method name. Method-specific parameter
//! extraction (`tools/call`, `resources/read`) happens after the envelope
//! is accepted so that those failures can echo the request id.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::jsonrpc::{
    JsonRpcRequest, CODE_INVALID_PARAMS, CODE_INVALID_REQUEST, CODE_PARSE_ERROR,
};

/// Method names longer than this are rejected outright.
const MAX_METHOD_LENGTH: usize = 256;

/// Method names must be identifier-like: a letter followed by letters,
/// digits, underscores, or path separators. Keeps log lines injection-free.
static METHOD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z][A-Za-z0-9_/]*$").expect("static pattern"));

/// A validation failure carrying the JSON-RPC code to reply with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    pub code: i32,
    pub message: String,
}

impl ParseError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Extracted `tools/call` parameters.
#[derive(Debug)]
pub struct ToolCallParams {
    pub name: String,
    pub arguments: Option<serde_json::Map<String, Value>>,
    pub agentfacts: Option<String>,
}

/// Extracted `resources/read` parameters.
#[derive(Debug)]
pub struct ResourceReadParams {
    pub uri: String,
    pub agentfacts: Option<String>,
}

/// Stateless message parser.
#[derive(Debug, Default)]
pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Parses and validates a JSON-RPC 2.0 envelope.
    pub fn parse(&self, data: &[u8]) -> Result<JsonRpcRequest, ParseError> {
        if data.is_empty() {
            return Err(ParseError::new(CODE_PARSE_ERROR, "Empty message"));
        }

        let request: JsonRpcRequest = serde_json::from_slice(data)
            .map_err(|e| ParseError::new(CODE_PARSE_ERROR, format!("Invalid JSON: {e}")))?;

        match request.jsonrpc.as_deref() {
            Some("2.0") => {}
            Some(other) => {
                return Err(ParseError::new(
                    CODE_INVALID_REQUEST,
                    format!("Invalid JSON-RPC version: expected '2.0', got '{other}'"),
                ));
            }
            None => {
                return Err(ParseError::new(
                    CODE_INVALID_REQUEST,
                    "Missing 'jsonrpc' field",
                ));
            }
        }

        let method = match request.method.as_deref() {
            Some(m) if !m.is_empty() => m,
            _ => return Err(ParseError::new(CODE_INVALID_REQUEST, "Missing 'method' field")),
        };

        if method.len() > MAX_METHOD_LENGTH {
            return Err(ParseError::new(CODE_INVALID_REQUEST, "Method name too long"));
        }
        if !METHOD_PATTERN.is_match(method) {
            return Err(ParseError::new(
                CODE_INVALID_REQUEST,
                "Invalid method name format",
            ));
        }
        if method.starts_with("rpc.") {
            return Err(ParseError::new(
                CODE_INVALID_REQUEST,
                "Method names starting with 'rpc.' are reserved",
            ));
        }

        Ok(request)
    }

    /// Extracts `tools/call` parameters. `name` is required and non-empty;
    /// `arguments` is an optional map.
    pub fn parse_tool_call(&self, request: &JsonRpcRequest) -> Result<ToolCallParams, ParseError> {
        let params = request
            .params
            .as_ref()
            .ok_or_else(|| ParseError::new(CODE_INVALID_PARAMS, "Missing 'params' for tools/call"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                ParseError::new(CODE_INVALID_PARAMS, "Missing 'name' in tools/call params")
            })?
            .to_string();

        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(_) => {
                return Err(ParseError::new(
                    CODE_INVALID_PARAMS,
                    "'arguments' must be an object",
                ));
            }
        };

        Ok(ToolCallParams {
            name,
            arguments,
            agentfacts: self.extract_agentfacts(params),
        })
    }

    /// Extracts `resources/read` parameters. `uri` is required.
    pub fn parse_resource_read(
        &self,
        request: &JsonRpcRequest,
    ) -> Result<ResourceReadParams, ParseError> {
        let params = request.params.as_ref().ok_or_else(|| {
            ParseError::new(CODE_INVALID_PARAMS, "Missing 'params' for resources/read")
        })?;

        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                ParseError::new(CODE_INVALID_PARAMS, "Missing 'uri' in resources/read params")
            })?
            .to_string();

        Ok(ResourceReadParams {
            uri,
            agentfacts: self.extract_agentfacts(params),
        })
    }

    /// Best-effort `_meta.agentfacts` extraction. A malformed `_meta` block
    /// is ignored rather than failing the request.
    pub fn extract_agentfacts(&self, params: &Value) -> Option<String> {
        params
            .get("_meta")?
            .get("agentfacts")?
            .as_str()
            .map(String::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::jsonrpc::JsonRpcId;

    fn parser() -> Parser {
        Parser::new()
    }

    #[test]
    fn valid_request_parses() {
        let req = parser()
            .parse(br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"t"}}"#)
            .unwrap();
        assert_eq!(req.id, Some(JsonRpcId::Number(1)));
        assert_eq!(req.method.as_deref(), Some("tools/call"));
    }

    #[test]
    fn empty_input_is_parse_error() {
        let err = parser().parse(b"").unwrap_err();
        assert_eq!(err.code, CODE_PARSE_ERROR);
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = parser().parse(b"{not json").unwrap_err();
        assert_eq!(err.code, CODE_PARSE_ERROR);
    }

    #[test]
    fn wrong_version_is_invalid_request() {
        let err = parser()
            .parse(br#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#)
            .unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
    }

    #[test]
    fn missing_version_is_invalid_request() {
        let err = parser().parse(br#"{"id":1,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
        assert!(err.message.contains("jsonrpc"));
    }

    #[test]
    fn missing_method_is_invalid_request() {
        let err = parser().parse(br#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
        assert!(err.message.contains("method"));
    }

    #[test]
    fn method_at_max_length_accepted() {
        let method = "a".repeat(256);
        let body = format!(r#"{{"jsonrpc":"2.0","id":1,"method":"{method}"}}"#);
        assert!(parser().parse(body.as_bytes()).is_ok());
    }

    #[test]
    fn method_over_max_length_rejected() {
        let method = "a".repeat(257);
        let body = format!(r#"{{"jsonrpc":"2.0","id":1,"method":"{method}"}}"#);
        let err = parser().parse(body.as_bytes()).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
    }

    #[test]
    fn method_with_bad_characters_rejected() {
        for method in ["1abc", "a b", "a\nb", "a.b", "-x"] {
            let body = format!(r#"{{"jsonrpc":"2.0","id":1,"method":"{method}"}}"#);
            let err = parser().parse(body.as_bytes()).unwrap_err();
            assert_eq!(err.code, CODE_INVALID_REQUEST, "method {method:?}");
        }
    }

    #[test]
    fn rpc_prefixed_method_rejected() {
        let err = parser()
            .parse(br#"{"jsonrpc":"2.0","id":1,"method":"rpc.reserved"}"#)
            .unwrap_err();
        assert_eq!(err.code, CODE_INVALID_REQUEST);
        // Non-reserved names sharing the prefix letters are fine.
        assert!(parser()
            .parse(br#"{"jsonrpc":"2.0","id":1,"method":"rpcx"}"#)
            .is_ok());
    }

    #[test]
    fn tool_call_params_extracted() {
        let req = parser()
            .parse(
                br#"{"jsonrpc":"2.0","id":1,"method":"tools/call",
                     "params":{"name":"read_file","arguments":{"path":"/tmp/x"},
                               "_meta":{"agentfacts":"tok"}}}"#,
            )
            .unwrap();
        let params = parser().parse_tool_call(&req).unwrap();
        assert_eq!(params.name, "read_file");
        assert_eq!(
            params.arguments.unwrap().get("path").unwrap(),
            &serde_json::json!("/tmp/x")
        );
        assert_eq!(params.agentfacts.as_deref(), Some("tok"));
    }

    #[test]
    fn tool_call_missing_name_rejected() {
        let req = parser()
            .parse(br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{}}"#)
            .unwrap();
        let err = parser().parse_tool_call(&req).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_PARAMS);
    }

    #[test]
    fn resource_read_requires_uri() {
        let req = parser()
            .parse(br#"{"jsonrpc":"2.0","id":1,"method":"resources/read","params":{}}"#)
            .unwrap();
        let err = parser().parse_resource_read(&req).unwrap_err();
        assert_eq!(err.code, CODE_INVALID_PARAMS);

        let req = parser()
            .parse(
                br#"{"jsonrpc":"2.0","id":1,"method":"resources/read","params":{"uri":"file:///x"}}"#,
            )
            .unwrap();
        let params = parser().parse_resource_read(&req).unwrap();
        assert_eq!(params.uri, "file:///x");
    }

    #[test]
    fn malformed_meta_is_ignored() {
        let req = parser()
            .parse(
                br#"{"jsonrpc":"2.0","id":1,"method":"tools/call",
                     "params":{"name":"t","_meta":"not-an-object"}}"#,
            )
            .unwrap();
        let params = parser().parse_tool_call(&req).unwrap();
        assert!(params.agentfacts.is_none());
    }
}
