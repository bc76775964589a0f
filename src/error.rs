//! Top-level error types.
//!
//! Subsystems define their own error enums (`SessionError`, `PolicyError`,
//! `UpstreamError`, `AuditError`, `ConfigError`); `GatewayError` aggregates
//! them for startup wiring and the transport boundary. Errors that reach a
//! client are rendered as JSON-RPC error objects using the closed code set
//! in [`crate::router::jsonrpc`].

use thiserror::Error;

use crate::router::jsonrpc;

/// Errors surfaced during startup or while servicing requests.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A transport failed to start or stop.
    #[error("transport error: {0}")]
    Transport(String),

    /// Session fabric rejected an operation.
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),

    /// Policy engine failed to compile or evaluate.
    #[error(transparent)]
    Policy(#[from] crate::policy::PolicyError),

    /// Upstream send failed.
    #[error(transparent)]
    Upstream(#[from] crate::upstream::UpstreamError),

    /// Audit store failure.
    #[error(transparent)]
    Audit(#[from] crate::audit::AuditError),

    /// Anything that should never happen in a healthy process.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Maps the error onto the JSON-RPC code a client would see.
    ///
    /// Parse and schema failures are handled before routing and carry their
    /// own codes; everything that escapes to this level is either a policy,
    /// upstream, or internal fault.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::Upstream(_) => jsonrpc::CODE_UPSTREAM_ERROR,
            Self::Policy(_) => jsonrpc::CODE_INTERNAL_ERROR,
            Self::Session(crate::session::SessionError::MaxSessionsReached) => {
                jsonrpc::CODE_RATE_LIMITED
            }
            _ => jsonrpc::CODE_INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamError;

    #[test]
    fn upstream_errors_map_to_upstream_code() {
        let err = GatewayError::from(UpstreamError::NotConnected);
        assert_eq!(err.jsonrpc_code(), -32004);
    }

    #[test]
    fn session_limit_maps_to_rate_limited() {
        let err = GatewayError::from(crate::session::SessionError::MaxSessionsReached);
        assert_eq!(err.jsonrpc_code(), -32003);
    }

    #[test]
    fn internal_maps_to_internal_code() {
        let err = GatewayError::Internal("boom".into());
        assert_eq!(err.jsonrpc_code(), -32603);
    }
}
