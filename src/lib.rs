//! mcpguard: security gateway for MCP (JSON-RPC 2.0) agent traffic.
//!
//! The gateway sits between AI agents and tool-providing MCP servers. Every
//! in-flight request is parsed and validated, checked against a declarative
//! Rego policy, forwarded upstream (or blocked with a structured violation),
//! streamed back to the originating session, and recorded through a buffered
//! audit pipeline.
//!
//! Component layout mirrors the dataflow: [`transport`] accepts framed
//! messages and streams replies, [`session`] tracks per-connection state,
//! [`router`] drives the per-request state machine, [`policy`] evaluates and
//! caches decisions, [`upstream`] correlates asynchronous backend replies,
//! and [`audit`] persists one record per completed request.

pub mod audit;
pub mod config;
pub mod error;
pub mod observability;
pub mod policy;
pub mod router;
pub mod session;
pub mod transport;
pub mod upstream;
