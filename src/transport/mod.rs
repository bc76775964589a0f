//! Inbound transports.
//!
//! Both transports expose the same contract: deliver each framed inbound
//! message to a [`MessageHandler`] and stream whatever it returns back to
//! the originating session. Start/stop are idempotent; starting twice is
//! an error and stop waits for the read loop to drain or the deadline.

pub mod sse;
pub mod stdio;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::GatewayError;
use crate::session::Session;

/// Processes one inbound message; `None` means no reply (notification).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, session: Arc<Session>, message: Bytes) -> Option<Vec<u8>>;
}

#[async_trait]
impl MessageHandler for crate::router::Router {
    async fn handle(&self, session: Arc<Session>, message: Bytes) -> Option<Vec<u8>> {
        self.route(&session, &message).await
    }
}

/// A running inbound transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts accepting traffic. Returns an error if already started.
    async fn start(&self) -> Result<(), GatewayError>;

    /// Stops the transport, waiting up to `deadline` for in-flight reads
    /// to drain. Idempotent.
    async fn stop(&self, deadline: Duration) -> Result<(), GatewayError>;

    /// Transport type name (`"sse"`, `"stdio"`).
    fn name(&self) -> &'static str;
}
