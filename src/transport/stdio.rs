//! Line transport over standard streams.
//!
//! One session for the whole process. Reads newline-delimited JSON
//! messages (blank lines skipped, 1 MiB cap per message, invalid JSON
//! answered with a `-32700` reply carrying `id: null`), writes
//! newline-terminated responses serialized behind a mutex and flushed
//! after each write. EOF on the input ends the session.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::session::{AgentIdentity, Session, SessionManager};
use crate::transport::{MessageHandler, Transport};

/// Maximum accepted line length (without the newline).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const PARSE_ERROR_REPLY: &[u8] =
    br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#;

type Reader = Pin<Box<dyn AsyncRead + Send>>;
type Writer = Arc<tokio::sync::Mutex<Pin<Box<dyn AsyncWrite + Send>>>>;

struct Io {
    reader: Reader,
    writer: Writer,
}

/// Line transport server.
pub struct StdioServer {
    agent: AgentIdentity,
    sessions: Arc<SessionManager>,
    handler: Arc<dyn MessageHandler>,
    io: Mutex<Option<Io>>,
    session: Mutex<Option<Arc<Session>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioServer {
    /// Serves the process's standard streams.
    pub fn new(
        agent: AgentIdentity,
        sessions: Arc<SessionManager>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self::with_io(
            agent,
            sessions,
            handler,
            tokio::io::stdin(),
            tokio::io::stdout(),
        )
    }

    /// Serves arbitrary streams; the test seam.
    pub fn with_io(
        agent: AgentIdentity,
        sessions: Arc<SessionManager>,
        handler: Arc<dyn MessageHandler>,
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            agent,
            sessions,
            handler,
            io: Mutex::new(Some(Io {
                reader: Box::pin(reader),
                writer: Arc::new(tokio::sync::Mutex::new(Box::pin(writer))),
            })),
            session: Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            read_task: Mutex::new(None),
        }
    }

    async fn read_loop(
        session: Arc<Session>,
        handler: Arc<dyn MessageHandler>,
        reader: Reader,
        writer: Writer,
        shutdown: CancellationToken,
    ) {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = tokio::select! {
                _ = shutdown.cancelled() => return,
                read = reader.read_until(b'\n', &mut line) => read,
            };

            match read {
                Ok(0) => {
                    info!("stdin closed (EOF), ending session");
                    session.close();
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "error reading message");
                    write_line(&writer, PARSE_ERROR_REPLY).await;
                    continue;
                }
            }

            while line.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }

            if line.len() > MAX_MESSAGE_SIZE
                || serde_json::from_slice::<serde::de::IgnoredAny>(&line).is_err()
            {
                write_line(&writer, PARSE_ERROR_REPLY).await;
                continue;
            }

            session.increment_request_count();
            debug!(
                session_id = %session.id,
                body_size = line.len(),
                request_count = session.request_count(),
                "received message"
            );

            let reply = handler
                .handle(Arc::clone(&session), Bytes::copy_from_slice(&line))
                .await;
            if let Some(reply) = reply {
                write_line(&writer, &reply).await;
            }
        }
    }
}

async fn write_line(writer: &Writer, message: &[u8]) {
    let mut writer = writer.lock().await;
    let result = async {
        writer.write_all(message).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
    .await;
    if let Err(e) = result {
        error!(error = %e, "error writing response");
    }
}

#[async_trait]
impl Transport for StdioServer {
    async fn start(&self) -> Result<(), GatewayError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Transport("server already started".into()));
        }

        let Some(io) = self.io.lock().expect("io lock poisoned").take() else {
            return Err(GatewayError::Transport("io streams already consumed".into()));
        };

        let session = self.sessions.create()?;
        session.set_agent(self.agent.clone());
        session.set_client_info("stdio", "stdio-client");
        *self.session.lock().expect("session lock poisoned") = Some(Arc::clone(&session));

        info!(session_id = %session.id, transport = "stdio", "line transport started");

        let handler = Arc::clone(&self.handler);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(Self::read_loop(
            session,
            handler,
            io.reader,
            io.writer,
            shutdown,
        ));
        *self.read_task.lock().expect("task lock poisoned") = Some(handle);

        Ok(())
    }

    async fn stop(&self, deadline: Duration) -> Result<(), GatewayError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();

        if let Some(session) = self.session.lock().expect("session lock poisoned").take() {
            self.sessions.delete(&session.id);
        }

        let handle = self.read_task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("line transport stop timed out");
            }
        }

        info!("line transport stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}
