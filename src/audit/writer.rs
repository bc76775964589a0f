//! Write-behind audit pipeline.
//!
//! [`AuditWriter::write`] appends to a bounded in-memory buffer and never
//! blocks or fails: at capacity the oldest record is dropped and counted,
//! and an asynchronous flush is nudged. The background loop flushes on the
//! configured interval, on capacity pressure, and once more at shutdown.
//! Flushes swap the buffer under the lock and do store I/O outside it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{AuditStore, Record};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Records buffered before a flush is forced.
    pub buffer_size: usize,
    pub flush_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Counters reported at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub dropped: u64,
    pub flushes: u64,
    pub buffered: usize,
}

/// Buffered asynchronous writer in front of the [`AuditStore`].
pub struct AuditWriter {
    store: Arc<AuditStore>,
    buffer: Mutex<Vec<Record>>,
    buffer_max: usize,
    flush_interval: Duration,
    flush_nudge: Notify,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    written: AtomicU64,
    dropped: AtomicU64,
    flushes: AtomicU64,
}

impl AuditWriter {
    pub fn new(store: Arc<AuditStore>, cfg: WriterConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            buffer: Mutex::new(Vec::with_capacity(cfg.buffer_size.max(1))),
            buffer_max: cfg.buffer_size.max(1),
            flush_interval: cfg.flush_interval,
            flush_nudge: Notify::new(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    /// Starts the background flush loop.
    pub fn start(self: &Arc<Self>) {
        let writer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(writer.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = writer.shutdown.cancelled() => {
                        writer.flush().await;
                        return;
                    }
                    _ = ticker.tick() => writer.flush().await,
                    _ = writer.flush_nudge.notified() => writer.flush().await,
                }
            }
        });
        *self.task.lock().expect("task lock poisoned") = Some(handle);

        info!(
            buffer_size = self.buffer_max,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "audit writer started"
        );
    }

    /// Appends a record. Never blocks and never errors; overflow drops the
    /// oldest buffered record and accounts for it.
    pub fn write(&self, record: Record) {
        let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
        if buffer.len() >= self.buffer_max {
            self.flush_nudge.notify_one();
            buffer.remove(0);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push(record);
    }

    /// Drains the buffer into the store. The swap happens under the lock;
    /// the insert runs on a blocking thread. A failed batch is dropped and
    /// counted, never retried into the request path.
    pub async fn flush(&self) {
        let batch: Vec<Record> = {
            let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let count = batch.len();
        let store = Arc::clone(&self.store);
        let result =
            tokio::task::spawn_blocking(move || store.insert_batch(&batch)).await;

        match result {
            Ok(Ok(())) => {
                self.written.fetch_add(count as u64, Ordering::Relaxed);
                self.flushes.fetch_add(1, Ordering::Relaxed);
                debug!(count, "flushed audit records");
            }
            Ok(Err(err)) => {
                self.dropped.fetch_add(count as u64, Ordering::Relaxed);
                error!(error = %err, count, "failed to flush audit records");
            }
            Err(err) => {
                self.dropped.fetch_add(count as u64, Ordering::Relaxed);
                error!(error = %err, count, "audit flush task failed");
            }
        }
    }

    /// Stops the loop, performs the final flush, and reports counters.
    pub async fn stop(&self) -> WriterStats {
        self.shutdown.cancel();
        let handle = self.task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        } else {
            // Never started; flush whatever accumulated.
            self.flush().await;
        }

        let stats = self.stats();
        info!(
            written = stats.written,
            dropped = stats.dropped,
            flushes = stats.flushes,
            "audit writer stopped"
        );
        stats
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            buffered: self.buffer.lock().expect("buffer lock poisoned").len(),
        }
    }
}
