//! Relay pipe: ordered, bounded byte conduit from socket payloads to the
//! encoder's stdin.
//!
//! ```text
//! WebSocket binary frame → push() → mpsc (bounded) → writer task → encoder stdin
//! ```
//!
//! When the channel is full `push` waits, which stalls the session's socket
//! reader and pushes backpressure onto the producer's transport.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Counters shared between the pipe's writer task and session snapshots.
#[derive(Debug, Default)]
pub struct RelayStats {
    chunks: AtomicU64,
    bytes: AtomicU64,
}

impl RelayStats {
    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn record(&self, len: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }
}

/// Errors from relay pipe operations.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("Relay input already closed for session {session_id}")]
    InputClosed { session_id: String },

    #[error("Relay consumer gone for session {session_id}")]
    ConsumerGone { session_id: String },
}

/// How the writer side finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All pushed chunks were written and the sink was shut down.
    Drained,
    /// The sink failed; remaining chunks were discarded.
    SinkFailed,
    /// The writer did not finish in time and was aborted.
    TimedOut,
}

/// Producer handle of the relay pipe.
pub struct RelayPipe {
    session_id: String,
    input: Mutex<Option<mpsc::Sender<Bytes>>>,
    writer: Option<JoinHandle<DrainOutcome>>,
}

impl RelayPipe {
    /// Start a pipe whose consumer writes into `sink`.
    pub fn start<W>(
        session_id: &str,
        sink: W,
        capacity: usize,
        stats: Arc<RelayStats>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(run_writer(session_id.to_string(), sink, rx, stats));
        Self {
            session_id: session_id.to_string(),
            input: Mutex::new(Some(tx)),
            writer: Some(writer),
        }
    }

    /// Queue one chunk. Waits while the pipe is at capacity.
    pub async fn push(&self, chunk: Bytes) -> Result<(), PipeError> {
        let tx = self
            .input
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| PipeError::InputClosed {
                session_id: self.session_id.clone(),
            })?;
        tx.send(chunk).await.map_err(|_| PipeError::ConsumerGone {
            session_id: self.session_id.clone(),
        })
    }

    /// Signal that no more data will arrive. Idempotent.
    pub fn close_input(&self) {
        if let Ok(mut guard) = self.input.lock()
            && guard.take().is_some()
        {
            debug!(session_id = %self.session_id, "Relay input closed");
        }
    }

    pub fn is_input_closed(&self) -> bool {
        self.input.lock().map_or(true, |guard| guard.is_none())
    }

    /// Close input and wait up to `timeout` for buffered chunks to reach the sink.
    ///
    /// Pushes already in flight keep the channel open until they complete, so
    /// the timeout also bounds a stalled producer.
    pub async fn finish(&mut self, timeout: Duration) -> DrainOutcome {
        self.close_input();
        let Some(mut writer) = self.writer.take() else {
            return DrainOutcome::Drained;
        };
        match tokio::time::timeout(timeout, &mut writer).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "Relay writer task failed");
                DrainOutcome::SinkFailed
            }
            Err(_) => {
                warn!(session_id = %self.session_id, "Relay drain timed out, aborting writer");
                writer.abort();
                DrainOutcome::TimedOut
            }
        }
    }
}

impl Drop for RelayPipe {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn run_writer<W>(
    session_id: String,
    mut sink: W,
    mut rx: mpsc::Receiver<Bytes>,
    stats: Arc<RelayStats>,
) -> DrainOutcome
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = sink.write_all(&chunk).await {
            warn!(session_id = %session_id, error = %e, "Failed to write to encoder stdin");
            return DrainOutcome::SinkFailed;
        }
        stats.record(chunk.len());
    }
    if let Err(e) = sink.shutdown().await {
        debug!(session_id = %session_id, error = %e, "Encoder stdin shutdown failed");
        return DrainOutcome::SinkFailed;
    }
    debug!(
        session_id = %session_id,
        chunks = stats.chunks(),
        bytes = stats.bytes(),
        "Relay writer drained"
    );
    DrainOutcome::Drained
}
