//! Inbound producer connection abstraction.
//!
//! A connection is split into an ordered stream of payload events and a
//! closer. The session worker owns both halves exclusively.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

/// Socket-level failure reported by the inbound transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Transport error: {0}")]
pub struct TransportError(pub String);

/// Ordered payload events. `None` means the producer closed the connection.
pub type InboundEvents = BoxStream<'static, Result<Bytes, TransportError>>;

/// Why the server closes a producer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Session ended normally (stop request, producer hang-up).
    Normal,
    /// Server is shutting down.
    GoingAway,
    /// Connection refused by policy (duplicate id, invalid id).
    Rejected(String),
    /// Session could not be served (downstream unavailable, encoder failure).
    Unavailable(String),
}

impl CloseReason {
    pub fn description(&self) -> &str {
        match self {
            Self::Normal => "stream ended",
            Self::GoingAway => "server shutting down",
            Self::Rejected(reason) | Self::Unavailable(reason) => reason,
        }
    }
}

/// Closing half of an inbound connection.
#[async_trait]
pub trait ConnectionCloser: Send {
    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError>;
}

/// An accepted producer connection.
pub trait InboundConnection: Send + 'static {
    fn split(self) -> (InboundEvents, Box<dyn ConnectionCloser>);
}

/// In-process connection backed by channels.
///
/// The [`ChannelProducer`] side plays the producer: it sends payloads,
/// reports errors, hangs up, and observes how the server closed it.
pub struct ChannelConnection {
    events_rx: mpsc::Receiver<Result<Bytes, TransportError>>,
    close_tx: watch::Sender<Option<CloseReason>>,
    close_calls: Arc<AtomicUsize>,
}

impl ChannelConnection {
    pub fn new(capacity: usize) -> (Self, ChannelProducer) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let close_calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                events_rx,
                close_tx,
                close_calls: Arc::clone(&close_calls),
            },
            ChannelProducer {
                events_tx: Some(events_tx),
                close_rx,
                close_calls,
            },
        )
    }
}

impl InboundConnection for ChannelConnection {
    fn split(self) -> (InboundEvents, Box<dyn ConnectionCloser>) {
        let events = ReceiverStream::new(self.events_rx).boxed();
        let closer = ChannelCloser {
            close_tx: self.close_tx,
            close_calls: self.close_calls,
        };
        (events, Box::new(closer))
    }
}

struct ChannelCloser {
    close_tx: watch::Sender<Option<CloseReason>>,
    close_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ConnectionCloser for ChannelCloser {
    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let changed = self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(TransportError("connection already closed".to_string()))
        }
    }
}

/// Producer half of a [`ChannelConnection`].
pub struct ChannelProducer {
    events_tx: Option<mpsc::Sender<Result<Bytes, TransportError>>>,
    close_rx: watch::Receiver<Option<CloseReason>>,
    close_calls: Arc<AtomicUsize>,
}

impl ChannelProducer {
    /// Send one payload. Fails once the server side is gone or we hung up.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<(), TransportError> {
        let tx = self
            .events_tx
            .as_ref()
            .ok_or_else(|| TransportError("producer hung up".to_string()))?;
        tx.send(Ok(chunk.into()))
            .await
            .map_err(|_| TransportError("server side gone".to_string()))
    }

    /// Report a transport failure to the server.
    pub async fn fail(&self, message: &str) -> Result<(), TransportError> {
        let tx = self
            .events_tx
            .as_ref()
            .ok_or_else(|| TransportError("producer hung up".to_string()))?;
        tx.send(Err(TransportError(message.to_string())))
            .await
            .map_err(|_| TransportError("server side gone".to_string()))
    }

    /// Close the producer side; the server sees end of stream.
    pub fn hang_up(&mut self) {
        self.events_tx = None;
    }

    /// How the server closed the connection, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_rx.borrow().clone()
    }

    /// How many times the server attempted to close the connection.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Wait until the server closes the connection.
    ///
    /// Returns `None` if the server dropped it without an explicit close.
    pub async fn closed(&mut self) -> Option<CloseReason> {
        match self.close_rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        }
    }
}
