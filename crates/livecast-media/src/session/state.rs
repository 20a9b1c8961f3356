//! Per-session state machine.
//!
//! ```text
//! Initializing ──► WaitingForDownstream ──► Active ──► Terminating ──► Closed
//!      │                   │    │                         ▲
//!      │                   │    └─────────────────────────┤ (stop / spawn failure)
//!      └───────────────────┼──────────────────────────────┘ (stop before the worker runs)
//!                          └──► Closed (downstream unavailable)
//! ```
//!
//! Every terminal trigger funnels through [`Session::fire`]; only the first
//! one is recorded and only the session worker performs teardown.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;

use crate::relay::RelayStats;

/// Lifecycle state of an ingest session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    WaitingForDownstream,
    Active,
    Terminating,
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::WaitingForDownstream | Self::Terminating)
                | (
                    Self::WaitingForDownstream,
                    Self::Active | Self::Terminating | Self::Closed
                )
                | (Self::Active, Self::Terminating)
                | (Self::Terminating, Self::Closed)
        )
    }

    /// Terminating or Closed: further triggers are ignored.
    pub const fn is_ending(self) -> bool {
        matches!(self, Self::Terminating | Self::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::WaitingForDownstream => "waiting_for_downstream",
            Self::Active => "active",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// The event that ended a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TerminalTrigger {
    /// Explicit `stop_session`.
    Stopped,
    /// Server shutdown.
    Shutdown,
    /// Producer closed the socket.
    TransportClosed,
    /// Socket-level failure.
    TransportError(String),
    /// Encoder exited, with its exit code when it has one.
    ProcessExited(Option<i32>),
    /// Encoder failed to start, could not be waited on, or stopped reading.
    ProcessError(String),
    /// Readiness check gave up before any process was started.
    DownstreamUnavailable(String),
}

impl std::fmt::Display for TerminalTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::TransportClosed => f.write_str("transport closed"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::ProcessExited(Some(code)) => write!(f, "encoder exited with code {code}"),
            Self::ProcessExited(None) => f.write_str("encoder terminated by signal"),
            Self::ProcessError(e) => write!(f, "encoder error: {e}"),
            Self::DownstreamUnavailable(e) => write!(f, "downstream unavailable: {e}"),
        }
    }
}

/// Point-in-time view of a session, for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SessionState,
    pub destination: String,
    pub chunks_relayed: u64,
    pub bytes_relayed: u64,
    pub uptime_secs: u64,
    pub trigger: Option<TerminalTrigger>,
}

/// Shared, observable part of a session. Resources (socket, pipe, process)
/// are owned by the session worker, not by this struct.
#[derive(Debug)]
pub struct Session {
    id: String,
    destination: String,
    created_at: Instant,
    state_tx: watch::Sender<SessionState>,
    trigger_tx: watch::Sender<Option<TerminalTrigger>>,
    stats: Arc<RelayStats>,
}

impl Session {
    pub fn new(id: impl Into<String>, destination: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Initializing);
        let (trigger_tx, _) = watch::channel(None);
        Self {
            id: id.into(),
            destination: destination.into(),
            created_at: Instant::now(),
            state_tx,
            trigger_tx,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// The first terminal trigger, once one has fired.
    pub fn trigger(&self) -> Option<TerminalTrigger> {
        self.trigger_tx.borrow().clone()
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_ending(&self) -> bool {
        self.state().is_ending()
    }

    /// Move to `next` if the transition is legal. Returns whether it happened.
    pub fn advance(&self, next: SessionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Fire a terminal trigger.
    ///
    /// Returns `true` only for the first trigger on a session that is not
    /// already ending. The session moves to Terminating immediately; the
    /// worker observes the trigger and tears down.
    pub fn fire(&self, trigger: TerminalTrigger) -> bool {
        if self.is_ending() {
            return false;
        }
        if !self.record_trigger(trigger) {
            return false;
        }
        self.advance(SessionState::Terminating);
        true
    }

    /// Record the trigger without touching the state. First one wins.
    pub(crate) fn record_trigger(&self, trigger: TerminalTrigger) -> bool {
        self.trigger_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(trigger);
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn subscribe_trigger(&self) -> watch::Receiver<Option<TerminalTrigger>> {
        self.trigger_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Wait until the session reaches `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state(),
            destination: self.destination.clone(),
            chunks_relayed: self.stats.chunks(),
            bytes_relayed: self.stats.bytes(),
            uptime_secs: self.created_at.elapsed().as_secs(),
            trigger: self.trigger(),
        }
    }
}
