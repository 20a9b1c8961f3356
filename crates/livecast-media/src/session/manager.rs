//! Stream session manager: owns the lifetime of every ingest session.
//!
//! Data flow for one session:
//! ```text
//! socket binary frames → RelayPipe → encoder stdin → encoder → rtmp://…/<session_id>
//! ```
//!
//! Each accepted connection gets one worker task. The worker is the sole owner
//! of the session's socket, pipe and process, and the only place teardown
//! runs, so teardown executes exactly once no matter how many triggers fire.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::readiness::ReadinessGate;
use crate::relay::{DrainOutcome, RelayPipe};
use crate::transcoder::{TranscoderProcess, TranscoderSupervisor};

use super::connection::{CloseReason, ConnectionCloser, InboundConnection, InboundEvents};
use super::registry::{RegistryError, SessionRegistry};
use super::state::{Session, SessionSnapshot, SessionState, TerminalTrigger};

/// Longest accepted session id.
const MAX_SESSION_ID_LEN: usize = 128;

/// Manager-wide settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// `host:port` the readiness gate checks before each session starts.
    pub downstream_endpoint: String,
    /// Relay pipe capacity, in chunks.
    pub relay_capacity: usize,
    /// How long teardown waits for buffered chunks to reach the encoder.
    pub drain_timeout: Duration,
    /// Upper bound on closing a producer connection.
    pub close_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            downstream_endpoint: "localhost:1935".to_string(),
            relay_capacity: 256,
            drain_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Errors surfaced to callers of the manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Session already active: {session_id}")]
    DuplicateSession { session_id: String },

    #[error("Invalid session id: {session_id:?}")]
    InvalidSessionId { session_id: String },

    #[error("Server is shutting down")]
    ShuttingDown,
}

/// Coordinates readiness checks, encoder supervision and relaying per session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    registry: SessionRegistry,
    gate: ReadinessGate,
    supervisor: TranscoderSupervisor,
    config: ManagerConfig,
    shutting_down: AtomicBool,
}

/// Resources a worker releases during teardown.
struct SessionResources {
    closer: Box<dyn ConnectionCloser>,
    pipe: Option<RelayPipe>,
    process: Option<TranscoderProcess>,
}

impl SessionManager {
    pub fn new(
        gate: ReadinessGate,
        supervisor: TranscoderSupervisor,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: SessionRegistry::new(),
                gate,
                supervisor,
                config,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Encoder processes currently alive.
    pub fn running_processes(&self) -> usize {
        self.inner.supervisor.running_count()
    }

    /// Accept a producer connection and start its session.
    ///
    /// Returns once the session is registered; readiness checks, spawning and relaying
    /// continue on the session's worker task. A duplicate or invalid id closes
    /// the new connection and leaves any existing session untouched.
    pub async fn accept_connection<C: InboundConnection>(
        &self,
        session_id: &str,
        connection: C,
    ) -> Result<Arc<Session>, ManagerError> {
        let (events, mut closer) = connection.split();
        let close_timeout = self.inner.config.close_timeout;

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            debug!(session_id, "Rejecting connection during shutdown");
            close_quietly(
                session_id,
                closer.as_mut(),
                CloseReason::GoingAway,
                close_timeout,
            )
            .await;
            return Err(ManagerError::ShuttingDown);
        }

        if !is_valid_session_id(session_id) {
            warn!(session_id, "Rejecting connection with invalid session id");
            close_quietly(
                session_id,
                closer.as_mut(),
                CloseReason::Rejected("invalid session id".to_string()),
                close_timeout,
            )
            .await;
            return Err(ManagerError::InvalidSessionId {
                session_id: session_id.to_string(),
            });
        }

        let destination = self.inner.supervisor.destination_for(session_id);
        let session = Arc::new(Session::new(session_id, destination));

        if let Err(e) = self.inner.registry.insert(Arc::clone(&session)).await {
            warn!(session_id, error = %e, "Rejecting duplicate connection");
            close_quietly(
                session_id,
                closer.as_mut(),
                CloseReason::Rejected("session already active".to_string()),
                close_timeout,
            )
            .await;
            return Err(ManagerError::DuplicateSession {
                session_id: session_id.to_string(),
            });
        }

        info!(session_id, "New stream connection");
        let inner = Arc::clone(&self.inner);
        let worker_session = Arc::clone(&session);
        tokio::spawn(async move {
            inner.run_session(worker_session, events, closer).await;
        });

        Ok(session)
    }

    /// Request teardown of a session. Unknown ids are a no-op.
    ///
    /// Returns once the trigger is recorded; teardown completes on the worker.
    pub async fn stop_session(&self, session_id: &str) {
        match self.inner.registry.lookup(session_id).await {
            Ok(session) => {
                if session.fire(TerminalTrigger::Stopped) {
                    info!(session_id, "Stop requested");
                } else {
                    debug!(session_id, "Stop ignored, session already ending");
                }
            }
            Err(_) => debug!(session_id, "Stop for unknown session ignored"),
        }
    }

    /// Look up a live session.
    pub async fn lookup(&self, session_id: &str) -> Result<Arc<Session>, RegistryError> {
        self.inner.registry.lookup(session_id).await
    }

    /// Snapshots of all registered sessions.
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .registry
            .list()
            .await
            .iter()
            .map(|s| s.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Stop every session and wait up to `timeout` for all of them to close.
    ///
    /// New connections are refused from this point on. Returns `true` if the
    /// registry drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let sessions = self.inner.registry.list().await;
        info!(count = sessions.len(), "Stopping all sessions");
        for session in &sessions {
            session.fire(TerminalTrigger::Shutdown);
        }
        let drained = async {
            futures::future::join_all(sessions.iter().map(|s| s.wait_closed())).await;
            // Workers unregister right after entering Closed.
            while !self.inner.registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(timeout, drained).await.is_err() {
            warn!("Timed out waiting for sessions to close");
            return false;
        }
        true
    }
}

impl ManagerInner {
    async fn run_session(
        &self,
        session: Arc<Session>,
        events: InboundEvents,
        closer: Box<dyn ConnectionCloser>,
    ) {
        let session_id = session.id().to_string();
        let mut trigger_rx = session.subscribe_trigger();
        let mut resources = SessionResources {
            closer,
            pipe: None,
            process: None,
        };

        if !session.advance(SessionState::WaitingForDownstream) {
            // Stopped before the worker ran.
            self.teardown(&session, resources).await;
            return;
        }
        let endpoint = self.config.downstream_endpoint.as_str();
        debug!(session_id = %session_id, endpoint, "Waiting for downstream");

        let readiness_result = tokio::select! {
            biased;
            () = trigger_fired(&mut trigger_rx) => None,
            result = self.gate.wait_until_ready(endpoint) => Some(result),
        };
        match readiness_result {
            None => {
                self.teardown(&session, resources).await;
                return;
            }
            Some(Err(e)) => {
                self.close_unstarted(&session, resources, e.to_string()).await;
                return;
            }
            Some(Ok(_)) => {}
        }

        let mut process = match self.supervisor.spawn(&session_id) {
            Ok(process) => process,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Encoder failed to start");
                session.fire(TerminalTrigger::ProcessError(e.to_string()));
                self.teardown(&session, resources).await;
                return;
            }
        };
        let stdin = match process.take_stdin() {
            Ok(stdin) => stdin,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Encoder stdin unavailable");
                session.fire(TerminalTrigger::ProcessError(e.to_string()));
                resources.process = Some(process);
                self.teardown(&session, resources).await;
                return;
            }
        };
        let pipe = RelayPipe::start(
            &session_id,
            stdin,
            self.config.relay_capacity,
            session.stats(),
        );

        if !session.advance(SessionState::Active) {
            // A trigger arrived while the encoder was starting.
            resources.pipe = Some(pipe);
            resources.process = Some(process);
            self.teardown(&session, resources).await;
            return;
        }
        info!(
            session_id = %session_id,
            pid = ?process.pid(),
            destination = %process.destination(),
            "Session active"
        );

        if let Some(trigger) =
            relay_loop(&session_id, &mut trigger_rx, events, &pipe, &mut process).await
        {
            session.fire(trigger);
        }
        resources.pipe = Some(pipe);
        resources.process = Some(process);
        self.teardown(&session, resources).await;
    }

    /// Release every resource the session owns, then unregister it.
    ///
    /// Each release is attempted regardless of the others' outcome. End of
    /// input always reaches the encoder before it is signalled.
    async fn teardown(&self, session: &Arc<Session>, mut resources: SessionResources) {
        let session_id = session.id();
        session.advance(SessionState::Terminating);
        let trigger = session.trigger().unwrap_or(TerminalTrigger::Stopped);
        info!(session_id, trigger = %trigger, "Tearing down session");

        let mut drained = false;
        if let Some(mut pipe) = resources.pipe.take() {
            let outcome = pipe.finish(self.config.drain_timeout).await;
            debug!(session_id, ?outcome, "Relay pipe closed");
            drained = outcome == DrainOutcome::Drained;
        }

        if let Some(mut process) = resources.process.take() {
            // An encoder that saw end of input gets a chance to flush and exit.
            if drained
                && tokio::time::timeout(self.config.drain_timeout, process.wait())
                    .await
                    .is_ok()
            {
                debug!(session_id, "Encoder exited after end of input");
            }
            let outcome = process
                .terminate(self.supervisor.terminate_timeout())
                .await;
            debug!(session_id, ?outcome, status = ?process.exit_status(), "Encoder released");
        }

        close_quietly(
            session_id,
            resources.closer.as_mut(),
            close_reason_for(&trigger),
            self.config.close_timeout,
        )
        .await;

        session.advance(SessionState::Closed);
        self.registry.remove_entry(session).await;
        let stats = session.stats();
        info!(
            session_id,
            chunks = stats.chunks(),
            bytes = stats.bytes(),
            "Stopped stream"
        );
    }

    /// Downstream never became ready: close the socket and go straight to
    /// Closed. No process was started.
    async fn close_unstarted(
        &self,
        session: &Arc<Session>,
        mut resources: SessionResources,
        reason: String,
    ) {
        let session_id = session.id();
        warn!(session_id, error = %reason, "Closing session, downstream unavailable");
        session.record_trigger(TerminalTrigger::DownstreamUnavailable(reason));

        close_quietly(
            session_id,
            resources.closer.as_mut(),
            CloseReason::Unavailable("downstream unavailable".to_string()),
            self.config.close_timeout,
        )
        .await;

        // Legal from WaitingForDownstream, and from Terminating if a stop raced
        // the readiness failure.
        session.advance(SessionState::Closed);
        self.registry.remove_entry(session).await;
    }
}

/// Relay socket payloads into the pipe until a terminal event occurs.
///
/// Returns the trigger this loop observed, or `None` when an external
/// trigger (stop, shutdown) already fired.
async fn relay_loop(
    session_id: &str,
    trigger_rx: &mut watch::Receiver<Option<TerminalTrigger>>,
    mut events: InboundEvents,
    pipe: &RelayPipe,
    process: &mut TranscoderProcess,
) -> Option<TerminalTrigger> {
    loop {
        tokio::select! {
            biased;
            () = trigger_fired(trigger_rx) => return None,
            status = process.wait() => {
                return Some(match status {
                    Ok(status) => {
                        info!(session_id, ?status, "Encoder process exited");
                        TerminalTrigger::ProcessExited(status.code())
                    }
                    Err(e) => {
                        error!(session_id, error = %e, "Encoder process error");
                        TerminalTrigger::ProcessError(e.to_string())
                    }
                });
            }
            event = events.next() => match event {
                Some(Ok(chunk)) => {
                    tokio::select! {
                        biased;
                        () = trigger_fired(trigger_rx) => return None,
                        pushed = pipe.push(chunk) => {
                            if let Err(e) = pushed {
                                return Some(TerminalTrigger::ProcessError(e.to_string()));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(session_id, error = %e, "Transport error");
                    return Some(TerminalTrigger::TransportError(e.0));
                }
                None => return Some(TerminalTrigger::TransportClosed),
            },
        }
    }
}

/// Resolves once any terminal trigger has been recorded.
async fn trigger_fired(rx: &mut watch::Receiver<Option<TerminalTrigger>>) {
    if rx.wait_for(Option::is_some).await.is_err() {
        // Sender lives in the Session, which outlives its worker.
        std::future::pending::<()>().await;
    }
}

fn close_reason_for(trigger: &TerminalTrigger) -> CloseReason {
    match trigger {
        TerminalTrigger::Shutdown => CloseReason::GoingAway,
        TerminalTrigger::ProcessExited(_)
        | TerminalTrigger::ProcessError(_)
        | TerminalTrigger::DownstreamUnavailable(_) => CloseReason::Unavailable(trigger.to_string()),
        TerminalTrigger::Stopped
        | TerminalTrigger::TransportClosed
        | TerminalTrigger::TransportError(_) => CloseReason::Normal,
    }
}

async fn close_quietly(
    session_id: &str,
    closer: &mut dyn ConnectionCloser,
    reason: CloseReason,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, closer.close(reason)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(session_id, error = %e, "Inbound connection already closed"),
        Err(_) => warn!(session_id, "Timed out closing inbound connection"),
    }
}

/// Session ids end up in the encoder's destination URL.
fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && session_id != "."
        && session_id != ".."
}
