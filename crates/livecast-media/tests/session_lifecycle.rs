#![cfg(unix)]
#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the session lifecycle.
//!
//! Sessions run against real child processes (`cat`, `sh`) standing in for
//! the encoder and an in-process channel connection standing in for the
//! producer's WebSocket.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use livecast_media::readiness::{ReadinessCheck, ReadinessGate, RetryPolicy};
use livecast_media::session::{
    ChannelConnection, CloseReason, ManagerConfig, ManagerError, Session, SessionManager,
    SessionState, TerminalTrigger,
};
use livecast_media::transcoder::{ArgsPolicy, SupervisorConfig, TranscoderSupervisor};

const WAIT: Duration = Duration::from_secs(10);

/// Downstream that accepts connections from the `ready_on`-th attempt on.
struct ScriptedCheck {
    attempts: AtomicU32,
    ready_on: Option<u32>,
}

impl ScriptedCheck {
    fn ready_on(attempt: u32) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
            ready_on: Some(attempt),
        })
    }

    fn never() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
            ready_on: None,
        })
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessCheck for ScriptedCheck {
    async fn check(&self, _endpoint: &str) -> io::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.ready_on {
            Some(n) if attempt >= n => Ok(()),
            _ => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
        }
    }
}

fn manager_with(check: Arc<ScriptedCheck>, program: &str, args: &[&str]) -> SessionManager {
    manager_with_retry_delay(check, Duration::from_millis(10), program, args)
}

fn manager_with_retry_delay(
    check: Arc<ScriptedCheck>,
    retry_delay: Duration,
    program: &str,
    args: &[&str],
) -> SessionManager {
    let gate = ReadinessGate::new(
        check,
        RetryPolicy {
            max_attempts: 5,
            retry_delay,
        },
    );
    let supervisor = TranscoderSupervisor::new(SupervisorConfig {
        program: program.into(),
        args: ArgsPolicy::Custom(args.iter().map(ToString::to_string).collect()),
        destination_base: "rtmp://127.0.0.1:1935/live".to_string(),
        terminate_timeout: Duration::from_secs(2),
    });
    SessionManager::new(
        gate,
        supervisor,
        ManagerConfig {
            downstream_endpoint: "127.0.0.1:1935".to_string(),
            relay_capacity: 16,
            drain_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_secs(2),
        },
    )
}

fn cat_manager() -> SessionManager {
    manager_with(ScriptedCheck::ready_on(1), "cat", &[])
}

async fn wait_for_state(session: &Session, target: SessionState) {
    let mut rx = session.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
        .await
        .unwrap()
        .unwrap();
}

async fn wait_closed(session: &Session) {
    tokio::time::timeout(WAIT, session.wait_closed())
        .await
        .unwrap();
}

/// Poll until the registry no longer holds `session_id`.
async fn wait_unregistered(manager: &SessionManager, session_id: &str) {
    tokio::time::timeout(WAIT, async {
        while manager.registry().contains(session_id).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test]
async fn chunks_reach_encoder_in_order_and_session_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("s1.bin");
    let out_arg = out.to_string_lossy().to_string();
    let manager = manager_with(
        ScriptedCheck::ready_on(1),
        "sh",
        &["-c", "cat > \"$0\"", &out_arg],
    );

    let (conn, mut producer) = ChannelConnection::new(16);
    let session = manager.accept_connection("s1", conn).await.unwrap();
    wait_for_state(&session, SessionState::Active).await;
    assert_eq!(manager.running_processes(), 1);

    for chunk in [&b"A"[..], b"B", b"C"] {
        producer.send(Bytes::copy_from_slice(chunk)).await.unwrap();
    }
    producer.hang_up();

    wait_closed(&session).await;
    wait_unregistered(&manager, "s1").await;

    assert_eq!(session.trigger(), Some(TerminalTrigger::TransportClosed));
    assert_eq!(std::fs::read(&out).unwrap(), b"ABC");
    assert_eq!(session.stats().chunks(), 3);
    assert_eq!(session.stats().bytes(), 3);
    assert_eq!(manager.running_processes(), 0);
    assert_eq!(producer.closed().await, Some(CloseReason::Normal));
}

#[tokio::test]
async fn session_goes_active_when_downstream_ready_on_third_attempt() {
    let check = ScriptedCheck::ready_on(3);
    let manager = manager_with(Arc::clone(&check), "cat", &[]);

    let (conn, _producer) = ChannelConnection::new(4);
    let session = manager.accept_connection("s1", conn).await.unwrap();
    wait_for_state(&session, SessionState::Active).await;

    assert_eq!(check.attempts(), 3);
    assert_eq!(manager.running_processes(), 1);
    assert!(session.destination().ends_with("/live/s1"));

    manager.stop_session("s1").await;
    wait_closed(&session).await;
    assert_eq!(session.trigger(), Some(TerminalTrigger::Stopped));
}

// =========================================================================
// Failure paths
// =========================================================================

#[tokio::test]
async fn unavailable_downstream_closes_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let marker_arg = marker.to_string_lossy().to_string();
    let check = ScriptedCheck::never();
    let manager = manager_with(
        Arc::clone(&check),
        "sh",
        &["-c", "touch \"$0\"; cat", &marker_arg],
    );

    let (conn, mut producer) = ChannelConnection::new(4);
    let session = manager.accept_connection("s1", conn).await.unwrap();

    let reason = tokio::time::timeout(WAIT, producer.closed()).await.unwrap();
    assert!(matches!(reason, Some(CloseReason::Unavailable(_))));
    wait_closed(&session).await;
    wait_unregistered(&manager, "s1").await;

    assert_eq!(check.attempts(), 5);
    assert!(matches!(
        session.trigger(),
        Some(TerminalTrigger::DownstreamUnavailable(_))
    ));
    assert_eq!(manager.running_processes(), 0);
    assert!(!marker.exists());
}

#[tokio::test]
async fn encoder_start_failure_closes_as_unavailable() {
    let manager = manager_with(ScriptedCheck::ready_on(1), "/nonexistent/encoder", &[]);

    let (conn, mut producer) = ChannelConnection::new(4);
    let session = manager.accept_connection("s1", conn).await.unwrap();

    wait_closed(&session).await;
    wait_unregistered(&manager, "s1").await;

    assert!(matches!(
        session.trigger(),
        Some(TerminalTrigger::ProcessError(_))
    ));
    assert!(matches!(
        producer.closed().await,
        Some(CloseReason::Unavailable(_))
    ));
    assert_eq!(manager.running_processes(), 0);
}

#[tokio::test]
async fn stop_while_waiting_for_downstream_never_spawns() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let marker_arg = marker.to_string_lossy().to_string();
    let manager = manager_with_retry_delay(
        ScriptedCheck::never(),
        Duration::from_millis(500),
        "sh",
        &["-c", "touch \"$0\"; cat", &marker_arg],
    );

    let (conn, mut producer) = ChannelConnection::new(4);
    let session = manager.accept_connection("s1", conn).await.unwrap();
    wait_for_state(&session, SessionState::WaitingForDownstream).await;

    manager.stop_session("s1").await;
    assert_eq!(session.state(), SessionState::Terminating);

    wait_closed(&session).await;
    wait_unregistered(&manager, "s1").await;

    assert_eq!(session.trigger(), Some(TerminalTrigger::Stopped));
    assert_eq!(producer.closed().await, Some(CloseReason::Normal));
    assert_eq!(manager.running_processes(), 0);
    assert!(!marker.exists());
}

#[tokio::test]
async fn encoder_exit_tears_session_down() {
    let manager = manager_with(ScriptedCheck::ready_on(1), "sh", &["-c", "exit 3"]);

    let (conn, mut producer) = ChannelConnection::new(4);
    let session = manager.accept_connection("s1", conn).await.unwrap();

    wait_closed(&session).await;
    wait_unregistered(&manager, "s1").await;

    assert_eq!(session.trigger(), Some(TerminalTrigger::ProcessExited(Some(3))));
    assert!(matches!(
        producer.closed().await,
        Some(CloseReason::Unavailable(_))
    ));
    assert_eq!(manager.running_processes(), 0);
}

#[tokio::test]
async fn transport_error_tears_session_down() {
    let manager = cat_manager();

    let (conn, mut producer) = ChannelConnection::new(4);
    let session = manager.accept_connection("s1", conn).await.unwrap();
    wait_for_state(&session, SessionState::Active).await;

    producer.fail("connection reset").await.unwrap();
    wait_closed(&session).await;

    assert_eq!(
        session.trigger(),
        Some(TerminalTrigger::TransportError("connection reset".into()))
    );
    assert_eq!(manager.running_processes(), 0);
}

// =========================================================================
// Registry semantics
// =========================================================================

#[tokio::test]
async fn duplicate_connection_rejected_and_existing_untouched() {
    let manager = cat_manager();

    let (first_conn, _first) = ChannelConnection::new(4);
    let first = manager.accept_connection("s1", first_conn).await.unwrap();
    wait_for_state(&first, SessionState::Active).await;

    let (second_conn, mut second) = ChannelConnection::new(4);
    let err = manager
        .accept_connection("s1", second_conn)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::DuplicateSession { .. }));
    assert!(matches!(
        second.closed().await,
        Some(CloseReason::Rejected(_))
    ));

    let current = manager.lookup("s1").await.unwrap();
    assert!(Arc::ptr_eq(&current, &first));
    assert_eq!(first.state(), SessionState::Active);
    assert_eq!(manager.running_processes(), 1);

    manager.stop_session("s1").await;
    wait_closed(&first).await;
}

#[tokio::test]
async fn invalid_session_id_rejected() {
    let manager = cat_manager();

    let (conn, mut producer) = ChannelConnection::new(4);
    let err = manager.accept_connection("../etc", conn).await.unwrap_err();

    assert!(matches!(err, ManagerError::InvalidSessionId { .. }));
    assert!(matches!(
        producer.closed().await,
        Some(CloseReason::Rejected(_))
    ));
    assert!(manager.registry().is_empty().await);
}

#[tokio::test]
async fn stop_session_is_idempotent() {
    let manager = cat_manager();

    let (conn, _producer) = ChannelConnection::new(4);
    let session = manager.accept_connection("s1", conn).await.unwrap();
    wait_for_state(&session, SessionState::Active).await;

    manager.stop_session("s1").await;
    manager.stop_session("s1").await;
    manager.stop_session("unknown").await;

    wait_closed(&session).await;
    wait_unregistered(&manager, "s1").await;
    manager.stop_session("s1").await;

    assert_eq!(session.trigger(), Some(TerminalTrigger::Stopped));
    assert_eq!(manager.running_processes(), 0);
}

#[tokio::test]
async fn reconnect_after_immediate_stop_is_accepted() {
    let manager = cat_manager();

    let (conn, _first) = ChannelConnection::new(4);
    let old = manager.accept_connection("s1", conn).await.unwrap();
    manager.stop_session("s1").await;
    assert!(old.is_ending());
    assert_eq!(old.trigger(), Some(TerminalTrigger::Stopped));

    let (conn, _second) = ChannelConnection::new(4);
    let new = manager.accept_connection("s1", conn).await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new));

    // The old worker finishing must leave the replacement registered.
    wait_closed(&old).await;
    wait_for_state(&new, SessionState::Active).await;
    assert!(Arc::ptr_eq(&manager.lookup("s1").await.unwrap(), &new));

    manager.stop_session("s1").await;
    wait_closed(&new).await;
    wait_unregistered(&manager, "s1").await;
    assert_eq!(manager.running_processes(), 0);
}

#[tokio::test]
async fn id_can_be_reused_after_close() {
    let manager = cat_manager();

    let (conn, _producer) = ChannelConnection::new(4);
    let old = manager.accept_connection("s1", conn).await.unwrap();
    wait_for_state(&old, SessionState::Active).await;
    manager.stop_session("s1").await;
    wait_closed(&old).await;
    wait_unregistered(&manager, "s1").await;

    let (conn, _producer) = ChannelConnection::new(4);
    let new = manager.accept_connection("s1", conn).await.unwrap();
    wait_for_state(&new, SessionState::Active).await;
    assert!(!Arc::ptr_eq(&old, &new));

    manager.stop_session("s1").await;
    wait_closed(&new).await;
}

// =========================================================================
// Concurrency and shutdown
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_sessions_started_and_stopped_leave_nothing_behind() {
    let manager = cat_manager();

    let tasks = (0..100).map(|i| {
        let manager = manager.clone();
        tokio::spawn(async move {
            let id = format!("s{i}");
            let (conn, mut producer) = ChannelConnection::new(4);
            let session = manager.accept_connection(&id, conn).await.unwrap();
            producer.send(Bytes::from(id.clone())).await.unwrap();
            if i % 2 == 0 {
                producer.hang_up();
            } else {
                manager.stop_session(&id).await;
            }
            tokio::time::timeout(WAIT, session.wait_closed())
                .await
                .unwrap();
        })
    });
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    tokio::time::timeout(WAIT, async {
        while !manager.registry().is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(manager.running_processes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_racing_hang_up_closes_producer_once() {
    let manager = cat_manager();

    for i in 0..20 {
        let id = format!("race{i}");
        let (conn, mut producer) = ChannelConnection::new(4);
        let session = manager.accept_connection(&id, conn).await.unwrap();
        wait_for_state(&session, SessionState::Active).await;

        tokio::join!(manager.stop_session(&id), async { producer.hang_up() });
        wait_closed(&session).await;

        assert!(matches!(
            session.trigger(),
            Some(TerminalTrigger::Stopped | TerminalTrigger::TransportClosed)
        ));
        assert_eq!(producer.closed().await, Some(CloseReason::Normal));
        assert_eq!(producer.close_calls(), 1);
    }

    tokio::time::timeout(WAIT, async {
        while !manager.registry().is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(manager.running_processes(), 0);
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let manager = cat_manager();

    let mut producers = Vec::new();
    for i in 0..5 {
        let (conn, producer) = ChannelConnection::new(4);
        let session = manager
            .accept_connection(&format!("s{i}"), conn)
            .await
            .unwrap();
        wait_for_state(&session, SessionState::Active).await;
        producers.push(producer);
    }
    assert_eq!(manager.sessions().await.len(), 5);

    assert!(manager.shutdown(WAIT).await);

    assert!(manager.registry().is_empty().await);
    assert_eq!(manager.running_processes(), 0);
    for producer in &mut producers {
        assert_eq!(producer.closed().await, Some(CloseReason::GoingAway));
    }
}
