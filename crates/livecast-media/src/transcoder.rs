//! Encoder subprocess supervision.
//!
//! Spawns one encoder process per ingest session, forwards its diagnostic
//! output to tracing, and owns the graceful-then-forced termination path.
//! The supervisor never restarts a process.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use livecast_core::config::{DownstreamConfig, TranscoderConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

/// Encoder codec/format policy used to build the default argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderProfile {
    pub video_codec: String,
    pub audio_codec: String,
    pub format: String,
    pub extra_args: Vec<String>,
}

impl Default for EncoderProfile {
    fn default() -> Self {
        Self {
            video_codec: "copy".to_string(),
            audio_codec: "copy".to_string(),
            format: "flv".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// How the argument list for a session's process is built.
#[derive(Debug, Clone)]
pub enum ArgsPolicy {
    /// ffmpeg-style: read stdin, apply codecs, write `format` to the destination.
    Encoder(EncoderProfile),
    /// Literal arguments; `{session_id}` and `{destination}` are substituted.
    Custom(Vec<String>),
}

impl ArgsPolicy {
    /// Build the argument list for one session.
    pub fn build(&self, session_id: &str, destination: &str) -> Vec<String> {
        match self {
            Self::Encoder(profile) => {
                let mut args = vec![
                    "-i".to_string(),
                    "pipe:0".to_string(),
                    "-c:v".to_string(),
                    profile.video_codec.clone(),
                    "-c:a".to_string(),
                    profile.audio_codec.clone(),
                ];
                args.extend(profile.extra_args.iter().cloned());
                args.push("-f".to_string());
                args.push(profile.format.clone());
                args.push(destination.to_string());
                args
            }
            Self::Custom(template) => template
                .iter()
                .map(|arg| {
                    arg.replace("{session_id}", session_id)
                        .replace("{destination}", destination)
                })
                .collect(),
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the encoder binary.
    pub program: PathBuf,
    pub args: ArgsPolicy,
    /// Destination prefix; the session id is appended as the last path segment.
    pub destination_base: String,
    /// Grace period between SIGINT and SIGKILL.
    pub terminate_timeout: Duration,
}

impl SupervisorConfig {
    /// Build from the resolved transcoder and downstream configuration.
    pub fn from_config(transcoder: &TranscoderConfig, downstream: &DownstreamConfig) -> Self {
        Self {
            program: transcoder.program.clone(),
            args: ArgsPolicy::Encoder(EncoderProfile {
                video_codec: transcoder.video_codec.clone(),
                audio_codec: transcoder.audio_codec.clone(),
                format: transcoder.format.clone(),
                extra_args: transcoder.extra_args.clone(),
            }),
            destination_base: format!(
                "rtmp://{}:{}/{}",
                downstream.host, downstream.port, downstream.app
            ),
            terminate_timeout: transcoder.terminate_timeout(),
        }
    }
}

/// Errors from encoder process operations.
#[derive(Debug, thiserror::Error)]
pub enum TranscoderError {
    #[error("Failed to spawn encoder for session {session_id}: {reason}")]
    SpawnFailed { session_id: String, reason: String },

    #[error("Failed to capture encoder stdin for session {session_id}")]
    StdinUnavailable { session_id: String },

    #[error("Error waiting on encoder for session {session_id}: {source}")]
    Wait {
        session_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// How a process ended when termination was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process had already exited on its own.
    AlreadyExited,
    /// The process exited within the grace period after SIGINT.
    Graceful,
    /// The process was force-killed.
    Killed,
}

/// Launches encoder processes and tracks how many are alive.
#[derive(Clone)]
pub struct TranscoderSupervisor {
    config: Arc<SupervisorConfig>,
    running: Arc<AtomicUsize>,
}

impl TranscoderSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config: Arc::new(config),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Destination address for a session.
    pub fn destination_for(&self, session_id: &str) -> String {
        format!(
            "{}/{}",
            self.config.destination_base.trim_end_matches('/'),
            session_id
        )
    }

    /// Number of processes spawned and not yet released.
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn terminate_timeout(&self) -> Duration {
        self.config.terminate_timeout
    }

    /// Spawn the encoder for `session_id` with stdin piped.
    pub fn spawn(&self, session_id: &str) -> Result<TranscoderProcess, TranscoderError> {
        let destination = self.destination_for(session_id);
        let args = self.config.args.build(session_id, &destination);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            session_id,
            program = %self.config.program.display(),
            destination = %destination,
            "Spawning encoder subprocess"
        );
        let mut child = cmd.spawn().map_err(|e| TranscoderError::SpawnFailed {
            session_id: session_id.to_string(),
            reason: e.to_string(),
        })?;

        // From here on the process exists; the guard keeps the count honest
        // even if the handle is dropped without an explicit terminate.
        let guard = RunningGuard::new(Arc::clone(&self.running));

        let stdin = child.stdin.take();
        if let Some(stderr) = child.stderr.take() {
            let sid = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(session_id = %sid, "encoder: {}", line);
                }
                debug!(session_id = %sid, "encoder stderr closed");
            });
        }

        let pid = child.id();
        debug!(session_id, ?pid, "Encoder subprocess started");

        Ok(TranscoderProcess {
            session_id: session_id.to_string(),
            pid,
            destination,
            args,
            child,
            stdin,
            exit_status: None,
            _guard: guard,
        })
    }
}

/// Decrements the running counter once per spawned process.
struct RunningGuard {
    running: Arc<AtomicUsize>,
}

impl RunningGuard {
    fn new(running: Arc<AtomicUsize>) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        Self { running }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to one session's encoder process.
pub struct TranscoderProcess {
    session_id: String,
    pid: Option<u32>,
    destination: String,
    args: Vec<String>,
    child: Child,
    stdin: Option<ChildStdin>,
    exit_status: Option<ExitStatus>,
    _guard: RunningGuard,
}

impl std::fmt::Debug for TranscoderProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscoderProcess")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .field("destination", &self.destination)
            .field("exit_status", &self.exit_status)
            .finish_non_exhaustive()
    }
}

impl TranscoderProcess {
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Exit status, once the process has been observed to exit.
    pub const fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Take the process's stdin for the relay pipe. Yields once.
    pub fn take_stdin(&mut self) -> Result<ChildStdin, TranscoderError> {
        self.stdin
            .take()
            .ok_or_else(|| TranscoderError::StdinUnavailable {
                session_id: self.session_id.clone(),
            })
    }

    /// Wait for the process to exit. Cancel-safe.
    pub async fn wait(&mut self) -> Result<ExitStatus, TranscoderError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await.map_err(|source| TranscoderError::Wait {
            session_id: self.session_id.clone(),
            source,
        })?;
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Request termination: SIGINT, then SIGKILL after `grace`.
    ///
    /// Safe to call after the process has already exited.
    pub async fn terminate(&mut self, grace: Duration) -> TerminateOutcome {
        if self.exit_status.is_some() {
            return TerminateOutcome::AlreadyExited;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit_status = Some(status);
            return TerminateOutcome::AlreadyExited;
        }

        debug!(session_id = %self.session_id, pid = ?self.pid, "Terminating encoder subprocess");
        self.interrupt();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(session_id = %self.session_id, ?status, "Encoder exited gracefully");
                self.exit_status = Some(status);
                TerminateOutcome::Graceful
            }
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "Error waiting for encoder");
                self.force_kill().await;
                TerminateOutcome::Killed
            }
            Err(_) => {
                warn!(session_id = %self.session_id, "Timeout waiting for graceful shutdown, killing");
                self.force_kill().await;
                TerminateOutcome::Killed
            }
        }
    }

    #[cfg(unix)]
    fn interrupt(&self) {
        if let Some(pid) = self.pid {
            // SAFETY: pid comes from our own Child handle, which has not been
            // reaped yet, so it cannot refer to an unrelated process.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(session_id = %self.session_id, pid, error = %err, "Failed to send SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    #[allow(clippy::unused_self)]
    const fn interrupt(&self) {}

    async fn force_kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(session_id = %self.session_id, error = %e, "Failed to kill encoder");
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit_status = Some(status);
        }
    }
}
