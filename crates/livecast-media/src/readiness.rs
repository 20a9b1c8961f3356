//! Downstream readiness checks.
//!
//! A session only starts its encoder once the broadcast endpoint accepts TCP
//! connections. The check is a bare connect; no RTMP handshake is attempted.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// A single connectivity check against a `host:port` endpoint.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check(&self, endpoint: &str) -> io::Result<()>;
}

/// Check that opens (and immediately drops) a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpCheck {
    connect_timeout: Duration,
}

impl TcpCheck {
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpCheck {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl ReadinessCheck for TcpCheck {
    async fn check(&self, endpoint: &str) -> io::Result<()> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        drop(stream);
        Ok(())
    }
}

/// Retry policy for readiness checks. The delay is fixed between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Errors from readiness checks.
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("Downstream {endpoint} unavailable after {attempts} attempts: {last_error}")]
    DownstreamUnavailable {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },
}

/// Polls an endpoint until it accepts connections or the attempts run out.
#[derive(Clone)]
pub struct ReadinessGate {
    check: Arc<dyn ReadinessCheck>,
    policy: RetryPolicy,
}

impl ReadinessGate {
    pub fn new(check: Arc<dyn ReadinessCheck>, policy: RetryPolicy) -> Self {
        Self { check, policy }
    }

    /// TCP gate with the given policy and per-attempt connect timeout.
    pub fn tcp(policy: RetryPolicy, connect_timeout: Duration) -> Self {
        Self::new(Arc::new(TcpCheck::new(connect_timeout)), policy)
    }

    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Wait until `endpoint` is reachable.
    ///
    /// Returns the 1-based attempt number that succeeded. Only the calling
    /// task is suspended between attempts.
    pub async fn wait_until_ready(&self, endpoint: &str) -> Result<u32, ReadinessError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.check.check(endpoint).await {
                Ok(()) => {
                    info!(endpoint, attempt, "Downstream ready");
                    return Ok(attempt);
                }
                Err(e) => {
                    debug!(endpoint, attempt, max_attempts, error = %e, "Downstream not ready");
                    last_error = e.to_string();
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        warn!(endpoint, attempts = max_attempts, error = %last_error, "Downstream unavailable");
        Err(ReadinessError::DownstreamUnavailable {
            endpoint: endpoint.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

/// Check `host:port` over TCP with a fixed retry delay.
pub async fn wait_until_ready(
    host: &str,
    port: u16,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<u32, ReadinessError> {
    let gate = ReadinessGate::new(
        Arc::new(TcpCheck::default()),
        RetryPolicy {
            max_attempts,
            retry_delay,
        },
    );
    gate.wait_until_ready(&format!("{host}:{port}")).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails until the `ready_on`-th call.
    struct FlakyCheck {
        calls: AtomicU32,
        ready_on: u32,
    }

    #[async_trait]
    impl ReadinessCheck for FlakyCheck {
        async fn check(&self, _endpoint: &str) -> io::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.ready_on {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            }
        }
    }

    fn flaky(ready_on: u32) -> Arc<FlakyCheck> {
        Arc::new(FlakyCheck {
            calls: AtomicU32::new(0),
            ready_on,
        })
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            retry_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let check = flaky(3);
        let gate = ReadinessGate::new(check.clone(), fast_policy(5));

        let attempt = gate.wait_until_ready("downstream:1935").await.unwrap();
        assert_eq!(attempt, 3);
        assert_eq!(check.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let check = flaky(u32::MAX);
        let gate = ReadinessGate::new(check.clone(), fast_policy(5));

        let err = gate.wait_until_ready("downstream:1935").await.unwrap_err();
        let ReadinessError::DownstreamUnavailable { attempts, .. } = err;
        assert_eq!(attempts, 5);
        assert_eq!(check.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn tcp_check_accepts_listening_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let attempt = wait_until_ready("127.0.0.1", port, 1, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(attempt, 1);
    }

    #[tokio::test]
    async fn tcp_check_refused_when_nothing_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = wait_until_ready("127.0.0.1", port, 2, Duration::from_millis(5)).await;
        assert!(result.is_err());
    }
}
