//! Health check probe logic.
//!
//! `HealthRecord` is the debounced per-instance state machine; `http_probe`
//! performs one bounded-latency liveness check.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use fleet_state::{HealthVerdict, InstanceId};

/// Why a single probe counted as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,

    #[error("connection refused")]
    Refused,

    #[error("non-2xx status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Tracks consecutive probe results for a single instance.
///
/// The verdict only moves after `healthy_threshold` consecutive successes
/// or `unhealthy_threshold` consecutive failures, never on one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRecord {
    pub instance_id: InstanceId,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Unix timestamp (seconds) of the last recorded result.
    pub last_probe_at: Option<u64>,
    pub verdict: HealthVerdict,
    #[serde(skip)]
    healthy_threshold: u32,
    #[serde(skip)]
    unhealthy_threshold: u32,
}

impl HealthRecord {
    pub fn new(instance_id: impl Into<InstanceId>, healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_probe_at: None,
            verdict: HealthVerdict::Unknown,
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Record one probe result taken at `at` (epoch seconds).
    ///
    /// Returns the new verdict when this result changed it.
    pub fn record(&mut self, passed: bool, at: u64) -> Option<HealthVerdict> {
        self.last_probe_at = Some(at);
        let previous = self.verdict;

        if passed {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            if self.consecutive_successes >= self.healthy_threshold {
                self.verdict = HealthVerdict::Healthy;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= self.unhealthy_threshold {
                self.verdict = HealthVerdict::Unhealthy;
            }
        }

        if self.verdict == previous {
            return None;
        }
        match self.verdict {
            HealthVerdict::Healthy => debug!(
                instance = %self.instance_id,
                successes = self.consecutive_successes,
                "instance became healthy"
            ),
            _ => warn!(
                instance = %self.instance_id,
                failures = self.consecutive_failures,
                threshold = self.unhealthy_threshold,
                "instance marked unhealthy"
            ),
        }
        Some(self.verdict)
    }

    pub fn verdict(&self) -> HealthVerdict {
        self.verdict
    }
}

/// Perform an HTTP liveness probe against `address`.
///
/// Succeeds only on a 2xx response within `timeout`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> Result<(), ProbeError> {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(address).await.map_err(|e| {
            debug!(error = %e, %uri, "health probe connection failed");
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ProbeError::Refused
            } else {
                ProbeError::Transport(e.to_string())
            }
        })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "fleet-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            debug!(status = %resp.status(), %uri, "health probe non-2xx");
            Err(ProbeError::Status(resp.status().as_u16()))
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            Err(ProbeError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a fixed raw HTTP response to every connection.
    async fn serve_fixed(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[test]
    fn record_starts_unknown() {
        let record = HealthRecord::new("i-1", 2, 3);
        assert_eq!(record.verdict(), HealthVerdict::Unknown);
        assert_eq!(record.last_probe_at, None);
    }

    #[test]
    fn healthy_after_n_successes() {
        let mut record = HealthRecord::new("i-1", 2, 3);
        assert_eq!(record.record(true, 1), None);
        assert_eq!(record.record(true, 2), Some(HealthVerdict::Healthy));
        assert_eq!(record.record(true, 3), None);
        assert_eq!(record.last_probe_at, Some(3));
    }

    #[test]
    fn unhealthy_after_m_failures() {
        let mut record = HealthRecord::new("i-1", 1, 3);
        record.record(true, 0);

        assert_eq!(record.record(false, 1), None);
        assert_eq!(record.record(false, 2), None);
        assert_eq!(record.verdict(), HealthVerdict::Healthy);
        assert_eq!(record.record(false, 3), Some(HealthVerdict::Unhealthy));
    }

    #[test]
    fn unknown_becomes_unhealthy_after_m_failures() {
        let mut record = HealthRecord::new("i-1", 2, 3);
        record.record(false, 1);
        record.record(false, 2);
        assert_eq!(record.verdict(), HealthVerdict::Unknown);
        assert_eq!(record.record(false, 3), Some(HealthVerdict::Unhealthy));
    }

    #[test]
    fn alternating_results_never_flip() {
        let mut record = HealthRecord::new("i-1", 2, 2);
        record.record(true, 0);
        record.record(true, 0);
        assert_eq!(record.verdict(), HealthVerdict::Healthy);

        for t in 0..20 {
            assert_eq!(record.record(t % 2 == 0, t), None);
        }
        assert_eq!(record.verdict(), HealthVerdict::Healthy);
    }

    #[test]
    fn recovery_needs_n_successes() {
        let mut record = HealthRecord::new("i-1", 3, 1);
        record.record(false, 0);
        assert_eq!(record.verdict(), HealthVerdict::Unhealthy);

        assert_eq!(record.record(true, 1), None);
        assert_eq!(record.record(true, 2), None);
        assert_eq!(record.record(true, 3), Some(HealthVerdict::Healthy));
    }

    #[tokio::test]
    async fn probe_2xx_succeeds() {
        let addr = serve_fixed("HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n").await;
        assert_eq!(http_probe(&addr, "/healthz", Duration::from_secs(2)).await, Ok(()));
    }

    #[tokio::test]
    async fn probe_non_2xx_fails_with_status() {
        let addr = serve_fixed("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n").await;
        assert_eq!(
            http_probe(&addr, "/healthz", Duration::from_secs(2)).await,
            Err(ProbeError::Status(503))
        );
    }

    #[tokio::test]
    async fn probe_closed_port_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert_eq!(
            http_probe(&addr, "/healthz", Duration::from_secs(2)).await,
            Err(ProbeError::Refused)
        );
    }

    #[tokio::test]
    async fn probe_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        assert_eq!(
            http_probe(&addr, "/healthz", Duration::from_millis(100)).await,
            Err(ProbeError::Timeout)
        );
    }
}
