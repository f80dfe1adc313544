//! Reverse proxy adapter — forwards a routed connection to the instance's
//! application port.
//!
//! Forwarding is byte-transparent. A failed or timed-out connect is
//! reported to the health checker as a failed probe and surfaced to the
//! caller; it is never retried against another instance here.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use fleet_health::PassiveReporter;

use crate::router::RouteLease;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("instance {id} unreachable at {address}: {reason}")]
    Unreachable {
        id: String,
        address: String,
        reason: String,
    },

    #[error("forwarding error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ProxyAdapter {
    connect_timeout: Duration,
    reporter: PassiveReporter,
}

impl ProxyAdapter {
    pub fn new(connect_timeout: Duration, reporter: PassiveReporter) -> Self {
        Self {
            connect_timeout,
            reporter,
        }
    }

    /// Open the upstream connection for a lease.
    pub async fn connect(&self, lease: &RouteLease) -> Result<TcpStream, AdapterError> {
        let target = &lease.target;
        let address = target.upstream();
        let reason = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address)).await
        {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timed out after {:?}", self.connect_timeout),
        };

        warn!(instance = %target.id, %address, %reason, "upstream connect failed");
        self.reporter.report_failure(&target.id);
        Err(AdapterError::Unreachable {
            id: target.id.clone(),
            address,
            reason,
        })
    }

    /// Forward `incoming` to the leased instance until either side closes.
    ///
    /// Returns bytes copied (client → instance, instance → client).
    pub async fn translate<S>(&self, lease: &RouteLease, incoming: &mut S) -> Result<(u64, u64), AdapterError>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let mut upstream = self.connect(lease).await?;
        let (up, down) = tokio::io::copy_bidirectional(incoming, &mut upstream).await?;
        debug!(
            instance = %lease.target.id,
            port = lease.target.mapping.app_port,
            bytes_up = up,
            bytes_down = down,
            "connection forwarded"
        );
        Ok((up, down))
    }
}
