//! Traffic frontend — the TCP listener clients connect to.
//!
//! Accepted connections wait in a small bounded buffer until a dispatcher
//! admits them under the `max_connections` limit. Nothing queues beyond
//! that buffer: when it is full, when no instance is routable, or when
//! the chosen instance cannot be reached, the client gets a minimal 503
//! response and the connection is closed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, ProxyAdapter};
use crate::router::Router;

pub const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
content-type: text/plain\r\n\
content-length: 19\r\n\
connection: close\r\n\
\r\n\
service unavailable";

pub struct TrafficFrontend {
    router: Arc<Router>,
    adapter: Arc<ProxyAdapter>,
    buffer: usize,
    max_connections: usize,
}

impl TrafficFrontend {
    pub fn new(
        router: Arc<Router>,
        adapter: Arc<ProxyAdapter>,
        buffer: usize,
        max_connections: usize,
    ) -> Self {
        Self {
            router,
            adapter,
            buffer: buffer.max(1),
            max_connections: max_connections.max(1),
        }
    }

    /// Accept connections on `listener` until shutdown.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let (queue_tx, queue_rx) = mpsc::channel::<TcpStream>(self.buffer);
        let dispatcher = tokio::spawn(dispatch(
            queue_rx,
            Arc::clone(&self.router),
            Arc::clone(&self.adapter),
            Arc::new(Semaphore::new(self.max_connections)),
        ));

        info!(
            addr = %listener.local_addr()?,
            buffer = self.buffer,
            max_connections = self.max_connections,
            "traffic frontend listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if self.router.current().is_empty() {
                        debug!(%peer, "no routable instances");
                        tokio::spawn(reject(stream));
                        continue;
                    }
                    match queue_tx.try_send(stream) {
                        Ok(()) => {}
                        Err(TrySendError::Full(stream)) => {
                            debug!(%peer, "connection buffer full");
                            tokio::spawn(reject(stream));
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                _ = shutdown.changed() => {
                    info!("traffic frontend shutting down");
                    break;
                }
            }
        }

        // Forwards already admitted keep running; buffered ones are dropped.
        dispatcher.abort();
        Ok(())
    }
}

async fn dispatch(
    mut queue: mpsc::Receiver<TcpStream>,
    router: Arc<Router>,
    adapter: Arc<ProxyAdapter>,
    limit: Arc<Semaphore>,
) {
    while let Some(stream) = queue.recv().await {
        let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
            break;
        };
        let router = Arc::clone(&router);
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move {
            let _permit = permit;
            handle(stream, &router, &adapter).await;
        });
    }
}

async fn handle(mut stream: TcpStream, router: &Router, adapter: &ProxyAdapter) {
    // Routed at dispatch time: the set may have changed while buffered.
    let lease = match router.route() {
        Ok(lease) => lease,
        Err(e) => {
            debug!(error = %e, "rejecting connection");
            reject(stream).await;
            return;
        }
    };
    match adapter.translate(&lease, &mut stream).await {
        Ok(_) => {}
        Err(AdapterError::Unreachable { .. }) => reject(stream).await,
        Err(e) => debug!(instance = %lease.target.id, error = %e, "connection ended with error"),
    }
}

/// Answer with 503 and close.
async fn reject(mut stream: TcpStream) {
    let _ = stream.write_all(SERVICE_UNAVAILABLE).await;
    let _ = stream.shutdown().await;
    // Read off the request so closing does not reset the connection
    // before the client has read the response.
    let mut buf = [0u8; 4096];
    let _ = tokio::time::timeout(Duration::from_millis(200), async {
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_response_length_matches_body() {
        let text = std::str::from_utf8(SERVICE_UNAVAILABLE).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 503"));
        assert!(head.contains(&format!("content-length: {}", body.len())));
    }
}
