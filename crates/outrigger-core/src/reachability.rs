//! Server reachability probe
//!
//! A bare TCP connect against the remote server, used as the cheap
//! fail-fast gate before any child process is spawned. No retries here;
//! retry policy belongs to the caller.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Reachability check seam for the lifecycle controller
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Returns true iff a TCP connection to `host:port` succeeds within
    /// `limit`. Any connect error or timeout counts as unreachable.
    async fn is_reachable(&self, host: &str, port: u16, limit: Duration) -> bool;
}

/// Probe backed by a real TCP connection attempt
#[derive(Debug, Default, Clone)]
pub struct TcpReachabilityProbe;

#[async_trait]
impl ReachabilityProbe for TcpReachabilityProbe {
    async fn is_reachable(&self, host: &str, port: u16, limit: Duration) -> bool {
        // The stream is dropped (and the socket closed) on every path.
        match timeout(limit, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!("reachability probe to {}:{} failed: {}", host, port, e);
                false
            }
            Err(_) => {
                debug!(
                    "reachability probe to {}:{} timed out after {:?}",
                    host, port, limit
                );
                false
            }
        }
    }
}
