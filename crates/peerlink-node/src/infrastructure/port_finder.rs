//! Free-port probing for push sockets.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::trace;

use crate::application::ports::{PortAllocator, TransportError};

/// Finds a free TCP port by binding (and immediately releasing) candidates in
/// ascending order starting at the preferred port.
///
/// The port is only free at the moment of probing; the caller still has to
/// handle [`TransportError::AddrInUse`] when it binds for real.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortFinder;

impl TcpPortFinder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PortAllocator for TcpPortFinder {
    async fn free_port(&self, host: IpAddr, preferred: u16) -> Result<u16, TransportError> {
        let from = preferred.max(1);
        for port in from..=u16::MAX {
            match TcpListener::bind(SocketAddr::new(host, port)).await {
                Ok(listener) => {
                    drop(listener);
                    return Ok(port);
                }
                Err(e) => trace!("port {port} on {host} unavailable: {e}"),
            }
        }
        Err(TransportError::NoFreePort { host, from })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_skips_a_port_that_is_taken() {
        // Arrange: hold an ephemeral port.
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = held.local_addr().unwrap().port();

        // Act
        let found = TcpPortFinder::new().free_port(localhost(), taken).await.unwrap();

        // Assert
        assert!(found > taken);
    }

    #[tokio::test]
    async fn test_returned_port_can_be_bound() {
        let found = TcpPortFinder::new().free_port(localhost(), 20000).await.unwrap();
        assert!(found >= 20000);
        assert!(std::net::TcpListener::bind(("127.0.0.1", found)).is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_range_reports_no_free_port() {
        // Only 65535 is a candidate; hold it if we can, otherwise skip.
        let Ok(_held) = std::net::TcpListener::bind(("127.0.0.1", u16::MAX)) else {
            return;
        };
        let result = TcpPortFinder::new().free_port(localhost(), u16::MAX).await;
        assert!(matches!(
            result,
            Err(TransportError::NoFreePort { from: u16::MAX, .. })
        ));
    }
}
