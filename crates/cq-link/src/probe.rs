/// Host probing used by discovery.
///
/// `TcpProbe` is the real thing: a bounded TCP connect to the protocol port,
/// and a weak "is this a CQ mixer" check. The check sends a keepalive byte
/// and treats a connection that stays open for the verification window as a
/// match. Any TCP service that tolerates a stray byte will pass too; the
/// protocol offers no identity handshake to do better.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use cq_protocol::KEEPALIVE_BYTE;

#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Whether the protocol port accepts a TCP connection.
    async fn probe_port(&self, address: Ipv4Addr) -> bool;

    /// Whether the host behaves like a mixer (best effort).
    async fn verify_device(&self, address: Ipv4Addr) -> bool;

    /// Port the probe targets; discovered endpoints use it.
    fn port(&self) -> u16;
}

#[derive(Debug, Clone)]
pub struct TcpProbe {
    port: u16,
    timeout: Duration,
    verify_window: Duration,
}

impl TcpProbe {
    pub fn new(port: u16, timeout: Duration, verify_window: Duration) -> Self {
        Self {
            port,
            timeout,
            verify_window,
        }
    }

    fn target(&self, address: Ipv4Addr) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(address, self.port))
    }

    async fn open(&self, address: Ipv4Addr) -> Option<TcpStream> {
        match timeout(self.timeout, TcpStream::connect(self.target(address))).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                trace!(address = %address, error = %e, "Probe connect failed");
                None
            }
            Err(_) => {
                trace!(address = %address, "Probe connect timed out");
                None
            }
        }
    }
}

#[async_trait]
impl DeviceProbe for TcpProbe {
    async fn probe_port(&self, address: Ipv4Addr) -> bool {
        self.open(address).await.is_some()
    }

    async fn verify_device(&self, address: Ipv4Addr) -> bool {
        let Some(mut stream) = self.open(address).await else {
            return false;
        };

        if let Err(e) = stream.write_all(&[KEEPALIVE_BYTE]).await {
            debug!(address = %address, error = %e, "Verification write failed");
            return false;
        }

        // Mixers stay silent and keep the socket open. A peer that hangs up
        // inside the window is not a mixer.
        let mut buf = [0u8; 64];
        let verified = match timeout(self.verify_window, stream.read(&mut buf)).await {
            Err(_) => true,
            Ok(Ok(0)) => false,
            Ok(Ok(n)) => {
                debug!(address = %address, bytes = n, "Candidate answered during verification");
                true
            }
            Ok(Err(e)) => {
                debug!(address = %address, error = %e, "Candidate reset during verification");
                false
            }
        };

        let _ = stream.shutdown().await;
        verified
    }

    fn port(&self) -> u16 {
        self.port
    }
}
