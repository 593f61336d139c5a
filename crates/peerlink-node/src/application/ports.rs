//! Port traits: the only way the application layer reaches the network.
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │        application           │
//!                 │  pairing · dispatch · node   │
//!                 └──────┬──────────┬─────────┬──┘
//!          Transport     │          │         │  CoordinationBus
//!     (push/pull sockets)│   PortAllocator    │  (publish/subscribe)
//!                 ┌──────▼──────────▼─────────▼──┐
//!                 │       infrastructure         │
//!                 │  tcp_transport · port_finder │
//!                 │  bus · memory                │
//!                 └──────────────────────────────┘
//! ```
//!
//! # Push and pull (for beginners)
//!
//! A *push* socket only sends and a *pull* socket only receives.  A pair between
//! two peers therefore needs two sockets on each side: A's push feeds B's pull,
//! and B's push feeds A's pull.  Each socket is registered under an address
//! string (`ip:port`) so replies can be routed by address.
//!
//! Push sockets queue frames while no pull peer is attached, and closing any
//! socket is infallible and idempotent.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use peerlink_core::SocketToken;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by transport sockets and port allocation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Another socket already holds this address.
    #[error("address {0} is already in use")]
    AddrInUse(String),

    /// Binding a push socket failed for a reason other than the address being taken.
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    /// Connecting a pull socket failed.
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// The push socket refused the handshake token.
    #[error("handshake rejected by {0}")]
    HandshakeRejected(String),

    /// The socket has been closed.
    #[error("socket {0} is closed")]
    Closed(String),

    /// No port in `from..=65535` could be bound on `host`.
    #[error("no free port on {host} at or above {from}")]
    NoFreePort { host: IpAddr, from: u16 },
}

/// Errors raised by the coordination bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus endpoint could not be reached.
    #[error("could not connect to bus at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// An I/O error on an established bus connection.
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bus frame could not be encoded or decoded.
    #[error("bus frame error: {0}")]
    Frame(String),

    /// The bus connection is gone.
    #[error("bus is closed")]
    Closed,
}

/// One frame received on a pull socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Address of the pull socket that received the frame.
    pub address: String,
    pub bytes: Vec<u8>,
}

/// One message delivered by the coordination bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Outbound half of a pair.
pub trait PushSocket: Send + Sync {
    /// `ip:port` this socket was bound on.
    fn address(&self) -> &str;

    /// Queues one frame for delivery.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once [`PushSocket::close`] has been called.
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    fn close(&self);
}

/// Inbound half of a pair.  Received frames go to the channel given at connect time.
pub trait PullSocket: Send + Sync {
    /// `ip:port` of the push socket this socket connected to.
    fn address(&self) -> &str;

    fn close(&self);
}

/// Opens push and pull sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Binds a push socket on `host:port` that accepts only pull peers
    /// presenting `token`.
    async fn bind_push(
        &self,
        host: IpAddr,
        port: u16,
        token: SocketToken,
    ) -> Result<Arc<dyn PushSocket>, TransportError>;

    /// Connects a pull socket to the push socket announced at `host:port`.
    async fn connect_pull(
        &self,
        host: IpAddr,
        port: u16,
        token: SocketToken,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Result<Arc<dyn PullSocket>, TransportError>;
}

/// Finds a port a push socket can bind.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Returns a free port on `host`, preferring `preferred` and searching upward.
    async fn free_port(&self, host: IpAddr, preferred: u16) -> Result<u16, TransportError>;
}

/// Broadcast publish/subscribe used for handshake signalling.
#[async_trait]
pub trait CoordinationBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Subscribes to `channels`.  Messages arrive on the returned receiver until
    /// it is dropped.
    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<BusMessage>, BusError>;

    /// Leaves the bus: ends every subscription made through this handle, and
    /// later calls fail with [`BusError::Closed`].  Idempotent.
    async fn close(&self);
}
