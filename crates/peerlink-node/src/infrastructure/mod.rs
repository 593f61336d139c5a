//! Infrastructure layer of a peerlink node.
//!
//! Contains the adapters behind the application ports: TCP push/pull sockets,
//! the TCP coordination bus (client and broker), the in-memory network used by
//! tests, free-port probing, host address resolution and TOML config storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `peerlink_core`, but MUST NOT be imported by the `application` layer.

pub mod bus;
pub mod framing;
pub mod host;
pub mod memory;
pub mod port_finder;
pub mod storage;
pub mod tcp_transport;

use std::sync::Arc;

use peerlink_core::Role;

use crate::application::peer_node::{NodeInfrastructure, NodeOptions, PeerNode};
use crate::application::ports::BusError;
use crate::infrastructure::bus::TcpBus;
use crate::infrastructure::port_finder::TcpPortFinder;
use crate::infrastructure::tcp_transport::TcpTransport;

/// Builds an idle node wired to the TCP adapters: a [`TcpBus`] connection to
/// `options.bus_address`, TCP push/pull sockets and free-port probing.
///
/// # Errors
///
/// [`BusError::Connect`] if the bus broker cannot be reached.
pub async fn connect(role: Role, options: NodeOptions) -> Result<PeerNode, BusError> {
    let bus = TcpBus::connect(&options.bus_address).await?;
    let infra = NodeInfrastructure {
        bus: Arc::new(bus),
        transport: Arc::new(TcpTransport::new()),
        ports: Arc::new(TcpPortFinder::new()),
    };
    Ok(PeerNode::new(role, options, infra))
}
