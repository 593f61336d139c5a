//! # peerlink-core
//!
//! Shared library for peerlink containing the identifiers, peer roles, wire
//! envelope codec, and coordination-bus signal types.
//!
//! This crate is used by every node regardless of role.  It has zero
//! dependencies on sockets, async runtimes, or the coordination bus itself.
//!
//! # Architecture overview (for beginners)
//!
//! peerlink lets two kinds of processes find each other without knowing each
//! other's address in advance:
//!
//! - **Clients** announce themselves on a shared broadcast bus.
//! - **Servers** answer the announcement by opening a socket and telling the
//!   client where to connect.
//!
//! Once both sides have connected, they hold a *pair*: two one-directional
//! sockets (one for each direction) over which application messages flow.
//!
//! This crate is the shared vocabulary for that conversation:
//!
//! - **`domain`** – Identifiers (`PeerId`, `CorrelationId`, `SocketToken`) and
//!   the `Role` enum that decides which channels a node listens to.
//!
//! - **`protocol`** – How bytes travel.  Application messages are wrapped in an
//!   [`Envelope`] (a flat JSON object) and handshake messages are [`Signal`]s
//!   published on named bus channels.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `peerlink_core::PeerId` instead of `peerlink_core::domain::ids::PeerId`.
pub use domain::ids::{CorrelationId, IdError, PeerId, SocketToken};
pub use domain::role::Role;
pub use protocol::envelope::{encode, parse, Envelope, ParseRules, ProtocolError, ValidationError};
pub use protocol::signal::{
    Channel, ChannelNames, InitSignal, PingSignal, PushSignal, Signal, SignalKind,
};
