//! Domain types shared by every peer.
//!
//! - **`ids`** – The three kinds of identifier that travel between peers.
//! - **`role`** – Which side of the handshake a node plays, and therefore which
//!   bus channels it listens to and publishes on.

pub mod ids;
pub mod role;
