//! Application layer of a peerlink node.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The application layer holds the rules of the pairing protocol and talks to
//! the outside world only through the traits declared in [`ports`].  It never
//! opens a TCP socket or a bus connection itself, which is why every module in
//! here can be tested against the in-memory adapters.
//!
//! # Sub-modules
//!
//! - **`ports`** – Traits for the transport, the coordination bus and the port
//!   allocator, plus their error types.
//!
//! - **`pair_table`** – Who we are paired with, which sockets belong to each
//!   pair, and which handshakes are still in flight.
//!
//! - **`heartbeat`** – Single-flight tick that decides between a
//!   garbage-collection pass and a liveness broadcast.
//!
//! - **`pairing`** – Reacts to `init`/`push`/`ping` bus signals by opening
//!   sockets and filling the pair table.
//!
//! - **`dispatch`** – Turns inbound frames into handler calls and replies.
//!
//! - **`peer_node`** – Composes everything above behind `start`/`send`/`stop`.

pub mod dispatch;
pub mod heartbeat;
pub mod pair_table;
pub mod pairing;
pub mod peer_node;
pub mod ports;
