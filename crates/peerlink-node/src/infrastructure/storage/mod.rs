//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads and writes the node's TOML configuration and
//! turns it into the [`NodeOptions`](crate::application::peer_node::NodeOptions)
//! the application layer runs on.  A missing file is not an error: defaults
//! apply on first run.

pub mod config;
