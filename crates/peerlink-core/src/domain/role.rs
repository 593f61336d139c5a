//! Peer roles.
//!
//! A node is created as either a [`Role::Client`] or a [`Role::Server`].  The
//! role decides:
//!
//! - which coordination-bus channels the node subscribes to,
//! - which channels it publishes its own `push` and `ping` signals on,
//! - whether it starts the handshake (clients announce `init`) or answers it.
//!
//! ```text
//!  Client                         Server
//!  ──────                         ──────
//!  publish  client-init  ───────► subscribe client-init
//!  subscribe server-push ◄─────── publish  server-push
//!  publish  client-push  ───────► subscribe client-push
//!  subscribe server-ping ◄─────── publish  server-ping
//!  publish  client-ping  ───────► subscribe client-ping
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::signal::Channel;

/// Which side of the pairing handshake a node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Announces itself with `init` and pairs with every server that answers.
    Client,
    /// Answers `init` announcements and dispatches requests to a handler.
    Server,
}

impl Role {
    /// Lower-case name used in channel names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }

    /// The role on the other end of a pair.
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    /// Channels this role listens to.
    pub fn subscriptions(&self) -> &'static [Channel] {
        match self {
            Role::Client => &[Channel::ServerPush, Channel::ServerPing],
            Role::Server => &[Channel::ClientInit, Channel::ClientPush, Channel::ClientPing],
        }
    }

    /// Channel this role announces its push sockets on.
    pub fn push_channel(&self) -> Channel {
        match self {
            Role::Client => Channel::ClientPush,
            Role::Server => Channel::ServerPush,
        }
    }

    /// Channel this role broadcasts liveness on.
    pub fn ping_channel(&self) -> Channel {
        match self {
            Role::Client => Channel::ClientPing,
            Role::Server => Channel::ServerPing,
        }
    }

    /// Channel this role announces itself on when starting, if any.
    pub fn init_channel(&self) -> Option<Channel> {
        match self {
            Role::Client => Some(Channel::ClientInit),
            Role::Server => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            other => Err(format!("unknown role {other:?} (expected client or server)")),
        }
    }
}
