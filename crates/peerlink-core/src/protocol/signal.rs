//! Coordination-bus channels and the handshake signals published on them.
//!
//! # Channel naming
//!
//! Every channel is named `<origin role>-<signal kind>`, optionally namespaced
//! with a prefix so several independent meshes can share one bus:
//!
//! ```text
//!   prefix = None          prefix = Some("billing")
//!   ─────────────          ────────────────────────
//!   client-init            billing-client-init
//!   client-push            billing-client-push
//!   server-push            billing-server-push
//!   client-ping            billing-client-ping
//!   server-ping            billing-server-ping
//! ```
//!
//! # Payloads
//!
//! | Kind   | JSON body                                   |
//! |--------|---------------------------------------------|
//! | `init` | `{"id","ip"}`                               |
//! | `push` | `{"id","ip","port","sock","address"?,"to"?}` |
//! | `ping` | `{"id"}`                                    |

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::domain::ids::{PeerId, SocketToken};
use crate::domain::role::Role;
use crate::protocol::envelope::ProtocolError;

/// What a signal asks the receiver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// A client announcing itself.
    Init,
    /// A node announcing a push socket the receiver should connect to.
    Push,
    /// A liveness broadcast.
    Ping,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Init => "init",
            SignalKind::Push => "push",
            SignalKind::Ping => "ping",
        }
    }
}

/// The five bus channels of the pairing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ClientInit,
    ClientPush,
    ClientPing,
    ServerPush,
    ServerPing,
}

impl Channel {
    /// Every channel, in a stable order.
    pub const ALL: [Channel; 5] = [
        Channel::ClientInit,
        Channel::ClientPush,
        Channel::ClientPing,
        Channel::ServerPush,
        Channel::ServerPing,
    ];

    /// Unprefixed channel name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::ClientInit => "client-init",
            Channel::ClientPush => "client-push",
            Channel::ClientPing => "client-ping",
            Channel::ServerPush => "server-push",
            Channel::ServerPing => "server-ping",
        }
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            Channel::ClientInit => SignalKind::Init,
            Channel::ClientPush | Channel::ServerPush => SignalKind::Push,
            Channel::ClientPing | Channel::ServerPing => SignalKind::Ping,
        }
    }

    /// The role that publishes on this channel.
    pub fn origin(&self) -> Role {
        match self {
            Channel::ClientInit | Channel::ClientPush | Channel::ClientPing => Role::Client,
            Channel::ServerPush | Channel::ServerPing => Role::Server,
        }
    }
}

/// Maps [`Channel`]s to bus topic names under an optional prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelNames {
    prefix: Option<String>,
}

impl ChannelNames {
    /// An empty prefix is treated the same as no prefix.
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Full topic name for `channel`.
    pub fn name(&self, channel: Channel) -> String {
        match &self.prefix {
            Some(p) => format!("{p}-{}", channel.as_str()),
            None => channel.as_str().to_string(),
        }
    }

    /// Reverse of [`Self::name`]: `None` for topics outside this prefix.
    pub fn resolve(&self, topic: &str) -> Option<Channel> {
        let bare = match &self.prefix {
            Some(p) => topic.strip_prefix(p.as_str())?.strip_prefix('-')?,
            None => topic,
        };
        Channel::ALL.into_iter().find(|c| c.as_str() == bare)
    }
}

// ── Signal payloads ───────────────────────────────────────────────────────────

/// `client-init`: a client announcing itself so servers offer it a push socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSignal {
    pub id: PeerId,
    pub ip: IpAddr,
}

/// `client-push` / `server-push`: "connect a pull socket to `ip:port`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSignal {
    pub id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
    /// Handshake token the pull side must present.
    pub sock: SocketToken,
    /// Set by clients: the client's own pull address, which names the server's
    /// announced push socket being completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Intended receiver.  Peers other than `to` ignore the signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
}

impl PushSignal {
    /// `ip:port` of the announced push socket.
    pub fn push_address(&self) -> String {
        std::net::SocketAddr::new(self.ip, self.port).to_string()
    }

    /// `true` if the signal is addressed to `me` or to nobody in particular.
    pub fn is_for(&self, me: PeerId) -> bool {
        self.to.map_or(true, |to| to == me)
    }
}

/// `client-ping` / `server-ping`: liveness of the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingSignal {
    pub id: PeerId,
}

/// A decoded bus signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Init(InitSignal),
    Push(PushSignal),
    Ping(PingSignal),
}

impl Signal {
    /// Decodes the JSON body received on `channel`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedPayload`] if the body does not match the
    /// channel's payload shape.
    pub fn decode(channel: Channel, payload: &str) -> Result<Self, ProtocolError> {
        let malformed = |e: serde_json::Error| {
            ProtocolError::MalformedPayload(format!("{}: {e}", channel.as_str()))
        };
        match channel.kind() {
            SignalKind::Init => serde_json::from_str(payload).map(Signal::Init).map_err(malformed),
            SignalKind::Push => serde_json::from_str(payload).map(Signal::Push).map_err(malformed),
            SignalKind::Ping => serde_json::from_str(payload).map(Signal::Ping).map_err(malformed),
        }
    }

    /// Encodes the signal body (without the channel).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let result = match self {
            Signal::Init(s) => serde_json::to_string(s),
            Signal::Push(s) => serde_json::to_string(s),
            Signal::Ping(s) => serde_json::to_string(s),
        };
        result.map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// The peer that published the signal.
    pub fn sender(&self) -> PeerId {
        match self {
            Signal::Init(s) => s.id,
            Signal::Push(s) => s.id,
            Signal::Ping(s) => s.id,
        }
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Init(_) => SignalKind::Init,
            Signal::Push(_) => SignalKind::Push,
            Signal::Ping(_) => SignalKind::Ping,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
