//! Per-node registry of pairs, in-flight handshakes and the sockets they own.
//!
//! # Layout
//!
//! ```text
//!  pairs:    PeerId ─► Pair { push_address, pull_address, last_seen }
//!  pending:  PeerId ─► PendingPair { stage, since }
//!  push:     "ip:port" ─► Arc<dyn PushSocket>
//!  pull:     "ip:port" ─► Arc<dyn PullSocket>
//! ```
//!
//! Every address in `push`/`pull` belongs to exactly one pair or one pending
//! handshake, and every pair's two addresses are present in `push`/`pull`.
//! The table enforces both rules: inserting a taken address fails, and
//! [`PairTable::register_pair`] refuses addresses without a live socket.
//!
//! # Locking
//!
//! The table itself is plain data.  The node wraps it in a
//! `tokio::sync::Mutex` and only holds the lock for the short synchronous
//! calls below, never across a socket connect or a bus publish.  Sockets that
//! leave the table are handed back to the caller to close outside the lock.
//!
//! Once [`PairTable::drain`] has run the table is closed: every insert fails
//! with [`PairTableError::Closed`], so handshakes finishing after `stop()`
//! close their sockets instead of leaking them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use peerlink_core::{PeerId, SocketToken};
use thiserror::Error;
use tokio::time::Instant;

use crate::application::ports::{PullSocket, PushSocket};

/// Errors returned by pair table mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairTableError {
    /// The node has stopped.
    #[error("pair table is closed")]
    Closed,
    /// The address is already registered.
    #[error("address {0} is already registered")]
    AddressInUse(String),
    /// A pair was registered with an address that has no live socket.
    #[error("no live socket registered at {0}")]
    MissingSocket(String),
    /// The remote peer is already paired.
    #[error("peer {0} is already paired")]
    AlreadyPaired(PeerId),
}

/// Where a remote peer stands from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unknown,
    Pending,
    Paired,
}

/// A completed pairing with one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    /// Address of our push socket feeding the remote's pull socket.
    pub push_address: String,
    /// Address of the remote push socket our pull socket connected to.
    pub pull_address: String,
    pub last_seen: Instant,
}

/// Progress of a handshake that has not produced a pair yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingStage {
    /// Sockets are being opened; nothing is registered yet.
    Opening,
    /// Server: our push socket is bound and announced, waiting for the client's
    /// push signal.
    Announced {
        push_address: String,
        port: u16,
        token: SocketToken,
    },
    /// Server: the client answered and our pull socket is connecting.
    Completing {
        push_address: String,
        port: u16,
        token: SocketToken,
    },
    /// Client: our pull socket is connected, our push socket is being opened.
    Connected { pull_address: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPair {
    pub stage: PendingStage,
    pub since: Instant,
}

/// Sockets released by garbage collection, ready to be closed by the caller.
pub struct Reclaimed {
    pub peer: PeerId,
    /// `true` if a completed pair was removed, `false` for a stale handshake.
    pub was_paired: bool,
    pub push: Option<Arc<dyn PushSocket>>,
    pub pull: Option<Arc<dyn PullSocket>>,
}

impl Reclaimed {
    /// Closes every socket carried by this record.
    pub fn close(&self) {
        if let Some(push) = &self.push {
            push.close();
        }
        if let Some(pull) = &self.pull {
            pull.close();
        }
    }
}

/// Point-in-time view of one pair, returned by the node's introspection API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSnapshot {
    pub peer: PeerId,
    pub push_address: String,
    pub pull_address: String,
    pub idle: Duration,
}

#[derive(Default)]
pub struct PairTable {
    pairs: HashMap<PeerId, Pair>,
    pending: HashMap<PeerId, PendingPair>,
    push: HashMap<String, Arc<dyn PushSocket>>,
    pull: HashMap<String, Arc<dyn PullSocket>>,
    closed: bool,
}

impl PairTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// `true` when there are no pairs and no handshakes in flight.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.pending.is_empty()
    }

    pub fn state(&self, peer: &PeerId) -> PeerState {
        if self.pairs.contains_key(peer) {
            PeerState::Paired
        } else if self.pending.contains_key(peer) {
            PeerState::Pending
        } else {
            PeerState::Unknown
        }
    }

    pub fn pair(&self, peer: &PeerId) -> Option<&Pair> {
        self.pairs.get(peer)
    }

    pub fn pending(&self, peer: &PeerId) -> Option<&PendingPair> {
        self.pending.get(peer)
    }

    pub fn snapshot(&self, now: Instant) -> Vec<PairSnapshot> {
        let mut pairs: Vec<PairSnapshot> = self
            .pairs
            .iter()
            .map(|(peer, pair)| PairSnapshot {
                peer: *peer,
                push_address: pair.push_address.clone(),
                pull_address: pair.pull_address.clone(),
                idle: now.saturating_duration_since(pair.last_seen),
            })
            .collect();
        pairs.sort_by(|a, b| a.peer.cmp(&b.peer));
        pairs
    }

    // ── Handshake bookkeeping ─────────────────────────────────────────────────

    /// Marks `peer` as pending in the [`PendingStage::Opening`] stage.
    ///
    /// Returns `Ok(false)` without changing anything if the peer is already
    /// pending or paired.
    pub fn begin_pending(&mut self, peer: PeerId, now: Instant) -> Result<bool, PairTableError> {
        if self.closed {
            return Err(PairTableError::Closed);
        }
        if self.state(&peer) != PeerState::Unknown {
            return Ok(false);
        }
        self.pending.insert(
            peer,
            PendingPair {
                stage: PendingStage::Opening,
                since: now,
            },
        );
        Ok(true)
    }

    /// Moves a pending handshake to `stage`.  Returns `false` if `peer` is no
    /// longer pending (reclaimed or cleared meanwhile).
    pub fn set_stage(&mut self, peer: &PeerId, stage: PendingStage) -> bool {
        match self.pending.get_mut(peer) {
            Some(entry) => {
                entry.stage = stage;
                true
            }
            None => false,
        }
    }

    /// Forgets a pending handshake.  Sockets it registered are removed from the
    /// socket tables and returned for closing.
    pub fn abandon_pending(&mut self, peer: &PeerId) -> Option<Reclaimed> {
        let entry = self.pending.remove(peer)?;
        Some(self.release_stage(*peer, &entry.stage))
    }

    // ── Socket tables ─────────────────────────────────────────────────────────

    pub fn insert_push(&mut self, socket: Arc<dyn PushSocket>) -> Result<(), PairTableError> {
        if self.closed {
            return Err(PairTableError::Closed);
        }
        let address = socket.address().to_string();
        if self.push.contains_key(&address) {
            return Err(PairTableError::AddressInUse(address));
        }
        self.push.insert(address, socket);
        Ok(())
    }

    pub fn insert_pull(&mut self, socket: Arc<dyn PullSocket>) -> Result<(), PairTableError> {
        if self.closed {
            return Err(PairTableError::Closed);
        }
        let address = socket.address().to_string();
        if self.pull.contains_key(&address) {
            return Err(PairTableError::AddressInUse(address));
        }
        self.pull.insert(address, socket);
        Ok(())
    }

    pub fn remove_push(&mut self, address: &str) -> Option<Arc<dyn PushSocket>> {
        self.push.remove(address)
    }

    pub fn remove_pull(&mut self, address: &str) -> Option<Arc<dyn PullSocket>> {
        self.pull.remove(address)
    }

    pub fn push_socket(&self, address: &str) -> Option<Arc<dyn PushSocket>> {
        self.push.get(address).cloned()
    }

    // ── Pairs ─────────────────────────────────────────────────────────────────

    /// Completes the handshake with `peer`: clears its pending entry and
    /// records the pair.
    ///
    /// # Errors
    ///
    /// - [`PairTableError::Closed`] after [`PairTable::drain`].
    /// - [`PairTableError::AlreadyPaired`] if `peer` already has a pair.
    /// - [`PairTableError::MissingSocket`] if either address has no socket.
    pub fn register_pair(
        &mut self,
        peer: PeerId,
        push_address: String,
        pull_address: String,
        now: Instant,
    ) -> Result<(), PairTableError> {
        if self.closed {
            return Err(PairTableError::Closed);
        }
        if self.pairs.contains_key(&peer) {
            return Err(PairTableError::AlreadyPaired(peer));
        }
        if !self.push.contains_key(&push_address) {
            return Err(PairTableError::MissingSocket(push_address));
        }
        if !self.pull.contains_key(&pull_address) {
            return Err(PairTableError::MissingSocket(pull_address));
        }
        self.pending.remove(&peer);
        self.pairs.insert(
            peer,
            Pair {
                push_address,
                pull_address,
                last_seen: now,
            },
        );
        Ok(())
    }

    /// Refreshes the pair with `peer`.  Returns `false` if there is none.
    pub fn touch(&mut self, peer: &PeerId, now: Instant) -> bool {
        match self.pairs.get_mut(peer) {
            Some(pair) => {
                pair.last_seen = pair.last_seen.max(now);
                true
            }
            None => false,
        }
    }

    /// Refreshes the pair owning the pull socket at `pull_address` and returns
    /// the remote peer and the push address replies should go to.
    pub fn touch_by_pull(&mut self, pull_address: &str, now: Instant) -> Option<(PeerId, String)> {
        let (peer, pair) = self
            .pairs
            .iter_mut()
            .find(|(_, pair)| pair.pull_address == pull_address)?;
        pair.last_seen = pair.last_seen.max(now);
        Some((*peer, pair.push_address.clone()))
    }

    /// The address a peer answers on for traffic sent on `push_address`: the
    /// pull leg of the pair that push socket belongs to.
    pub fn reply_leg(&self, push_address: &str) -> Option<&str> {
        self.pairs
            .values()
            .find(|pair| pair.push_address == push_address)
            .map(|pair| pair.pull_address.as_str())
    }

    // ── Reclamation ───────────────────────────────────────────────────────────

    /// Removes every pair idle for longer than `max_idle` and every handshake
    /// started longer than `max_idle` ago, along with their socket entries.
    pub fn collect_expired(&mut self, now: Instant, max_idle: Duration) -> Vec<Reclaimed> {
        let expired_pairs: Vec<PeerId> = self
            .pairs
            .iter()
            .filter(|(_, pair)| now.saturating_duration_since(pair.last_seen) > max_idle)
            .map(|(peer, _)| *peer)
            .collect();
        let expired_pending: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.since) > max_idle)
            .map(|(peer, _)| *peer)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired_pairs.len() + expired_pending.len());
        for peer in expired_pairs {
            if let Some(pair) = self.pairs.remove(&peer) {
                reclaimed.push(Reclaimed {
                    peer,
                    was_paired: true,
                    push: self.push.remove(&pair.push_address),
                    pull: self.pull.remove(&pair.pull_address),
                });
            }
        }
        for peer in expired_pending {
            if let Some(rec) = self.abandon_pending(&peer) {
                reclaimed.push(rec);
            }
        }
        reclaimed
    }

    /// Closes the table and hands back every socket it held.
    pub fn drain(&mut self) -> (Vec<Arc<dyn PushSocket>>, Vec<Arc<dyn PullSocket>>) {
        self.closed = true;
        self.pairs.clear();
        self.pending.clear();
        (
            self.push.drain().map(|(_, s)| s).collect(),
            self.pull.drain().map(|(_, s)| s).collect(),
        )
    }

    fn release_stage(&mut self, peer: PeerId, stage: &PendingStage) -> Reclaimed {
        let (push, pull) = match stage {
            PendingStage::Opening => (None, None),
            PendingStage::Announced { push_address, .. }
            | PendingStage::Completing { push_address, .. } => {
                (self.push.remove(push_address), None)
            }
            PendingStage::Connected { pull_address } => (None, self.pull.remove(pull_address)),
        };
        Reclaimed {
            peer,
            was_paired: false,
            push,
            pull,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
