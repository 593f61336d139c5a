//! Pairing state machine: turns bus signals into open sockets and pairs.
//!
//! # The handshake
//!
//! ```text
//!  Client C                         bus                          Server S
//!  ────────                         ───                          ────────
//!  publish client-init {C, ip} ───────────────────────────────►  S: C Unknown → Pending
//!                                                                allocate port, bind push(P_s, tok_s)
//!  C: S Unknown → Pending  ◄───────────── server-push {S, ip, P_s, tok_s, to: C}
//!  connect pull → P_s (tok_s)
//!  allocate port, bind push(P_c, tok_c)
//!  register pair S {push P_c, pull P_s}
//!  publish client-push {C, ip, P_c, tok_c, address: P_s, to: S} ──►  S: address == announced P_s?
//!                                                                connect pull → P_c (tok_c)
//!                                                                register pair C {push P_s, pull P_c}
//! ```
//!
//! Per remote peer the states are Unknown → Pending → Paired, and a pair
//! leaves only through garbage collection.  The reaction to each signal kind
//! depends on the role, see [`reaction`].
//!
//! # Concurrency
//!
//! Every signal is handled in its own task.  The pair table lock is taken only
//! for short bookkeeping steps between the awaits; the `Pending` mark set in the
//! first step stops a duplicate signal from opening a second set of sockets
//! while the first round trip is still in flight.  After every await the code
//! re-checks the table, because the peer may have been reclaimed or the node
//! stopped in the meantime; sockets that no longer have a home are closed.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use peerlink_core::{
    Channel, ChannelNames, InitSignal, PeerId, PingSignal, PushSignal, Role, Signal, SignalKind,
    SocketToken,
};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::pair_table::{PairTable, PairTableError, PeerState, PendingStage};
use crate::application::ports::{
    BusError, CoordinationBus, InboundFrame, PortAllocator, PullSocket, PushSocket, Transport,
};

/// What a node does with a signal of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Server: bind a push socket for the announcing client and advertise it.
    AnnouncePush,
    /// Server: connect a pull socket to the client's push and complete the pair.
    CompleteWithAnnouncedPush,
    /// Client: connect a pull socket to the server's push, bind our own push
    /// socket and advertise it.
    OpenPullAndAnnounce,
    /// Refresh the pair's last-seen time.
    Refresh,
    Ignore,
}

/// The role-specific transition table.
pub fn reaction(role: Role, kind: SignalKind) -> Reaction {
    match (role, kind) {
        (Role::Server, SignalKind::Init) => Reaction::AnnouncePush,
        (Role::Server, SignalKind::Push) => Reaction::CompleteWithAnnouncedPush,
        (Role::Client, SignalKind::Init) => Reaction::Ignore,
        (Role::Client, SignalKind::Push) => Reaction::OpenPullAndAnnounce,
        (_, SignalKind::Ping) => Reaction::Refresh,
    }
}

/// Collaborators the state machine drives.
#[derive(Clone)]
pub struct PairingDeps {
    pub table: Arc<Mutex<PairTable>>,
    pub transport: Arc<dyn Transport>,
    pub ports: Arc<dyn PortAllocator>,
    pub bus: Arc<dyn CoordinationBus>,
    /// Handed to every pull socket; the node's dispatcher reads from it.
    pub inbound: mpsc::Sender<InboundFrame>,
}

pub struct PairingStateMachine {
    role: Role,
    id: PeerId,
    host: IpAddr,
    names: ChannelNames,
    deps: PairingDeps,
    port_hint: AtomicU16,
}

impl PairingStateMachine {
    pub fn new(
        role: Role,
        id: PeerId,
        host: IpAddr,
        names: ChannelNames,
        base_port: u16,
        deps: PairingDeps,
    ) -> Self {
        Self {
            role,
            id,
            host,
            names,
            deps,
            port_hint: AtomicU16::new(base_port),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Reacts to one decoded bus signal.  Never fails: problems are logged and
    /// the attempt is abandoned until the next signal from the same peer.
    pub async fn handle(&self, signal: Signal) {
        let from = signal.sender();
        if from == self.id {
            return;
        }
        match (reaction(self.role, signal.kind()), signal) {
            (Reaction::AnnouncePush, Signal::Init(init)) => self.announce_push(init).await,
            (Reaction::CompleteWithAnnouncedPush, Signal::Push(push)) => {
                self.complete_with_announced_push(push).await
            }
            (Reaction::OpenPullAndAnnounce, Signal::Push(push)) => {
                self.open_pull_and_announce(push).await
            }
            (Reaction::Refresh, Signal::Ping(ping)) => self.refresh(ping).await,
            (reaction, signal) => {
                debug!("ignoring {:?} signal from {from} ({reaction:?})", signal.kind());
            }
        }
    }

    // ── Outbound signals ──────────────────────────────────────────────────────

    /// Publishes `client-init` for this node.
    pub async fn announce_init(&self) -> Result<(), BusError> {
        let Some(channel) = self.role.init_channel() else {
            return Ok(());
        };
        let signal = Signal::Init(InitSignal {
            id: self.id,
            ip: self.host,
        });
        self.publish(channel, &signal).await
    }

    /// Publishes this node's liveness ping.
    pub async fn broadcast_ping(&self) -> Result<(), BusError> {
        let signal = Signal::Ping(PingSignal { id: self.id });
        self.publish(self.role.ping_channel(), &signal).await
    }

    async fn publish(&self, channel: Channel, signal: &Signal) -> Result<(), BusError> {
        let payload = signal
            .encode()
            .map_err(|e| BusError::Frame(e.to_string()))?;
        self.deps.bus.publish(&self.names.name(channel), payload).await
    }

    async fn publish_push(&self, port: u16, token: SocketToken, address: Option<String>, to: PeerId) {
        let signal = Signal::Push(PushSignal {
            id: self.id,
            ip: self.host,
            port,
            sock: token,
            address,
            to: Some(to),
        });
        if let Err(e) = self.publish(self.role.push_channel(), &signal).await {
            warn!("failed to announce push socket to {to}: {e}");
        }
    }

    // ── Server: init ──────────────────────────────────────────────────────────

    async fn announce_push(&self, init: InitSignal) {
        let peer = init.id;
        {
            let mut table = self.deps.table.lock().await;
            match table.state(&peer) {
                PeerState::Paired => {
                    debug!("init from already paired {peer}");
                    return;
                }
                PeerState::Pending => {
                    let announced = table.pending(&peer).and_then(|p| match &p.stage {
                        PendingStage::Announced { port, token, .. } => Some((*port, *token)),
                        _ => None,
                    });
                    drop(table);
                    if let Some((port, token)) = announced {
                        debug!("re-announcing push socket on port {port} to {peer}");
                        self.publish_push(port, token, None, peer).await;
                    }
                    return;
                }
                PeerState::Unknown => {
                    if let Err(e) = table.begin_pending(peer, Instant::now()) {
                        debug!("not pairing with {peer}: {e}");
                        return;
                    }
                }
            }
        }

        let token = SocketToken::generate();
        let Some(push) = self.open_push(peer, token).await else {
            self.abandon(&peer).await;
            return;
        };
        let port = push.port;
        let push_address = push.socket.address().to_string();

        {
            let mut table = self.deps.table.lock().await;
            if table.pending(&peer).is_none() {
                drop(table);
                debug!("handshake with {peer} was reclaimed while binding");
                push.socket.close();
                return;
            }
            if let Err(e) = table.insert_push(Arc::clone(&push.socket)) {
                drop(table);
                warn!("cannot register push socket {push_address}: {e}");
                push.socket.close();
                self.abandon(&peer).await;
                return;
            }
            table.set_stage(
                &peer,
                PendingStage::Announced {
                    push_address: push_address.clone(),
                    port,
                    token,
                },
            );
        }

        info!("offering push socket {push_address} to client {peer}");
        self.publish_push(port, token, None, peer).await;
    }

    // ── Server: push ──────────────────────────────────────────────────────────

    async fn complete_with_announced_push(&self, signal: PushSignal) {
        let peer = signal.id;
        if !signal.is_for(self.id) {
            return;
        }

        let (push_address, port, token) = {
            let mut table = self.deps.table.lock().await;
            if table.state(&peer) == PeerState::Paired {
                debug!("push from already paired {peer}");
                return;
            }
            let announced = table.pending(&peer).and_then(|p| match &p.stage {
                PendingStage::Announced {
                    push_address,
                    port,
                    token,
                } => Some((push_address.clone(), *port, *token)),
                _ => None,
            });
            let Some((push_address, port, token)) = announced else {
                debug!("push from {peer} without an announced socket");
                return;
            };
            if signal.address.as_deref() != Some(push_address.as_str()) {
                debug!(
                    "push from {peer} names {:?}, expected {push_address}",
                    signal.address
                );
                return;
            }
            table.set_stage(
                &peer,
                PendingStage::Completing {
                    push_address: push_address.clone(),
                    port,
                    token,
                },
            );
            (push_address, port, token)
        };

        let pull = match self.connect_pull(&signal).await {
            Some(pull) => pull,
            None => {
                let mut table = self.deps.table.lock().await;
                table.set_stage(
                    &peer,
                    PendingStage::Announced {
                        push_address,
                        port,
                        token,
                    },
                );
                return;
            }
        };

        let pull_address = pull.address().to_string();
        let mut table = self.deps.table.lock().await;
        if table.pending(&peer).is_none() {
            drop(table);
            debug!("handshake with {peer} was reclaimed while connecting");
            pull.close();
            return;
        }
        let registered = table
            .insert_pull(Arc::clone(&pull))
            .and_then(|()| {
                table.register_pair(peer, push_address.clone(), pull_address.clone(), Instant::now())
            });
        match registered {
            Ok(()) => {
                drop(table);
                info!("paired with client {peer} (push {push_address}, pull {pull_address})");
            }
            Err(e) => {
                if !matches!(e, PairTableError::AddressInUse(_)) {
                    table.remove_pull(&pull_address);
                }
                table.set_stage(
                    &peer,
                    PendingStage::Announced {
                        push_address,
                        port,
                        token,
                    },
                );
                drop(table);
                warn!("cannot complete pair with {peer}: {e}");
                pull.close();
            }
        }
    }

    // ── Client: push ──────────────────────────────────────────────────────────

    async fn open_pull_and_announce(&self, signal: PushSignal) {
        let peer = signal.id;
        if !signal.is_for(self.id) {
            return;
        }

        {
            let mut table = self.deps.table.lock().await;
            match table.begin_pending(peer, Instant::now()) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("push from {peer} while {:?}", table.state(&peer));
                    return;
                }
                Err(e) => {
                    debug!("not pairing with {peer}: {e}");
                    return;
                }
            }
        }

        let Some(pull) = self.connect_pull(&signal).await else {
            self.abandon(&peer).await;
            return;
        };
        let pull_address = pull.address().to_string();
        {
            let mut table = self.deps.table.lock().await;
            let stored = table.pending(&peer).is_some() && table.insert_pull(Arc::clone(&pull)).is_ok();
            if !stored {
                drop(table);
                debug!("dropping pull socket {pull_address} for {peer}");
                pull.close();
                self.abandon(&peer).await;
                return;
            }
            table.set_stage(
                &peer,
                PendingStage::Connected {
                    pull_address: pull_address.clone(),
                },
            );
        }

        let token = SocketToken::generate();
        let Some(push) = self.open_push(peer, token).await else {
            self.abandon(&peer).await;
            return;
        };
        let push_address = push.socket.address().to_string();

        {
            let mut table = self.deps.table.lock().await;
            if table.pending(&peer).is_none() {
                drop(table);
                debug!("handshake with {peer} was reclaimed while binding");
                push.socket.close();
                return;
            }
            let registered = table.insert_push(Arc::clone(&push.socket)).and_then(|()| {
                table.register_pair(peer, push_address.clone(), pull_address.clone(), Instant::now())
            });
            if let Err(e) = registered {
                if !matches!(e, PairTableError::AddressInUse(_)) {
                    table.remove_push(&push_address);
                }
                drop(table);
                warn!("cannot complete pair with {peer}: {e}");
                push.socket.close();
                self.abandon(&peer).await;
                return;
            }
        }

        info!("paired with server {peer} (push {push_address}, pull {pull_address})");
        self.publish_push(push.port, token, Some(pull_address), peer).await;
    }

    // ── Ping ──────────────────────────────────────────────────────────────────

    async fn refresh(&self, ping: PingSignal) {
        let refreshed = self.deps.table.lock().await.touch(&ping.id, Instant::now());
        if !refreshed {
            debug!("ping from unpaired {}", ping.id);
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn open_push(&self, peer: PeerId, token: SocketToken) -> Option<BoundPush> {
        let hint = self.port_hint.load(Ordering::Relaxed);
        let port = match self.deps.ports.free_port(self.host, hint).await {
            Ok(port) => port,
            Err(e) => {
                warn!("no port for push socket to {peer}: {e}");
                return None;
            }
        };
        match self.deps.transport.bind_push(self.host, port, token).await {
            Ok(socket) => {
                self.port_hint.store(port, Ordering::Relaxed);
                Some(BoundPush { socket, port })
            }
            Err(e) => {
                warn!("could not bind push socket for {peer} on port {port}: {e}");
                None
            }
        }
    }

    async fn connect_pull(&self, signal: &PushSignal) -> Option<Arc<dyn PullSocket>> {
        let addr = SocketAddr::new(signal.ip, signal.port);
        match self
            .deps
            .transport
            .connect_pull(signal.ip, signal.port, signal.sock, self.deps.inbound.clone())
            .await
        {
            Ok(pull) => Some(pull),
            Err(e) => {
                warn!("could not connect pull socket to {} at {addr}: {e}", signal.id);
                None
            }
        }
    }

    /// Clears the pending mark for `peer` and closes whatever it had opened.
    async fn abandon(&self, peer: &PeerId) {
        let released = self.deps.table.lock().await.abandon_pending(peer);
        if let Some(released) = released {
            released.close();
        }
    }
}

struct BoundPush {
    socket: Arc<dyn PushSocket>,
    port: u16,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
