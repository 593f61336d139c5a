//! `PeerNode`: one running client or server.
//!
//! # Architecture
//!
//! ```text
//!  PeerNode::start(handler)
//!   ├─ subscribe role channels on the bus
//!   ├─ bus task ──────► one task per signal ──► PairingStateMachine ──► PairTable
//!   ├─ inbound task ──► one task per frame ───► Dispatcher ──► handler / request()
//!   ├─ tick task ─────► one task per tick ────► HeartbeatScheduler ──► GC or ping
//!   └─ client only: publish client-init
//!
//!  PeerNode::stop()
//!   ├─ abort the three tasks and leave the bus
//!   ├─ drain PairTable, close every socket, mark the table closed
//!   └─ fail pending request() calls
//! ```
//!
//! Every task is instrumented with the node's `node{role, id}` span, so log
//! lines from concurrent nodes in one process stay distinguishable.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use peerlink_core::{
    encode, ChannelNames, CorrelationId, Envelope, ParseRules, PeerId, ProtocolError, Role, Signal,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::application::dispatch::{Dispatcher, MessageHandler, PendingRequests};
use crate::application::heartbeat::{HeartbeatIntervals, HeartbeatScheduler, TickAction};
use crate::application::pair_table::{PairSnapshot, PairTable, PeerState};
use crate::application::pairing::{PairingDeps, PairingStateMachine};
use crate::application::ports::{
    BusError, BusMessage, CoordinationBus, InboundFrame, PortAllocator, Transport, TransportError,
};

const INBOUND_CAPACITY: usize = 1024;

const IDLE: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPED: u8 = 3;

/// Errors returned by [`PeerNode`] operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// No push socket is registered at the address.
    #[error("no push socket registered at {0}")]
    Address(String),

    /// The peer has no completed pair with this node.
    #[error("peer {0} is not paired")]
    NotPaired(PeerId),

    #[error("node has already been started")]
    AlreadyStarted,

    #[error("node is stopped")]
    Stopped,

    /// The operation only makes sense for the other role.
    #[error("{operation} is not available to a {role} node")]
    WrongRole { operation: &'static str, role: Role },

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Resolved node settings.  Build one from config with
/// `AppConfig::to_node_options`, or start from [`NodeOptions::default`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    /// Interval between liveness broadcasts (floored to 1 s).
    pub heartbeat_interval: Duration,
    /// Idle time after which a pair is reclaimed (floored to 5 s).
    pub gc_interval: Duration,
    /// Heartbeat tick period (floored to 1 s).
    pub tick_interval: Duration,
    /// Address this node binds push sockets on and advertises to peers.
    pub host: IpAddr,
    /// `host:port` of the coordination bus.
    pub bus_address: String,
    /// Channel namespace; `None` uses the bare channel names.
    pub prefix: Option<String>,
    /// First port tried for push sockets.
    pub base_port: u16,
    /// Address-embedded variant: servers reject requests without a valid
    /// `targetIp`/`targetPort`, and [`PeerNode::send`] stamps one.
    pub require_reply_target: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            gc_interval: Duration::from_secs(120),
            tick_interval: Duration::from_secs(3),
            host: IpAddr::from([127, 0, 0, 1]),
            bus_address: "127.0.0.1:24900".to_string(),
            prefix: None,
            base_port: 8000,
            require_reply_target: false,
        }
    }
}

impl NodeOptions {
    pub fn intervals(&self) -> HeartbeatIntervals {
        HeartbeatIntervals::floored(self.heartbeat_interval, self.gc_interval, self.tick_interval)
    }
}

/// The adapters a node runs on.
#[derive(Clone)]
pub struct NodeInfrastructure {
    pub bus: Arc<dyn CoordinationBus>,
    pub transport: Arc<dyn Transport>,
    pub ports: Arc<dyn PortAllocator>,
}

pub struct PeerNode {
    id: PeerId,
    role: Role,
    options: NodeOptions,
    names: ChannelNames,
    bus: Arc<dyn CoordinationBus>,
    table: Arc<Mutex<PairTable>>,
    machine: Arc<PairingStateMachine>,
    scheduler: Arc<HeartbeatScheduler>,
    pending: Arc<PendingRequests>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<InboundFrame>>>,
    lifecycle: AtomicU8,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl PeerNode {
    /// Creates an idle node with a fresh [`PeerId`].  Nothing touches the
    /// network until [`PeerNode::start`].
    pub fn new(role: Role, options: NodeOptions, infra: NodeInfrastructure) -> Self {
        let id = PeerId::generate();
        let names = ChannelNames::new(options.prefix.clone());
        let table = Arc::new(Mutex::new(PairTable::new()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let machine = Arc::new(PairingStateMachine::new(
            role,
            id,
            options.host,
            names.clone(),
            options.base_port,
            PairingDeps {
                table: Arc::clone(&table),
                transport: infra.transport,
                ports: infra.ports,
                bus: Arc::clone(&infra.bus),
                inbound: inbound_tx,
            },
        ));
        let scheduler = Arc::new(HeartbeatScheduler::new(options.intervals(), Instant::now()));
        let span = info_span!("node", role = %role, id = %id);

        Self {
            id,
            role,
            options,
            names,
            bus: infra.bus,
            table,
            machine,
            scheduler,
            pending: Arc::new(PendingRequests::new()),
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            lifecycle: AtomicU8::new(IDLE),
            tasks: StdMutex::new(Vec::new()),
            span,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The address advertised to peers.
    pub fn host(&self) -> IpAddr {
        self.options.host
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == RUNNING
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Subscribes to the role's bus channels and starts the background tasks.
    /// A client also announces itself right away.
    ///
    /// # Errors
    ///
    /// - [`NodeError::AlreadyStarted`] if `start` was already called.
    /// - [`NodeError::Stopped`] after [`PeerNode::stop`].
    /// - [`NodeError::Bus`] if the subscription fails; the node stays idle and
    ///   `start` may be retried.
    pub async fn start<H: MessageHandler>(&self, handler: H) -> Result<(), NodeError> {
        match self
            .lifecycle
            .compare_exchange(IDLE, STARTING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(STOPPED) => return Err(NodeError::Stopped),
            Err(_) => return Err(NodeError::AlreadyStarted),
        }

        let channels: Vec<String> = self
            .role
            .subscriptions()
            .iter()
            .map(|channel| self.names.name(*channel))
            .collect();
        let bus_rx = match self.bus.subscribe(&channels).await {
            Ok(rx) => rx,
            Err(e) => {
                self.lifecycle.store(IDLE, Ordering::Release);
                return Err(NodeError::Bus(e));
            }
        };
        let Some(inbound_rx) = self.lock_inbound().take() else {
            return Err(NodeError::AlreadyStarted);
        };

        let dispatcher = Arc::new(Dispatcher::new(
            self.role,
            self.id,
            ParseRules {
                require_target: self.options.require_reply_target,
            },
            Arc::clone(&self.table),
            Arc::new(handler),
            Arc::clone(&self.pending),
        ));

        let tasks = vec![
            tokio::spawn(
                run_bus_loop(bus_rx, self.names.clone(), Arc::clone(&self.machine))
                    .instrument(self.span.clone()),
            ),
            tokio::spawn(run_inbound_loop(inbound_rx, dispatcher).instrument(self.span.clone())),
            tokio::spawn(
                run_tick_loop(
                    Arc::clone(&self.scheduler),
                    Arc::clone(&self.table),
                    Arc::clone(&self.machine),
                )
                .instrument(self.span.clone()),
            ),
        ];
        self.lock_tasks().extend(tasks);

        if self
            .lifecycle
            .compare_exchange(STARTING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.abort_tasks();
            return Err(NodeError::Stopped);
        }

        self.span.in_scope(|| {
            info!(
                "started on {} (channels: {})",
                self.options.host,
                channels.join(", ")
            )
        });

        if self.role == Role::Client {
            self.publish_init().await;
        }
        Ok(())
    }

    /// Re-broadcasts this client's `init` so servers started later can answer.
    ///
    /// # Errors
    ///
    /// [`NodeError::WrongRole`] on a server, [`NodeError::Bus`] if publishing
    /// fails.
    pub async fn announce(&self) -> Result<(), NodeError> {
        if self.role != Role::Client {
            return Err(NodeError::WrongRole {
                operation: "announce",
                role: self.role,
            });
        }
        if !self.is_running() {
            return Err(NodeError::Stopped);
        }
        self.machine
            .announce_init()
            .instrument(self.span.clone())
            .await?;
        Ok(())
    }

    /// Stops the node: halts the tick, leaves the bus, closes every socket and
    /// fails pending requests.  Safe to call more than once.
    pub async fn stop(&self) {
        if self.lifecycle.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return;
        }
        self.abort_tasks();
        self.bus.close().await;

        let (push, pull) = self.table.lock().await.drain();
        let closed = push.len() + pull.len();
        for socket in push {
            socket.close();
        }
        for socket in pull {
            socket.close();
        }
        self.pending.fail_all();

        self.span
            .in_scope(|| info!("stopped ({closed} socket(s) closed)"));
    }

    /// Runs one heartbeat pass now.  A no-op while another pass is in flight.
    pub async fn run_heartbeat(&self) {
        heartbeat_pass(&self.scheduler, &self.table, &self.machine)
            .instrument(self.span.clone())
            .await;
    }

    // ── Messaging ─────────────────────────────────────────────────────────────

    /// Sends `envelope` on the push socket registered at `address`.
    ///
    /// Stamps this node's id as sender and a fresh correlation id if the
    /// envelope has none, and returns that id.  With `require_reply_target`
    /// set, an envelope without a reply target gets the pair's reply leg as
    /// `targetIp`/`targetPort`.  Never opens a connection.
    ///
    /// # Errors
    ///
    /// [`NodeError::Address`] if no push socket is registered at `address`.
    pub async fn send(
        &self,
        address: &str,
        mut envelope: Envelope,
    ) -> Result<CorrelationId, NodeError> {
        let (socket, reply_leg) = {
            let table = self.table.lock().await;
            let socket = table
                .push_socket(address)
                .ok_or_else(|| NodeError::Address(address.to_string()))?;
            let reply_leg = table
                .reply_leg(address)
                .and_then(|leg| leg.parse::<SocketAddr>().ok());
            (socket, reply_leg)
        };
        if self.options.require_reply_target && envelope.reply_target().is_none() {
            if let Some(leg) = reply_leg {
                envelope.target_ip = Some(leg.ip());
                envelope.target_port = Some(leg.port());
            }
        }
        envelope.sender = Some(self.id);
        let bytes = encode(&mut envelope)?;
        let id = envelope.ensure_correlation_id();
        socket.send(bytes)?;
        Ok(id)
    }

    /// Sends `envelope` to `peer` over its pair.
    pub async fn send_to_peer(
        &self,
        peer: PeerId,
        envelope: Envelope,
    ) -> Result<CorrelationId, NodeError> {
        let address = self
            .table
            .lock()
            .await
            .pair(&peer)
            .map(|pair| pair.push_address.clone())
            .ok_or(NodeError::NotPaired(peer))?;
        self.send(&address, envelope).await
    }

    /// Sends `payload` to `address` and waits for the envelope carrying the
    /// same correlation id.  The reply may carry `errorMessage` instead of a
    /// payload.
    ///
    /// There is no built-in timeout; wrap the call in `tokio::time::timeout`
    /// if one is needed.
    ///
    /// # Errors
    ///
    /// Everything [`PeerNode::send`] returns, and [`NodeError::Stopped`] if the
    /// node stops before the reply arrives.
    pub async fn request(&self, address: &str, payload: Value) -> Result<Envelope, NodeError> {
        let mut envelope = Envelope::request(payload);
        let id = envelope.ensure_correlation_id();
        let reply = self.pending.register(id);
        let _waiting = self.pending.cancel_on_drop(id);
        self.send(address, envelope).await?;
        reply.await.map_err(|_| NodeError::Stopped)
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub async fn pairs(&self) -> Vec<PairSnapshot> {
        self.table.lock().await.snapshot(Instant::now())
    }

    pub async fn peer_state(&self, peer: PeerId) -> PeerState {
        self.table.lock().await.state(&peer)
    }

    /// Number of [`PeerNode::request`] calls still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn publish_init(&self) {
        if let Err(e) = self
            .machine
            .announce_init()
            .instrument(self.span.clone())
            .await
        {
            self.span
                .in_scope(|| warn!("failed to announce init: {e}"));
        }
    }

    fn abort_tasks(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_inbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Receiver<InboundFrame>>> {
        self.inbound_rx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn run_bus_loop(
    mut rx: mpsc::Receiver<BusMessage>,
    names: ChannelNames,
    machine: Arc<PairingStateMachine>,
) {
    while let Some(message) = rx.recv().await {
        let Some(channel) = names.resolve(&message.channel) else {
            debug!("ignoring message on foreign channel {}", message.channel);
            continue;
        };
        match Signal::decode(channel, &message.payload) {
            Ok(signal) => {
                let machine = Arc::clone(&machine);
                tokio::spawn(async move { machine.handle(signal).await }.in_current_span());
            }
            Err(e) => warn!("dropping bus message: {e}"),
        }
    }
    debug!("bus subscription closed");
}

async fn run_inbound_loop(mut rx: mpsc::Receiver<InboundFrame>, dispatcher: Arc<Dispatcher>) {
    while let Some(frame) = rx.recv().await {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.on_frame(frame).await }.in_current_span());
    }
}

async fn run_tick_loop(
    scheduler: Arc<HeartbeatScheduler>,
    table: Arc<Mutex<PairTable>>,
    machine: Arc<PairingStateMachine>,
) {
    let mut ticker = tokio::time::interval(scheduler.intervals().tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let scheduler = Arc::clone(&scheduler);
        let table = Arc::clone(&table);
        let machine = Arc::clone(&machine);
        tokio::spawn(
            async move { heartbeat_pass(&scheduler, &table, &machine).await }.in_current_span(),
        );
    }
}

async fn heartbeat_pass(
    scheduler: &HeartbeatScheduler,
    table: &Mutex<PairTable>,
    machine: &PairingStateMachine,
) {
    let Some(_guard) = scheduler.try_begin() else {
        debug!("heartbeat pass already in flight");
        return;
    };
    let now = Instant::now();
    let empty = table.lock().await.is_empty();

    match scheduler.decide(now, empty) {
        TickAction::Skip => {}
        TickAction::CollectGarbage => {
            let reclaimed = table
                .lock()
                .await
                .collect_expired(now, scheduler.intervals().gc);
            for record in &reclaimed {
                record.close();
                if record.was_paired {
                    info!("reclaimed idle pair with {}", record.peer);
                } else {
                    debug!("reclaimed stale handshake with {}", record.peer);
                }
            }
        }
        TickAction::Ping => {
            if let Err(e) = machine.broadcast_ping().await {
                warn!("liveness broadcast failed: {e}");
            }
        }
    }
}
