//! TCP coordination bus: a small publish/subscribe broker and its client.
//!
//! # Wire format
//!
//! Every frame is a JSON object carried in a length-prefixed frame (see
//! [`framing`](super::framing)):
//!
//! ```text
//!  client → broker   {"type":"subscribe","channels":["client-init"]}
//!  broker → client   {"type":"subscribed","channels":["client-init"]}
//!  client → broker   {"type":"publish","channel":"client-init","payload":"{…}"}
//!  broker → client   {"type":"message","channel":"client-init","payload":"{…}"}
//! ```
//!
//! # Delivery rules
//!
//! - A publish is delivered to every connection subscribed to the channel,
//!   including the publisher itself.  Nodes ignore their own signals.
//! - `subscribe` resolves only after the broker has acknowledged it, so a
//!   publish made by anyone afterwards is guaranteed to reach the subscriber.
//! - There is no persistence: a message published before a subscription
//!   exists is gone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::application::ports::{BusError, BusMessage, CoordinationBus};
use crate::infrastructure::framing::{read_frame, write_frame};

/// Capacity of each local subscription channel.
const SUBSCRIPTION_CAPACITY: usize = 256;

/// One frame on the bus connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusFrame {
    Subscribe { channels: Vec<String> },
    Subscribed { channels: Vec<String> },
    Publish { channel: String, payload: String },
    Message { channel: String, payload: String },
}

impl BusFrame {
    fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(self).map_err(|e| BusError::Frame(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Frame(e.to_string()))
    }
}

// ── Broker ────────────────────────────────────────────────────────────────────

struct Connection {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct BrokerState {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Connection>>,
}

impl BrokerState {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fan-out broker for the coordination bus.
pub struct BusBroker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl BusBroker {
    /// Binds the broker listener.
    ///
    /// # Errors
    ///
    /// [`BusError::Connect`] if `addr` cannot be bound.
    pub async fn bind(addr: &str) -> Result<Self, BusError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| BusError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self {
            listener,
            state: Arc::new(BrokerState::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BusError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts bus connections until `running` is cleared.  Open connections
    /// are dropped when this returns.
    pub async fn run(self, running: Arc<AtomicBool>) {
        let local = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        info!("bus broker listening on {local}");

        let mut sessions = JoinSet::new();
        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping bus broker");
                break;
            }

            match timeout(Duration::from_millis(200), self.listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
                    debug!("bus connection {id} from {peer}");
                    sessions.spawn(serve_connection(id, stream, Arc::clone(&self.state)));
                }
                Ok(Err(e)) => error!("bus accept error: {e}"),
                Err(_) => {
                    // Reap finished sessions while idle.
                    while sessions.try_join_next().is_some() {}
                }
            }
        }
        sessions.abort_all();
        // Dropping the queues ends every connection writer.
        self.state.lock().clear();
    }
}

async fn serve_connection(id: u64, stream: TcpStream, state: Arc<BrokerState>) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state.lock().insert(
        id,
        Connection {
            channels: HashSet::new(),
            tx: tx.clone(),
        },
    );

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &bytes).await {
                debug!("bus connection {id} write failed: {e}");
                break;
            }
        }
    });

    loop {
        let bytes = match read_frame(&mut reader).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                debug!("bus connection {id} read failed: {e}");
                break;
            }
        };
        match BusFrame::from_bytes(&bytes) {
            Ok(BusFrame::Subscribe { channels }) => {
                if let Some(conn) = state.lock().get_mut(&id) {
                    conn.channels.extend(channels.iter().cloned());
                }
                if let Ok(ack) = (BusFrame::Subscribed { channels }).to_bytes() {
                    let _ = tx.send(ack);
                }
            }
            Ok(BusFrame::Publish { channel, payload }) => {
                let Ok(bytes) = (BusFrame::Message {
                    channel: channel.clone(),
                    payload,
                })
                .to_bytes() else {
                    continue;
                };
                let connections = state.lock();
                for conn in connections.values() {
                    if conn.channels.contains(&channel) {
                        let _ = conn.tx.send(bytes.clone());
                    }
                }
            }
            Ok(other) => warn!("bus connection {id} sent an unexpected frame: {other:?}"),
            Err(e) => warn!("bus connection {id} sent garbage: {e}"),
        }
    }

    state.lock().remove(&id);
    writer_task.abort();
    debug!("bus connection {id} closed");
}

// ── Client ────────────────────────────────────────────────────────────────────

struct Subscriber {
    channels: HashSet<String>,
    tx: mpsc::Sender<BusMessage>,
}

#[derive(Default)]
struct ClientState {
    subscribers: Vec<Subscriber>,
    pending_acks: VecDeque<oneshot::Sender<()>>,
}

/// [`CoordinationBus`] backed by a TCP connection to a [`BusBroker`].
pub struct TcpBus {
    address: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    state: Arc<Mutex<ClientState>>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl TcpBus {
    /// Connects to the broker at `addr`.
    ///
    /// # Errors
    ///
    /// [`BusError::Connect`] if the broker cannot be reached.
    pub async fn connect(addr: &str) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| BusError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let state = Arc::new(Mutex::new(ClientState::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_bus(
            reader,
            addr.to_string(),
            Arc::clone(&state),
            Arc::clone(&closed),
        ));
        debug!("connected to bus at {addr}");

        Ok(Self {
            address: addr.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            state,
            closed,
            reader,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn write(&self, frame: &BusFrame) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let bytes = frame.to_bytes()?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &bytes).await?;
        Ok(())
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl CoordinationBus for TcpBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        self.write(&BusFrame::Publish {
            channel: channel.to_string(),
            payload,
        })
        .await
    }

    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let (ack_tx, ack_rx) = oneshot::channel();
        let frame = BusFrame::Subscribe {
            channels: channels.to_vec(),
        }
        .to_bytes()?;

        {
            // Acks come back in request order; queue ours while holding the
            // writer so no other subscribe can slip in between.
            let mut writer = self.writer.lock().await;
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if self.closed.load(Ordering::Acquire) {
                    return Err(BusError::Closed);
                }
                state.subscribers.push(Subscriber {
                    channels: channels.iter().cloned().collect(),
                    tx,
                });
                state.pending_acks.push_back(ack_tx);
            }
            write_frame(&mut *writer, &frame).await?;
        }

        ack_rx.await.map_err(|_| BusError::Closed)?;
        Ok(rx)
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            state.subscribers.clear();
            state.pending_acks.clear();
        }
        self.reader.abort();
        // The broker drops the connection once it reads end-of-stream.
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("bus at {} shutdown failed: {e}", self.address);
        }
        debug!("left bus at {}", self.address);
    }
}

async fn read_bus(
    mut reader: OwnedReadHalf,
    address: String,
    state: Arc<Mutex<ClientState>>,
    closed: Arc<AtomicBool>,
) {
    loop {
        let bytes = match read_frame(&mut reader).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                info!("bus at {address} closed the connection");
                break;
            }
            Err(e) => {
                warn!("bus at {address} read failed: {e}");
                break;
            }
        };

        match BusFrame::from_bytes(&bytes) {
            Ok(BusFrame::Message { channel, payload }) => {
                let targets: Vec<mpsc::Sender<BusMessage>> = {
                    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    state.subscribers.retain(|s| !s.tx.is_closed());
                    state
                        .subscribers
                        .iter()
                        .filter(|s| s.channels.contains(&channel))
                        .map(|s| s.tx.clone())
                        .collect()
                };
                for tx in targets {
                    let message = BusMessage {
                        channel: channel.clone(),
                        payload: payload.clone(),
                    };
                    let _ = tx.send(message).await;
                }
            }
            Ok(BusFrame::Subscribed { .. }) => {
                let ack = state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pending_acks
                    .pop_front();
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Ok(other) => warn!("bus at {address} sent an unexpected frame: {other:?}"),
            Err(e) => warn!("bus at {address} sent garbage: {e}"),
        }
    }

    // Dropping the senders ends every subscription stream.
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    closed.store(true, Ordering::Release);
    state.subscribers.clear();
    state.pending_acks.clear();
}

// ── Tests ─────────────────────────────────────────────────────────────────────
