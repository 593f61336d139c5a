//! In-process transport and bus.
//!
//! [`MemoryNetwork`] and [`MemoryBus`] implement the application ports without
//! touching the operating system, so several nodes can pair inside one test
//! process (and under paused tokio time).  Semantics mirror the TCP adapters:
//!
//! - binding an address that is already bound fails with `AddrInUse`;
//! - a push socket accepts one pull peer, which must present the right token;
//! - frames sent before the pull peer attaches are queued;
//! - closing a push socket releases its address and ends the pull stream.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use peerlink_core::SocketToken;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::application::peer_node::NodeInfrastructure;
use crate::application::ports::{
    BusError, BusMessage, CoordinationBus, InboundFrame, PortAllocator, PullSocket, PushSocket,
    Transport, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Network ───────────────────────────────────────────────────────────────────

struct Listener {
    token: SocketToken,
    /// Taken by the first pull peer that attaches.
    queue: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Shared in-memory address space.  Clones see the same listeners.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<SocketAddr, Listener>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a push socket is currently bound on `addr`.
    pub fn is_bound(&self, addr: &str) -> bool {
        addr.parse::<SocketAddr>()
            .map(|a| lock(&self.listeners).contains_key(&a))
            .unwrap_or(false)
    }

    /// Number of bound push sockets.
    pub fn bound_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Node adapters that use this network for sockets and ports and `bus`
    /// for signalling.
    pub fn infrastructure(&self, bus: &MemoryBus) -> NodeInfrastructure {
        NodeInfrastructure {
            bus: Arc::new(bus.attach()),
            transport: Arc::new(self.clone()),
            ports: Arc::new(self.clone()),
        }
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn bind_push(
        &self,
        host: IpAddr,
        port: u16,
        token: SocketToken,
    ) -> Result<Arc<dyn PushSocket>, TransportError> {
        let addr = SocketAddr::new(host, port);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut listeners = lock(&self.listeners);
            if listeners.contains_key(&addr) {
                return Err(TransportError::AddrInUse(addr.to_string()));
            }
            listeners.insert(
                addr,
                Listener {
                    token,
                    queue: Some(rx),
                },
            );
        }
        debug!("memory push socket bound on {addr}");
        Ok(Arc::new(MemoryPushSocket {
            addr,
            address: addr.to_string(),
            tx: Mutex::new(Some(tx)),
            listeners: Arc::clone(&self.listeners),
        }))
    }

    async fn connect_pull(
        &self,
        host: IpAddr,
        port: u16,
        token: SocketToken,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Result<Arc<dyn PullSocket>, TransportError> {
        let addr = SocketAddr::new(host, port);
        let address = addr.to_string();
        let mut queue = {
            let mut listeners = lock(&self.listeners);
            let listener = listeners
                .get_mut(&addr)
                .ok_or_else(|| TransportError::ConnectFailed {
                    addr: address.clone(),
                    reason: "connection refused".to_string(),
                })?;
            if listener.token != token {
                return Err(TransportError::HandshakeRejected(address));
            }
            listener
                .queue
                .take()
                .ok_or_else(|| TransportError::HandshakeRejected(address.clone()))?
        };

        let frame_address = address.clone();
        let task = tokio::spawn(async move {
            while let Some(bytes) = queue.recv().await {
                let frame = InboundFrame {
                    address: frame_address.clone(),
                    bytes,
                };
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Ok(Arc::new(MemoryPullSocket {
            address,
            task,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl PortAllocator for MemoryNetwork {
    /// Lowest port at or above `preferred` with nothing bound on `host`.
    async fn free_port(&self, host: IpAddr, preferred: u16) -> Result<u16, TransportError> {
        let from = preferred.max(1);
        let listeners = lock(&self.listeners);
        (from..=u16::MAX)
            .find(|&port| !listeners.contains_key(&SocketAddr::new(host, port)))
            .ok_or(TransportError::NoFreePort { host, from })
    }
}

struct MemoryPushSocket {
    addr: SocketAddr,
    address: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    listeners: Arc<Mutex<HashMap<SocketAddr, Listener>>>,
}

impl PushSocket for MemoryPushSocket {
    fn address(&self) -> &str {
        &self.address
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let tx = lock(&self.tx);
        let Some(tx) = tx.as_ref() else {
            return Err(TransportError::Closed(self.address.clone()));
        };
        // A pull peer that went away leaves nobody to read; the frame is dropped.
        let _ = tx.send(frame);
        Ok(())
    }

    fn close(&self) {
        if lock(&self.tx).take().is_some() {
            lock(&self.listeners).remove(&self.addr);
            debug!("memory push socket {} closed", self.address);
        }
    }
}

impl Drop for MemoryPushSocket {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemoryPullSocket {
    address: String,
    task: JoinHandle<()>,
    closed: AtomicBool,
}

impl PullSocket for MemoryPullSocket {
    fn address(&self) -> &str {
        &self.address
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.task.abort();
        }
    }
}

impl Drop for MemoryPullSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Bus ───────────────────────────────────────────────────────────────────────

struct MemorySubscriber {
    handle: u64,
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<MemorySubscriber>,
    closed: bool,
    next_handle: u64,
}

/// In-process [`CoordinationBus`].  All handles share one set of subscribers,
/// so every node sees every other node's signals (and its own).
///
/// A clone is the same handle; [`MemoryBus::attach`] makes a new one that can
/// leave the bus on its own through [`CoordinationBus::close`].
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    published: Arc<Mutex<Vec<BusMessage>>>,
    handle: u64,
    left: Arc<AtomicBool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new handle on the same bus.
    pub fn attach(&self) -> Self {
        let handle = {
            let mut state = lock(&self.state);
            state.next_handle += 1;
            state.next_handle
        };
        Self {
            state: Arc::clone(&self.state),
            published: Arc::clone(&self.published),
            handle,
            left: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shuts the whole bus down: every later publish and subscribe fails on
    /// every handle, and all subscriptions end.
    pub fn shut_down(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.subscribers.clear();
    }

    /// Number of live subscriptions across all handles.
    pub fn subscriber_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl CoordinationBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if state.closed || self.left.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let message = BusMessage {
            channel: channel.to_string(),
            payload,
        };
        state.subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in &state.subscribers {
            if subscriber.channels.contains(channel) {
                let _ = subscriber.tx.send(message.clone());
            }
        }
        lock(&self.published).push(message);
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let (tx, mut unbounded_rx) = mpsc::unbounded_channel();
        {
            let mut state = lock(&self.state);
            if state.closed || self.left.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }
            state.subscribers.push(MemorySubscriber {
                handle: self.handle,
                channels: channels.iter().cloned().collect(),
                tx,
            });
        }
        // The port hands out a bounded receiver; bridge to it.
        let (bounded_tx, bounded_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(message) = unbounded_rx.recv().await {
                if bounded_tx.send(message).await.is_err() {
                    break;
                }
            }
        });
        Ok(bounded_rx)
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        if !self.left.swap(true, Ordering::AcqRel) {
            state.subscribers.retain(|s| s.handle != self.handle);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_push_to_pull_in_order() {
        // Arrange
        let net = MemoryNetwork::new();
        let token = SocketToken::generate();
        let push = net.bind_push(localhost(), 8000, token).await.unwrap();
        push.send(b"one".to_vec()).unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        // Act
        let pull = net.connect_pull(localhost(), 8000, token, tx).await.unwrap();
        push.send(b"two".to_vec()).unwrap();

        // Assert
        assert_eq!(rx.recv().await.unwrap().bytes, b"one");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.bytes, b"two");
        assert_eq!(second.address, "127.0.0.1:8000");
        assert_eq!(pull.address(), "127.0.0.1:8000");
    }

    #[tokio::test]
    async fn test_bind_conflict_and_release_on_close() {
        let net = MemoryNetwork::new();
        let push = net
            .bind_push(localhost(), 8000, SocketToken::generate())
            .await
            .unwrap();
        let again = net
            .bind_push(localhost(), 8000, SocketToken::generate())
            .await;
        assert!(matches!(again, Err(TransportError::AddrInUse(_))));

        push.close();
        push.close();
        assert!(!net.is_bound("127.0.0.1:8000"));
        assert!(matches!(push.send(vec![0]), Err(TransportError::Closed(_))));
        assert!(net
            .bind_push(localhost(), 8000, SocketToken::generate())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_wrong_token_and_second_peer_are_rejected() {
        let net = MemoryNetwork::new();
        let token = SocketToken::generate();
        let _push = net.bind_push(localhost(), 8001, token).await.unwrap();
        let (tx, _rx) = mpsc::channel(1);

        let wrong = net
            .connect_pull(localhost(), 8001, SocketToken::generate(), tx.clone())
            .await;
        assert!(matches!(wrong, Err(TransportError::HandshakeRejected(_))));

        let _first = net.connect_pull(localhost(), 8001, token, tx.clone()).await.unwrap();
        let second = net.connect_pull(localhost(), 8001, token, tx).await;
        assert!(matches!(second, Err(TransportError::HandshakeRejected(_))));
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let net = MemoryNetwork::new();
        let (tx, _rx) = mpsc::channel(1);
        let result = net
            .connect_pull(localhost(), 9, SocketToken::generate(), tx)
            .await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_free_port_skips_bound_ports() {
        let net = MemoryNetwork::new();
        let _a = net.bind_push(localhost(), 8000, SocketToken::generate()).await.unwrap();
        let _b = net.bind_push(localhost(), 8001, SocketToken::generate()).await.unwrap();
        assert_eq!(net.free_port(localhost(), 8000).await.unwrap(), 8002);
        assert_eq!(net.free_port(localhost(), 7000).await.unwrap(), 7000);
    }

    #[tokio::test]
    async fn test_bus_fans_out_by_channel() {
        // Arrange
        let bus = MemoryBus::new();
        let mut inits = bus.subscribe(&["client-init".to_string()]).await.unwrap();
        let mut pings = bus.subscribe(&["server-ping".to_string()]).await.unwrap();

        // Act
        bus.publish("server-ping", "p".into()).await.unwrap();
        bus.publish("client-init", "i".into()).await.unwrap();

        // Assert
        assert_eq!(inits.recv().await.unwrap().payload, "i");
        assert_eq!(pings.recv().await.unwrap().payload, "p");
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_calls_and_ends_streams() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe(&["x".to_string()]).await.unwrap();
        bus.shut_down();
        assert!(rx.recv().await.is_none());
        assert!(matches!(bus.publish("x", String::new()).await, Err(BusError::Closed)));
        assert!(matches!(bus.subscribe(&[]).await, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn test_closing_one_handle_leaves_the_others_subscribed() {
        // Arrange
        let bus = MemoryBus::new();
        let leaving = bus.attach();
        let staying = bus.attach();
        let mut leaving_rx = leaving.subscribe(&["x".to_string()]).await.unwrap();
        let mut staying_rx = staying.subscribe(&["x".to_string()]).await.unwrap();

        // Act
        leaving.close().await;
        leaving.close().await;

        // Assert
        assert!(leaving_rx.recv().await.is_none());
        assert!(matches!(leaving.publish("x", String::new()).await, Err(BusError::Closed)));
        assert_eq!(bus.subscriber_count(), 1);
        staying.publish("x", "hi".into()).await.unwrap();
        assert_eq!(staying_rx.recv().await.unwrap().payload, "hi");
    }
}
