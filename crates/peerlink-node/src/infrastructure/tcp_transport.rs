//! TCP implementation of the push/pull [`Transport`].
//!
//! # Push socket
//!
//! Binds a `TcpListener` and serves one pull peer at a time.  A connecting peer
//! must send the handshake token as its first frame within
//! [`HANDSHAKE_TIMEOUT`]; anything else drops the connection.  Frames handed to
//! [`PushSocket::send`] go onto an unbounded queue and are written whenever a
//! peer is attached, so nothing is lost while the peer is (re)connecting.
//!
//! # Pull socket
//!
//! Connects to the announced `ip:port`, presents the token, and forwards every
//! frame to the node as an [`InboundFrame`].  The first connect is awaited so
//! the caller learns about unreachable peers; afterwards the socket reconnects
//! in the background with a capped exponential backoff until closed.
//!
//! Both sockets own one background task; `close()` aborts it.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerlink_core::SocketToken;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::application::ports::{
    InboundFrame, PullSocket, PushSocket, Transport, TransportError,
};
use crate::infrastructure::framing::{read_frame, write_frame};

/// How long a connecting pull peer has to present its token.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// First reconnect delay of a pull socket.
pub const RECONNECT_INITIAL: Duration = Duration::from_millis(100);
/// Longest reconnect delay of a pull socket.
pub const RECONNECT_MAX: Duration = Duration::from_secs(5);

/// TCP-backed [`Transport`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind_push(
        &self,
        host: IpAddr,
        port: u16,
        token: SocketToken,
    ) -> Result<Arc<dyn PushSocket>, TransportError> {
        let addr = SocketAddr::new(host, port);
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::AddrInUse(addr.to_string())
            } else {
                TransportError::BindFailed {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        let address = addr.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve_push(listener, address.clone(), token, rx));
        debug!("push socket bound on {address}");
        Ok(Arc::new(TcpPushSocket {
            address,
            tx,
            task,
            closed: AtomicBool::new(false),
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
        let stream = open_pull_stream(addr, token).await?;
        let address = addr.to_string();
        let task = tokio::spawn(run_pull(stream, addr, token, inbound));
        debug!("pull socket connected to {address}");
        Ok(Arc::new(TcpPullSocket {
            address,
            task,
            closed: AtomicBool::new(false),
        }))
    }
}

// ── Push ──────────────────────────────────────────────────────────────────────

struct TcpPushSocket {
    address: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
    closed: AtomicBool,
}

impl PushSocket for TcpPushSocket {
    fn address(&self) -> &str {
        &self.address
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed(self.address.clone()));
        }
        self.tx
            .send(frame)
            .map_err(|_| TransportError::Closed(self.address.clone()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.task.abort();
            debug!("push socket {} closed", self.address);
        }
    }
}

impl Drop for TcpPushSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_push(
    listener: TcpListener,
    address: String,
    token: SocketToken,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let expected = token.to_string();
    // A frame whose write failed is retried on the next peer.
    let mut unsent: Option<Vec<u8>> = None;

    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept on {address} failed: {e}");
                tokio::time::sleep(RECONNECT_INITIAL).await;
                continue;
            }
        };

        match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(Some(presented))) if presented == expected.as_bytes() => {}
            Ok(Ok(_)) | Ok(Err(_)) => {
                warn!("{peer} presented a bad handshake to {address}");
                continue;
            }
            Err(_) => {
                warn!("{peer} did not complete the handshake with {address} in time");
                continue;
            }
        }
        info!("pull peer {peer} attached to {address}");

        let (mut reader, mut writer) = stream.into_split();
        let mut probe = [0u8; 1];
        loop {
            let frame = match unsent.take() {
                Some(frame) => frame,
                None => tokio::select! {
                    next = queue.recv() => match next {
                        Some(frame) => frame,
                        None => return,
                    },
                    // Pull peers never write after the handshake: any read
                    // result means the peer went away.
                    _ = reader.read(&mut probe) => break,
                },
            };
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("write to {peer} on {address} failed: {e}");
                unsent = Some(frame);
                break;
            }
        }
        debug!("pull peer {peer} detached from {address}");
    }
}

// ── Pull ──────────────────────────────────────────────────────────────────────

struct TcpPullSocket {
    address: String,
    task: JoinHandle<()>,
    closed: AtomicBool,
}

impl PullSocket for TcpPullSocket {
    fn address(&self) -> &str {
        &self.address
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.task.abort();
            debug!("pull socket {} closed", self.address);
        }
    }
}

impl Drop for TcpPullSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn open_pull_stream(addr: SocketAddr, token: SocketToken) -> Result<TcpStream, TransportError> {
    let connect_failed = |e: std::io::Error| TransportError::ConnectFailed {
        addr: addr.to_string(),
        reason: e.to_string(),
    };
    let mut stream = TcpStream::connect(addr).await.map_err(connect_failed)?;
    stream.set_nodelay(true).map_err(connect_failed)?;
    write_frame(&mut stream, token.to_string().as_bytes())
        .await
        .map_err(connect_failed)?;
    Ok(stream)
}

async fn run_pull(
    mut stream: TcpStream,
    addr: SocketAddr,
    token: SocketToken,
    inbound: mpsc::Sender<InboundFrame>,
) {
    let address = addr.to_string();
    loop {
        loop {
            match read_frame(&mut stream).await {
                Ok(Some(bytes)) => {
                    let frame = InboundFrame {
                        address: address.clone(),
                        bytes,
                    };
                    if inbound.send(frame).await.is_err() {
                        // The node is gone.
                        return;
                    }
                }
                Ok(None) => {
                    debug!("push peer {address} closed the connection");
                    break;
                }
                Err(e) => {
                    debug!("read from {address} failed: {e}");
                    break;
                }
            }
        }

        let mut delay = RECONNECT_INITIAL;
        stream = loop {
            tokio::time::sleep(delay).await;
            match open_pull_stream(addr, token).await {
                Ok(stream) => {
                    info!("pull socket reconnected to {address}");
                    break stream;
                }
                Err(e) => {
                    debug!("reconnect to {address} failed: {e}");
                    delay = (delay * 2).min(RECONNECT_MAX);
                }
            }
        };
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_frames_queued_before_connect_are_delivered() {
        // Arrange
        let transport = TcpTransport::new();
        let token = SocketToken::generate();
        let port = free_port().await;
        let push = transport.bind_push(localhost(), port, token).await.unwrap();
        push.send(b"early".to_vec()).unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        // Act
        let pull = transport
            .connect_pull(localhost(), port, token, tx)
            .await
            .unwrap();
        push.send(b"late".to_vec()).unwrap();

        // Assert
        let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.bytes, b"early");
        assert_eq!(second.bytes, b"late");
        assert_eq!(first.address, push.address());
        assert_eq!(pull.address(), push.address());

        push.close();
        pull.close();
    }

    #[tokio::test]
    async fn test_wrong_token_receives_nothing() {
        // Arrange
        let transport = TcpTransport::new();
        let port = free_port().await;
        let push = transport
            .bind_push(localhost(), port, SocketToken::generate())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let pull = transport
            .connect_pull(localhost(), port, SocketToken::generate(), tx)
            .await
            .unwrap();

        // Act
        push.send(b"secret".to_vec()).unwrap();

        // Assert
        let received = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(received.is_err(), "a rejected peer must not receive frames");
        pull.close();
        push.close();
    }

    #[tokio::test]
    async fn test_bind_taken_port_reports_addr_in_use() {
        let transport = TcpTransport::new();
        let port = free_port().await;
        let _first = transport
            .bind_push(localhost(), port, SocketToken::generate())
            .await
            .unwrap();
        let second = transport
            .bind_push(localhost(), port, SocketToken::generate())
            .await;
        assert!(matches!(second, Err(TransportError::AddrInUse(_))));
    }

    #[tokio::test]
    async fn test_connect_to_nothing_fails() {
        let transport = TcpTransport::new();
        let port = free_port().await;
        let (tx, _rx) = mpsc::channel(1);
        let result = transport
            .connect_pull(localhost(), port, SocketToken::generate(), tx)
            .await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_closed_push_rejects_sends_and_close_is_idempotent() {
        let transport = TcpTransport::new();
        let port = free_port().await;
        let push = transport
            .bind_push(localhost(), port, SocketToken::generate())
            .await
            .unwrap();
        push.close();
        push.close();
        assert!(matches!(
            push.send(vec![1]),
            Err(TransportError::Closed(_))
        ));
    }
}
