//! Inbound frame dispatch: from pull-socket bytes to handler calls and replies.
//!
//! ```text
//!  InboundFrame ─► refresh pair ─► parse ─┬─ invalid ─► server: echo error envelope
//!                                         │             client: log and drop
//!                                         ├─ answers one of our requests ─► wake request()
//!                                         └─ otherwise ─► handler (own task)
//!                                                           │
//!                                            server only:   ▼
//!                                            respond_ok / respond_err ─► push socket
//! ```
//!
//! The handler runs in a spawned task so a panic inside it surfaces as a
//! `JoinError` instead of tearing down the dispatcher; the server turns that
//! into a `"handler panicked"` error reply.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use peerlink_core::{encode, parse, CorrelationId, Envelope, ParseRules, PeerId, Role};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::pair_table::PairTable;
use crate::application::ports::InboundFrame;

/// Error text sent back when the handler panics.
pub const HANDLER_PANICKED: &str = "handler panicked";

/// A handler's rejection of a request.  Its message becomes the reply's
/// `errorMessage`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Application callback invoked for every valid inbound request.
///
/// Implemented for any `Fn(Envelope) -> impl Future<Output = Result<Value, HandlerError>>`,
/// so an async closure works directly:
///
/// ```rust,ignore
/// node.start(|env: Envelope| async move {
///     Ok(env.payload.unwrap_or(Value::Null))
/// })
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<Value, HandlerError> {
        (self)(envelope).await
    }
}

// ── Pending requests ──────────────────────────────────────────────────────────

/// Requests waiting for a reply, keyed by correlation id.
#[derive(Default)]
pub struct PendingRequests {
    waiting: StdMutex<HashMap<CorrelationId, oneshot::Sender<Envelope>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: CorrelationId) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    pub fn cancel(&self, id: &CorrelationId) {
        self.lock().remove(id);
    }

    /// Cancels `id` when the returned guard is dropped.  Hold it for as long as
    /// the caller waits, so a request abandoned under a timeout leaves no
    /// waiter behind.
    pub fn cancel_on_drop(&self, id: CorrelationId) -> CancelOnDrop<'_> {
        CancelOnDrop { pending: self, id }
    }

    /// Hands `envelope` to the request waiting on its correlation id.  Gives
    /// the envelope back if nobody is waiting.
    pub fn complete(&self, envelope: Envelope) -> Result<(), Envelope> {
        let waiter = envelope
            .correlation_id
            .and_then(|id| self.lock().remove(&id));
        match waiter {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    debug!("request was abandoned before its reply arrived");
                }
                Ok(())
            }
            None => Err(envelope),
        }
    }

    /// Drops every waiter; their receivers observe a closed channel.
    pub fn fail_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<Envelope>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guard returned by [`PendingRequests::cancel_on_drop`].
pub struct CancelOnDrop<'a> {
    pending: &'a PendingRequests,
    id: CorrelationId,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.cancel(&self.id);
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher {
    role: Role,
    id: PeerId,
    rules: ParseRules,
    table: Arc<Mutex<PairTable>>,
    handler: Arc<dyn MessageHandler>,
    pending: Arc<PendingRequests>,
}

impl Dispatcher {
    /// `rules` apply to requests a server receives.  A client parses with the
    /// default rules because replies never carry a reply target.
    pub fn new(
        role: Role,
        id: PeerId,
        rules: ParseRules,
        table: Arc<Mutex<PairTable>>,
        handler: Arc<dyn MessageHandler>,
        pending: Arc<PendingRequests>,
    ) -> Self {
        let rules = match role {
            Role::Server => rules,
            Role::Client => ParseRules::default(),
        };
        Self {
            role,
            id,
            rules,
            table,
            handler,
            pending,
        }
    }

    /// Processes one inbound frame to completion.  Never fails.
    pub async fn on_frame(&self, frame: InboundFrame) {
        let paired = self
            .table
            .lock()
            .await
            .touch_by_pull(&frame.address, Instant::now());
        let envelope = parse(&frame.bytes, self.rules);

        match self.role {
            Role::Server => self.serve(envelope, paired.map(|(_, push)| push)).await,
            Role::Client => self.consume(envelope, paired.map(|(peer, _)| peer)).await,
        }
    }

    async fn serve(&self, envelope: Envelope, pair_push: Option<String>) {
        let reply_address = envelope
            .reply_target()
            .map(|addr| addr.to_string())
            .or(pair_push);

        if !envelope.is_valid() {
            let reason = envelope.error.clone().unwrap_or_default();
            debug!("rejecting envelope: {reason}");
            self.reply(reply_address, envelope.respond_err(reason)).await;
            return;
        }

        let envelope = match self.pending.complete(envelope) {
            Ok(()) => return,
            Err(envelope) => envelope,
        };

        let handler = Arc::clone(&self.handler);
        let request = envelope.clone();
        let outcome = tokio::spawn(async move { handler.handle(request).await }).await;
        let response = match outcome {
            Ok(Ok(result)) => envelope.respond_ok(result),
            Ok(Err(rejection)) => envelope.respond_err(rejection.0),
            Err(join) => {
                warn!("handler failed: {join}");
                envelope.respond_err(HANDLER_PANICKED)
            }
        };
        self.reply(reply_address, response).await;
    }

    async fn consume(&self, envelope: Envelope, from: Option<PeerId>) {
        if !envelope.is_valid() {
            warn!("dropping malformed envelope: {:?}", envelope.error);
            return;
        }
        let envelope = match self.pending.complete(envelope) {
            Ok(()) => return,
            Err(envelope) => envelope,
        };

        let handler = Arc::clone(&self.handler);
        let correlation = envelope.correlation_id;
        match tokio::spawn(async move { handler.handle(envelope).await }).await {
            Ok(Ok(_)) => debug!("handled {correlation:?} from {from:?}"),
            Ok(Err(e)) => warn!("handler rejected {correlation:?}: {e}"),
            Err(join) => warn!("handler failed on {correlation:?}: {join}"),
        }
    }

    async fn reply(&self, address: Option<String>, mut response: Envelope) {
        let Some(address) = address else {
            debug!("no reply path for {:?}", response.correlation_id);
            return;
        };
        let socket = self.table.lock().await.push_socket(&address);
        let Some(socket) = socket else {
            debug!("reply address {address} is not registered");
            return;
        };
        response.sender = Some(self.id);
        match encode(&mut response) {
            Ok(bytes) => {
                if let Err(e) = socket.send(bytes) {
                    warn!("reply to {address} failed: {e}");
                }
            }
            Err(e) => warn!("could not encode reply: {e}"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::application::ports::{PullSocket, PushSocket, TransportError};

    #[derive(Default)]
    struct CapturingSocket {
        address: String,
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl CapturingSocket {
        fn new(address: &str) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                ..Self::default()
            })
        }

        fn replies(&self) -> Vec<Envelope> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|b| parse(b, ParseRules::default()))
                .collect()
        }
    }

    impl PushSocket for CapturingSocket {
        fn address(&self) -> &str {
            &self.address
        }
        fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }
        fn close(&self) {}
    }

    impl PullSocket for CapturingSocket {
        fn address(&self) -> &str {
            &self.address
        }
        fn close(&self) {}
    }

    const PUSH: &str = "127.0.0.1:8000";
    const PULL: &str = "10.0.0.2:8001";

    async fn paired_table(peer: PeerId) -> (Arc<Mutex<PairTable>>, Arc<CapturingSocket>) {
        let table = Arc::new(Mutex::new(PairTable::new()));
        let push = CapturingSocket::new(PUSH);
        {
            let mut t = table.lock().await;
            t.insert_push(push.clone()).unwrap();
            t.insert_pull(CapturingSocket::new(PULL)).unwrap();
            t.register_pair(peer, PUSH.into(), PULL.into(), Instant::now())
                .unwrap();
        }
        (table, push)
    }

    fn dispatcher(
        role: Role,
        table: Arc<Mutex<PairTable>>,
        handler: Arc<dyn MessageHandler>,
    ) -> (Dispatcher, Arc<PendingRequests>) {
        let pending = Arc::new(PendingRequests::new());
        let d = Dispatcher::new(
            role,
            PeerId::generate(),
            ParseRules::default(),
            table,
            handler,
            Arc::clone(&pending),
        );
        (d, pending)
    }

    fn request_frame(payload: Value) -> (InboundFrame, CorrelationId) {
        let mut env = Envelope::request(payload);
        let bytes = encode(&mut env).unwrap();
        let id = env.correlation_id.unwrap();
        (
            InboundFrame {
                address: PULL.into(),
                bytes,
            },
            id,
        )
    }

    fn echo() -> Arc<dyn MessageHandler> {
        Arc::new(|env: Envelope| async move {
            Ok::<_, HandlerError>(env.payload.unwrap_or(Value::Null))
        })
    }

    #[tokio::test]
    async fn test_server_replies_with_handler_result_and_same_correlation_id() {
        // Arrange
        let (table, push) = paired_table(PeerId::generate()).await;
        let (d, _) = dispatcher(Role::Server, table, echo());
        let (frame, id) = request_frame(json!(1_700_000_000_000u64));

        // Act
        d.on_frame(frame).await;

        // Assert
        let replies = push.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].correlation_id, Some(id));
        assert_eq!(replies[0].payload, Some(json!(1_700_000_000_000u64)));
        assert!(replies[0].error.is_none());
        assert_eq!(replies[0].sender, Some(d.id));
    }

    #[tokio::test]
    async fn test_server_turns_rejection_into_error_reply() {
        let (table, push) = paired_table(PeerId::generate()).await;
        let handler: Arc<dyn MessageHandler> =
            Arc::new(|_env: Envelope| async move { Err::<Value, _>(HandlerError::new("nope")) });
        let (d, _) = dispatcher(Role::Server, table, handler);
        let (frame, id) = request_frame(json!("x"));

        d.on_frame(frame).await;

        let replies = push.replies();
        assert_eq!(replies[0].error.as_deref(), Some("nope"));
        assert_eq!(replies[0].payload, None);
        assert_eq!(replies[0].correlation_id, Some(id));
    }

    #[tokio::test]
    async fn test_server_survives_panicking_handler() {
        let (table, push) = paired_table(PeerId::generate()).await;
        let handler: Arc<dyn MessageHandler> = Arc::new(|_env: Envelope| async move {
            if true {
                panic!("boom");
            }
            Ok::<_, HandlerError>(Value::Null)
        });
        let (d, _) = dispatcher(Role::Server, table, handler);
        let (frame, _) = request_frame(json!(1));

        d.on_frame(frame).await;

        assert_eq!(push.replies()[0].error.as_deref(), Some(HANDLER_PANICKED));
    }

    #[tokio::test]
    async fn test_server_echoes_parse_error_without_calling_handler() {
        // Arrange
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: Arc<dyn MessageHandler> = Arc::new(move |_env: Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, HandlerError>(Value::Null) }
        });
        let (table, push) = paired_table(PeerId::generate()).await;
        let (d, _) = dispatcher(Role::Server, table, handler);

        // Act
        d.on_frame(InboundFrame {
            address: PULL.into(),
            bytes: br#"{"payload":1}"#.to_vec(),
        })
        .await;

        // Assert
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let replies = push.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].error.as_deref().unwrap().contains("invalid message id"));
    }

    #[tokio::test]
    async fn test_server_refreshes_pair_on_inbound_frame() {
        let peer = PeerId::generate();
        let (table, _) = paired_table(peer).await;
        let before = table.lock().await.pair(&peer).unwrap().last_seen;
        let (d, _) = dispatcher(Role::Server, Arc::clone(&table), echo());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        d.on_frame(request_frame(json!(null)).0).await;

        assert!(table.lock().await.pair(&peer).unwrap().last_seen > before);
    }

    #[tokio::test]
    async fn test_client_drops_malformed_envelope_silently() {
        let (table, push) = paired_table(PeerId::generate()).await;
        let (d, _) = dispatcher(Role::Client, table, echo());

        d.on_frame(InboundFrame {
            address: PULL.into(),
            bytes: b"garbage".to_vec(),
        })
        .await;

        assert!(push.replies().is_empty());
    }

    #[tokio::test]
    async fn test_client_does_not_reply_to_handled_message() {
        let (table, push) = paired_table(PeerId::generate()).await;
        let (d, _) = dispatcher(Role::Client, table, echo());

        d.on_frame(request_frame(json!(5)).0).await;

        assert!(push.replies().is_empty());
    }

    #[tokio::test]
    async fn test_reply_completes_pending_request_instead_of_handler() {
        // Arrange
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: Arc<dyn MessageHandler> = Arc::new(move |_env: Envelope| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, HandlerError>(Value::Null) }
        });
        let (table, _) = paired_table(PeerId::generate()).await;
        let (d, pending) = dispatcher(Role::Client, table, handler);
        let (frame, id) = request_frame(json!("answer"));
        let waiter = pending.register(id);

        // Act
        d.on_frame(frame).await;

        // Assert
        let reply = tokio_test::assert_ok!(waiter.await);
        assert_eq!(reply.payload, Some(json!("answer")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_client_accepts_replies_without_target_under_strict_rules() {
        // Arrange: replies never carry targetIp/targetPort.
        let (table, _) = paired_table(PeerId::generate()).await;
        let pending = Arc::new(PendingRequests::new());
        let d = Dispatcher::new(
            Role::Client,
            PeerId::generate(),
            ParseRules {
                require_target: true,
            },
            table,
            echo(),
            Arc::clone(&pending),
        );
        let (frame, id) = request_frame(json!("reply"));
        let waiter = pending.register(id);

        // Act
        d.on_frame(frame).await;

        // Assert
        let reply = tokio_test::assert_ok!(waiter.await);
        assert!(reply.is_valid());
        assert_eq!(reply.payload, Some(json!("reply")));
    }

    #[tokio::test]
    async fn test_strict_server_rejects_request_without_target() {
        let (table, push) = paired_table(PeerId::generate()).await;
        let d = Dispatcher::new(
            Role::Server,
            PeerId::generate(),
            ParseRules {
                require_target: true,
            },
            table,
            echo(),
            Arc::new(PendingRequests::new()),
        );

        d.on_frame(request_frame(json!(1)).0).await;

        let replies = push.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].error.as_deref().unwrap().starts_with("invalid ip"));
    }

    #[tokio::test]
    async fn test_abandoned_wait_removes_its_waiter() {
        // Arrange
        let pending = PendingRequests::new();
        let id = CorrelationId::generate();
        let waiter = pending.register(id);
        let guard = pending.cancel_on_drop(id);

        // Act: the caller gives up before any reply.
        let waited = tokio::time::timeout(std::time::Duration::from_millis(5), waiter).await;
        drop(guard);

        // Assert
        assert!(waited.is_err());
        assert!(pending.is_empty());
        let mut late = Envelope::request(json!("late"));
        late.correlation_id = Some(id);
        assert!(pending.complete(late).is_err());
    }

    #[tokio::test]
    async fn test_fail_all_closes_waiters() {
        let pending = PendingRequests::new();
        let waiter = pending.register(CorrelationId::generate());
        pending.fail_all();
        tokio_test::assert_err!(waiter.await);
    }
}
