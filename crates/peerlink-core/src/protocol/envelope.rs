//! JSON codec for the application envelope carried over paired sockets.
//!
//! Wire format (one flat JSON object per transport frame, absent fields omitted):
//!
//! ```json
//! {"correlationId":"7c0e…","senderPeerId":"1f9a…","payload":1700000000000}
//! {"correlationId":"7c0e…","senderPeerId":"53d2…","errorMessage":"boom"}
//! {"correlationId":"7c0e…","targetIp":"10.0.0.5","targetPort":8001,"payload":{}}
//! ```
//!
//! `result` is accepted as an alias of `payload` when decoding.
//!
//! # Why does `parse` never fail? (for beginners)
//!
//! The receiving side of a socket has nobody to return an `Err` to: the bytes
//! arrived from a remote peer.  What it *can* do is answer the sender with an
//! explanation.  So [`parse`] always produces an [`Envelope`]; when the bytes
//! are malformed, the envelope carries the explanation in `errorMessage` and the
//! structured reason in [`Envelope::validation_error`].  The server echoes such
//! envelopes back to the sender without calling the application handler.

use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::ids::{CorrelationId, PeerId};

const KEY_CORRELATION_ID: &str = "correlationId";
const KEY_SENDER: &str = "senderPeerId";
const KEY_TARGET_IP: &str = "targetIp";
const KEY_TARGET_PORT: &str = "targetPort";
const KEY_PAYLOAD: &str = "payload";
const KEY_RESULT: &str = "result";
const KEY_ERROR: &str = "errorMessage";

/// Longest excerpt of offending input quoted in an error message.
const PREVIEW_LEN: usize = 64;

/// Errors that can occur while encoding protocol values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// A value could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A bus payload could not be parsed (invalid JSON, missing field, bad id).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A bus channel name does not belong to this protocol or prefix.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// Why an inbound envelope was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Not JSON, or JSON that is not an object.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Missing correlation id, or one that fails [`CorrelationId::is_valid`].
    #[error("invalid message id: {0}")]
    InvalidCorrelationId(String),
    /// Missing or unparsable `targetIp` where a reply target is required.
    #[error("invalid ip: {0}")]
    InvalidTargetIp(String),
    /// Missing, non-numeric, zero, or out-of-range `targetPort` where a reply target is required.
    #[error("invalid port: {0}")]
    InvalidTargetPort(String),
}

/// Validation rules applied by [`parse`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseRules {
    /// Require a valid `targetIp`/`targetPort` pair.  Set on nodes that act as
    /// addressable reply targets.
    pub require_target: bool,
}

/// One application message or response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Envelope {
    /// Links a response to its request.  Always present on outbound envelopes.
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    /// The node that sent this envelope.
    #[serde(rename = "senderPeerId", skip_serializing_if = "Option::is_none")]
    pub sender: Option<PeerId>,

    /// Explicit reply address (address-embedded variant).
    #[serde(rename = "targetIp", skip_serializing_if = "Option::is_none")]
    pub target_ip: Option<IpAddr>,

    /// Explicit reply port (address-embedded variant).
    #[serde(rename = "targetPort", skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,

    /// Request payload, or the handler result in a response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Failure description: a handler rejection or a validation failure.
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Set by [`parse`] when the inbound bytes were rejected.  Never serialized.
    #[serde(skip)]
    validation: Option<ValidationError>,
}

impl Envelope {
    /// Creates a request envelope carrying `payload` (no correlation id yet).
    pub fn request(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::default()
        }
    }

    fn rejected(reason: ValidationError) -> Self {
        let mut env = Self::default();
        env.reject(reason);
        env
    }

    fn reject(&mut self, reason: ValidationError) {
        self.error = Some(reason.to_string());
        self.validation = Some(reason);
    }

    /// Returns the validation failure recorded by [`parse`], if any.
    pub fn validation_error(&self) -> Option<&ValidationError> {
        self.validation.as_ref()
    }

    /// `true` if the envelope passed validation.
    pub fn is_valid(&self) -> bool {
        self.validation.is_none()
    }

    /// Returns the correlation id, generating and storing one if absent.
    pub fn ensure_correlation_id(&mut self) -> CorrelationId {
        *self
            .correlation_id
            .get_or_insert_with(CorrelationId::generate)
    }

    /// The explicit reply address, when both target fields are present.
    pub fn reply_target(&self) -> Option<SocketAddr> {
        match (self.target_ip, self.target_port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    /// Turns a request into a successful response carrying `result`.
    ///
    /// Keeps the correlation id; drops the error and the reply-target fields so
    /// the response carries exactly one of payload or errorMessage.
    pub fn respond_ok(mut self, result: Value) -> Self {
        self.payload = Some(result);
        self.error = None;
        self.target_ip = None;
        self.target_port = None;
        self
    }

    /// Turns a request into a failed response carrying `message`.
    pub fn respond_err(mut self, message: impl Into<String>) -> Self {
        self.payload = None;
        self.error = Some(message.into());
        self.target_ip = None;
        self.target_port = None;
        self
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Parses one inbound frame into an [`Envelope`].
///
/// Never fails: malformed input yields an envelope whose `error` describes the
/// problem and whose [`Envelope::validation_error`] is set.  Offending fields are
/// cleared rather than kept malformed.  The first failure found is reported.
///
/// # Examples
///
/// ```rust
/// use peerlink_core::protocol::envelope::{parse, ParseRules};
///
/// let env = parse(b"not json", ParseRules::default());
/// assert!(env.error.is_some());
/// assert!(!env.is_valid());
/// ```
pub fn parse(raw: &[u8], rules: ParseRules) -> Envelope {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(_) => return Envelope::rejected(ValidationError::InvalidRequest(preview(raw))),
    };
    let Value::Object(fields) = value else {
        return Envelope::rejected(ValidationError::InvalidRequest(preview(raw)));
    };

    let mut env = Envelope {
        correlation_id: string_field(&fields, KEY_CORRELATION_ID)
            .and_then(|s| CorrelationId::parse(s).ok()),
        sender: string_field(&fields, KEY_SENDER).and_then(|s| PeerId::parse(s).ok()),
        target_ip: string_field(&fields, KEY_TARGET_IP).and_then(|s| s.parse().ok()),
        target_port: fields
            .get(KEY_TARGET_PORT)
            .and_then(Value::as_u64)
            .filter(|p| *p > 0)
            .and_then(|p| u16::try_from(p).ok()),
        payload: fields
            .get(KEY_PAYLOAD)
            .or_else(|| fields.get(KEY_RESULT))
            .cloned(),
        error: string_field(&fields, KEY_ERROR).map(str::to_owned),
        validation: None,
    };

    if env.correlation_id.is_none() {
        env.reject(ValidationError::InvalidCorrelationId(describe(
            fields.get(KEY_CORRELATION_ID),
        )));
    } else if rules.require_target {
        if env.target_ip.is_none() {
            env.reject(ValidationError::InvalidTargetIp(describe(
                fields.get(KEY_TARGET_IP),
            )));
        } else if env.target_port.is_none() {
            env.reject(ValidationError::InvalidTargetPort(describe(
                fields.get(KEY_TARGET_PORT),
            )));
        }
    }

    env
}

/// Encodes `envelope` as a flat JSON object.
///
/// Generates and stores a fresh correlation id first if the envelope has none,
/// so the caller can read it back after encoding.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if the payload cannot be serialized.
pub fn encode(envelope: &mut Envelope) -> Result<Vec<u8>, ProtocolError> {
    envelope.ensure_correlation_id();
    serde_json::to_vec(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn string_field<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

fn describe(value: Option<&Value>) -> String {
    match value {
        None => "missing".to_string(),
        Some(v) => truncate(v.to_string()),
    }
}

fn preview(raw: &[u8]) -> String {
    truncate(String::from_utf8_lossy(raw).into_owned())
}

fn truncate(mut s: String) -> String {
    if let Some((cut, _)) = s.char_indices().nth(PREVIEW_LEN) {
        s.truncate(cut);
        s.push('…');
    }
    s
}

// ── Tests ─────────────────────────────────────────────────────────────────────
