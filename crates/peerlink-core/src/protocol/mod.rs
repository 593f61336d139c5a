//! Protocol module containing the wire envelope codec and the bus signal types.

pub mod envelope;
pub mod signal;

pub use envelope::{encode, parse, Envelope, ParseRules, ProtocolError, ValidationError};
pub use signal::{Channel, ChannelNames, InitSignal, PingSignal, PushSignal, Signal, SignalKind};
