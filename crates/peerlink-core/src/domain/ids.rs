//! Identifiers used on the coordination bus and on the wire.
//!
//! Three identifiers travel between peers:
//!
//! | Type            | Generated              | Purpose                                    |
//! |-----------------|------------------------|--------------------------------------------|
//! | [`PeerId`]      | once per node lifetime | who sent a bus signal or an envelope       |
//! | [`CorrelationId`] | once per request     | links a request envelope to its response   |
//! | [`SocketToken`] | once per push socket   | proves a pull socket connected to the right push socket |
//!
//! All three are random (version 4) UUIDs.  The validity predicate accepts any
//! textual UUID form that `uuid` understands as long as it is a v4 UUID, so every
//! value produced by the generator satisfies the predicate.
//!
//! # Why not a counter? (for beginners)
//!
//! A sequence counter is only unique inside one process.  Peers here never
//! coordinate before they talk, so two processes would hand out the same numbers.
//! A random 122-bit UUID makes collisions across processes practically impossible
//! without any coordination.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when a string is not an acceptable identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The string is not a UUID at all.
    #[error("malformed identifier: {0:?}")]
    Malformed(String),
    /// The string is a UUID, but not a random (v4) one.
    #[error("identifier {0} is not a random (v4) id")]
    WrongVersion(String),
}

fn parse_v4(s: &str) -> Result<Uuid, IdError> {
    let id = Uuid::try_parse(s).map_err(|_| IdError::Malformed(s.to_string()))?;
    if id.get_version_num() != 4 {
        return Err(IdError::WrongVersion(s.to_string()));
    }
    Ok(id)
}

/// Declares a `Copy` newtype over a v4 [`Uuid`] with generation, validation,
/// `Display`/`FromStr`, and string-based serde.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parses an identifier, accepting only v4 UUIDs.
            ///
            /// # Errors
            ///
            /// Returns [`IdError`] if `s` is not a v4 UUID.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                parse_v4(s).map(Self)
            }

            /// Returns `true` if `s` would be accepted by [`Self::parse`].
            pub fn is_valid(s: &str) -> bool {
                parse_v4(s).is_ok()
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0.hyphenated(), f)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(&s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_string()
            }
        }
    };
}

uuid_id! {
    /// Opaque identifier of one running node, generated once per node lifetime.
    PeerId
}

uuid_id! {
    /// Opaque token linking a request envelope to its eventual response.
    CorrelationId
}

uuid_id! {
    /// Handshake token naming one push socket.
    ///
    /// The server publishes it next to the port it bound; the client presents it
    /// when its pull socket connects, and the push socket refuses any connection
    /// that presents a different token.
    SocketToken
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_correlation_ids_satisfy_validity_predicate() {
        // Arrange / Act
        let ids: Vec<String> = (0..1000)
            .map(|_| CorrelationId::generate().to_string())
            .collect();

        // Assert
        for id in &ids {
            assert!(CorrelationId::is_valid(id), "generated id {id} must be valid");
        }
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_round_trips_display() {
        // Arrange
        let id = SocketToken::generate();

        // Act
        let parsed: SocketToken = id.to_string().parse().unwrap();

        // Assert
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(
            CorrelationId::parse("abc"),
            Err(IdError::Malformed("abc".to_string()))
        );
        assert!(!CorrelationId::is_valid(""));
    }

    #[test]
    fn test_parse_rejects_non_v4_uuid() {
        // The nil UUID parses as a UUID but carries no version.
        let nil = Uuid::nil().to_string();
        assert!(matches!(
            PeerId::parse(&nil),
            Err(IdError::WrongVersion(_))
        ));
    }

    #[test]
    fn test_serde_uses_hyphenated_string() {
        // Arrange
        let id = PeerId::generate();

        // Act
        let json = serde_json::to_string(&id).unwrap();
        let back: PeerId = serde_json::from_str(&json).unwrap();

        // Assert
        assert_eq!(json, format!("\"{id}\""));
        assert_eq!(back, id);
    }

    #[test]
    fn test_serde_rejects_invalid_string() {
        let result: Result<PeerId, _> = serde_json::from_str("\"not-an-id\"");
        assert!(result.is_err());
    }
}
