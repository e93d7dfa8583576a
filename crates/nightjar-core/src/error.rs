//! Error types for the nightjar protocol core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Event failed structural validation
    #[error("invalid event: {reason}")]
    InvalidEvent { reason: String },

    /// Private key rejected (wrong length, zero, or >= curve order)
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// X coordinate does not name a point on the curve
    #[error("invalid curve point")]
    InvalidPoint,

    /// Hex or bech32 decoding failure
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// NIP-44 decryption failure. Deliberately opaque: the MAC, padding,
    /// version and length failure modes are indistinguishable.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Rumor author does not match the seal author
    #[error("sender impersonation detected")]
    Impersonation,

    /// Unwrap input had the wrong kind
    #[error("unexpected kind: expected {expected}, got {got}")]
    UnexpectedKind { expected: u16, got: u16 },

    /// Group wrap called with an empty recipient list
    #[error("no recipients")]
    NoRecipients,

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for structural validation failures.
    pub fn invalid_event(reason: impl Into<String>) -> Self {
        Error::InvalidEvent {
            reason: reason.into(),
        }
    }
}
