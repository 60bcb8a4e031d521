//! Error types for ceremony coordination

use thiserror::Error;

/// Result type alias for ceremony operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating a ceremony
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration or argument
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Network/relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Relay answered with a status the protocol does not expect
    #[error("Unexpected relay status {status} for {operation}")]
    UnexpectedStatus { operation: String, status: u16 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Encryption or decryption of a round message failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Timeout waiting for a condition
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// The MPC engine reported a failure
    #[error("Engine error: {0}")]
    Engine(String),

    /// A sign task ran out of attempts
    #[error("Failed to sign message {message_hash} after {attempts} attempts: {reason}")]
    SigningFailed {
        message_hash: String,
        attempts: u32,
        reason: String,
    },

    /// Key generation ran out of attempts
    #[error("Key generation failed after {attempts} attempts: {reason}")]
    KeygenFailed { attempts: u32, reason: String },

    /// The session committee was already declared
    #[error("Session already started: {0}")]
    SessionAlreadyStarted(String),

    /// Pairing payload could not be understood
    #[error("Invalid pairing payload: {0}")]
    InvalidPayload(String),

    /// Reshare payload names a different key than the local vault holds
    #[error("Reshare public key mismatch: vault holds {local}, payload declares {declared}")]
    ReshareMismatch { local: String, declared: String },

    /// No local vault matches the requested key
    #[error("Vault not found for public key {0}")]
    VaultNotFound(String),

    /// Mediator could not be located on the local network
    #[error("Service discovery failed: {0}")]
    ServiceDiscovery(String),

    /// Flow was cancelled before reaching a terminal state
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors a polling loop may swallow and retry on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Relay(_) | Error::UnexpectedStatus { .. } | Error::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
