//! # Ceremony Core
//!
//! Session and message delivery layer for threshold key generation and
//! signing across devices that only share an untrusted relay.
//!
//! This crate provides:
//! - Session lifecycle (create, start, await start) and participant discovery
//! - Encrypted round message relay keyed by message hash
//! - Retry-driven signing with cross-party completion fallback
//! - Keygen, keysign and the matching joiner flows as state machines
//!
//! The MPC engine itself stays behind the [`mpc::Engine`] seam.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ceremony_core::{flow::KeygenFlow, keygen::KeygenPlan, CeremonyContext};
//!
//! let flow = KeygenFlow::new(ctx, KeygenPlan::Keygen { hex_chain_code });
//! show_qr(flow.pairing_payload("my-vault").to_json()?);
//! let outcome = flow.run(selected_devices_rx, approval_rx).await?;
//! ```

pub mod completion;
pub mod config;
pub mod context;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod keygen;
pub mod mpc;
pub mod payload;
pub mod poll;
pub mod session;
pub mod sign;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use completion::CompletionVerifier;
pub use config::{CeremonyConfig, PUBLIC_RELAY_URL};
pub use context::CeremonyContext;
pub use crypto::EncryptionKey;
pub use discovery::{ParticipantDiscovery, ParticipantObserver};
pub use error::{Error, Result};
pub use session::SessionCoordinator;
pub use sign::SigningOrchestrator;
pub use types::{
    Committee, CompletionRecord, CompletionScope, KeyType, PartyId, Session, SessionId, SignTask,
    Signature, TssAction, Vault,
};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
