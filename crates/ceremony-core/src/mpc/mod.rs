//! Seams between the ceremony layer and its collaborators
//!
//! - [`Relay`]: the mediator/relay HTTP surface
//! - [`Engine`] / [`EngineFactory`]: the opaque MPC engine
//! - [`StateAccessor`]: key share persistence handed to the engine
//! - [`ServiceDiscovery`]: local network mediator lookup

use crate::transport::Messenger;
use crate::{Committee, KeyType, PartyId, Result, Signature};
use std::sync::Arc;

pub use ::async_trait::async_trait;
pub use msg_relay::RoundMessage;

/// Relay/mediator operations used by a ceremony
#[async_trait]
pub trait Relay: Send + Sync {
    /// Register parties under a session (`POST /{session}`)
    async fn register(&self, session_id: &str, parties: &[PartyId]) -> Result<()>;

    /// Drop a session and its start record (`DELETE /{session}`)
    async fn end_session(&self, session_id: &str) -> Result<()>;

    /// Parties registered so far, empty for an unknown session
    async fn participants(&self, session_id: &str) -> Result<Vec<PartyId>>;

    /// Declare the committee and close the session for joining
    async fn start(&self, session_id: &str, committee: &Committee) -> Result<()>;

    /// Declared committee, `None` until the session has started
    async fn committee(&self, session_id: &str) -> Result<Option<Vec<PartyId>>>;

    /// Record keygen completion for parties
    async fn mark_complete(&self, session_id: &str, parties: &[PartyId]) -> Result<()>;

    /// Parties that reported keygen completion
    async fn completed_parties(&self, session_id: &str) -> Result<Vec<PartyId>>;

    /// Publish the signature produced for a message
    async fn mark_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &Signature,
    ) -> Result<()>;

    /// Signature some party published for a message
    async fn keysign_signature(&self, session_id: &str, message_id: &str)
        -> Result<Option<Signature>>;

    /// Post an encrypted round message
    async fn send_message(&self, message_id: Option<&str>, message: &RoundMessage) -> Result<()>;

    /// Round messages waiting for `party`
    async fn fetch_messages(
        &self,
        session_id: &str,
        party: &str,
        message_id: Option<&str>,
    ) -> Result<Vec<RoundMessage>>;

    /// Acknowledge a consumed round message
    async fn delete_message(
        &self,
        session_id: &str,
        party: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> Result<()>;
}

/// Builds a relay handle for a server address.
///
/// Joiners only learn the address after decoding the pairing payload (and
/// possibly resolving a local mediator), so flows connect lazily.
pub trait Connector: Send + Sync {
    fn connect(&self, server_address: &str) -> Result<Arc<dyn Relay>>;
}

impl<F> Connector for F
where
    F: Fn(&str) -> Result<Arc<dyn Relay>> + Send + Sync,
{
    fn connect(&self, server_address: &str) -> Result<Arc<dyn Relay>> {
        self(server_address)
    }
}

/// Key generation request
#[derive(Debug, Clone)]
pub struct KeygenRequest {
    pub local_party_id: PartyId,
    pub committee: Committee,
    pub hex_chain_code: String,
}

/// Reshare request, moving a key from the old committee to a new one
#[derive(Debug, Clone)]
pub struct ReshareRequest {
    pub local_party_id: PartyId,
    pub pub_key: String,
    pub old_committee: Committee,
    pub new_committee: Committee,
    pub hex_chain_code: String,
    pub reshare_prefix: String,
}

/// Result of a keygen or reshare
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeygenResponse {
    pub pub_key: String,
    pub reshare_prefix: String,
}

/// Signing request for one message
#[derive(Debug, Clone)]
pub struct KeysignRequest {
    pub local_party_id: PartyId,
    pub committee: Committee,
    pub pub_key: String,
    /// Hex encoded message
    pub message: String,
    pub derivation_path: String,
}

/// Opaque MPC engine.
///
/// Outbound round messages leave through the [`Messenger`] the engine was
/// created with; inbound ones arrive through [`Engine::apply_message`].
#[async_trait]
pub trait Engine: Send + Sync {
    async fn keygen(&self, key_type: KeyType, request: &KeygenRequest) -> Result<KeygenResponse>;

    async fn reshare(&self, key_type: KeyType, request: &ReshareRequest)
        -> Result<KeygenResponse>;

    async fn keysign(&self, key_type: KeyType, request: &KeysignRequest) -> Result<Signature>;

    /// Inbound hook, fed with decrypted round messages
    fn apply_message(&self, payload: &[u8]) -> Result<()>;
}

/// Creates one engine instance per ceremony
pub trait EngineFactory: Send + Sync {
    fn new_instance(
        &self,
        messenger: Messenger,
        state: Arc<dyn StateAccessor>,
        local_party: &str,
    ) -> Result<Arc<dyn Engine>>;
}

/// Key share persistence handed to the engine
pub trait StateAccessor: Send + Sync {
    fn get_local_state(&self, pub_key: &str) -> Result<String>;
    fn save_local_state(&self, pub_key: &str, state: &str) -> Result<()>;
}

/// Resolves a mediator advertised on the local network
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Returns the mediator base URL for `service_name`
    async fn resolve(&self, service_name: &str) -> Result<String>;
}

/// In-memory collaborators for local runs and tests
pub mod memory;

pub use memory::{MemoryRelay, MemoryStateAccessor, StaticServiceDiscovery};
