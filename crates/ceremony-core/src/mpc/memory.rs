//! In-memory collaborators for local runs and testing

use super::{async_trait, Connector, Relay, RoundMessage, ServiceDiscovery, StateAccessor};
use crate::{Committee, Error, PartyId, Result, Signature};
use dashmap::DashMap;
use msg_relay::{MediatorStore, RelayError};
use std::collections::HashMap;
use std::sync::Arc;

/// Relay backed directly by a [`MediatorStore`], no HTTP in between
#[derive(Clone, Default)]
pub struct MemoryRelay {
    store: MediatorStore,
}

impl MemoryRelay {
    /// Create a new in-memory relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing store, e.g. the one behind a running mediator
    pub fn with_store(store: MediatorStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MediatorStore {
        &self.store
    }

    /// Connector handing out this relay for every server address
    pub fn connector(self: &Arc<Self>) -> impl Connector {
        let relay = Arc::clone(self);
        move |_server_address: &str| -> Result<Arc<dyn Relay>> {
            Ok(Arc::clone(&relay) as Arc<dyn Relay>)
        }
    }
}

fn relay_error(e: RelayError) -> Error {
    match e {
        RelayError::Conflict(reason) => Error::SessionAlreadyStarted(reason),
        other => Error::Relay(other.to_string()),
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn register(&self, session_id: &str, parties: &[PartyId]) -> Result<()> {
        self.store.register(session_id, parties);
        Ok(())
    }

    async fn end_session(&self, session_id: &str) -> Result<()> {
        self.store.remove_session(session_id);
        Ok(())
    }

    async fn participants(&self, session_id: &str) -> Result<Vec<PartyId>> {
        Ok(self.store.participants(session_id).unwrap_or_default())
    }

    async fn start(&self, session_id: &str, committee: &Committee) -> Result<()> {
        self.store
            .start(session_id, committee.parties())
            .map_err(relay_error)
    }

    async fn committee(&self, session_id: &str) -> Result<Option<Vec<PartyId>>> {
        Ok(self.store.committee(session_id))
    }

    async fn mark_complete(&self, session_id: &str, parties: &[PartyId]) -> Result<()> {
        self.store.mark_complete(session_id, parties);
        Ok(())
    }

    async fn completed_parties(&self, session_id: &str) -> Result<Vec<PartyId>> {
        Ok(self.store.completed(session_id).unwrap_or_default())
    }

    async fn mark_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &Signature,
    ) -> Result<()> {
        let body = serde_json::to_string(signature)?;
        self.store.put_signature(session_id, message_id, body);
        Ok(())
    }

    async fn keysign_signature(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<Signature>> {
        self.store
            .signature(session_id, message_id)
            .map(|body| {
                serde_json::from_str(&body).map_err(|e| Error::Deserialization(e.to_string()))
            })
            .transpose()
    }

    async fn send_message(&self, message_id: Option<&str>, message: &RoundMessage) -> Result<()> {
        self.store
            .put_message(message_id, message.clone())
            .map(|_| ())
            .map_err(relay_error)
    }

    async fn fetch_messages(
        &self,
        session_id: &str,
        party: &str,
        message_id: Option<&str>,
    ) -> Result<Vec<RoundMessage>> {
        Ok(self.store.messages_for(session_id, party, message_id))
    }

    async fn delete_message(
        &self,
        session_id: &str,
        party: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> Result<()> {
        self.store.delete_message(session_id, party, hash, message_id);
        Ok(())
    }
}

/// Key shares kept in memory, keyed by public key
#[derive(Default)]
pub struct MemoryStateAccessor {
    shares: DashMap<String, String>,
}

impl MemoryStateAccessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateAccessor for MemoryStateAccessor {
    fn get_local_state(&self, pub_key: &str) -> Result<String> {
        self.shares
            .get(pub_key)
            .map(|share| share.value().clone())
            .ok_or_else(|| Error::VaultNotFound(pub_key.to_string()))
    }

    fn save_local_state(&self, pub_key: &str, state: &str) -> Result<()> {
        self.shares.insert(pub_key.to_string(), state.to_string());
        Ok(())
    }
}

/// Fixed service name to mediator address table
#[derive(Debug, Clone, Default)]
pub struct StaticServiceDiscovery {
    services: HashMap<String, String>,
}

impl StaticServiceDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.services.insert(name.into(), address.into());
        self
    }
}

#[async_trait]
impl ServiceDiscovery for StaticServiceDiscovery {
    async fn resolve(&self, service_name: &str) -> Result<String> {
        self.services
            .get(service_name)
            .cloned()
            .ok_or_else(|| Error::ServiceDiscovery(format!("no mediator named {}", service_name)))
    }
}
