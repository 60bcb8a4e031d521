//! Initiator side of keysign

use super::await_confirmation;
use crate::context::CeremonyContext;
use crate::discovery::ParticipantDiscovery;
use crate::payload::KeysignPairingPayload;
use crate::session::SessionCoordinator;
use crate::sign::SigningOrchestrator;
use crate::{Committee, Error, KeyType, PartyId, Result, SignTask, Signature, Vault};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeysignState {
    PeerDiscovery,
    Keysign,
    Success(HashMap<String, Signature>),
    Error(String),
}

pub struct KeysignFlow {
    ctx: CeremonyContext,
    vault: Vault,
    key_type: KeyType,
    messages: Vec<String>,
    derivation_path: String,
    state: watch::Sender<KeysignState>,
    participants: Arc<watch::Sender<Vec<PartyId>>>,
}

impl KeysignFlow {
    pub fn new(
        ctx: CeremonyContext,
        vault: Vault,
        key_type: KeyType,
        messages: Vec<String>,
        derivation_path: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(KeysignState::PeerDiscovery);
        let (participants, _) = watch::channel(vec![ctx.local_party.clone()]);
        Self {
            ctx,
            vault,
            key_type,
            messages,
            derivation_path: derivation_path.into(),
            state,
            participants: Arc::new(participants),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<KeysignState> {
        self.state.subscribe()
    }

    pub fn participants(&self) -> watch::Receiver<Vec<PartyId>> {
        self.participants.subscribe()
    }

    pub fn pairing_payload(&self, service_name: &str) -> KeysignPairingPayload {
        KeysignPairingPayload {
            session_id: self.ctx.session.session_id.clone(),
            service_name: service_name.to_string(),
            encryption_key_hex: self.ctx.session.encryption_key.to_hex(),
            use_relay: self.ctx.session.uses_public_relay,
            pub_key_ecdsa: self.vault.pub_key_ecdsa.clone(),
            key_type: self.key_type,
            messages: self.messages.clone(),
            derive_path: self.derivation_path.clone(),
        }
    }

    #[instrument(skip_all, fields(session_id = %self.ctx.session.session_id))]
    pub async fn run(
        &self,
        confirm: oneshot::Receiver<Vec<PartyId>>,
    ) -> Result<HashMap<String, Signature>> {
        let result = self.drive(confirm).await;
        match &result {
            Ok(signatures) => {
                info!(count = signatures.len(), "Keysign flow succeeded");
                self.state.send_replace(KeysignState::Success(signatures.clone()));
            }
            Err(e) => {
                error!(error = %e, "Keysign flow failed");
                self.state.send_replace(KeysignState::Error(e.to_string()));
            }
        }
        result
    }

    async fn drive(
        &self,
        confirm: oneshot::Receiver<Vec<PartyId>>,
    ) -> Result<HashMap<String, Signature>> {
        self.state.send_replace(KeysignState::PeerDiscovery);
        let coordinator = SessionCoordinator::new(
            self.ctx.session.clone(),
            self.ctx.local_party.clone(),
            Arc::clone(&self.ctx.relay),
            self.ctx.config.clone(),
        );
        coordinator.create_session().await?;

        let mut discovery = ParticipantDiscovery::new(
            self.ctx.session.session_id.clone(),
            self.ctx.local_party.clone(),
            Arc::clone(&self.ctx.relay),
            &self.ctx.config,
        );
        discovery.add_observer(self.participants.clone());
        discovery.start();

        let confirmed = self.confirm(&discovery, &coordinator, confirm).await;
        discovery.stop().await;
        let committee = confirmed?;

        self.state.send_replace(KeysignState::Keysign);
        let tasks: Vec<SignTask> = self
            .messages
            .iter()
            .map(|message| SignTask::new(message.clone(), self.derivation_path.clone()))
            .collect();
        let mut orchestrator = SigningOrchestrator::new(
            self.ctx.clone(),
            self.key_type,
            self.vault.pub_key(self.key_type),
            committee,
        );
        orchestrator.sign_all(tasks).await
    }

    async fn confirm(
        &self,
        discovery: &ParticipantDiscovery,
        coordinator: &SessionCoordinator,
        confirm: oneshot::Receiver<Vec<PartyId>>,
    ) -> Result<Committee> {
        let committee = await_confirmation(discovery, &self.ctx.local_party, confirm).await?;
        if !self.vault.signers.is_empty() {
            if let Some(stranger) = committee
                .parties()
                .iter()
                .find(|party| !self.vault.signers.contains(party))
            {
                return Err(Error::InvalidConfig(format!(
                    "{} is not a signer of vault {}",
                    stranger, self.vault.name
                )));
            }
        }
        coordinator.start_session(&committee).await?;
        Ok(committee)
    }
}
