//! Initiator side of key generation

use super::await_confirmation;
use crate::context::CeremonyContext;
use crate::discovery::ParticipantDiscovery;
use crate::keygen::{run_keygen, KeygenOutcome, KeygenPlan};
use crate::payload::KeygenPairingPayload;
use crate::session::SessionCoordinator;
use crate::{Error, PartyId, Result, TssAction};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeygenState {
    PeerDiscovery,
    DeviceConfirmation,
    Keygen,
    Success(KeygenOutcome),
    Error(String),
}

pub struct KeygenFlow {
    ctx: CeremonyContext,
    plan: KeygenPlan,
    state: watch::Sender<KeygenState>,
    participants: Arc<watch::Sender<Vec<PartyId>>>,
}

impl KeygenFlow {
    pub fn new(ctx: CeremonyContext, plan: KeygenPlan) -> Self {
        let (state, _) = watch::channel(KeygenState::PeerDiscovery);
        let (participants, _) = watch::channel(vec![ctx.local_party.clone()]);
        Self {
            ctx,
            plan,
            state,
            participants: Arc::new(participants),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<KeygenState> {
        self.state.subscribe()
    }

    /// Participants discovered so far, for the confirmation screen
    pub fn participants(&self) -> watch::Receiver<Vec<PartyId>> {
        self.participants.subscribe()
    }

    /// Payload to show joiners
    pub fn pairing_payload(&self, service_name: &str) -> KeygenPairingPayload {
        let (action, hex_chain_code, pub_key_ecdsa, old_parties) = match &self.plan {
            KeygenPlan::Keygen { hex_chain_code } => {
                (TssAction::Keygen, hex_chain_code.clone(), None, None)
            }
            KeygenPlan::Reshare {
                vault,
                old_committee,
            } => (
                TssAction::Reshare,
                vault.hex_chain_code.clone(),
                Some(vault.pub_key_ecdsa.clone()),
                Some(old_committee.parties().to_vec()),
            ),
        };
        KeygenPairingPayload {
            session_id: self.ctx.session.session_id.clone(),
            service_name: service_name.to_string(),
            hex_chain_code,
            encryption_key_hex: self.ctx.session.encryption_key.to_hex(),
            use_relay: self.ctx.session.uses_public_relay,
            action,
            pub_key_ecdsa,
            old_parties,
        }
    }

    /// Run the flow to a terminal state.
    ///
    /// `selection` ends peer discovery with the parties the user picked;
    /// `approval` is the user accepting that device list, which starts the
    /// session. Dropping either sender cancels the flow.
    #[instrument(skip_all, fields(session_id = %self.ctx.session.session_id))]
    pub async fn run(
        &self,
        selection: oneshot::Receiver<Vec<PartyId>>,
        approval: oneshot::Receiver<()>,
    ) -> Result<KeygenOutcome> {
        let result = self.drive(selection, approval).await;
        match &result {
            Ok(outcome) => {
                info!(pub_key_ecdsa = %outcome.pub_key_ecdsa, "Keygen flow succeeded");
                self.state.send_replace(KeygenState::Success(outcome.clone()));
            }
            Err(e) => {
                error!(error = %e, "Keygen flow failed");
                self.state.send_replace(KeygenState::Error(e.to_string()));
            }
        }
        result
    }

    async fn drive(
        &self,
        selection: oneshot::Receiver<Vec<PartyId>>,
        approval: oneshot::Receiver<()>,
    ) -> Result<KeygenOutcome> {
        self.state.send_replace(KeygenState::PeerDiscovery);
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

        let selected = await_confirmation(&discovery, &self.ctx.local_party, selection).await;
        discovery.stop().await;
        let committee = selected?;

        self.state.send_replace(KeygenState::DeviceConfirmation);
        approval
            .await
            .map_err(|_| Error::Cancelled("device confirmation dropped".into()))?;
        coordinator.start_session(&committee).await?;

        self.state.send_replace(KeygenState::Keygen);
        run_keygen(&self.ctx, &committee, &self.plan).await
    }
}
