//! Joiner side of key generation and reshare

use super::JoinerContext;
use crate::context::CeremonyContext;
use crate::keygen::{run_keygen, KeygenOutcome, KeygenPlan};
use crate::mpc::Relay;
use crate::payload::KeygenPairingPayload;
use crate::session::SessionCoordinator;
use crate::{Error, Result, Session, TssAction, Vault};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinKeygenState {
    DiscoveringSessionId,
    DiscoverService,
    JoinKeygen,
    WaitingForStart,
    Keygen,
    Success(KeygenOutcome),
    Error(String),
    FailedToStart(String),
}

pub struct JoinKeygenFlow {
    joiner: JoinerContext,
    /// Local vault; empty keys for a device joining a fresh keygen
    vault: Vault,
    state: watch::Sender<JoinKeygenState>,
}

/// Failure before the ceremony started vs. during it
enum Failure {
    BeforeStart(Error),
    During(Error),
}

impl JoinKeygenFlow {
    pub fn new(joiner: JoinerContext, vault: Vault) -> Self {
        let (state, _) = watch::channel(JoinKeygenState::DiscoveringSessionId);
        Self {
            joiner,
            vault,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<JoinKeygenState> {
        self.state.subscribe()
    }

    /// Join the session described by a scanned pairing payload
    #[instrument(skip_all, fields(party = %self.joiner.local_party))]
    pub async fn run(&self, raw_payload: &str) -> Result<KeygenOutcome> {
        match self.drive(raw_payload).await {
            Ok(outcome) => {
                info!(pub_key_ecdsa = %outcome.pub_key_ecdsa, "Joined keygen succeeded");
                self.state.send_replace(JoinKeygenState::Success(outcome.clone()));
                Ok(outcome)
            }
            Err(Failure::BeforeStart(e)) => {
                warn!(error = %e, "Failed to start keygen");
                self.state
                    .send_replace(JoinKeygenState::FailedToStart(e.to_string()));
                Err(e)
            }
            Err(Failure::During(e)) => {
                error!(error = %e, "Joined keygen failed");
                self.state.send_replace(JoinKeygenState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn drive(&self, raw_payload: &str) -> std::result::Result<KeygenOutcome, Failure> {
        self.state
            .send_replace(JoinKeygenState::DiscoveringSessionId);
        let payload = KeygenPairingPayload::parse(raw_payload).map_err(Failure::BeforeStart)?;
        payload.check_reshare(&self.vault).map_err(Failure::BeforeStart)?;

        if !payload.use_relay {
            self.state.send_replace(JoinKeygenState::DiscoverService);
        }
        let address = self
            .joiner
            .server_address(payload.use_relay, &payload.service_name)
            .await
            .map_err(Failure::BeforeStart)?;
        let session = payload.session(&address).map_err(Failure::BeforeStart)?;

        self.state.send_replace(JoinKeygenState::JoinKeygen);
        let relay = self
            .joiner
            .connector
            .connect(&session.server_address)
            .map_err(Failure::BeforeStart)?;
        let coordinator = SessionCoordinator::new(
            session.clone(),
            self.joiner.local_party.clone(),
            Arc::clone(&relay),
            self.joiner.config.clone(),
        );
        coordinator.create_session().await.map_err(Failure::BeforeStart)?;

        self.state.send_replace(JoinKeygenState::WaitingForStart);
        let committee = coordinator
            .await_session_start()
            .await
            .map_err(Failure::BeforeStart)?;

        self.state.send_replace(JoinKeygenState::Keygen);
        let ctx = self.ceremony(session, relay);
        let plan = self.plan(&payload);
        run_keygen(&ctx, &committee, &plan)
            .await
            .map_err(Failure::During)
    }

    fn ceremony(&self, session: Session, relay: Arc<dyn Relay>) -> CeremonyContext {
        CeremonyContext::new(
            session,
            self.joiner.local_party.clone(),
            relay,
            Arc::clone(&self.joiner.engine_factory),
            Arc::clone(&self.joiner.state),
            self.joiner.config.clone(),
        )
    }

    fn plan(&self, payload: &KeygenPairingPayload) -> KeygenPlan {
        match payload.action {
            TssAction::Keygen => KeygenPlan::Keygen {
                hex_chain_code: payload.hex_chain_code.clone(),
            },
            TssAction::Reshare => {
                let mut vault = self.vault.clone();
                if vault.pub_key_ecdsa.is_empty() {
                    vault.pub_key_ecdsa = payload.pub_key_ecdsa.clone().unwrap_or_default();
                }
                if vault.hex_chain_code.is_empty() {
                    vault.hex_chain_code = payload.hex_chain_code.clone();
                }
                KeygenPlan::Reshare {
                    vault,
                    old_committee: payload.old_committee(),
                }
            }
        }
    }
}
