//! Joiner side of keysign

use super::JoinerContext;
use crate::context::CeremonyContext;
use crate::payload::KeysignPairingPayload;
use crate::session::SessionCoordinator;
use crate::sign::SigningOrchestrator;
use crate::{Error, Result, Signature, Vault};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinKeysignState {
    DiscoveringSessionId,
    DiscoverService,
    JoinKeysign,
    WaitingForStart,
    Keysign,
    Success(HashMap<String, Signature>),
    Error(String),
    FailedToStart(String),
}

pub struct JoinKeysignFlow {
    joiner: JoinerContext,
    vaults: Vec<Vault>,
    state: watch::Sender<JoinKeysignState>,
}

enum Failure {
    BeforeStart(Error),
    During(Error),
}

impl JoinKeysignFlow {
    pub fn new(joiner: JoinerContext, vaults: Vec<Vault>) -> Self {
        let (state, _) = watch::channel(JoinKeysignState::DiscoveringSessionId);
        Self {
            joiner,
            vaults,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<JoinKeysignState> {
        self.state.subscribe()
    }

    #[instrument(skip_all, fields(party = %self.joiner.local_party))]
    pub async fn run(&self, raw_payload: &str) -> Result<HashMap<String, Signature>> {
        match self.drive(raw_payload).await {
            Ok(signatures) => {
                info!(count = signatures.len(), "Joined keysign succeeded");
                self.state
                    .send_replace(JoinKeysignState::Success(signatures.clone()));
                Ok(signatures)
            }
            Err(Failure::BeforeStart(e)) => {
                warn!(error = %e, "Failed to start keysign");
                self.state
                    .send_replace(JoinKeysignState::FailedToStart(e.to_string()));
                Err(e)
            }
            Err(Failure::During(e)) => {
                error!(error = %e, "Joined keysign failed");
                self.state.send_replace(JoinKeysignState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        raw_payload: &str,
    ) -> std::result::Result<HashMap<String, Signature>, Failure> {
        self.state
            .send_replace(JoinKeysignState::DiscoveringSessionId);
        let payload = KeysignPairingPayload::parse(raw_payload).map_err(Failure::BeforeStart)?;
        let vault = payload
            .find_vault(&self.vaults)
            .map_err(Failure::BeforeStart)?;

        if !payload.use_relay {
            self.state.send_replace(JoinKeysignState::DiscoverService);
        }
        let address = self
            .joiner
            .server_address(payload.use_relay, &payload.service_name)
            .await
            .map_err(Failure::BeforeStart)?;
        let session = payload.session(&address).map_err(Failure::BeforeStart)?;

        self.state.send_replace(JoinKeysignState::JoinKeysign);
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

        self.state.send_replace(JoinKeysignState::WaitingForStart);
        let committee = coordinator
            .await_session_start()
            .await
            .map_err(Failure::BeforeStart)?;

        self.state.send_replace(JoinKeysignState::Keysign);
        let ctx = CeremonyContext::new(
            session,
            self.joiner.local_party.clone(),
            relay,
            Arc::clone(&self.joiner.engine_factory),
            Arc::clone(&self.joiner.state),
            self.joiner.config.clone(),
        );
        let mut orchestrator = SigningOrchestrator::new(
            ctx,
            payload.key_type,
            vault.pub_key(payload.key_type),
            committee,
        );
        orchestrator
            .sign_all(payload.sign_tasks())
            .await
            .map_err(Failure::During)
    }
}
