//! Per-party ceremony wiring

use crate::completion::CompletionVerifier;
use crate::mpc::{Engine, EngineFactory, Relay, StateAccessor};
use crate::transport::{Messenger, Puller};
use crate::{CeremonyConfig, Committee, PartyId, Result, Session};
use std::sync::Arc;

/// Everything one party needs to run engine ceremonies within a session
#[derive(Clone)]
pub struct CeremonyContext {
    pub session: Session,
    pub local_party: PartyId,
    pub relay: Arc<dyn Relay>,
    pub engine_factory: Arc<dyn EngineFactory>,
    pub state: Arc<dyn StateAccessor>,
    pub config: CeremonyConfig,
}

impl CeremonyContext {
    pub fn new(
        session: Session,
        local_party: impl Into<PartyId>,
        relay: Arc<dyn Relay>,
        engine_factory: Arc<dyn EngineFactory>,
        state: Arc<dyn StateAccessor>,
        config: CeremonyConfig,
    ) -> Self {
        Self {
            session,
            local_party: local_party.into(),
            relay,
            engine_factory,
            state,
            config,
        }
    }

    /// Fresh engine wired to a messenger for `committee`, plus its puller
    pub(crate) fn engine(
        &self,
        committee: &Committee,
        message_id: Option<&str>,
    ) -> Result<(Arc<dyn Engine>, Puller)> {
        let mut messenger = Messenger::new(
            &self.session,
            self.local_party.clone(),
            Arc::clone(&self.relay),
        )
        .with_committee(committee);
        if let Some(message_id) = message_id {
            messenger = messenger.with_message_id(message_id);
        }

        let engine = self.engine_factory.new_instance(
            messenger,
            Arc::clone(&self.state),
            &self.local_party,
        )?;
        let puller = Puller::new(
            &self.session,
            self.local_party.clone(),
            Arc::clone(&self.relay),
            Arc::clone(&engine),
            &self.config,
        );
        Ok((engine, puller))
    }

    pub fn completion_verifier(&self) -> CompletionVerifier {
        CompletionVerifier::new(
            self.session.session_id.clone(),
            self.local_party.clone(),
            Arc::clone(&self.relay),
            &self.config,
        )
    }
}
