//! Session lifecycle against the relay

use crate::mpc::Relay;
use crate::{CeremonyConfig, Committee, Error, PartyId, Result, Session};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Owns the session identity and drives create/start against the relay
pub struct SessionCoordinator {
    session: Session,
    local_party: PartyId,
    relay: Arc<dyn Relay>,
    config: CeremonyConfig,
    started: AtomicBool,
}

impl SessionCoordinator {
    pub fn new(
        session: Session,
        local_party: impl Into<PartyId>,
        relay: Arc<dyn Relay>,
        config: CeremonyConfig,
    ) -> Self {
        Self {
            session,
            local_party: local_party.into(),
            relay,
            config,
            started: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn local_party(&self) -> &str {
        &self.local_party
    }

    pub fn relay(&self) -> &Arc<dyn Relay> {
        &self.relay
    }

    /// Register the local party. Safe to repeat.
    #[instrument(skip(self), fields(session_id = %self.session.session_id, party = %self.local_party))]
    pub async fn create_session(&self) -> Result<()> {
        self.relay
            .register(&self.session.session_id, &[self.local_party.clone()])
            .await?;
        info!("Joined session");
        Ok(())
    }

    /// Declare the committee. Initiator only, at most once per coordinator.
    #[instrument(skip(self, committee), fields(session_id = %self.session.session_id))]
    pub async fn start_session(&self, committee: &Committee) -> Result<()> {
        if committee.is_empty() {
            return Err(Error::InvalidConfig("committee must not be empty".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::SessionAlreadyStarted(self.session.session_id.clone()));
        }

        match self.relay.start(&self.session.session_id, committee).await {
            Ok(()) => {
                info!(committee = %committee.keys(), "Session started");
                Ok(())
            }
            Err(e) => {
                // a request that never reached the relay may be retried
                if e.is_transient() {
                    self.started.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    /// Wait for the initiator to declare a committee that includes us.
    ///
    /// Polls until then; relay errors are logged and retried on the next tick.
    #[instrument(skip(self), fields(session_id = %self.session.session_id, party = %self.local_party))]
    pub async fn await_session_start(&self) -> Result<Committee> {
        loop {
            match self.relay.committee(&self.session.session_id).await {
                Ok(Some(parties)) => {
                    let committee = Committee::new(parties);
                    if committee.contains(&self.local_party) {
                        info!(committee = %committee.keys(), "Session start observed");
                        return Ok(committee);
                    }
                    debug!(committee = %committee.keys(), "Started without us, waiting");
                }
                Ok(None) => debug!("Session not started yet"),
                Err(e) => warn!(error = %e, "Failed to check session start"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Tear down the session on the relay
    pub async fn end_session(&self) -> Result<()> {
        self.relay.end_session(&self.session.session_id).await?;
        debug!(session_id = %self.session.session_id, "Session removed from relay");
        Ok(())
    }
}
