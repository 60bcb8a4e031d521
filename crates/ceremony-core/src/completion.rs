//! Local "done" to global "all done"
//!
//! Keygen completion is a set of parties per session; keysign completion is
//! the signature itself, stored per message so a party whose own attempt
//! failed can adopt what a peer produced.

use crate::mpc::Relay;
use crate::{
    CeremonyConfig, Committee, CompletionRecord, CompletionScope, Error, PartyId, Result,
    SessionId, Signature,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub struct CompletionVerifier {
    session_id: SessionId,
    local_party: PartyId,
    relay: Arc<dyn Relay>,
    poll_interval: Duration,
    timeout: Duration,
}

impl CompletionVerifier {
    pub fn new(
        session_id: impl Into<SessionId>,
        local_party: impl Into<PartyId>,
        relay: Arc<dyn Relay>,
        config: &CeremonyConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            local_party: local_party.into(),
            relay,
            poll_interval: config.poll_interval,
            timeout: config.completion_timeout,
        }
    }

    fn record(&self, scope: CompletionScope) -> CompletionRecord {
        CompletionRecord {
            party_id: self.local_party.clone(),
            scope,
        }
    }

    /// Report the local keygen as done. Failures are logged only; peers
    /// waiting on us will time out instead.
    pub async fn mark_local_party_complete(&self) -> Option<CompletionRecord> {
        match self
            .relay
            .mark_complete(&self.session_id, &[self.local_party.clone()])
            .await
        {
            Ok(()) => {
                debug!(session_id = %self.session_id, party = %self.local_party, "Marked keygen complete");
                Some(self.record(CompletionScope::Session))
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Failed to mark keygen complete");
                None
            }
        }
    }

    /// Wait until every committee member reported completion
    #[instrument(skip(self, committee), fields(session_id = %self.session_id))]
    pub async fn check_completed_parties(&self, committee: &Committee) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.relay.completed_parties(&self.session_id).await {
                Ok(completed) if committee.is_covered_by(&completed) => {
                    info!(parties = ?completed, "All parties completed");
                    return Ok(());
                }
                Ok(completed) => debug!(parties = ?completed, "Waiting for completion"),
                Err(e) => warn!(error = %e, "Failed to check completed parties"),
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(Error::Timeout(format!(
                    "all of {} to complete session {}",
                    committee.keys(),
                    self.session_id
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Publish the signature produced locally for `message_id`
    pub async fn mark_local_party_keysign_complete(
        &self,
        message_id: &str,
        signature: &Signature,
    ) -> Option<CompletionRecord> {
        match self
            .relay
            .mark_keysign_complete(&self.session_id, message_id, signature)
            .await
        {
            Ok(()) => {
                debug!(session_id = %self.session_id, message_id, "Marked keysign complete");
                Some(self.record(CompletionScope::Message(message_id.to_string())))
            }
            Err(e) => {
                warn!(session_id = %self.session_id, message_id, error = %e, "Failed to mark keysign complete");
                None
            }
        }
    }

    /// Signature some party already published for `message_id`.
    ///
    /// Single lookup; relay errors read as "not yet complete".
    pub async fn check_keysign_complete(&self, message_id: &str) -> Option<Signature> {
        match self.relay.keysign_signature(&self.session_id, message_id).await {
            Ok(signature) => signature,
            Err(e) => {
                warn!(session_id = %self.session_id, message_id, error = %e, "Failed to check keysign completion");
                None
            }
        }
    }

    /// Poll for a published signature until the completion ceiling
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn await_keysign_complete(&self, message_id: &str) -> Result<Signature> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(signature) = self.check_keysign_complete(message_id).await {
                return Ok(signature);
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(Error::Timeout(format!("signature for message {}", message_id)));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
