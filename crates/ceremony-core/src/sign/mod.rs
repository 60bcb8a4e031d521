//! Keysign orchestration
//!
//! Messages are signed strictly one after another. Each sign task gets a
//! bounded number of attempts; after a failed attempt the party first looks
//! for a signature a peer already published for the same message hash and
//! adopts it, so a single slow device does not fail the whole ceremony.

use crate::completion::CompletionVerifier;
use crate::context::CeremonyContext;
use crate::mpc::KeysignRequest;
use crate::{Committee, Error, KeyType, Result, SignTask, Signature};
use std::collections::HashMap;
use tracing::{info, instrument, warn};

/// Terminal state of one sign task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutcome {
    /// Signed locally
    Signed(Signature),
    /// Local attempt failed but a peer finished the message
    Adopted(Signature),
}

impl SignOutcome {
    pub fn signature(&self) -> &Signature {
        match self {
            SignOutcome::Signed(sig) | SignOutcome::Adopted(sig) => sig,
        }
    }

    pub fn into_signature(self) -> Signature {
        match self {
            SignOutcome::Signed(sig) | SignOutcome::Adopted(sig) => sig,
        }
    }
}

/// Drives the engine through a list of sign tasks
pub struct SigningOrchestrator {
    ctx: CeremonyContext,
    key_type: KeyType,
    pub_key: String,
    committee: Committee,
    verifier: CompletionVerifier,
    signatures: HashMap<String, Signature>,
}

impl SigningOrchestrator {
    pub fn new(
        ctx: CeremonyContext,
        key_type: KeyType,
        pub_key: impl Into<String>,
        committee: Committee,
    ) -> Self {
        let verifier = ctx.completion_verifier();
        Self {
            ctx,
            key_type,
            pub_key: pub_key.into(),
            committee,
            verifier,
            signatures: HashMap::new(),
        }
    }

    /// Signatures collected so far, by message hash
    pub fn signatures(&self) -> &HashMap<String, Signature> {
        &self.signatures
    }

    /// Sign every task in order, stopping at the first permanent failure
    #[instrument(skip(self, tasks), fields(session_id = %self.ctx.session.session_id, count = tasks.len()))]
    pub async fn sign_all(&mut self, tasks: Vec<SignTask>) -> Result<HashMap<String, Signature>> {
        for mut task in tasks {
            self.sign(&mut task).await?;
        }
        Ok(self.signatures.clone())
    }

    /// Run one task to a terminal state
    #[instrument(skip(self, task), fields(message_hash = %task.message_hash))]
    pub async fn sign(&mut self, task: &mut SignTask) -> Result<SignOutcome> {
        let max_attempts = self.ctx.config.max_attempts;
        loop {
            task.attempt_count += 1;
            info!(attempt = task.attempt_count, "Signing message");

            let error = match self.attempt(task).await {
                Ok(signature) => {
                    self.signatures
                        .insert(task.message_hash.clone(), signature.clone());
                    self.verifier
                        .mark_local_party_keysign_complete(&task.message_hash, &signature)
                        .await;
                    return Ok(SignOutcome::Signed(signature));
                }
                Err(e) => e,
            };
            warn!(attempt = task.attempt_count, error = %error, "Keysign attempt failed");

            if let Some(signature) = self.verifier.check_keysign_complete(&task.message_hash).await {
                info!("Adopting signature published by a peer");
                self.signatures
                    .insert(task.message_hash.clone(), signature.clone());
                return Ok(SignOutcome::Adopted(signature));
            }

            if task.attempt_count >= max_attempts {
                return Err(Error::SigningFailed {
                    message_hash: task.message_hash.clone(),
                    attempts: task.attempt_count,
                    reason: error.to_string(),
                });
            }
            tokio::time::sleep(self.ctx.config.retry_backoff).await;
        }
    }

    async fn attempt(&self, task: &SignTask) -> Result<Signature> {
        let (engine, mut puller) = self.ctx.engine(&self.committee, Some(&task.message_hash))?;
        puller.pull_messages(Some(&task.message_hash)).await;

        let request = KeysignRequest {
            local_party_id: self.ctx.local_party.clone(),
            committee: self.committee.clone(),
            pub_key: self.pub_key.clone(),
            message: task.raw_message.clone(),
            derivation_path: task.derivation_path.clone(),
        };
        let result = engine.keysign(self.key_type, &request).await;
        puller.stop().await;
        result
    }
}
