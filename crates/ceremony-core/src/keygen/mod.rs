//! Key generation and reshare
//!
//! Runs ECDSA then EdDSA generation (or reshare) with one engine instance per
//! attempt, then reports completion and waits for the rest of the committee.

use crate::context::CeremonyContext;
use crate::mpc::{Engine, KeygenRequest, KeygenResponse, ReshareRequest};
use crate::{Committee, Error, KeyType, Result, Vault};
use tracing::{info, instrument, warn};

/// What a keygen-style session should produce
#[derive(Debug, Clone)]
pub enum KeygenPlan {
    /// Fresh keys under a new chain code
    Keygen { hex_chain_code: String },
    /// Move the vault's keys from `old_committee` to the session committee
    Reshare {
        vault: Vault,
        old_committee: Committee,
    },
}

/// Result of a successful key generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeygenOutcome {
    pub pub_key_ecdsa: String,
    pub pub_key_eddsa: String,
    pub reshare_prefix: String,
    pub committee: Committee,
}

/// Generate (or reshare) both keys, retrying failed attempts.
///
/// Completion is only checked once both keys exist; a timeout there is
/// final since rerunning the engine would not help a peer that is gone.
#[instrument(skip(ctx, committee, plan), fields(session_id = %ctx.session.session_id, party = %ctx.local_party))]
pub async fn run_keygen(
    ctx: &CeremonyContext,
    committee: &Committee,
    plan: &KeygenPlan,
) -> Result<KeygenOutcome> {
    let max_attempts = ctx.config.max_attempts;
    let mut attempt_count = 0;

    let (ecdsa, eddsa) = loop {
        attempt_count += 1;
        info!(attempt = attempt_count, committee = %committee.keys(), "Starting key generation");

        match attempt(ctx, committee, plan).await {
            Ok(keys) => break keys,
            Err(e) if attempt_count < max_attempts => {
                warn!(attempt = attempt_count, error = %e, "Key generation attempt failed");
                tokio::time::sleep(ctx.config.retry_backoff).await;
            }
            Err(e) => {
                return Err(Error::KeygenFailed {
                    attempts: attempt_count,
                    reason: e.to_string(),
                })
            }
        }
    };

    let verifier = ctx.completion_verifier();
    verifier.mark_local_party_complete().await;
    verifier.check_completed_parties(committee).await?;

    info!(pub_key_ecdsa = %ecdsa.pub_key, pub_key_eddsa = %eddsa.pub_key, "Key generation complete");
    Ok(KeygenOutcome {
        pub_key_ecdsa: ecdsa.pub_key,
        pub_key_eddsa: eddsa.pub_key,
        reshare_prefix: ecdsa.reshare_prefix,
        committee: committee.clone(),
    })
}

async fn attempt(
    ctx: &CeremonyContext,
    committee: &Committee,
    plan: &KeygenPlan,
) -> Result<(KeygenResponse, KeygenResponse)> {
    let (engine, mut puller) = ctx.engine(committee, None)?;
    puller.pull_messages(None).await;

    let result = generate(engine.as_ref(), ctx, committee, plan).await;
    puller.stop().await;
    result
}

async fn generate(
    engine: &dyn Engine,
    ctx: &CeremonyContext,
    committee: &Committee,
    plan: &KeygenPlan,
) -> Result<(KeygenResponse, KeygenResponse)> {
    match plan {
        KeygenPlan::Keygen { hex_chain_code } => {
            let request = KeygenRequest {
                local_party_id: ctx.local_party.clone(),
                committee: committee.clone(),
                hex_chain_code: hex_chain_code.clone(),
            };
            let ecdsa = engine.keygen(KeyType::Ecdsa, &request).await?;
            let eddsa = engine.keygen(KeyType::Eddsa, &request).await?;
            Ok((ecdsa, eddsa))
        }
        KeygenPlan::Reshare {
            vault,
            old_committee,
        } => {
            let request = |key_type: KeyType| ReshareRequest {
                local_party_id: ctx.local_party.clone(),
                pub_key: vault.pub_key(key_type).to_string(),
                old_committee: old_committee.clone(),
                new_committee: committee.clone(),
                hex_chain_code: vault.hex_chain_code.clone(),
                reshare_prefix: vault.reshare_prefix.clone(),
            };
            let ecdsa = engine.reshare(KeyType::Ecdsa, &request(KeyType::Ecdsa)).await?;
            let eddsa = engine.reshare(KeyType::Eddsa, &request(KeyType::Eddsa)).await?;
            Ok((ecdsa, eddsa))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::{MemoryRelay, Relay};
    use crate::testing::{context, expected_pub_key, ScriptedFactory};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn plan() -> KeygenPlan {
        KeygenPlan::Keygen {
            hex_chain_code: "00".repeat(32),
        }
    }

    #[tokio::test]
    async fn test_two_party_keygen() {
        let relay = Arc::new(MemoryRelay::new());
        let factory = ScriptedFactory::exchanging();
        let committee = Committee::new(["P1", "P2"]);
        let p1 = context(&relay, "P1", factory.clone());
        let p2 = context(&relay, "P2", factory.clone());

        let plan = plan();
        let (a, b) = tokio::join!(
            run_keygen(&p1, &committee, &plan),
            run_keygen(&p2, &committee, &plan)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a, b);
        assert_eq!(a.pub_key_ecdsa, expected_pub_key(KeyType::Ecdsa, &committee));
        assert_eq!(a.pub_key_eddsa, expected_pub_key(KeyType::Eddsa, &committee));
        let completed = relay.completed_parties("abc").await.unwrap();
        assert_eq!(completed.len(), 2);
        assert_eq!(Committee::new(completed), committee);
    }

    #[tokio::test]
    async fn test_keygen_retries_then_fails() {
        let relay = Arc::new(MemoryRelay::new());
        let factory = ScriptedFactory::failing(usize::MAX);
        let ctx = context(&relay, "P1", factory.clone());

        let err = run_keygen(&ctx, &Committee::new(["P1"]), &plan())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::KeygenFailed { attempts: 3, .. }));
        assert_eq!(factory.keygen_calls.load(Ordering::SeqCst), 3);
        assert!(relay.completed_parties("abc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keygen_times_out_without_peer_completion() {
        let relay = Arc::new(MemoryRelay::new());
        let factory = ScriptedFactory::failing(0);
        let ctx = context(&relay, "P1", factory);

        let err = run_keygen(&ctx, &Committee::new(["P1", "P2"]), &plan())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_reshare_keeps_public_key() {
        let relay = Arc::new(MemoryRelay::new());
        let ctx = context(&relay, "P1", ScriptedFactory::failing(0));
        let mut vault = Vault::new("main", "P1", "00");
        vault.pub_key_ecdsa = "02ab".into();
        vault.pub_key_eddsa = "ed01".into();
        vault.reshare_prefix = "r1".into();

        let plan = KeygenPlan::Reshare {
            vault,
            old_committee: Committee::new(["P1", "P9"]),
        };
        let outcome = run_keygen(&ctx, &Committee::new(["P1"]), &plan).await.unwrap();

        assert_eq!(outcome.pub_key_ecdsa, "02ab");
        assert_eq!(outcome.pub_key_eddsa, "ed01");
        assert_eq!(outcome.reshare_prefix, "r1-next");
    }
}
