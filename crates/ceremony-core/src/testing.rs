//! Scripted engine used by the unit tests

use crate::context::CeremonyContext;
use crate::crypto::EncryptionKey;
use crate::mpc::{
    async_trait, Engine, EngineFactory, KeygenRequest, KeygenResponse, KeysignRequest,
    MemoryRelay, MemoryStateAccessor, Relay, ReshareRequest, RoundMessage, StateAccessor,
};
use crate::transport::Messenger;
use crate::{CeremonyConfig, Committee, Error, KeyType, PartyId, Result, Session, Signature};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn fast_config() -> CeremonyConfig {
    CeremonyConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_backoff(Duration::from_millis(10))
        .with_completion_timeout(Duration::from_millis(500))
}

pub(crate) fn session() -> Session {
    Session::new(
        "abc",
        "http://relay",
        true,
        EncryptionKey::from_bytes([7u8; 32]),
    )
}

pub(crate) fn context(
    relay: &Arc<MemoryRelay>,
    party: &str,
    factory: Arc<ScriptedFactory>,
) -> CeremonyContext {
    CeremonyContext::new(
        session(),
        party,
        relay.clone(),
        factory,
        Arc::new(MemoryStateAccessor::new()),
        fast_config(),
    )
}

/// Signature every party derives for `message`
pub(crate) fn expected_signature(message: &str) -> Signature {
    let digest = msg_relay::content_hash(message.as_bytes());
    Signature {
        msg: message.to_string(),
        r: digest[..32].to_string(),
        s: digest[32..].to_string(),
        der_signature: format!("30{}", digest),
        recovery_id: "00".into(),
    }
}

/// Public key every party derives for a committee
pub(crate) fn expected_pub_key(key_type: KeyType, committee: &Committee) -> String {
    msg_relay::content_hash(format!("{:?}:{}", key_type, committee.keys()).as_bytes())
}

/// Factory for engines that either fail on command or run a one-round
/// exchange: broadcast a tag, then wait for the same tag from every peer.
pub(crate) struct ScriptedFactory {
    fail_first: usize,
    exchange: bool,
    wait: Duration,
    pub keysign_calls: Arc<AtomicUsize>,
    pub keygen_calls: Arc<AtomicUsize>,
    pub signed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFactory {
    fn build(fail_first: usize, exchange: bool, wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            exchange,
            wait,
            keysign_calls: Arc::new(AtomicUsize::new(0)),
            keygen_calls: Arc::new(AtomicUsize::new(0)),
            signed: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Engines whose first `n` keysign/keygen calls fail, no message exchange
    pub fn failing(n: usize) -> Arc<Self> {
        Self::build(n, false, Duration::ZERO)
    }

    /// Engines exchanging one round with their peers through the relay
    pub fn exchanging() -> Arc<Self> {
        Self::build(0, true, Duration::from_secs(2))
    }
}

impl EngineFactory for ScriptedFactory {
    fn new_instance(
        &self,
        messenger: Messenger,
        state: Arc<dyn StateAccessor>,
        local_party: &str,
    ) -> Result<Arc<dyn Engine>> {
        Ok(Arc::new(ScriptedEngine {
            fail_first: self.fail_first,
            exchange: self.exchange,
            wait: self.wait,
            messenger,
            state,
            local_party: local_party.to_string(),
            inbox: Mutex::new(Vec::new()),
            keysign_calls: self.keysign_calls.clone(),
            keygen_calls: self.keygen_calls.clone(),
            signed: self.signed.clone(),
        }))
    }
}

struct ScriptedEngine {
    fail_first: usize,
    exchange: bool,
    wait: Duration,
    messenger: Messenger,
    state: Arc<dyn StateAccessor>,
    local_party: PartyId,
    inbox: Mutex<Vec<String>>,
    keysign_calls: Arc<AtomicUsize>,
    keygen_calls: Arc<AtomicUsize>,
    signed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedEngine {
    async fn exchange_round(&self, tag: &str, committee: &Committee) -> Result<()> {
        if !self.exchange {
            return Ok(());
        }
        self.messenger
            .broadcast(format!("{}|{}", tag, self.local_party).as_bytes())
            .await?;

        let expected: Vec<String> = committee
            .others(&self.local_party)
            .into_iter()
            .map(|peer| format!("{}|{}", tag, peer))
            .collect();
        let deadline = tokio::time::Instant::now() + self.wait;
        loop {
            {
                let inbox = self.inbox.lock().unwrap();
                if expected.iter().all(|m| inbox.contains(m)) {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() > deadline {
                return Err(Error::Engine(format!("timed out waiting for {}", tag)));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn keygen(&self, key_type: KeyType, request: &KeygenRequest) -> Result<KeygenResponse> {
        let call = self.keygen_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(Error::Engine("scripted failure".into()));
        }
        self.exchange_round(&format!("keygen:{:?}", key_type), &request.committee)
            .await?;

        let pub_key = expected_pub_key(key_type, &request.committee);
        self.state.save_local_state(&pub_key, &self.local_party)?;
        Ok(KeygenResponse {
            pub_key,
            reshare_prefix: String::new(),
        })
    }

    async fn reshare(&self, key_type: KeyType, request: &ReshareRequest) -> Result<KeygenResponse> {
        let call = self.keygen_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(Error::Engine("scripted failure".into()));
        }
        self.exchange_round(&format!("reshare:{:?}", key_type), &request.new_committee)
            .await?;

        Ok(KeygenResponse {
            pub_key: request.pub_key.clone(),
            reshare_prefix: format!("{}-next", request.reshare_prefix),
        })
    }

    async fn keysign(&self, _key_type: KeyType, request: &KeysignRequest) -> Result<Signature> {
        let call = self.keysign_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(Error::Engine("scripted failure".into()));
        }
        self.exchange_round(&format!("sign:{}", request.message), &request.committee)
            .await?;

        self.signed.lock().unwrap().push(request.message.clone());
        Ok(expected_signature(&request.message))
    }

    fn apply_message(&self, payload: &[u8]) -> Result<()> {
        let text = String::from_utf8(payload.to_vec())
            .map_err(|e| Error::Engine(e.to_string()))?;
        self.inbox.lock().unwrap().push(text);
        Ok(())
    }
}

/// Relay whose polled reads take `delay`, so a stop can land mid-tick
pub(crate) struct SlowRelay {
    pub inner: Arc<MemoryRelay>,
    pub delay: Duration,
}

#[async_trait]
impl Relay for SlowRelay {
    async fn register(&self, session_id: &str, parties: &[PartyId]) -> Result<()> {
        self.inner.register(session_id, parties).await
    }

    async fn end_session(&self, session_id: &str) -> Result<()> {
        self.inner.end_session(session_id).await
    }

    async fn participants(&self, session_id: &str) -> Result<Vec<PartyId>> {
        tokio::time::sleep(self.delay).await;
        self.inner.participants(session_id).await
    }

    async fn start(&self, session_id: &str, committee: &Committee) -> Result<()> {
        self.inner.start(session_id, committee).await
    }

    async fn committee(&self, session_id: &str) -> Result<Option<Vec<PartyId>>> {
        self.inner.committee(session_id).await
    }

    async fn mark_complete(&self, session_id: &str, parties: &[PartyId]) -> Result<()> {
        self.inner.mark_complete(session_id, parties).await
    }

    async fn completed_parties(&self, session_id: &str) -> Result<Vec<PartyId>> {
        self.inner.completed_parties(session_id).await
    }

    async fn mark_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &Signature,
    ) -> Result<()> {
        self.inner
            .mark_keysign_complete(session_id, message_id, signature)
            .await
    }

    async fn keysign_signature(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<Signature>> {
        self.inner.keysign_signature(session_id, message_id).await
    }

    async fn send_message(&self, message_id: Option<&str>, message: &RoundMessage) -> Result<()> {
        self.inner.send_message(message_id, message).await
    }

    async fn fetch_messages(
        &self,
        session_id: &str,
        party: &str,
        message_id: Option<&str>,
    ) -> Result<Vec<RoundMessage>> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_messages(session_id, party, message_id).await
    }

    async fn delete_message(
        &self,
        session_id: &str,
        party: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> Result<()> {
        self.inner
            .delete_message(session_id, party, hash, message_id)
            .await
    }
}
