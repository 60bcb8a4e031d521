//! Outgoing round messages

use crate::crypto::EncryptionKey;
use crate::mpc::{Relay, RoundMessage};
use crate::{Committee, Error, PartyId, Result, Session, SessionId};
use base64::Engine as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Seals engine payloads and posts them to the relay.
///
/// Cheap to clone; clones share the sequence counter.
#[derive(Clone)]
pub struct Messenger {
    session_id: SessionId,
    local_party: PartyId,
    relay: Arc<dyn Relay>,
    encryption_key: EncryptionKey,
    committee: Committee,
    message_id: Option<String>,
    sequence: Arc<AtomicU64>,
}

impl Messenger {
    pub fn new(session: &Session, local_party: impl Into<PartyId>, relay: Arc<dyn Relay>) -> Self {
        Self {
            session_id: session.session_id.clone(),
            local_party: local_party.into(),
            relay,
            encryption_key: session.encryption_key.clone(),
            committee: Committee::default(),
            message_id: None,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Committee used to expand broadcasts
    pub fn with_committee(mut self, committee: &Committee) -> Self {
        self.committee = committee.clone();
        self
    }

    /// Scope every message to one sign task
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn local_party(&self) -> &str {
        &self.local_party
    }

    /// Encrypt `payload` and post it for `to`
    pub async fn send(&self, to: &[PartyId], payload: &[u8]) -> Result<()> {
        if to.is_empty() {
            return Err(Error::InvalidConfig("round message without recipients".into()));
        }
        let message = self.seal(to, payload)?;
        self.relay
            .send_message(self.message_id.as_deref(), &message)
            .await?;

        debug!(
            session_id = %self.session_id,
            from = %self.local_party,
            to = ?message.to,
            hash = %message.hash,
            seq = message.sequence_no,
            "Round message sent"
        );
        Ok(())
    }

    /// Send `payload` to every committee member but ourselves
    pub async fn broadcast(&self, payload: &[u8]) -> Result<()> {
        let to = self.committee.others(&self.local_party);
        self.send(&to, payload).await
    }

    fn seal(&self, to: &[PartyId], payload: &[u8]) -> Result<RoundMessage> {
        let sealed = self.encryption_key.encrypt(payload)?;
        Ok(RoundMessage {
            session_id: self.session_id.clone(),
            from: self.local_party.clone(),
            to: to.to_vec(),
            body: base64::engine::general_purpose::STANDARD.encode(sealed),
            hash: msg_relay::message_hash(&self.local_party, payload),
            sequence_no: self.sequence.fetch_add(1, Ordering::SeqCst),
        })
    }
}

/// Open a round message body sealed by [`Messenger`]
pub fn open_body(encryption_key: &EncryptionKey, body: &str) -> Result<Vec<u8>> {
    let sealed = base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| Error::Deserialization(format!("message body is not base64: {}", e)))?;
    encryption_key.decrypt(&sealed)
}
