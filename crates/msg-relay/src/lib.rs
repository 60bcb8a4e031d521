//! Message Relay Library
//!
//! Storage engine behind the mediator service. Keeps the light-weight
//! membership metadata of each session (registered parties, the declared
//! committee, completion sets, keysign completions) and the encrypted round
//! messages addressed to every participant. All entries expire after a TTL
//! so an abandoned ceremony never pins memory.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Header carrying the per-message scope of keysign traffic.
pub const MESSAGE_ID_HEADER: &str = "message_id";

/// One encrypted protocol message as it travels through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMessage {
    pub session_id: String,
    pub from: String,
    pub to: Vec<String>,
    /// base64 ciphertext
    pub body: String,
    pub hash: String,
    pub sequence_no: u64,
}

/// Hex blake3 digest used to identify message contents.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Hash identifying a round message. The sender is part of it, so equal
/// payloads from two parties are stored and delivered separately.
pub fn message_hash(from: &str, payload: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(from.len() as u64).to_le_bytes());
    hasher.update(from.as_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize().as_bytes())
}

/// Storage key of a round message for one recipient
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct MessageKey {
    pub session_id: String,
    pub recipient: String,
    /// Keysign messages are scoped by message id, keygen ones are not
    pub message_id: Option<String>,
    pub hash: String,
}

impl MessageKey {
    pub fn new(session_id: &str, recipient: &str, message_id: Option<&str>, hash: &str) -> Self {
        Self {
            session_id: session_id.trim().to_string(),
            recipient: recipient.trim().to_string(),
            message_id: message_id.map(str::to_string),
            hash: hash.to_string(),
        }
    }
}

/// Stored round message
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message: RoundMessage,
    /// Store-wide arrival counter, used to hand messages back in order
    pub arrival: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

/// Mediator store
#[derive(Clone)]
pub struct MediatorStore {
    sessions: Arc<DashMap<String, Expiring<Vec<String>>>>,
    committees: Arc<DashMap<String, Expiring<Vec<String>>>>,
    completed: Arc<DashMap<String, Expiring<Vec<String>>>>,
    /// (session_id, message_id) -> serialized signature
    signatures: Arc<DashMap<(String, String), Expiring<String>>>,
    messages: Arc<DashMap<MessageKey, StoredMessage>>,
    arrivals: Arc<AtomicU64>,
    ttl_seconds: i64,
}

impl MediatorStore {
    /// Create a new store
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            committees: Arc::new(DashMap::new()),
            completed: Arc::new(DashMap::new()),
            signatures: Arc::new(DashMap::new()),
            messages: Arc::new(DashMap::new()),
            arrivals: Arc::new(AtomicU64::new(0)),
            ttl_seconds,
        }
    }

    fn expiry(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(self.ttl_seconds)
    }

    /// Register parties under a session, creating it on first use.
    /// Parties already listed are ignored. Returns the resulting list.
    pub fn register(&self, session_id: &str, parties: &[String]) -> Vec<String> {
        merge_parties(&self.sessions, session_id, parties, self.expiry())
    }

    /// Parties registered so far, `None` for an unknown session
    pub fn participants(&self, session_id: &str) -> Option<Vec<String>> {
        self.sessions
            .get(session_id.trim())
            .map(|entry| entry.value.clone())
    }

    /// Drop a session and its declared committee
    pub fn remove_session(&self, session_id: &str) {
        let session_id = session_id.trim();
        self.sessions.remove(session_id);
        self.committees.remove(session_id);
    }

    /// Declare the committee of a session.
    ///
    /// The first declaration wins. Repeating the same committee is accepted,
    /// a different one is refused with [`RelayError::Conflict`].
    pub fn start(&self, session_id: &str, committee: &[String]) -> Result<()> {
        let expires_at = self.expiry();
        match self.committees.entry(session_id.trim().to_string()) {
            Entry::Occupied(existing) => {
                if existing.get().value == committee {
                    Ok(())
                } else {
                    debug!(session_id, "Rejected second committee declaration");
                    Err(RelayError::Conflict(format!(
                        "session {} already started with {:?}",
                        session_id,
                        existing.get().value
                    )))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Expiring {
                    value: committee.to_vec(),
                    expires_at,
                });
                Ok(())
            }
        }
    }

    /// Declared committee, `None` while the session has not started
    pub fn committee(&self, session_id: &str) -> Option<Vec<String>> {
        self.committees
            .get(session_id.trim())
            .map(|entry| entry.value.clone())
    }

    /// Record parties that finished key generation
    pub fn mark_complete(&self, session_id: &str, parties: &[String]) -> Vec<String> {
        merge_parties(&self.completed, session_id, parties, self.expiry())
    }

    /// Parties that reported keygen completion
    pub fn completed(&self, session_id: &str) -> Option<Vec<String>> {
        self.completed
            .get(session_id.trim())
            .map(|entry| entry.value.clone())
    }

    /// Store the signature produced for one message
    pub fn put_signature(&self, session_id: &str, message_id: &str, body: String) {
        self.signatures.insert(
            (session_id.trim().to_string(), message_id.to_string()),
            Expiring {
                value: body,
                expires_at: self.expiry(),
            },
        );
    }

    /// Signature stored for one message, if any party has finished it
    pub fn signature(&self, session_id: &str, message_id: &str) -> Option<String> {
        self.signatures
            .get(&(session_id.trim().to_string(), message_id.to_string()))
            .map(|entry| entry.value.clone())
    }

    /// Store a round message once per recipient.
    ///
    /// Re-posting a message with the same hash keeps its original arrival
    /// position. Returns the number of recipients it was filed under.
    pub fn put_message(&self, message_id: Option<&str>, message: RoundMessage) -> Result<usize> {
        if message.hash.is_empty() {
            return Err(RelayError::InvalidFormat("missing message hash".into()));
        }
        if message.to.is_empty() {
            return Err(RelayError::InvalidFormat("message has no recipients".into()));
        }

        let now = Utc::now();
        let expires_at = self.expiry();
        for recipient in &message.to {
            let key = MessageKey::new(&message.session_id, recipient, message_id, &message.hash);
            self.messages.entry(key).or_insert_with(|| StoredMessage {
                message: message.clone(),
                arrival: self.arrivals.fetch_add(1, Ordering::SeqCst),
                created_at: now,
                expires_at,
            });
        }

        debug!(
            session_id = %message.session_id,
            from = %message.from,
            to = ?message.to,
            hash = %message.hash,
            "Message stored"
        );
        Ok(message.to.len())
    }

    /// Messages waiting for a recipient, in arrival order
    pub fn messages_for(
        &self,
        session_id: &str,
        recipient: &str,
        message_id: Option<&str>,
    ) -> Vec<RoundMessage> {
        let session_id = session_id.trim();
        let recipient = recipient.trim();
        let mut pending: Vec<StoredMessage> = self
            .messages
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.session_id == session_id
                    && key.recipient == recipient
                    && key.message_id.as_deref() == message_id
            })
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|stored| stored.arrival);
        pending.into_iter().map(|stored| stored.message).collect()
    }

    /// Remove a consumed message. Returns whether it was present.
    pub fn delete_message(
        &self,
        session_id: &str,
        recipient: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> bool {
        let key = MessageKey::new(session_id, recipient, message_id, hash);
        self.messages.remove(&key).is_some()
    }

    /// Remove expired entries
    pub fn cleanup(&self) {
        let now = Utc::now();
        self.sessions.retain(|_, v| v.expires_at > now);
        self.committees.retain(|_, v| v.expires_at > now);
        self.completed.retain(|_, v| v.expires_at > now);
        self.signatures.retain(|_, v| v.expires_at > now);
        self.messages.retain(|_, v| v.expires_at > now);
    }
}

impl Default for MediatorStore {
    fn default() -> Self {
        Self::new(3600) // 1 hour default TTL
    }
}

fn merge_parties(
    map: &DashMap<String, Expiring<Vec<String>>>,
    session_id: &str,
    parties: &[String],
    expires_at: DateTime<Utc>,
) -> Vec<String> {
    let mut entry = map
        .entry(session_id.trim().to_string())
        .or_insert_with(|| Expiring {
            value: Vec::new(),
            expires_at,
        });
    for party in parties {
        if !entry.value.contains(party) {
            entry.value.push(party.clone());
        }
    }
    entry.expires_at = expires_at;
    entry.value.clone()
}
