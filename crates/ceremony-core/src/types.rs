//! Core types for ceremony coordination

use crate::crypto::EncryptionKey;
use serde::{Deserialize, Serialize};

/// Human/device chosen label of a party, unique within a session
pub type PartyId = String;

/// Opaque, caller generated session identifier
pub type SessionId = String;

/// Finalized set of parties taking part in a ceremony.
///
/// Always kept sorted and free of duplicates so every party derives the
/// same committee key list regardless of the order parties joined in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<PartyId>", into = "Vec<PartyId>")]
pub struct Committee(Vec<PartyId>);

impl Committee {
    pub fn new<I, P>(parties: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PartyId>,
    {
        let mut parties: Vec<PartyId> = parties.into_iter().map(Into::into).collect();
        parties.sort();
        parties.dedup();
        Self(parties)
    }

    pub fn parties(&self) -> &[PartyId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, party: &str) -> bool {
        self.0.iter().any(|p| p == party)
    }

    /// Every member except `party`
    pub fn others(&self, party: &str) -> Vec<PartyId> {
        self.0.iter().filter(|p| *p != party).cloned().collect()
    }

    /// True when `parties` covers every member
    pub fn is_covered_by(&self, parties: &[PartyId]) -> bool {
        self.0.iter().all(|member| parties.contains(member))
    }

    /// Comma separated key list handed to the engine
    pub fn keys(&self) -> String {
        self.0.join(",")
    }
}

impl From<Vec<PartyId>> for Committee {
    fn from(parties: Vec<PartyId>) -> Self {
        Committee::new(parties)
    }
}

impl From<Committee> for Vec<PartyId> {
    fn from(committee: Committee) -> Self {
        committee.0
    }
}

/// Identity of one ceremony instance
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    /// Public relay URL or the address of a locally discovered mediator
    pub server_address: String,
    pub uses_public_relay: bool,
    pub encryption_key: EncryptionKey,
}

impl Session {
    pub fn new(
        session_id: impl Into<SessionId>,
        server_address: impl Into<String>,
        uses_public_relay: bool,
        encryption_key: EncryptionKey,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            server_address: server_address.into().trim_end_matches('/').to_string(),
            uses_public_relay,
            encryption_key,
        }
    }

    /// Fresh session for an initiating device
    pub fn generate(server_address: impl Into<String>, uses_public_relay: bool) -> Self {
        Self::new(
            uuid::Uuid::new_v4().simple().to_string(),
            server_address,
            uses_public_relay,
            EncryptionKey::generate(),
        )
    }
}

/// Signature scheme a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "ECDSA")]
    Ecdsa,
    #[serde(rename = "EdDSA")]
    Eddsa,
}

/// What a keygen-style session produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TssAction {
    Keygen,
    Reshare,
}

/// Signature produced by the engine for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(rename = "Msg")]
    pub msg: String,
    #[serde(rename = "R")]
    pub r: String,
    #[serde(rename = "S")]
    pub s: String,
    #[serde(rename = "DerSignature")]
    pub der_signature: String,
    #[serde(rename = "RecoveryID")]
    pub recovery_id: String,
}

/// One message to sign within a keysign ceremony
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignTask {
    /// Scope of relay traffic and completion records for this message
    pub message_hash: String,
    /// Hex encoded payload handed to the engine
    pub raw_message: String,
    pub derivation_path: String,
    pub attempt_count: u32,
}

impl SignTask {
    pub fn new(raw_message: impl Into<String>, derivation_path: impl Into<String>) -> Self {
        let raw_message = raw_message.into();
        Self {
            message_hash: msg_relay::content_hash(raw_message.as_bytes()),
            raw_message,
            derivation_path: derivation_path.into(),
            attempt_count: 0,
        }
    }
}

/// What a completion record vouches for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionScope {
    Session,
    Message(String),
}

/// Written by a party once its local share of work is done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub party_id: PartyId,
    pub scope: CompletionScope,
}

/// Local view of a vault, as far as the ceremony flows need it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub name: String,
    pub local_party_id: PartyId,
    pub pub_key_ecdsa: String,
    pub pub_key_eddsa: String,
    pub hex_chain_code: String,
    pub signers: Vec<PartyId>,
    pub reshare_prefix: String,
}

impl Vault {
    pub fn new(
        name: impl Into<String>,
        local_party_id: impl Into<PartyId>,
        hex_chain_code: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            local_party_id: local_party_id.into(),
            hex_chain_code: hex_chain_code.into(),
            ..Default::default()
        }
    }

    pub fn pub_key(&self, key_type: KeyType) -> &str {
        match key_type {
            KeyType::Ecdsa => &self.pub_key_ecdsa,
            KeyType::Eddsa => &self.pub_key_eddsa,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_committee_is_sorted_and_unique() {
        let committee = Committee::new(["P2", "P1", "P2", "P3"]);
        assert_eq!(committee.parties(), ["P1", "P2", "P3"]);
        assert_eq!(committee.keys(), "P1,P2,P3");
        assert_eq!(committee.others("P2"), vec!["P1", "P3"]);
        assert!(committee.is_covered_by(&["P3".into(), "P1".into(), "P2".into()]));
        assert!(!committee.is_covered_by(&["P1".into()]));
    }

    #[test]
    fn test_committee_serializes_as_list() {
        let committee: Committee = serde_json::from_str(r#"["b","a"]"#).unwrap();
        assert_eq!(serde_json::to_string(&committee).unwrap(), r#"["a","b"]"#);
    }

    #[test]
    fn test_sign_task_hash_is_deterministic() {
        let a = SignTask::new("deadbeef", "m/44'/60'/0'/0/0");
        let b = SignTask::new("deadbeef", "m/44'/60'/0'/0/0");
        assert_eq!(a.message_hash, b.message_hash);
        assert_ne!(a.message_hash, SignTask::new("beef", "m").message_hash);
        assert_eq!(a.attempt_count, 0);
    }

    #[test]
    fn test_signature_wire_names() {
        let sig = Signature {
            msg: "aa".into(),
            r: "01".into(),
            s: "02".into(),
            der_signature: "3006".into(),
            recovery_id: "00".into(),
        };
        let json = serde_json::to_value(&sig).unwrap();
        assert_eq!(json["RecoveryID"], "00");
        assert_eq!(json["DerSignature"], "3006");
    }
}
