//! Pairing payloads handed from initiator to joiners out of band (QR)

use crate::crypto::EncryptionKey;
use crate::{Committee, Error, KeyType, PartyId, Result, Session, SignTask, TssAction, Vault};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Lets a joiner attach to a keygen or reshare session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenPairingPayload {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "hexChainCode")]
    pub hex_chain_code: String,
    #[serde(rename = "encryptionKeyHex")]
    pub encryption_key_hex: String,
    #[serde(rename = "useRelay")]
    pub use_relay: bool,
    pub action: TssAction,
    #[serde(rename = "pubKeyECDSA", default, skip_serializing_if = "Option::is_none")]
    pub pub_key_ecdsa: Option<String>,
    #[serde(rename = "oldParties", default, skip_serializing_if = "Option::is_none")]
    pub old_parties: Option<Vec<PartyId>>,
}

impl KeygenPairingPayload {
    pub fn parse(raw: &str) -> Result<Self> {
        let payload: Self = parse_json(raw)?;
        if payload.session_id.trim().is_empty() {
            return Err(Error::InvalidPayload("missing sessionID".into()));
        }
        if payload.action == TssAction::Reshare && payload.pub_key_ecdsa.is_none() {
            return Err(Error::InvalidPayload("reshare without pubKeyECDSA".into()));
        }
        Ok(payload)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Session described by the payload, bound to `server_address`
    pub fn session(&self, server_address: &str) -> Result<Session> {
        Ok(Session::new(
            self.session_id.trim(),
            server_address,
            self.use_relay,
            EncryptionKey::from_hex(&self.encryption_key_hex)?,
        ))
    }

    /// Refuse a reshare of a different key than the local vault holds
    pub fn check_reshare(&self, vault: &Vault) -> Result<()> {
        if self.action != TssAction::Reshare || vault.pub_key_ecdsa.is_empty() {
            return Ok(());
        }
        let declared = self.pub_key_ecdsa.as_deref().unwrap_or_default();
        if declared != vault.pub_key_ecdsa {
            return Err(Error::ReshareMismatch {
                local: vault.pub_key_ecdsa.clone(),
                declared: declared.to_string(),
            });
        }
        Ok(())
    }

    pub fn old_committee(&self) -> Committee {
        Committee::new(self.old_parties.clone().unwrap_or_default())
    }
}

/// Lets a joiner attach to a keysign session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignPairingPayload {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "encryptionKeyHex")]
    pub encryption_key_hex: String,
    #[serde(rename = "useRelay")]
    pub use_relay: bool,
    #[serde(rename = "pubKeyECDSA")]
    pub pub_key_ecdsa: String,
    #[serde(rename = "keyType")]
    pub key_type: KeyType,
    /// Hex encoded messages, signed in this order
    pub messages: Vec<String>,
    #[serde(rename = "derivePath")]
    pub derive_path: String,
}

impl KeysignPairingPayload {
    pub fn parse(raw: &str) -> Result<Self> {
        let payload: Self = parse_json(raw)?;
        if payload.session_id.trim().is_empty() {
            return Err(Error::InvalidPayload("missing sessionID".into()));
        }
        if payload.messages.is_empty() {
            return Err(Error::InvalidPayload("nothing to sign".into()));
        }
        Ok(payload)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn session(&self, server_address: &str) -> Result<Session> {
        Ok(Session::new(
            self.session_id.trim(),
            server_address,
            self.use_relay,
            EncryptionKey::from_hex(&self.encryption_key_hex)?,
        ))
    }

    /// Sign tasks in payload order
    pub fn sign_tasks(&self) -> Vec<SignTask> {
        self.messages
            .iter()
            .map(|message| SignTask::new(message.clone(), self.derive_path.clone()))
            .collect()
    }

    /// Local vault holding the key this payload asks to sign with
    pub fn find_vault<'a>(&self, vaults: &'a [Vault]) -> Result<&'a Vault> {
        vaults
            .iter()
            .find(|vault| vault.pub_key_ecdsa == self.pub_key_ecdsa)
            .ok_or_else(|| Error::VaultNotFound(self.pub_key_ecdsa.clone()))
    }
}

fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw.trim()).map_err(|e| Error::InvalidPayload(e.to_string()))
}
