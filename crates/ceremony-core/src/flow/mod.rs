//! Ceremony flow state machines
//!
//! Initiator flows ([`KeygenFlow`], [`KeysignFlow`]) create the session,
//! discover peers until the user confirms a committee, then start the
//! ceremony. Joiner flows ([`JoinKeygenFlow`], [`JoinKeysignFlow`]) decode a
//! pairing payload, register, and wait for the initiator to start.
//!
//! Every flow publishes its state on a `watch` channel and returns the
//! terminal outcome from `run`.

mod join_keygen;
mod join_keysign;
mod keygen;
mod keysign;

pub use join_keygen::{JoinKeygenFlow, JoinKeygenState};
pub use join_keysign::{JoinKeysignFlow, JoinKeysignState};
pub use keygen::{KeygenFlow, KeygenState};
pub use keysign::{KeysignFlow, KeysignState};

use crate::discovery::{ParticipantDiscovery, ParticipantObserver};
use crate::mpc::{Connector, EngineFactory, ServiceDiscovery, StateAccessor};
use crate::{CeremonyConfig, Committee, Error, PartyId, Result};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

impl ParticipantObserver for watch::Sender<Vec<PartyId>> {
    fn on_participants(&self, participants: &[PartyId]) {
        self.send_replace(participants.to_vec());
    }
}

/// Collaborators a joining device brings to a flow
#[derive(Clone)]
pub struct JoinerContext {
    pub local_party: PartyId,
    pub connector: Arc<dyn Connector>,
    pub service_discovery: Arc<dyn ServiceDiscovery>,
    pub engine_factory: Arc<dyn EngineFactory>,
    pub state: Arc<dyn StateAccessor>,
    pub config: CeremonyConfig,
}

impl JoinerContext {
    /// Mediator address for a pairing payload: the public relay, or the
    /// local mediator advertised under `service_name`
    pub(crate) async fn server_address(&self, use_relay: bool, service_name: &str) -> Result<String> {
        if use_relay {
            return Ok(self.config.relay_url.clone());
        }
        let address = self.service_discovery.resolve(service_name).await?;
        info!(service_name, address = %address, "Resolved local mediator");
        Ok(address)
    }
}

/// Wait for the user to confirm a committee while discovery runs.
///
/// The confirmed parties must all have been discovered; the local party is
/// always added.
pub(crate) async fn await_confirmation(
    discovery: &ParticipantDiscovery,
    local_party: &str,
    confirm: oneshot::Receiver<Vec<PartyId>>,
) -> Result<Committee> {
    let selected = confirm
        .await
        .map_err(|_| Error::Cancelled("committee confirmation dropped".into()))?;

    let discovered = discovery.participants();
    if let Some(unknown) = selected.iter().find(|party| !discovered.contains(party)) {
        return Err(Error::InvalidConfig(format!("{} was never discovered", unknown)));
    }

    let committee = Committee::new(
        selected
            .into_iter()
            .chain(std::iter::once(local_party.to_string())),
    );
    debug!(committee = %committee.keys(), "Committee confirmed");
    Ok(committee)
}
