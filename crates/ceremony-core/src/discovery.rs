//! Participant discovery
//!
//! Polls the relay for the parties registered under a session and grows the
//! local list in discovery order. Parties are never removed; a device that
//! drops out is only noticed when the ceremony itself fails.

use crate::mpc::Relay;
use crate::poll::PollTask;
use crate::{CeremonyConfig, PartyId, SessionId};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Receives the full participant list whenever it grows
pub trait ParticipantObserver: Send + Sync {
    fn on_participants(&self, participants: &[PartyId]);
}

/// Polls `GET /{session}` and reconciles the known participants
pub struct ParticipantDiscovery {
    session_id: SessionId,
    local_party: PartyId,
    relay: Arc<dyn Relay>,
    interval: Duration,
    observers: Vec<Arc<dyn ParticipantObserver>>,
    snapshot: watch::Sender<Vec<PartyId>>,
    task: Option<PollTask>,
}

impl ParticipantDiscovery {
    pub fn new(
        session_id: impl Into<SessionId>,
        local_party: impl Into<PartyId>,
        relay: Arc<dyn Relay>,
        config: &CeremonyConfig,
    ) -> Self {
        let local_party = local_party.into();
        let (snapshot, _) = watch::channel(vec![local_party.clone()]);
        Self {
            session_id: session_id.into(),
            local_party,
            relay,
            interval: config.poll_interval,
            observers: Vec::new(),
            snapshot,
            task: None,
        }
    }

    /// Register an observer. Takes effect on the next `start()`.
    pub fn add_observer(&mut self, observer: Arc<dyn ParticipantObserver>) {
        self.observers.push(observer);
    }

    /// Snapshot stream of the participant list
    pub fn subscribe(&self) -> watch::Receiver<Vec<PartyId>> {
        self.snapshot.subscribe()
    }

    /// Participants known so far, local party first
    pub fn participants(&self) -> Vec<PartyId> {
        self.snapshot.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(PollTask::is_running).unwrap_or(false)
    }

    /// Start polling. A running loop is left untouched.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        info!(session_id = %self.session_id, "Starting participant discovery");

        let known = Arc::new(Mutex::new(self.participants()));
        let session_id = self.session_id.clone();
        let local_party = self.local_party.clone();
        let relay = Arc::clone(&self.relay);
        let observers = self.observers.clone();
        let snapshot = self.snapshot.clone();

        self.task = Some(PollTask::spawn(
            "participant-discovery",
            self.interval,
            false,
            move || {
                let known = Arc::clone(&known);
                let session_id = session_id.clone();
                let local_party = local_party.clone();
                let relay = Arc::clone(&relay);
                let observers = observers.clone();
                let snapshot = snapshot.clone();
                async move {
                    let registered = match relay.participants(&session_id).await {
                        Ok(parties) => parties,
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "Failed to fetch participants");
                            return ControlFlow::Continue(());
                        }
                    };

                    let mut known = known.lock().await;
                    let before = known.len();
                    for party in registered {
                        if party != local_party && !known.contains(&party) {
                            debug!(session_id = %session_id, party = %party, "Discovered participant");
                            known.push(party);
                        }
                    }
                    if known.len() != before {
                        snapshot.send_replace(known.clone());
                        for observer in &observers {
                            observer.on_participants(&known);
                        }
                    }
                    ControlFlow::Continue(())
                }
            },
        ));
    }

    /// Stop polling and wait for the in-flight tick
    pub async fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.stop().await;
            debug!(session_id = %self.session_id, "Participant discovery stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::MemoryRelay;
    use crate::testing::SlowRelay;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        last: std::sync::Mutex<Vec<PartyId>>,
    }

    impl ParticipantObserver for Recorder {
        fn on_participants(&self, participants: &[PartyId]) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = participants.to_vec();
        }
    }

    fn config() -> CeremonyConfig {
        CeremonyConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_discovers_in_order_without_duplicates() {
        let relay = Arc::new(MemoryRelay::new());
        relay.register("abc", &["P1".into()]).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let mut discovery = ParticipantDiscovery::new("abc", "P1", relay.clone(), &config());
        discovery.add_observer(recorder.clone());
        let mut updates = discovery.subscribe();
        discovery.start();

        relay.register("abc", &["P3".into()]).await.unwrap();
        updates.changed().await.unwrap();
        relay.register("abc", &["P2".into()]).await.unwrap();
        relay.register("abc", &["P3".into()]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while updates.borrow_and_update().len() < 3 {
                updates.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        discovery.stop().await;

        assert_eq!(discovery.participants(), vec!["P1", "P3", "P2"]);
        assert_eq!(*recorder.last.lock().unwrap(), vec!["P1", "P3", "P2"]);
    }

    #[tokio::test]
    async fn test_no_callback_after_stop() {
        let relay = Arc::new(MemoryRelay::new());
        let recorder = Arc::new(Recorder::default());
        let mut discovery = ParticipantDiscovery::new("abc", "P1", relay.clone(), &config());
        discovery.add_observer(recorder.clone());
        discovery.start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        discovery.stop().await;
        assert!(!discovery.is_running());

        relay.register("abc", &["P2".into()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(discovery.participants(), vec!["P1"]);
    }

    #[tokio::test]
    async fn test_stop_during_slow_poll() {
        let relay = Arc::new(MemoryRelay::new());
        relay.register("abc", &["P2".into()]).await.unwrap();
        let slow = Arc::new(SlowRelay {
            inner: relay.clone(),
            delay: Duration::from_millis(100),
        });

        let recorder = Arc::new(Recorder::default());
        let mut discovery = ParticipantDiscovery::new("abc", "P1", slow, &config());
        discovery.add_observer(recorder.clone());
        discovery.start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
        discovery.stop().await;
        assert!(!discovery.is_running());

        // the in-flight poll finished before stop returned
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        relay.register("abc", &["P3".into()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(discovery.participants(), vec!["P1", "P2"]);
    }
}
