//! Incoming round messages

use super::messenger::open_body;
use crate::crypto::EncryptionKey;
use crate::mpc::{Engine, Relay};
use crate::poll::PollTask;
use crate::{CeremonyConfig, PartyId, Session, SessionId};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// (message id, hash) pairs already fed to the engine
type Applied = Arc<Mutex<HashSet<(Option<String>, String)>>>;

/// Polls the relay for messages addressed to the local party and feeds
/// them to the engine, once per hash, in relay arrival order.
pub struct Puller {
    session_id: SessionId,
    local_party: PartyId,
    relay: Arc<dyn Relay>,
    engine: Arc<dyn Engine>,
    encryption_key: EncryptionKey,
    interval: Duration,
    applied: Applied,
    message_id: Option<String>,
    task: Option<PollTask>,
}

impl Puller {
    pub fn new(
        session: &Session,
        local_party: impl Into<PartyId>,
        relay: Arc<dyn Relay>,
        engine: Arc<dyn Engine>,
        config: &CeremonyConfig,
    ) -> Self {
        Self {
            session_id: session.session_id.clone(),
            local_party: local_party.into(),
            relay,
            engine,
            encryption_key: session.encryption_key.clone(),
            interval: config.poll_interval,
            applied: Arc::new(Mutex::new(HashSet::new())),
            message_id: None,
            task: None,
        }
    }

    /// Start pulling messages scoped to `message_id`.
    ///
    /// Only one scope is pulled at a time; a running loop is stopped first.
    pub async fn pull_messages(&mut self, message_id: Option<&str>) {
        self.stop().await;

        self.message_id = message_id.map(str::to_string);
        info!(
            session_id = %self.session_id,
            message_id = ?self.message_id,
            "Start pulling messages"
        );

        let ctx = PullContext {
            session_id: self.session_id.clone(),
            local_party: self.local_party.clone(),
            relay: Arc::clone(&self.relay),
            engine: Arc::clone(&self.engine),
            encryption_key: self.encryption_key.clone(),
            message_id: self.message_id.clone(),
            applied: Arc::clone(&self.applied),
        };
        self.task = Some(PollTask::spawn("message-puller", self.interval, true, move || {
            let ctx = ctx.clone();
            async move {
                ctx.tick().await;
                ControlFlow::Continue(())
            }
        }));
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(PollTask::is_running).unwrap_or(false)
    }

    /// Drain what is already on the relay, then stop
    pub async fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            task.stop().await;
            debug!(
                session_id = %self.session_id,
                message_id = ?self.message_id,
                "Stopped pulling messages"
            );
        }
    }

    /// Number of distinct messages applied so far
    pub async fn applied_count(&self) -> usize {
        self.applied.lock().await.len()
    }
}

#[derive(Clone)]
struct PullContext {
    session_id: SessionId,
    local_party: PartyId,
    relay: Arc<dyn Relay>,
    engine: Arc<dyn Engine>,
    encryption_key: EncryptionKey,
    message_id: Option<String>,
    applied: Applied,
}

impl PullContext {
    async fn tick(&self) {
        let message_id = self.message_id.as_deref();
        let pending = match self
            .relay
            .fetch_messages(&self.session_id, &self.local_party, message_id)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Failed to fetch messages");
                return;
            }
        };

        let mut applied = self.applied.lock().await;
        for message in pending {
            let key = (self.message_id.clone(), message.hash.clone());
            if applied.contains(&key) {
                debug!(hash = %message.hash, "Already applied, skipping");
                self.acknowledge(&message.hash).await;
                continue;
            }

            let payload = match open_body(&self.encryption_key, &message.body) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(hash = %message.hash, from = %message.from, error = %e, "Dropping unreadable message");
                    self.acknowledge(&message.hash).await;
                    continue;
                }
            };

            // leave the message on the relay so the next tick retries it
            if let Err(e) = self.engine.apply_message(&payload) {
                warn!(hash = %message.hash, from = %message.from, error = %e, "Engine rejected message");
                continue;
            }

            debug!(
                session_id = %self.session_id,
                from = %message.from,
                hash = %message.hash,
                seq = message.sequence_no,
                "Applied round message"
            );
            applied.insert(key);
            self.acknowledge(&message.hash).await;
        }
    }

    async fn acknowledge(&self, hash: &str) {
        if let Err(e) = self
            .relay
            .delete_message(
                &self.session_id,
                &self.local_party,
                hash,
                self.message_id.as_deref(),
            )
            .await
        {
            warn!(hash = %hash, error = %e, "Failed to delete message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::{
        async_trait, KeygenRequest, KeygenResponse, KeysignRequest, MemoryRelay, ReshareRequest,
    };
    use crate::testing::SlowRelay;
    use crate::transport::Messenger;
    use crate::{Error, KeyType, Result, Signature};

    #[derive(Default)]
    struct RecordingEngine {
        inbox: std::sync::Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Engine for RecordingEngine {
        async fn keygen(&self, _: KeyType, _: &KeygenRequest) -> Result<KeygenResponse> {
            Err(Error::Engine("unused".into()))
        }

        async fn reshare(&self, _: KeyType, _: &ReshareRequest) -> Result<KeygenResponse> {
            Err(Error::Engine("unused".into()))
        }

        async fn keysign(&self, _: KeyType, _: &KeysignRequest) -> Result<Signature> {
            Err(Error::Engine("unused".into()))
        }

        fn apply_message(&self, payload: &[u8]) -> Result<()> {
            self.inbox.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn session() -> Session {
        Session::new("abc", "http://relay", true, EncryptionKey::generate())
    }

    fn config() -> CeremonyConfig {
        CeremonyConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_applies_everything_posted_before_stop() {
        let relay = Arc::new(MemoryRelay::new());
        let session = session();
        let engine = Arc::new(RecordingEngine::default());
        let messenger = Messenger::new(&session, "P1", relay.clone()).with_message_id("h1");

        let mut puller = Puller::new(&session, "P2", relay.clone(), engine.clone(), &config());
        puller.pull_messages(Some("h1")).await;

        for round in 0..5u8 {
            messenger.send(&["P2".into()], &[round]).await.unwrap();
        }
        // resent duplicate
        messenger.send(&["P2".into()], &[0]).await.unwrap();
        puller.stop().await;

        let inbox = engine.inbox.lock().unwrap().clone();
        assert_eq!(inbox, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
        assert_eq!(puller.applied_count().await, 5);
        assert!(relay.fetch_messages("abc", "P2", Some("h1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_applied_after_stop() {
        let relay = Arc::new(MemoryRelay::new());
        let session = session();
        let engine = Arc::new(RecordingEngine::default());
        let messenger = Messenger::new(&session, "P1", relay.clone());

        let mut puller = Puller::new(&session, "P2", relay.clone(), engine.clone(), &config());
        puller.pull_messages(None).await;
        puller.stop().await;
        assert!(!puller.is_running());

        messenger.send(&["P2".into()], b"late").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(engine.inbox.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_scope_replaces_previous_loop() {
        let relay = Arc::new(MemoryRelay::new());
        let session = session();
        let engine = Arc::new(RecordingEngine::default());

        let mut puller = Puller::new(&session, "P2", relay.clone(), engine.clone(), &config());
        puller.pull_messages(Some("h1")).await;
        puller.pull_messages(Some("h2")).await;

        Messenger::new(&session, "P1", relay.clone())
            .with_message_id("h1")
            .send(&["P2".into()], b"old scope")
            .await
            .unwrap();
        Messenger::new(&session, "P1", relay.clone())
            .with_message_id("h2")
            .send(&["P2".into()], b"new scope")
            .await
            .unwrap();
        puller.stop().await;

        assert_eq!(*engine.inbox.lock().unwrap(), vec![b"new scope".to_vec()]);
    }

    #[tokio::test]
    async fn test_unreadable_message_is_dropped() {
        let relay = Arc::new(MemoryRelay::new());
        let session = session();
        let engine = Arc::new(RecordingEngine::default());
        let foreign = Session::new("abc", "http://relay", true, EncryptionKey::generate());
        Messenger::new(&foreign, "P9", relay.clone())
            .send(&["P2".into()], b"wrong key")
            .await
            .unwrap();

        let mut puller = Puller::new(&session, "P2", relay.clone(), engine.clone(), &config());
        puller.pull_messages(None).await;
        puller.stop().await;

        assert!(engine.inbox.lock().unwrap().is_empty());
        assert!(relay.fetch_messages("abc", "P2", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_equal_payloads_from_two_senders() {
        let relay = Arc::new(MemoryRelay::new());
        let session = session();
        let engine = Arc::new(RecordingEngine::default());

        for sender in ["P1", "P3"] {
            Messenger::new(&session, sender, relay.clone())
                .with_message_id("h1")
                .send(&["P2".into()], b"ack")
                .await
                .unwrap();
        }

        let mut puller = Puller::new(&session, "P2", relay.clone(), engine.clone(), &config());
        puller.pull_messages(Some("h1")).await;
        puller.stop().await;

        assert_eq!(
            *engine.inbox.lock().unwrap(),
            vec![b"ack".to_vec(), b"ack".to_vec()]
        );
        assert_eq!(puller.applied_count().await, 2);
    }

    #[tokio::test]
    async fn test_stop_during_slow_fetch() {
        let relay = Arc::new(MemoryRelay::new());
        let session = session();
        let engine = Arc::new(RecordingEngine::default());
        let slow = Arc::new(SlowRelay {
            inner: relay.clone(),
            delay: Duration::from_millis(100),
        });
        let messenger = Messenger::new(&session, "P1", relay.clone());
        messenger.send(&["P2".into()], b"first").await.unwrap();

        let mut puller = Puller::new(&session, "P2", slow, engine.clone(), &config());
        puller.pull_messages(None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(engine.inbox.lock().unwrap().is_empty());
        puller.stop().await;
        assert!(!puller.is_running());

        assert_eq!(*engine.inbox.lock().unwrap(), vec![b"first".to_vec()]);
        messenger.send(&["P2".into()], b"late").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*engine.inbox.lock().unwrap(), vec![b"first".to_vec()]);
    }
}
