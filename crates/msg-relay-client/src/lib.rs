//! Message Relay Client
//!
//! HTTP client for the relay/mediator surface, implementing the
//! [`Relay`](ceremony_core::mpc::Relay) seam of `ceremony-core`.

use ceremony_core::mpc::{async_trait, Connector, Relay, RoundMessage};
use ceremony_core::{Committee, Error, PartyId, Result, Signature};
use msg_relay::MESSAGE_ID_HEADER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// HTTP-based relay client
#[derive(Clone)]
pub struct RelayClient {
    /// HTTP client
    client: Client,
    /// Relay service URL
    url: String,
    /// Request timeout
    timeout: Duration,
}

impl RelayClient {
    /// Create a new relay client
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: RequestBuilder, message_id: Option<&str>) -> Result<Response> {
        let request = match message_id {
            Some(id) => request.header(MESSAGE_ID_HEADER, id),
            None => request,
        };
        request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))
    }

    /// GET returning `None` on 404
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        message_id: Option<&str>,
        operation: &str,
    ) -> Result<Option<T>> {
        let response = self
            .send(self.client.get(self.endpoint(path)), message_id)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(response, operation)?;
        let value = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok(Some(value))
    }
}

fn expect_success(response: Response, operation: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::UnexpectedStatus {
            operation: operation.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Connector creating a [`RelayClient`] per server address
pub fn connector(timeout: Duration) -> impl Connector {
    move |server_address: &str| -> Result<Arc<dyn Relay>> {
        Ok(Arc::new(RelayClient::new(server_address).with_timeout(timeout)) as Arc<dyn Relay>)
    }
}

#[async_trait]
impl Relay for RelayClient {
    #[instrument(skip(self, parties))]
    async fn register(&self, session_id: &str, parties: &[PartyId]) -> Result<()> {
        let response = self
            .send(self.client.post(self.endpoint(session_id)).json(parties), None)
            .await?;
        expect_success(response, "register")?;
        debug!(parties = ?parties, "Registered");
        Ok(())
    }

    async fn end_session(&self, session_id: &str) -> Result<()> {
        let response = self
            .send(self.client.delete(self.endpoint(session_id)), None)
            .await?;
        expect_success(response, "end session")?;
        Ok(())
    }

    async fn participants(&self, session_id: &str) -> Result<Vec<PartyId>> {
        Ok(self
            .get_json(session_id, None, "participants")
            .await?
            .unwrap_or_default())
    }

    #[instrument(skip(self, committee))]
    async fn start(&self, session_id: &str, committee: &Committee) -> Result<()> {
        let response = self
            .send(
                self.client
                    .post(self.endpoint(&format!("start/{}", session_id)))
                    .json(committee.parties()),
                None,
            )
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(Error::SessionAlreadyStarted(session_id.to_string()));
        }
        expect_success(response, "start session")?;
        Ok(())
    }

    async fn committee(&self, session_id: &str) -> Result<Option<Vec<PartyId>>> {
        let committee: Option<Vec<PartyId>> = self
            .get_json(&format!("start/{}", session_id), None, "session start")
            .await?;
        Ok(committee.filter(|parties| !parties.is_empty()))
    }

    async fn mark_complete(&self, session_id: &str, parties: &[PartyId]) -> Result<()> {
        let response = self
            .send(
                self.client
                    .post(self.endpoint(&format!("complete/{}", session_id)))
                    .json(parties),
                None,
            )
            .await?;
        expect_success(response, "mark complete")?;
        Ok(())
    }

    async fn completed_parties(&self, session_id: &str) -> Result<Vec<PartyId>> {
        Ok(self
            .get_json(&format!("complete/{}", session_id), None, "completed parties")
            .await?
            .unwrap_or_default())
    }

    async fn mark_keysign_complete(
        &self,
        session_id: &str,
        message_id: &str,
        signature: &Signature,
    ) -> Result<()> {
        let response = self
            .send(
                self.client
                    .post(self.endpoint(&format!("complete/{}/keysign", session_id)))
                    .json(signature),
                Some(message_id),
            )
            .await?;
        expect_success(response, "mark keysign complete")?;
        Ok(())
    }

    async fn keysign_signature(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<Signature>> {
        self.get_json(
            &format!("complete/{}/keysign", session_id),
            Some(message_id),
            "keysign completion",
        )
        .await
    }

    async fn send_message(&self, message_id: Option<&str>, message: &RoundMessage) -> Result<()> {
        let response = self
            .send(
                self.client
                    .post(self.endpoint(&format!("message/{}", message.session_id)))
                    .json(message),
                message_id,
            )
            .await?;
        expect_success(response, "send message")?;
        Ok(())
    }

    async fn fetch_messages(
        &self,
        session_id: &str,
        party: &str,
        message_id: Option<&str>,
    ) -> Result<Vec<RoundMessage>> {
        Ok(self
            .get_json(&format!("message/{}/{}", session_id, party), message_id, "fetch messages")
            .await?
            .unwrap_or_default())
    }

    async fn delete_message(
        &self,
        session_id: &str,
        party: &str,
        hash: &str,
        message_id: Option<&str>,
    ) -> Result<()> {
        let response = self
            .send(
                self.client
                    .delete(self.endpoint(&format!("message/{}/{}/{}", session_id, party, hash))),
                message_id,
            )
            .await?;
        expect_success(response, "delete message")?;
        Ok(())
    }
}
