//! Request/response fallback used when no real-time connection is open.
//!
//! The HTTP response is the acknowledgment: a 2xx carries the canonical id
//! and timestamp, anything else carries an error body.

use std::time::Duration;

use courier_proto::api::{ErrorResponse, SendRequest, SendResponse, UnreadResponse};
use courier_proto::message::{Identity, Message, MessageId, Timestamp};
use courier_proto::presence::UserStatus;
use reqwest::header::AUTHORIZATION;
use url::Url;

use crate::error::TransportError;

/// HTTP client for the fallback endpoints.
#[derive(Debug, Clone)]
pub struct HttpFallback {
    client: reqwest::Client,
    base: Url,
    token: String,
}

impl HttpFallback {
    /// Creates a fallback client for the server at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if `base` is not an http(s)
    /// URL, or [`TransportError::Http`] if the client cannot be built.
    pub fn new(base: &str, token: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let base = Url::parse(base).map_err(|e| TransportError::InvalidUrl(format!("{base}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TransportError::InvalidUrl(format!(
                "{base}: expected http or https"
            )));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            token: token.into(),
        })
    }

    /// The server's base URL.
    #[must_use]
    pub const fn base(&self) -> &Url {
        &self.base
    }

    /// The real-time endpoint for the same server (`ws(s)://host/ws`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the scheme cannot be mapped.
    pub fn realtime_url(&self) -> Result<Url, TransportError> {
        let mut url = self.endpoint("ws")?;
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidUrl(format!("cannot use {scheme} for {url}")))?;
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|e| TransportError::InvalidUrl(format!("{path}: {e}")))
    }

    /// Sends a message; returns the canonical id and timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Rejected`] with the server's error text on a
    /// non-2xx response, or [`TransportError::Http`] on network failure.
    pub async fn send(&self, receiver: &Identity, body: &str) -> Result<(MessageId, Timestamp), TransportError> {
        let request = SendRequest {
            receiver: receiver.clone(),
            body: body.to_string(),
        };
        let response = self
            .client
            .post(self.endpoint("api/messages/send")?)
            .header(AUTHORIZATION, self.bearer())
            .json(&request)
            .send()
            .await?;
        let sent: SendResponse = Self::read_json(response).await?;
        Ok((sent.message_id, sent.time))
    }

    /// Fetches and clears the caller's pending queue.
    ///
    /// # Errors
    ///
    /// Same as [`HttpFallback::send`].
    pub async fn fetch_unread(&self) -> Result<Vec<Message>, TransportError> {
        let response = self
            .client
            .get(self.endpoint("api/messages/unread")?)
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await?;
        let unread: UnreadResponse = Self::read_json(response).await?;
        Ok(unread.messages)
    }

    /// Reachability of `identity`.
    ///
    /// # Errors
    ///
    /// Same as [`HttpFallback::send`].
    pub async fn status(&self, identity: &Identity) -> Result<UserStatus, TransportError> {
        let mut url = self.endpoint("api/messages/user-status/")?;
        url.path_segments_mut()
            .map_err(|()| TransportError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push(identity.as_str());
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await?;
        Self::read_json(response).await
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        let text = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<ErrorResponse>(&text).map_or(text, |e| e.error);
        Err(TransportError::Rejected {
            status: status.as_u16(),
            error,
        })
    }
}
