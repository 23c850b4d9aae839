use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use shared::{
    domain::{MediaType, PresenceRecord, UserId},
    protocol::{ConversationHistory, MessagePayload},
};

/// Durable per-pair message history, owned by an external REST service.
/// Conversations are created lazily by the store on first message or first
/// history fetch; this client only consumes fetch/append/upload/presence.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn fetch_history(&self, user: &UserId, peer: &UserId) -> Result<ConversationHistory>;
    async fn append_text(&self, from: &UserId, to: &UserId, text: &str)
        -> Result<MessagePayload>;
    async fn append_media(
        &self,
        from: &UserId,
        to: &UserId,
        media_url: &str,
        media_type: MediaType,
    ) -> Result<MessagePayload>;
    async fn upload_media(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String>;
    /// Point-in-time presence snapshot, distinct from the subscribed pushes.
    async fn fetch_presence(&self, user: &UserId) -> Result<PresenceRecord>;
}

#[derive(Debug, Serialize)]
struct AppendMessageRequest<'a> {
    from_user_id: &'a UserId,
    to_user_id: &'a UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_type: Option<MediaType>,
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    media_url: String,
}

pub struct RestConversationStore {
    http: Client,
    base_url: String,
}

impl RestConversationStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ConversationStore for RestConversationStore {
    async fn fetch_history(&self, user: &UserId, peer: &UserId) -> Result<ConversationHistory> {
        let history = self
            .http
            .get(format!(
                "{}/conversations/{}/{}",
                self.base_url, user, peer
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(history)
    }

    async fn append_text(
        &self,
        from: &UserId,
        to: &UserId,
        text: &str,
    ) -> Result<MessagePayload> {
        let message = self
            .http
            .post(format!("{}/messages", self.base_url))
            .json(&AppendMessageRequest {
                from_user_id: from,
                to_user_id: to,
                text: Some(text),
                media_url: None,
                media_type: None,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(message)
    }

    async fn append_media(
        &self,
        from: &UserId,
        to: &UserId,
        media_url: &str,
        media_type: MediaType,
    ) -> Result<MessagePayload> {
        let message = self
            .http
            .post(format!("{}/messages", self.base_url))
            .json(&AppendMessageRequest {
                from_user_id: from,
                to_user_id: to,
                text: None,
                media_url: Some(media_url),
                media_type: Some(media_type),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(message)
    }

    async fn upload_media(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        let response: MediaUploadResponse = self
            .http
            .post(format!("{}/media/upload", self.base_url))
            .query(&[("mime_type", mime_type)])
            .body(bytes)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.media_url)
    }

    async fn fetch_presence(&self, user: &UserId) -> Result<PresenceRecord> {
        let record = self
            .http
            .get(format!("{}/presence/{}", self.base_url, user))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(record)
    }
}
