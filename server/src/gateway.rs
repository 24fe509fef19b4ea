use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CAPTION_TIMEOUT, UPSTREAM_TIMEOUT};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Instagram API Error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Instagram API request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Outbound calls to the messaging platform.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send_text(
        &self,
        access_token: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<Value, GatewayError>;

    /// Register the page for message-related webhook fields.
    async fn subscribe_page(&self, page_id: &str, access_token: &str)
        -> Result<Value, GatewayError>;

    /// Caption of a media item or shared asset. `Ok(None)` when it has none.
    async fn fetch_caption(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<Option<String>, GatewayError>;
}

pub struct GraphApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl GraphApiClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

async fn read_response(response: reqwest::Response) -> Result<Value, GatewayError> {
    let status = response.status();
    let raw_body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(GatewayError::Api {
            status: status.as_u16(),
            body: raw_body,
        });
    }
    Ok(serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body })))
}

#[async_trait]
impl MessagingGateway for GraphApiClient {
    async fn send_text(
        &self,
        access_token: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<Value, GatewayError> {
        let response = self
            .http
            .post(format!("{}/me/messages", self.base_url))
            .query(&[("access_token", access_token)])
            .json(&json!({
                "recipient": { "id": recipient_id },
                "message": { "text": text }
            }))
            .timeout(UPSTREAM_TIMEOUT)
            .send()
            .await?;

        let result = read_response(response).await;
        match &result {
            Ok(_) => info!(recipient_id, "sent instagram message"),
            Err(err) => warn!(recipient_id, error = %err, "instagram send failed"),
        }
        result
    }

    async fn subscribe_page(
        &self,
        page_id: &str,
        access_token: &str,
    ) -> Result<Value, GatewayError> {
        let response = self
            .http
            .post(format!("{}/{}/subscribed_apps", self.base_url, page_id))
            .form(&[
                ("subscribed_fields", "messages,messaging_postbacks"),
                ("access_token", access_token),
            ])
            .timeout(UPSTREAM_TIMEOUT)
            .send()
            .await?;

        let result = read_response(response).await?;
        info!(page_id, "subscribed page to webhook fields");
        Ok(result)
    }

    async fn fetch_caption(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<Option<String>, GatewayError> {
        let response = self
            .http
            .get(format!("{}/{}", self.base_url, media_id))
            .query(&[("fields", "caption"), ("access_token", access_token)])
            .timeout(CAPTION_TIMEOUT)
            .send()
            .await?;

        let body = read_response(response).await?;
        let caption = body
            .get("caption")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|caption| !caption.is_empty())
            .map(str::to_string);
        debug!(media_id, found = caption.is_some(), "caption lookup finished");
        Ok(caption)
    }
}
