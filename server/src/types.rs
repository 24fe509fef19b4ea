use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PLATFORM_INSTAGRAM: &str = "instagram";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub ai_enabled: bool,
    pub allow_auto_reply_from_unknown: bool,
    pub instagram_page_id: Option<String>,
    #[serde(skip_serializing)]
    pub page_access_token: Option<String>,
    pub page_token_expires_at: Option<DateTime<Utc>>,
}

impl Business {
    /// Page token, if one is stored and not blank.
    pub fn access_token(&self) -> Option<&str> {
        self.page_access_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub business_id: Option<i64>,
    pub is_global: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySummary {
    pub name: String,
    pub product_count: i64,
    pub is_global: bool,
}

/// Product row joined with its category name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub business_id: i64,
    pub category_id: Option<i64>,
    pub category: Option<String>,
    pub sku: Option<String>,
    pub name: String,
    pub description: String,
    pub price_usd: Decimal,
    pub price_lbp: Option<i64>,
    pub stock: i32,
    pub metadata: Option<Value>,
    pub active: bool,
}

impl Product {
    pub fn available(&self) -> bool {
        self.stock > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub business_id: i64,
    pub platform: String,
    pub platform_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "incoming" => Some(Direction::Incoming),
            "outgoing" => Some(Direction::Outgoing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLog {
    pub id: i64,
    pub business_id: i64,
    pub customer_id: Option<i64>,
    pub sender_id: Option<String>,
    pub incoming_text: Option<String>,
    pub reply_text: Option<String>,
    pub direction: Direction,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessageLog {
    pub business_id: i64,
    pub customer_id: Option<i64>,
    pub sender_id: Option<String>,
    pub incoming_text: Option<String>,
    pub reply_text: Option<String>,
    pub direction: Direction,
    pub error_message: Option<String>,
}

impl NewMessageLog {
    pub fn incoming(business_id: i64, sender_id: &str, text: &str) -> Self {
        Self {
            business_id,
            customer_id: None,
            sender_id: Some(sender_id.to_string()),
            incoming_text: Some(text.to_string()),
            reply_text: None,
            direction: Direction::Incoming,
            error_message: None,
        }
    }

    pub fn outgoing(
        business_id: i64,
        customer_id: Option<i64>,
        sender_id: &str,
        reply: &str,
        error_message: Option<String>,
    ) -> Self {
        Self {
            business_id,
            customer_id,
            sender_id: Some(sender_id.to_string()),
            incoming_text: None,
            reply_text: Some(reply.to_string()),
            direction: Direction::Outgoing,
            error_message,
        }
    }
}

// Webhook envelope as delivered by the Instagram messaging platform.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagingEvent {
    #[serde(default)]
    pub sender: Option<Participant>,
    #[serde(default)]
    pub recipient: Option<Participant>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub message: Option<InboundMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Participant {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub story: Option<MediaRef>,
    #[serde(default)]
    pub reel: Option<MediaRef>,
    #[serde(default)]
    pub reply_to: Option<ReplyTo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attachment {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<AttachmentPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttachmentPayload {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub reel_video_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyTo {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub story: Option<MediaRef>,
}
