//! Figures out which post, story or reel an inbound message is replying to.

use std::sync::OnceLock;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gateway::MessagingGateway;
use crate::types::{Business, InboundMessage, MediaRef};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reel_url: Option<String>,
}

impl PostContext {
    pub fn is_empty(&self) -> bool {
        *self == PostContext::default()
    }

    /// Identifier fields in display order, caption excluded.
    fn identifiers(&self) -> Vec<(&'static str, &str)> {
        [
            ("media_id", &self.media_id),
            ("post_id", &self.post_id),
            ("post_url", &self.post_url),
            ("asset_id", &self.asset_id),
            ("share_url", &self.share_url),
            ("story_id", &self.story_id),
            ("story_url", &self.story_url),
            ("reel_id", &self.reel_id),
            ("reel_url", &self.reel_url),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
        .collect()
    }
}

/// Customer text plus bracketed post context the model can reason over.
pub fn enhance_message(text: &str, context: Option<&PostContext>) -> String {
    let Some(context) = context.filter(|c| !c.is_empty()) else {
        return text.to_string();
    };

    let mut enhanced = text.trim().to_string();
    let identifiers = context.identifiers();
    if !identifiers.is_empty() {
        let fields = identifiers
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        push_block(&mut enhanced, &format!("[Post context: {fields}]"));
    }
    if let Some(caption) = context.post_caption.as_deref() {
        push_block(&mut enhanced, &format!("[Post caption: {caption}]"));
    }
    enhanced
}

fn push_block(target: &mut String, block: &str) {
    if !target.is_empty() {
        target.push_str("\n\n");
    }
    target.push_str(block);
}

fn instagram_post_regex() -> &'static Regex {
    static POST: OnceLock<Regex> = OnceLock::new();
    POST.get_or_init(|| {
        Regex::new(r"(?i)^https?://(?:www\.)?instagram\.com/(?:p|reel|tv)/([A-Za-z0-9_-]+)")
            .expect("static regex")
    })
}

fn instagram_post_id(url: &str) -> Option<String> {
    instagram_post_regex()
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// `asset_id` query parameter of a messaging CDN share link.
fn cdn_asset_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let is_cdn = host.ends_with("fbsbx.com") || parsed.path().contains("ig_messaging_cdn");
    if !is_cdn {
        return None;
    }
    parsed
        .query_pairs()
        .find(|(key, _)| key == "asset_id")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn record_media_ref(media: &MediaRef, id_slot: &mut Option<String>, url_slot: &mut Option<String>) {
    if id_slot.is_none() {
        *id_slot = non_empty(&media.id);
    }
    if url_slot.is_none() {
        *url_slot = non_empty(&media.url);
    }
}

pub struct PostContextExtractor<'a> {
    gateway: &'a dyn MessagingGateway,
}

impl<'a> PostContextExtractor<'a> {
    pub fn new(gateway: &'a dyn MessagingGateway) -> Self {
        Self { gateway }
    }

    /// Post context for one inbound message, or `None` when it is not a reply
    /// to any shared content. Caption lookups use the resolving business's
    /// token and fail soft.
    pub async fn extract(&self, business: &Business, message: &InboundMessage) -> Option<PostContext> {
        let mut context = PostContext::default();

        if let Some(media_id) = non_empty(&message.media_id) {
            context.post_caption = self.caption_for(business, &media_id).await;
            context.media_id = Some(media_id);
        }

        if let Some(post_id) = non_empty(&message.post_id) {
            context.post_id = Some(post_id);
        }

        for attachment in &message.attachments {
            let Some(payload) = attachment.payload.as_ref() else {
                continue;
            };
            let url = non_empty(&payload.url);
            match attachment.kind.as_str() {
                "share" => {
                    let Some(url) = url else { continue };
                    if let Some(post_id) = instagram_post_id(&url) {
                        context.post_id.get_or_insert(post_id);
                        context.post_url.get_or_insert(url);
                    } else if let Some(asset_id) = cdn_asset_id(&url) {
                        if context.post_caption.is_none() {
                            context.post_caption = self.caption_for(business, &asset_id).await;
                        }
                        context.asset_id.get_or_insert(asset_id);
                        context.share_url.get_or_insert(url);
                    } else {
                        context.share_url.get_or_insert(url);
                    }
                    if context.post_caption.is_none() {
                        context.post_caption = non_empty(&payload.title);
                    }
                }
                "ig_reel" | "reel" => {
                    if context.reel_id.is_none() {
                        context.reel_id = non_empty(&payload.reel_video_id);
                    }
                    if context.reel_url.is_none() {
                        context.reel_url = url;
                    }
                    if context.post_caption.is_none() {
                        context.post_caption = non_empty(&payload.title);
                    }
                }
                "story_mention" => {
                    if context.story_url.is_none() {
                        context.story_url = url;
                    }
                }
                _ => {}
            }
        }

        if let Some(story) = message.story.as_ref() {
            record_media_ref(story, &mut context.story_id, &mut context.story_url);
        }
        if let Some(story) = message.reply_to.as_ref().and_then(|r| r.story.as_ref()) {
            record_media_ref(story, &mut context.story_id, &mut context.story_url);
        }
        if let Some(reel) = message.reel.as_ref() {
            record_media_ref(reel, &mut context.reel_id, &mut context.reel_url);
        }

        if context.is_empty() {
            None
        } else {
            debug!(business_id = business.id, ?context, "extracted post context");
            Some(context)
        }
    }

    async fn caption_for(&self, business: &Business, media_id: &str) -> Option<String> {
        let Some(token) = business.access_token() else {
            debug!(business_id = business.id, media_id, "no page token, skipping caption lookup");
            return None;
        };
        match self.gateway.fetch_caption(media_id, token).await {
            Ok(caption) => caption,
            Err(err) => {
                warn!(business_id = business.id, media_id, error = %err, "caption lookup failed");
                None
            }
        }
    }
}
