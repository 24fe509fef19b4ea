//! Short-window conversation state per (business, sender).
//!
//! History is rebuilt from the message log. The post context a customer was
//! replying to lives in a separate TTL cache so the audit log stays
//! append-only audit data.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::llm::ChatMessage;
use crate::post_context::PostContext;
use crate::store::{Store, StoreError};
use crate::types::{Direction, MessageLog};

/// Rebuild the recent exchange for (business, sender) as chat turns, oldest
/// first.
///
/// The dispatcher logs the inbound message before asking for a reply, so a
/// trailing incoming row is the message being answered and is dropped.
pub async fn recent_turns(
    store: &dyn Store,
    business_id: i64,
    sender_id: &str,
    window: chrono::Duration,
    limit: usize,
) -> Result<Vec<ChatMessage>, StoreError> {
    let since = Utc::now() - window;
    let mut logs = store
        .recent_message_logs(business_id, sender_id, since, limit + 1)
        .await?;
    if logs
        .last()
        .is_some_and(|log| log.direction == Direction::Incoming)
    {
        logs.pop();
    }
    let skip = logs.len().saturating_sub(limit);
    Ok(logs.iter().skip(skip).filter_map(log_to_turn).collect())
}

fn log_to_turn(log: &MessageLog) -> Option<ChatMessage> {
    match log.direction {
        Direction::Incoming => log
            .incoming_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(ChatMessage::user),
        // Failed sends never reached the customer.
        Direction::Outgoing if log.error_message.is_some() => None,
        Direction::Outgoing => log
            .reply_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(ChatMessage::assistant),
    }
}

struct CachedContext {
    context: PostContext,
    stored_at: Instant,
}

/// Last post context per (business, sender), valid for `ttl`.
pub struct PostContextCache {
    ttl: Duration,
    entries: Mutex<HashMap<(i64, String), CachedContext>>,
}

impl PostContextCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn remember(&self, business_id: i64, sender_id: &str, context: PostContext) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            (business_id, sender_id.to_string()),
            CachedContext {
                context,
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn recall(&self, business_id: i64, sender_id: &str) -> Option<PostContext> {
        let mut entries = self.entries.lock().await;
        let key = (business_id, sender_id.to_string());
        let fresh = entries
            .get(&key)
            .is_some_and(|entry| entry.stored_at.elapsed() <= self.ttl);
        if !fresh {
            entries.remove(&key);
            return None;
        }
        entries.get(&key).map(|entry| entry.context.clone())
    }

    /// Drop expired entries. Called periodically from a background task.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() <= self.ttl);
        before - entries.len()
    }
}
