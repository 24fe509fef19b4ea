//! Turns one customer message into one reply.
//!
//! `Responder::respond` never fails: every error on the way to a grounded
//! answer is logged and replaced by `FALLBACK_REPLY`.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogService;
use crate::config::AiConfig;
use crate::conversation::recent_turns;
use crate::llm::{ChatMessage, ChatRequest, LanguageModel, LlmError};
use crate::prompting::{render_system_prompt, SystemPromptContext};
use crate::store::{Store, StoreError};
use crate::tools::{execute_tool, tool_definitions, ToolError};

pub const EMPTY_MESSAGE_REPLY: &str =
    "I received your message but it appears to be empty. Could you please try again?";

pub const FALLBACK_REPLY: &str = "Thank you for your message! I'm currently having trouble processing your request. Please try again in a moment, or contact us directly for immediate assistance.";

#[derive(Debug, Error)]
enum ReplyError {
    #[error("business {0} not found or inactive")]
    BusinessUnavailable(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] LlmError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("model returned no text after the tool result")]
    NoText,
}

fn greeting_regex() -> &'static Regex {
    static GREETING: OnceLock<Regex> = OnceLock::new();
    GREETING.get_or_init(|| {
        Regex::new(
            r"(?i)\b(hello|hi|hey|good morning|good afternoon|good evening|what do you sell|what products do you have|what do you have)\b",
        )
        .expect("static regex")
    })
}

/// Greetings and catalog-wide questions start a fresh topic.
pub fn is_greeting_or_general_question(message: &str) -> bool {
    greeting_regex().is_match(message)
}

fn truncate_chars(message: &str, max_chars: usize) -> &str {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => &message[..cut],
        None => message,
    }
}

pub struct Responder {
    store: Arc<dyn Store>,
    model: Arc<dyn LanguageModel>,
    config: AiConfig,
}

impl Responder {
    pub fn new(store: Arc<dyn Store>, model: Arc<dyn LanguageModel>, config: AiConfig) -> Self {
        Self {
            store,
            model,
            config,
        }
    }

    pub async fn respond(&self, business_id: i64, message: &str, sender_id: Option<&str>) -> String {
        if message.trim().is_empty() {
            return EMPTY_MESSAGE_REPLY.to_string();
        }

        let truncated = truncate_chars(message, self.config.max_message_chars);
        if truncated.len() < message.len() {
            warn!(
                business_id,
                max_chars = self.config.max_message_chars,
                "message truncated"
            );
        }

        match self.generate(business_id, truncated, sender_id).await {
            Ok(reply) => reply,
            Err(err) => {
                error!(business_id, sender_id, error = %err, "AI reply failed, using fallback");
                FALLBACK_REPLY.to_string()
            }
        }
    }

    async fn generate(
        &self,
        business_id: i64,
        message: &str,
        sender_id: Option<&str>,
    ) -> Result<String, ReplyError> {
        let business = self
            .store
            .business_by_id(business_id)
            .await?
            .filter(|business| business.active)
            .ok_or(ReplyError::BusinessUnavailable(business_id))?;

        let mut history = match sender_id {
            Some(sender_id) => {
                recent_turns(
                    self.store.as_ref(),
                    business_id,
                    sender_id,
                    self.config.history_window,
                    self.config.history_limit,
                )
                .await?
            }
            None => Vec::new(),
        };
        if is_greeting_or_general_question(message) && history.len() > 1 {
            history = history.split_off(history.len() - 1);
            debug!(business_id, "greeting detected, narrowing history to last turn");
        }
        let keep_from = history.len().saturating_sub(self.config.history_limit);

        let system_prompt = render_system_prompt(&SystemPromptContext {
            business_name: &business.name,
            reply_language: &self.config.reply_language,
        });
        let mut messages = Vec::with_capacity(history.len() + 4);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(history.into_iter().skip(keep_from));
        messages.push(ChatMessage::user(message));

        let first = self
            .model
            .complete(ChatRequest {
                messages: messages.clone(),
                tools: tool_definitions(),
            })
            .await?;

        let Some(call) = first.tool_calls.first().cloned() else {
            let text = first.text_content().ok_or(LlmError::Empty)?;
            return Ok(text.to_string());
        };
        if first.tool_calls.len() > 1 {
            debug!(
                business_id,
                ignored = first.tool_calls.len() - 1,
                "model requested several tools, running only the first"
            );
        }

        info!(business_id, tool = %call.function.name, "model requested tool");
        let catalog = CatalogService::new(self.store.as_ref(), business_id);
        let result = execute_tool(&catalog, &call.function.name, &call.function.arguments).await?;

        let call_id = call.id.clone();
        messages.push(ChatMessage::Assistant {
            content: first.content.clone(),
            tool_calls: vec![call],
        });
        messages.push(ChatMessage::tool_result(call_id, result.to_string()));

        let second = self
            .model
            .complete(ChatRequest {
                messages,
                tools: Vec::new(),
            })
            .await?;
        second
            .text_content()
            .map(str::to_string)
            .ok_or(ReplyError::NoText)
    }
}
