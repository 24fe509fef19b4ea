//! Chat-completions client with function calling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::AiConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as the model produced it.
    #[serde(default)]
    pub arguments: String,
}

/// A callable function advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Empty means the model must answer in text.
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl AssistantReply {
    #[cfg(test)]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Trimmed text content, if any.
    pub fn text_content(&self) -> Option<&str> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("OPENAI_API_KEY not configured")]
    MissingApiKey,

    #[error("openai request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("openai returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("openai response malformed: {0}")]
    Malformed(String),

    #[error("openai response had no content or tool calls")]
    Empty,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<AssistantReply, LlmError>;
}

pub struct OpenAiClient {
    http: reqwest::Client,
    config: AiConfig,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, config: AiConfig) -> Self {
        Self { http, config }
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": request.messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        if !request.tools.is_empty() {
            let tools = request
                .tools
                .iter()
                .map(|tool| json!({ "type": "function", "function": tool }))
                .collect::<Vec<_>>();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

fn parse_completion(payload: &Value) -> Result<AssistantReply, LlmError> {
    let message = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| LlmError::Malformed("missing choices[0].message".to_string()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);
    let tool_calls = match message.get("tool_calls") {
        None | Some(Value::Null) => Vec::new(),
        Some(calls) => serde_json::from_value::<Vec<ToolCall>>(calls.clone())
            .map_err(|err| LlmError::Malformed(format!("tool_calls: {err}")))?,
    };

    let reply = AssistantReply {
        content,
        tool_calls,
    };
    if reply.tool_calls.is_empty() && reply.text_content().is_none() {
        return Err(LlmError::Empty);
    }
    Ok(reply)
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<AssistantReply, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.api_base))
            .bearer_auth(api_key)
            .json(&self.request_body(&request))
            .timeout(self.config.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| LlmError::Malformed(err.to_string()))?;

        let reply = parse_completion(&payload)?;
        debug!(
            model = %self.config.model,
            tool_calls = reply.tool_calls.len(),
            "completion received"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(api_key: Option<&str>, api_base: &str) -> OpenAiClient {
        OpenAiClient::new(
            reqwest::Client::new(),
            AiConfig {
                api_key: api_key.map(str::to_string),
                api_base: api_base.to_string(),
                ..AiConfig::default()
            },
        )
    }

    fn lookup_tool() -> ToolDefinition {
        ToolDefinition {
            name: "get_categories",
            description: "List categories",
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    #[test]
    fn messages_serialize_with_role_tags() {
        let call = ToolCall {
            id: "call_1".to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: "get_categories".to_string(),
                arguments: "{}".to_string(),
            },
        };
        let messages = vec![
            ChatMessage::system("rules"),
            ChatMessage::user("hi"),
            ChatMessage::Assistant {
                content: None,
                tool_calls: vec![call],
            },
            ChatMessage::tool_result("call_1", "{\"categories\":[]}"),
        ];

        let value = serde_json::to_value(&messages).unwrap();

        assert_eq!(value[0], json!({ "role": "system", "content": "rules" }));
        assert_eq!(value[1], json!({ "role": "user", "content": "hi" }));
        assert_eq!(value[2]["role"], "assistant");
        assert_eq!(value[2]["content"], Value::Null);
        assert_eq!(value[2]["tool_calls"][0]["type"], "function");
        assert_eq!(value[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn tools_are_only_sent_when_offered() {
        let client = client(Some("sk-test"), "http://localhost");
        let mut request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            tools: vec![lookup_tool()],
        };

        let body = client.request_body(&request);
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "get_categories");

        request.tools.clear();
        let body = client.request_body(&request);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn parses_tool_call_completion() {
        let payload = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "search_products", "arguments": "{\"search_term\":\"boots\"}" }
                    }]
                }
            }]
        });

        let reply = parse_completion(&payload).unwrap();

        assert!(reply.content.is_none());
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].function.name, "search_products");
    }

    #[test]
    fn blank_completion_is_an_error() {
        let payload = json!({ "choices": [{ "message": { "content": "   " } }] });
        assert!(matches!(parse_completion(&payload), Err(LlmError::Empty)));

        let payload = json!({ "choices": [] });
        assert!(matches!(
            parse_completion(&payload),
            Err(LlmError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_any_request() {
        let client = client(None, "http://127.0.0.1:9");
        let err = client
            .complete(ChatRequest {
                messages: vec![ChatMessage::user("hi")],
                tools: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingApiKey));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_request_error() {
        let client = client(Some("sk-test"), "http://127.0.0.1:9");
        let err = client
            .complete(ChatRequest {
                messages: vec![ChatMessage::user("hi")],
                tools: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Request(_)));
    }
}
