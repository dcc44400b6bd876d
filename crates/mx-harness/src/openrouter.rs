//! OpenRouter provider: the OpenAI chat-completions wire format with
//! tool calling, behind [`LlmProvider`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::provider::{
    ChatResponse, FinishReason, LlmProvider, Message, ProviderError, Role, TokenUsage, ToolCall,
    ToolSpec,
};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api";
const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

pub struct OpenRouterProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenRouterProvider {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
        })
    }

    /// Read the API key from `OPENROUTER_API_KEY`.
    pub fn from_env(model: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| ProviderError::NotConfigured(format!("{API_KEY_ENV} is not set")))?;
        Self::new(api_key, model, timeout)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request_body(&self, messages: &[Message], tools: Option<&[ToolSpec]>) -> serde_json::Value {
        let api_messages: Vec<serde_json::Value> = messages.iter().map(wire_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": api_messages,
        });
        if let Some(tools) = tools {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

/// Map a transcript message to the wire format. Tool results are
/// replayed as user turns carrying their call id, since the transcript
/// does not keep the upstream assistant tool_calls array.
fn wire_message(message: &Message) -> serde_json::Value {
    match message.role {
        Role::System => json!({ "role": "system", "content": message.content }),
        Role::User => json!({ "role": "user", "content": message.content }),
        Role::Assistant => json!({ "role": "assistant", "content": message.content }),
        Role::Tool => json!({
            "role": "user",
            "content": format!(
                "[result of {} ({})]\n{}",
                message.name.as_deref().unwrap_or("tool"),
                message.tool_call_id.as_deref().unwrap_or(""),
                message.content
            ),
        }),
    }
}

// -- response wire types --

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded arguments, per the chat-completions protocol.
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn response_from_json(text: &str) -> Result<ChatResponse, ProviderError> {
    let wire: WireResponse =
        serde_json::from_str(text).map_err(|e| ProviderError::Malformed(e.to_string()))?;
    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Malformed("no choices in response".to_string()))?;

    let mut tool_calls = Vec::with_capacity(choice.message.tool_calls.len());
    for call in choice.message.tool_calls {
        let arguments = serde_json::from_str(&call.function.arguments).map_err(|e| {
            ProviderError::Malformed(format!(
                "unparseable arguments for {}: {e}",
                call.function.name
            ))
        })?;
        tool_calls.push(ToolCall {
            id: call.id,
            name: call.function.name,
            arguments,
        });
    }

    let finish_reason = match choice.finish_reason.as_deref() {
        Some("tool_calls") => FinishReason::ToolCall,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ if !tool_calls.is_empty() => FinishReason::ToolCall,
        _ => FinishReason::Stop,
    };

    let usage = wire
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content: choice.message.content,
        tool_calls,
        finish_reason,
        usage,
    })
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolSpec>>,
    ) -> Result<ChatResponse, ProviderError> {
        let body = self.build_request_body(&messages, tools.as_deref());
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(model = %self.model, messages = messages.len(), "chat completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Api(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(ProviderError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("status {status}: {text}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Api(e.to_string()))?;
        response_from_json(&text)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenRouterProvider {
        OpenRouterProvider::new("key", "openrouter/auto", Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn request_body_carries_model_and_tools() {
        let p = provider();
        let tools = vec![ToolSpec {
            name: "read_file".into(),
            description: "Read a file".into(),
            parameters: json!({"type": "object"}),
        }];
        let body = p.build_request_body(
            &[Message::system("sys"), Message::user("go")],
            Some(&tools),
        );

        assert_eq!(body["model"], "openrouter/auto");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["tools"][0]["function"]["name"], "read_file");
        assert_eq!(body["tool_choice"], "auto");
    }

    #[test]
    fn request_body_omits_tools_when_none() {
        let body = provider().build_request_body(&[Message::user("hi")], None);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn tool_results_are_replayed_as_user_turns() {
        let wire = wire_message(&Message::tool_result("call_1", "read_file", "contents"));
        assert_eq!(wire["role"], "user");
        assert!(wire["content"].as_str().unwrap().contains("read_file"));
        assert!(wire["content"].as_str().unwrap().contains("contents"));
    }

    #[test]
    fn parses_text_completion() {
        let response = response_from_json(
            r#"{
                "choices": [{
                    "message": { "content": "hello" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
            }"#,
        )
        .unwrap();
        assert_eq!(response.content.as_deref(), Some("hello"));
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.prompt_tokens, 12);
    }

    #[test]
    fn parses_tool_call_with_string_encoded_arguments() {
        let response = response_from_json(
            r#"{
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_abc",
                            "function": {
                                "name": "write_file",
                                "arguments": "{\"file_path\": \"a.rs\", \"content\": \"x\"}"
                            }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCall);
        assert_eq!(response.tool_calls[0].name, "write_file");
        assert_eq!(response.tool_calls[0].arguments["file_path"], "a.rs");
    }

    #[test]
    fn unparseable_arguments_are_malformed() {
        let err = response_from_json(
            r#"{
                "choices": [{
                    "message": {
                        "tool_calls": [{
                            "id": "call_x",
                            "function": { "name": "read_file", "arguments": "not json" }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn empty_choices_are_malformed() {
        let err = response_from_json(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }
}
