//! LLM provider abstraction.
//!
//! A single async trait for chat completions with tool calling. Concrete
//! providers (OpenRouter, Anthropic, ...) live outside this workspace;
//! the workflow only ever sees [`LlmProvider`]. [`ScriptedProvider`]
//! drives deterministic tests, [`StubProvider`] is the unconfigured
//! placeholder.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Standardized failure modes across provider implementations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Missing API key or client setup.
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    /// The provider's service rejected or failed the request.
    #[error("api error: {0}")]
    Api(String),
    /// Temporarily blocked; retry after the indicated delay.
    #[error("rate limited - retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    /// No response within the per-call timeout.
    #[error("request timed out")]
    Timeout,
    /// The response could not be parsed into the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Whether a unit-of-work retry is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Timeout
        )
    }
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Links a `Tool` message back to the call it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name, for `Tool` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool schema + calls
// ---------------------------------------------------------------------------

/// A tool advertised to the model: name, description, JSON Schema params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCall,
    Length,
    ContentFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Structured completion returned by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl ChatResponse {
    /// Plain text completion.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: TokenUsage::default(),
        }
    }

    /// A single tool-call completion.
    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        let name = name.into();
        Self {
            content: None,
            tool_calls: vec![ToolCall {
                id: format!("call_{name}"),
                name,
                arguments,
            }],
            finish_reason: FinishReason::ToolCall,
            usage: TokenUsage::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// The only LLM surface the workflow sees.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Request the next completion for `messages`, optionally advertising
    /// `tools` the model may call.
    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolSpec>>,
    ) -> Result<ChatResponse, ProviderError>;
}

// ---------------------------------------------------------------------------
// StubProvider
// ---------------------------------------------------------------------------

/// Placeholder provider that always reports itself unconfigured.
#[derive(Debug, Default, Clone)]
pub struct StubProvider;

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(
        &self,
        _messages: Vec<Message>,
        _tools: Option<Vec<ToolSpec>>,
    ) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::NotConfigured(
            "no LLM provider configured".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

/// Test provider that replays a fixed script of responses and records
/// every transcript it was handed.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
    transcripts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<ChatResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            transcripts: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a script of plain successful responses.
    pub fn replaying(responses: Vec<ChatResponse>) -> Self {
        Self::new(responses.into_iter().map(Ok).collect())
    }

    /// Transcripts received so far, in call order.
    pub fn recorded_transcripts(&self) -> Vec<Vec<Message>> {
        self.transcripts.lock().expect("transcripts poisoned").clone()
    }

    pub fn calls_made(&self) -> usize {
        self.transcripts.lock().expect("transcripts poisoned").len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(
        &self,
        messages: Vec<Message>,
        _tools: Option<Vec<ToolSpec>>,
    ) -> Result<ChatResponse, ProviderError> {
        self.transcripts
            .lock()
            .expect("transcripts poisoned")
            .push(messages);
        self.script
            .lock()
            .expect("script poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Api("script exhausted".to_string())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
