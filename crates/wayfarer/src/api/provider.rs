//! The model provider seam.
//!
//! The orchestrator only ever talks to a `dyn ModelProvider`. Implementations
//! translate `(messages, tools, options)` into whatever wire format the
//! backend speaks and report usage back in [`UsageInfo`](crate::UsageInfo).

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{ChatCompletion, Message, ToolDef};

/// Future returned by [`ModelProvider::chat`].
pub type ProviderFuture<'a> = BoxFuture<'a, Result<ChatCompletion, ProviderError>>;

// ── Options ────────────────────────────────────────────────────────

/// Whether the model may answer without calling a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
}

/// Per-call request options.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tool_choice: ToolChoice,
    /// Ask reasoning models to skip extended thinking.
    pub disable_thinking: bool,
}

impl ChatOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_thinking_disabled(mut self) -> Self {
        self.disable_thinking = true;
        self
    }
}

/// What the provider advertises about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub provider: String,
    pub model: String,
    pub supports_tools: bool,
    pub supports_vision: bool,
    /// Advertised context window in tokens, when known.
    pub context_window: Option<u32>,
}

impl ProviderCapabilities {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            supports_tools: true,
            supports_vision: false,
            context_window: None,
        }
    }

    pub fn with_vision(mut self, supports: bool) -> Self {
        self.supports_vision = supports;
        self
    }

    pub fn with_tools(mut self, supports: bool) -> Self {
        self.supports_tools = supports;
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = Some(tokens);
        self
    }
}

// ── Trait ──────────────────────────────────────────────────────────

/// A chat-completion backend with tool calling.
pub trait ModelProvider: Send + Sync {
    fn capabilities(&self) -> ProviderCapabilities;

    fn chat<'a>(
        &'a self,
        messages: &'a [Message],
        tools: &'a [ToolDef],
        options: &'a ChatOptions,
    ) -> ProviderFuture<'a>;
}

// ── Errors ─────────────────────────────────────────────────────────

/// Failure of a provider call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("failed to parse response: {0}")]
    Decode(String),
    #[error("provider does not support {0}")]
    Unsupported(String),
    #[error("provider error: {0}")]
    Api(String),
}

/// How the orchestrator reacts to a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Back off and retry, up to a bounded number of consecutive hits.
    RateLimit,
    /// Inject a note and continue, up to a bounded number in a row.
    Generic,
    /// Terminal immediately.
    Fatal,
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::RateLimited(_) | ProviderError::Timeout => ErrorClass::RateLimit,
            ProviderError::Http { status: 429, .. } => ErrorClass::RateLimit,
            ProviderError::Http {
                status: 401 | 403, ..
            } => ErrorClass::Fatal,
            ProviderError::Unsupported(_) => ErrorClass::Fatal,
            _ => ErrorClass::Generic,
        }
    }
}
