//! OpenAI-compatible chat completions client (OpenRouter by default).

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::provider::{
    ChatOptions, ModelProvider, ProviderCapabilities, ProviderError, ProviderFuture, ToolChoice,
};
use crate::{ChatCompletion, Message, ToolCall, ToolDef, UsageInfo};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDef],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningToggle>,
}

fn no_tools(tools: &&[ToolDef]) -> bool {
    tools.is_empty()
}

#[derive(Serialize, Debug)]
struct ReasoningToggle {
    enabled: bool,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
    reasoning: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for an OpenAI-compatible chat completions endpoint.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    capabilities: ProviderCapabilities,
}

impl OpenRouterClient {
    /// Create a client for `model` against the OpenRouter endpoint.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent("wayfarer/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Transport(format!("failed to build HTTP client: {e}")))?;
        let model = model.into();
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: OPENROUTER_URL.to_string(),
            capabilities: ProviderCapabilities::new("openrouter", model),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        options: &ChatOptions,
    ) -> Result<ChatCompletion, ProviderError> {
        let body = ChatRequest {
            model: &self.capabilities.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            tools,
            tool_choice: match (tools.is_empty(), options.tool_choice) {
                (false, ToolChoice::Required) => Some("required"),
                _ => None,
            },
            reasoning: options
                .disable_thinking
                .then_some(ReasoningToggle { enabled: false }),
        };
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={:?}",
            body.model,
            messages.len(),
            tools.len(),
            body.max_tokens,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(&body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to read response: {e}")))?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited(text));
        }
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_response(&text)
    }
}

/// Decode a chat completion body.
fn parse_response(text: &str) -> Result<ChatCompletion, ProviderError> {
    let parsed: RawChatResponse =
        serde_json::from_str(text).map_err(|e| ProviderError::Decode(e.to_string()))?;

    if let Some(err) = parsed.error {
        let rate_limited = err
            .code
            .as_ref()
            .is_some_and(|c| c.as_u64() == Some(429) || c.as_str() == Some("429"));
        return Err(if rate_limited {
            ProviderError::RateLimited(err.message)
        } else {
            ProviderError::Api(err.message)
        });
    }

    if let Some(ref usage) = parsed.usage {
        debug!(
            "Token usage: prompt={}, completion={}, total={}",
            usage.prompt(),
            usage.completion(),
            usage.total(),
        );
    }

    let completion = match parsed.choices.and_then(|c| c.into_iter().next()) {
        Some(c) => ChatCompletion {
            content: c.message.content,
            tool_calls: c.message.tool_calls.unwrap_or_default(),
            usage: parsed.usage,
            finish_reason: c.finish_reason,
            reasoning: c.message.reasoning,
        },
        None => ChatCompletion {
            usage: parsed.usage,
            ..Default::default()
        },
    };
    debug!(
        "LLM output: {} chars text, {} tool call(s)",
        completion.content.as_ref().map_or(0, |s| s.len()),
        completion.tool_calls.len()
    );
    Ok(completion)
}

impl ModelProvider for OpenRouterClient {
    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    fn chat<'a>(
        &'a self,
        messages: &'a [Message],
        tools: &'a [ToolDef],
        options: &'a ChatOptions,
    ) -> ProviderFuture<'a> {
        Box::pin(self.send(messages, tools, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_calls_and_usage() {
        let body = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "click", "arguments": "{\"id\": 4}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 900, "completion_tokens": 40, "total_tokens": 940}
        }"#;
        let completion = parse_response(body).unwrap();
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].function.name, "click");
        assert_eq!(completion.usage.unwrap().total(), 940);
    }

    #[test]
    fn api_error_with_429_code_is_rate_limit() {
        let body = r#"{"error": {"message": "too many requests", "code": 429}}"#;
        assert!(matches!(
            parse_response(body),
            Err(ProviderError::RateLimited(_))
        ));
    }

    #[test]
    fn malformed_body_is_decode_error() {
        assert!(matches!(
            parse_response("not json"),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn request_omits_tool_choice_without_tools() {
        let messages = vec![Message::user("hi")];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            max_tokens: None,
            temperature: None,
            tools: &[],
            tool_choice: None,
            reasoning: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("tool_choice").is_none());
    }
}
