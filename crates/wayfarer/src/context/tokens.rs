//! Token estimation without a tokenizer.
//!
//! Every estimate is length-proportional: characters divided by
//! [`CHARS_PER_TOKEN`], rounded up. Messages add a fixed framing overhead and
//! every image part costs a flat [`IMAGE_PART_TOKENS`].

use crate::api::provider::{ChatOptions, ToolChoice};
use crate::{Message, ToolDef};

/// Characters per token. Most tokenizers average 3-4 for English text.
pub const CHARS_PER_TOKEN: f64 = 3.5;

/// Role and delimiter framing added to every message.
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Flat cost charged for any image part.
pub const IMAGE_PART_TOKENS: u32 = 1_000;

/// JSON wrapping around a tool definition or tool call.
const STRUCTURAL_OVERHEAD_CHARS: usize = 20;

/// Expected output when tool use is required and nothing else is known.
const REQUIRED_TOOL_OUTPUT_TOKENS: u32 = 768;

/// Expected output for free-form turns when nothing else is known.
const DEFAULT_OUTPUT_TOKENS: u32 = 1_536;

/// Fraction of the advertised context window assumed for output.
const CONTEXT_WINDOW_OUTPUT_DIVISOR: u32 = 16;
const MIN_WINDOW_OUTPUT_TOKENS: u32 = 256;
const MAX_WINDOW_OUTPUT_TOKENS: u32 = 4_096;

fn chars_to_tokens(chars: usize) -> u32 {
    (chars as f64 / CHARS_PER_TOKEN).ceil() as u32
}

/// Approximate token count of a text.
pub fn estimate_tokens(text: &str) -> u32 {
    chars_to_tokens(text.chars().count())
}

/// Approximate token count of one message.
pub fn estimate_single_message_tokens(msg: &Message) -> u32 {
    let mut tokens = MESSAGE_OVERHEAD_TOKENS;
    if let Some(content) = &msg.content {
        tokens += estimate_tokens(&content.text());
        tokens += content.image_count() as u32 * IMAGE_PART_TOKENS;
    }
    if let Some(calls) = &msg.tool_calls {
        for call in calls {
            let chars = call.id.len()
                + call.function.name.len()
                + call.function.arguments.chars().count()
                + STRUCTURAL_OVERHEAD_CHARS;
            tokens += chars_to_tokens(chars);
        }
    }
    if let Some(id) = &msg.tool_call_id {
        tokens += chars_to_tokens(id.len());
    }
    tokens
}

/// Approximate token count of a message list.
pub fn estimate_message_tokens(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_single_message_tokens).sum()
}

/// Approximate token count of the tool definitions sent with a request.
pub fn estimate_tool_schema_tokens(tools: &[ToolDef]) -> u32 {
    tools
        .iter()
        .map(|def| {
            let params = serde_json::to_string(&def.function.parameters)
                .map(|s| s.len())
                .unwrap_or(0);
            chars_to_tokens(
                def.function.name.len()
                    + def.function.description.chars().count()
                    + params
                    + STRUCTURAL_OVERHEAD_CHARS,
            )
        })
        .sum()
}

/// Tokens to reserve for the model's reply.
///
/// An explicit `max_tokens` wins. Otherwise a sixteenth of the advertised
/// context window (clamped), otherwise a fixed constant that is smaller when
/// the turn must be a tool call.
pub fn estimate_expected_output_tokens(
    options: &ChatOptions,
    tools: &[ToolDef],
    context_window: Option<u32>,
) -> u32 {
    if let Some(max) = options.max_tokens {
        return max;
    }
    if let Some(window) = context_window
        && window > 0
    {
        return (window / CONTEXT_WINDOW_OUTPUT_DIVISOR)
            .clamp(MIN_WINDOW_OUTPUT_TOKENS, MAX_WINDOW_OUTPUT_TOKENS);
    }
    if options.tool_choice == ToolChoice::Required && !tools.is_empty() {
        REQUIRED_TOOL_OUTPUT_TOKENS
    } else {
        DEFAULT_OUTPUT_TOKENS
    }
}

/// Full projected cost of a request: prompt, tool schemas, and expected output.
pub fn estimate_request_tokens(
    messages: &[Message],
    tools: &[ToolDef],
    options: &ChatOptions,
    context_window: Option<u32>,
) -> u32 {
    estimate_message_tokens(messages)
        + estimate_tool_schema_tokens(tools)
        + estimate_expected_output_tokens(options, tools, context_window)
}
