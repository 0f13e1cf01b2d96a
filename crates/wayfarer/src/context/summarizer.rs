//! Running summary compressor.
//!
//! Evicted batches are rendered to one line per message and queued as pending
//! chunks. Once enough has accumulated (or a pass is forced) up to three
//! chunks are drained and merged into the running summary: by a strict-JSON
//! model call when one is available and affordable, otherwise by bounded
//! concatenation that keeps the most recent content. Drained chunks and the
//! new summary are indexed into [`RetrievalMemory`] in the same pass.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::budget::{BudgetState, PrecheckPolicy};
use super::retrieval::{EntrySource, RetrievalMemory};
use super::window::EvictedMessage;
use crate::api::provider::{ChatOptions, ModelProvider};
use crate::{Message, MessageRole, UsageInfo, tail_chars, truncate_chars};

const SUMMARY_PROMPT: &str = "\
You maintain the running summary of a browser automation session.
Merge the new events into the previous summary. Keep URLs, element labels, \
extracted values, and failed approaches verbatim. Drop navigation noise.
Respond with strict JSON only: {\"summary\": \"<merged summary>\"}";

// ── Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Pending chunk count that triggers a pass.
    pub trigger_chunks: usize,
    /// Pending character total that triggers a pass.
    pub trigger_chars: usize,
    /// Chunks drained per pass.
    pub max_chunks_per_pass: usize,
    /// Combined character budget of drained chunks.
    pub max_pass_chars: usize,
    /// Bound on the running summary.
    pub max_running_chars: usize,
    /// Bound on each rendered message line.
    pub line_max_chars: usize,
    /// Reply budget for the summarization call.
    pub summary_max_tokens: u32,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            trigger_chunks: 3,
            trigger_chars: 6_000,
            max_chunks_per_pass: 3,
            max_pass_chars: 8_000,
            max_running_chars: 4_000,
            line_max_chars: 160,
            summary_max_tokens: 600,
        }
    }
}

// ── State ──────────────────────────────────────────────────────────

/// A rendered evicted batch awaiting compaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PendingChunk {
    pub text: String,
    pub messages: usize,
    /// Latest step represented in the chunk.
    pub step: Option<u32>,
}

/// History summary state for one run.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct HistorySummary {
    pub running: String,
    pub pending: VecDeque<PendingChunk>,
    pub evicted_messages: u64,
    pub evicted_chars: u64,
    pub summarized_chunks: u64,
    pub summarized_messages: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl HistorySummary {
    pub fn pending_chars(&self) -> usize {
        self.pending.iter().map(|c| c.text.chars().count()).sum()
    }
}

/// How a pass produced its summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryMode {
    Model,
    Fallback(FallbackReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    NoProvider,
    BudgetSkipped,
    CallFailed,
    Unparseable,
}

/// Result of one summarization pass.
#[derive(Debug, Clone)]
pub struct SummaryOutcome {
    pub mode: SummaryMode,
    pub chunks: usize,
    pub messages: usize,
    /// Usage of the model call, if one was made.
    pub usage: Option<UsageInfo>,
}

#[derive(Deserialize)]
struct SummaryReply {
    summary: String,
}

// ── Compressor ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SummaryCompressor {
    config: SummaryConfig,
    state: HistorySummary,
}

impl SummaryCompressor {
    pub fn new(config: SummaryConfig) -> Self {
        Self {
            config,
            state: HistorySummary::default(),
        }
    }

    /// Restore from a checkpointed state.
    pub fn with_state(mut self, state: HistorySummary) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &HistorySummary {
        &self.state
    }

    pub fn running(&self) -> &str {
        &self.state.running
    }

    pub fn reset(&mut self) {
        self.state = HistorySummary::default();
    }

    /// Queue an evicted batch as one pending chunk.
    pub fn record_eviction(&mut self, batch: &[EvictedMessage]) {
        if batch.is_empty() {
            return;
        }
        let text = render_batch(batch, self.config.line_max_chars);
        let chars: usize = batch.iter().map(|e| e.message.char_len()).sum();
        self.state.evicted_messages += batch.len() as u64;
        self.state.evicted_chars += chars as u64;
        self.state.pending.push_back(PendingChunk {
            text,
            messages: batch.len(),
            step: batch.iter().filter_map(|e| e.step).max(),
        });
        debug!(
            "Summary: queued chunk of {} message(s), {} pending",
            batch.len(),
            self.state.pending.len()
        );
    }

    /// Whether a pass should run now.
    pub fn should_summarize(&self, force: bool) -> bool {
        if self.state.pending.is_empty() {
            return false;
        }
        force
            || self.state.pending.len() >= self.config.trigger_chunks
            || self.state.pending_chars() >= self.config.trigger_chars
    }

    /// Drain pending chunks into the running summary.
    ///
    /// Returns `None` when no pass was due. Never fails: every model-side
    /// problem degrades to the concatenation fallback.
    pub async fn summarize(
        &mut self,
        force: bool,
        provider: Option<&dyn ModelProvider>,
        budget: Option<&BudgetState>,
        memory: &mut RetrievalMemory,
    ) -> Option<SummaryOutcome> {
        if !self.should_summarize(force) {
            return None;
        }
        let drained = self.drain();
        let new_events = drained
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let new_events = tail_chars(&new_events, self.config.max_pass_chars).to_string();

        let (summary, mode, usage) = match provider {
            None => (self.fallback(&new_events), SummaryMode::Fallback(FallbackReason::NoProvider), None),
            Some(provider) => self.model_summary(provider, budget, &new_events).await,
        };
        if let SummaryMode::Fallback(reason) = &mode {
            debug!("Summary: concatenation fallback ({reason:?})");
        }

        let messages: usize = drained.iter().map(|c| c.messages).sum();
        for chunk in &drained {
            memory.index(&chunk.text, chunk.step, EntrySource::EvictedTurn);
        }
        let latest_step = drained.iter().filter_map(|c| c.step).max();
        memory.index(&summary, latest_step, EntrySource::RunningSummary);

        self.state.running = summary;
        self.state.summarized_chunks += drained.len() as u64;
        self.state.summarized_messages += messages as u64;
        self.state.updated_at = Some(Utc::now());
        info!(
            "Summary: merged {} chunk(s) / {} message(s) via {:?}",
            drained.len(),
            messages,
            mode
        );

        Some(SummaryOutcome {
            mode,
            chunks: drained.len(),
            messages,
            usage,
        })
    }

    /// Pop up to `max_chunks_per_pass` chunks within the character budget.
    /// The first chunk is always taken.
    fn drain(&mut self) -> Vec<PendingChunk> {
        let mut drained: Vec<PendingChunk> = Vec::new();
        let mut chars = 0;
        while drained.len() < self.config.max_chunks_per_pass {
            let Some(next) = self.state.pending.front() else {
                break;
            };
            let len = next.text.chars().count();
            if !drained.is_empty() && chars + len > self.config.max_pass_chars {
                break;
            }
            chars += len;
            if let Some(chunk) = self.state.pending.pop_front() {
                drained.push(chunk);
            }
        }
        drained
    }

    fn fallback(&self, new_events: &str) -> String {
        let merged = if self.state.running.is_empty() {
            new_events.to_string()
        } else {
            format!("{}\n{}", self.state.running, new_events)
        };
        tail_chars(&merged, self.config.max_running_chars).to_string()
    }

    async fn model_summary(
        &self,
        provider: &dyn ModelProvider,
        budget: Option<&BudgetState>,
        new_events: &str,
    ) -> (String, SummaryMode, Option<UsageInfo>) {
        let previous = if self.state.running.is_empty() {
            "(none)"
        } else {
            self.state.running.as_str()
        };
        let messages = vec![
            Message::system(SUMMARY_PROMPT),
            Message::user(format!(
                "Previous summary:\n{previous}\n\nNew events:\n{new_events}"
            )),
        ];
        let options = ChatOptions::default()
            .with_max_tokens(self.config.summary_max_tokens)
            .with_temperature(0.0)
            .with_thinking_disabled();

        if let Some(budget) = budget {
            let outcome = budget.precheck(&messages, &[], &options, PrecheckPolicy::Skip, None);
            if !outcome.ok {
                return (
                    self.fallback(new_events),
                    SummaryMode::Fallback(FallbackReason::BudgetSkipped),
                    None,
                );
            }
        }

        match provider.chat(&messages, &[], &options).await {
            Ok(completion) => {
                let usage = completion.usage.clone();
                match completion.content.as_deref().and_then(parse_summary_reply) {
                    Some(summary) => (
                        tail_chars(&summary, self.config.max_running_chars).to_string(),
                        SummaryMode::Model,
                        usage,
                    ),
                    None => (
                        self.fallback(new_events),
                        SummaryMode::Fallback(FallbackReason::Unparseable),
                        usage,
                    ),
                }
            }
            Err(e) => {
                warn!("Summary call failed: {e}");
                (
                    self.fallback(new_events),
                    SummaryMode::Fallback(FallbackReason::CallFailed),
                    None,
                )
            }
        }
    }
}

/// Extract `summary` from a strict-JSON reply, tolerating surrounding prose.
fn parse_summary_reply(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let reply = serde_json::from_str::<SummaryReply>(trimmed).ok().or_else(|| {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        serde_json::from_str::<SummaryReply>(trimmed.get(start..=end)?).ok()
    })?;
    let summary = reply.summary.trim();
    (!summary.is_empty()).then(|| summary.to_string())
}

/// One line per message: tool calls list tool names, results are truncated,
/// vision messages are flagged.
fn render_batch(batch: &[EvictedMessage], line_max: usize) -> String {
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    let mut lines = Vec::with_capacity(batch.len());
    for evicted in batch {
        let msg = &evicted.message;
        let step = evicted
            .step
            .map_or_else(|| "[-]".to_string(), |s| format!("[s{s}]"));
        let line = match msg.role {
            MessageRole::Assistant if msg.has_tool_calls() => {
                let calls = msg.tool_calls.as_deref().unwrap_or_default();
                for call in calls {
                    call_names.insert(call.id.as_str(), call.function.name.as_str());
                }
                let names: Vec<String> = calls
                    .iter()
                    .map(|c| {
                        format!(
                            "{}({})",
                            c.function.name,
                            truncate_chars(&c.function.arguments, 60)
                        )
                    })
                    .collect();
                format!("{step} assistant called {}", names.join(", "))
            }
            MessageRole::Tool => {
                let name = msg
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| call_names.get(id).copied())
                    .unwrap_or("tool");
                format!("{step} {name} -> {}", one_line(&msg.text()))
            }
            _ if msg.is_vision() => {
                format!("{step} [screenshot] {}", one_line(&msg.text()))
            }
            role => format!("{step} {role}: {}", one_line(&msg.text())),
        };
        lines.push(truncate_chars(&line, line_max).to_string());
    }
    lines.join("\n")
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::provider::{ProviderCapabilities, ProviderError, ProviderFuture};
    use crate::{ChatCompletion, ToolCall, ToolDef};
    use std::sync::Mutex;

    struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<ChatCompletion, ProviderError>>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<ChatCompletion, ProviderError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
            }
        }
    }

    impl ModelProvider for ScriptedProvider {
        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::new("test", "scripted")
        }

        fn chat<'a>(
            &'a self,
            _messages: &'a [Message],
            _tools: &'a [ToolDef],
            _options: &'a ChatOptions,
        ) -> ProviderFuture<'a> {
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Api("no reply scripted".into())));
            Box::pin(async move { reply })
        }
    }

    fn batch(step: u32, text: &str) -> Vec<EvictedMessage> {
        vec![EvictedMessage {
            message: Message::user(text),
            step: Some(step),
        }]
    }

    #[test]
    fn eviction_renders_role_aware_lines() {
        let mut c = SummaryCompressor::default();
        c.record_eviction(&[
            EvictedMessage {
                message: Message::assistant_tool_calls(
                    None,
                    vec![ToolCall::new("c1", "click", r#"{"id":7}"#)],
                ),
                step: Some(3),
            },
            EvictedMessage {
                message: Message::tool_result("c1", "clicked\n  the   button"),
                step: Some(3),
            },
            EvictedMessage {
                message: Message::vision("cart page", "data:image/png;base64,AA"),
                step: Some(3),
            },
        ]);
        let chunk = &c.state().pending[0];
        let lines: Vec<&str> = chunk.text.lines().collect();
        assert_eq!(lines[0], r#"[s3] assistant called click({"id":7})"#);
        assert_eq!(lines[1], "[s3] click -> clicked the button");
        assert_eq!(lines[2], "[s3] [screenshot] cart page");
        assert_eq!(c.state().evicted_messages, 3);
        assert_eq!(chunk.step, Some(3));
    }

    #[test]
    fn triggers_on_count_chars_or_force() {
        let mut c = SummaryCompressor::default();
        assert!(!c.should_summarize(true));
        c.record_eviction(&batch(1, "a"));
        assert!(!c.should_summarize(false));
        assert!(c.should_summarize(true));
        c.record_eviction(&batch(2, "b"));
        c.record_eviction(&batch(3, "c"));
        assert!(c.should_summarize(false));

        let mut big = SummaryCompressor::default();
        big.record_eviction(&batch(1, &"z".repeat(6_500)));
        assert!(big.should_summarize(false));
    }

    #[tokio::test]
    async fn fallback_without_provider_concatenates() {
        let mut c = SummaryCompressor::default();
        let mut mem = RetrievalMemory::default();
        c.record_eviction(&batch(1, "opened the pricing page"));
        let outcome = c.summarize(true, None, None, &mut mem).await.unwrap();
        assert_eq!(outcome.mode, SummaryMode::Fallback(FallbackReason::NoProvider));
        assert!(c.running().contains("opened the pricing page"));
        assert!(c.state().pending.is_empty());
        assert_eq!(c.state().summarized_chunks, 1);
        assert_eq!(c.state().summarized_messages, 1);
        assert!(c.state().updated_at.is_some());
        // Chunk and summary are both indexed; identical text dedupes to one.
        assert!(mem.entries().any(|e| e.source == EntrySource::EvictedTurn));
    }

    #[tokio::test]
    async fn fallback_keeps_most_recent_content() {
        let mut c = SummaryCompressor::new(SummaryConfig {
            max_running_chars: 50,
            ..Default::default()
        });
        let mut mem = RetrievalMemory::default();
        c.record_eviction(&batch(1, &format!("{} OLD", "x".repeat(100))));
        c.summarize(true, None, None, &mut mem).await;
        c.record_eviction(&batch(2, "NEWEST"));
        c.summarize(true, None, None, &mut mem).await;
        assert_eq!(c.running().chars().count(), 50);
        assert!(c.running().ends_with("NEWEST"));
    }

    #[tokio::test]
    async fn drains_at_most_three_chunks() {
        let mut c = SummaryCompressor::default();
        let mut mem = RetrievalMemory::default();
        for i in 0..5 {
            c.record_eviction(&batch(i, &format!("event {i}")));
        }
        let outcome = c.summarize(false, None, None, &mut mem).await.unwrap();
        assert_eq!(outcome.chunks, 3);
        assert_eq!(c.state().pending.len(), 2);
    }

    #[tokio::test]
    async fn drain_respects_char_budget() {
        let mut c = SummaryCompressor::new(SummaryConfig {
            max_pass_chars: 100,
            ..Default::default()
        });
        let mut mem = RetrievalMemory::default();
        c.record_eviction(&batch(1, &"a".repeat(80)));
        c.record_eviction(&batch(2, &"b".repeat(80)));
        let outcome = c.summarize(true, None, None, &mut mem).await.unwrap();
        assert_eq!(outcome.chunks, 1);
        assert_eq!(c.state().pending.len(), 1);
    }

    #[tokio::test]
    async fn model_summary_is_used_and_indexed() {
        let provider = ScriptedProvider::new(vec![Ok(ChatCompletion::text(
            r#"{"summary": "User is comparing flight prices; cheapest so far 812 USD."}"#,
        )
        .with_usage(UsageInfo::new(200, 20)))]);
        let mut c = SummaryCompressor::default();
        let mut mem = RetrievalMemory::default();
        c.record_eviction(&batch(4, "read flight results"));
        let outcome = c
            .summarize(true, Some(&provider), None, &mut mem)
            .await
            .unwrap();
        assert_eq!(outcome.mode, SummaryMode::Model);
        assert_eq!(outcome.usage.unwrap().total(), 220);
        assert!(c.running().starts_with("User is comparing"));
        let summary_entry = mem
            .entries()
            .find(|e| e.source == EntrySource::RunningSummary)
            .unwrap();
        assert_eq!(summary_entry.step, Some(4));
    }

    #[tokio::test]
    async fn unparseable_reply_falls_back() {
        let provider = ScriptedProvider::new(vec![Ok(ChatCompletion::text("sure, here you go"))]);
        let mut c = SummaryCompressor::default();
        let mut mem = RetrievalMemory::default();
        c.record_eviction(&batch(1, "clicked login"));
        let outcome = c
            .summarize(true, Some(&provider), None, &mut mem)
            .await
            .unwrap();
        assert_eq!(outcome.mode, SummaryMode::Fallback(FallbackReason::Unparseable));
        assert!(c.running().contains("clicked login"));
    }

    #[tokio::test]
    async fn provider_error_falls_back() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Timeout)]);
        let mut c = SummaryCompressor::default();
        let mut mem = RetrievalMemory::default();
        c.record_eviction(&batch(1, "scrolled"));
        let outcome = c
            .summarize(true, Some(&provider), None, &mut mem)
            .await
            .unwrap();
        assert_eq!(outcome.mode, SummaryMode::Fallback(FallbackReason::CallFailed));
    }

    #[tokio::test]
    async fn exhausted_budget_skips_model_call() {
        let provider = ScriptedProvider::new(vec![]);
        let budget = BudgetState {
            token_limit: 100,
            used_tokens: 100,
            context_window_tokens: 8_000,
            reserved_output_tokens: 0,
            pressure_level: 0,
        };
        let mut c = SummaryCompressor::default();
        let mut mem = RetrievalMemory::default();
        c.record_eviction(&batch(1, "typed query"));
        let outcome = c
            .summarize(true, Some(&provider), Some(&budget), &mut mem)
            .await
            .unwrap();
        assert_eq!(outcome.mode, SummaryMode::Fallback(FallbackReason::BudgetSkipped));
        assert!(outcome.usage.is_none());
    }

    #[test]
    fn parses_reply_wrapped_in_prose() {
        assert_eq!(
            parse_summary_reply("Here:\n{\"summary\": \"done\"}\nthanks").as_deref(),
            Some("done")
        );
        assert!(parse_summary_reply(r#"{"summary": "   "}"#).is_none());
    }
}
