//! Conversation window: the live message sequence sent to the model.
//!
//! The window is a protected head (system prompt, goal) followed by a body of
//! [`WindowEntry`] values. Two operations keep it inside its limits:
//!
//! - [`trim`](ConversationWindow::trim) removes whole turn groups from the
//!   front of the body until both the message ceiling and the token ratio are
//!   satisfied. The removed messages are returned as an evicted batch for the
//!   summary compressor.
//! - [`compact_heavy`](ConversationWindow::compact_heavy) replaces the content
//!   of the least important messages with short placeholders. Message indices
//!   and tool-call linkage are never touched.
//!
//! A turn group is an assistant message with tool calls, every tool result
//! that follows it, and at most one trailing vision observation. Groups are
//! never split.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::tokens::estimate_message_tokens;
use crate::{Message, MessageContent, MessageRole, truncate_chars};

const RECENCY_WEIGHT: f64 = 0.45;
const ROLE_WEIGHT: f64 = 0.35;
const SIZE_WEIGHT: f64 = 0.20;

/// Prefix of every compaction placeholder.
pub const COMPACTED_PREFIX: &str = "[compacted";

/// Tool-call arguments longer than this are shortened by compaction.
const MAX_COMPACTED_ARGUMENT_CHARS: usize = 200;

// ── Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Body message ceiling (the protected head is not counted).
    pub max_conversation_messages: usize,
    /// Share of the usable context window the whole window may occupy.
    pub context_ratio: f64,
    /// Vision messages kept in full under ordinary pressure.
    pub vision_keep: usize,
    /// Vision messages kept in full under critical pressure.
    pub vision_keep_critical: usize,
    /// Share of candidates compacted under ordinary pressure.
    pub compact_fraction: f64,
    /// Share of candidates compacted under critical pressure.
    pub compact_fraction_critical: f64,
    /// Plain messages smaller than this are never compaction candidates.
    pub min_compact_chars: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_conversation_messages: 40,
            context_ratio: 0.75,
            vision_keep: 2,
            vision_keep_critical: 1,
            compact_fraction: 0.35,
            compact_fraction_critical: 0.80,
            min_compact_chars: 400,
        }
    }
}

/// How aggressively [`ConversationWindow::compact_heavy`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionLevel {
    Ordinary,
    Critical,
}

// ── Entries ────────────────────────────────────────────────────────

/// A body message plus its bookkeeping.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WindowEntry {
    pub message: Message,
    /// Step that produced the message, when known.
    pub step: Option<u32>,
    /// Set once the content has been replaced by a placeholder.
    pub compacted: bool,
    /// Character size before any compaction.
    pub original_chars: usize,
    /// Whether the original message carried an image.
    pub vision: bool,
}

impl WindowEntry {
    pub fn new(message: Message, step: Option<u32>) -> Self {
        let original_chars = message.char_len();
        let vision = message.is_vision();
        Self {
            message,
            step,
            compacted: false,
            original_chars,
            vision,
        }
    }
}

/// A message removed by trimming.
#[derive(Debug, Clone)]
pub struct EvictedMessage {
    pub message: Message,
    pub step: Option<u32>,
}

/// What a compaction pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionReport {
    pub compacted: usize,
    pub freed_chars: usize,
    /// Captions of vision messages reduced to text, with their step.
    pub vision_captions: Vec<(Option<u32>, String)>,
}

impl CompactionReport {
    pub fn is_noop(&self) -> bool {
        self.compacted == 0 && self.vision_captions.is_empty()
    }
}

/// Side effects of [`ConversationWindow::append`].
#[derive(Debug, Clone, Default)]
pub struct AppendOutcome {
    /// Evicted batch, empty when nothing was trimmed.
    pub evicted: Vec<EvictedMessage>,
    pub compaction: CompactionReport,
}

// ── Window ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationWindow {
    #[serde(skip)]
    config: WindowConfig,
    /// Usable window tokens; the ratio ceiling applies to this.
    token_budget: u32,
    head: Vec<Message>,
    body: Vec<WindowEntry>,
}

impl ConversationWindow {
    pub fn new(config: WindowConfig, token_budget: u32) -> Self {
        Self {
            config,
            token_budget,
            head: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Reattach a config after deserializing a snapshot.
    pub fn with_config(mut self, config: WindowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn set_token_budget(&mut self, tokens: u32) {
        self.token_budget = tokens;
    }

    /// Replace the protected head.
    pub fn set_head(&mut self, head: Vec<Message>) {
        self.head = head;
    }

    pub fn head(&self) -> &[Message] {
        &self.head
    }

    pub fn body(&self) -> &[WindowEntry] {
        &self.body
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Drop the body, keeping the head.
    pub fn clear_body(&mut self) {
        self.body.clear();
    }

    /// Head followed by body, as sent to the model.
    pub fn to_messages(&self) -> Vec<Message> {
        self.head
            .iter()
            .cloned()
            .chain(self.body.iter().map(|e| e.message.clone()))
            .collect()
    }

    /// Head, then `extra` system messages, then body.
    pub fn to_messages_with(&self, extra: impl IntoIterator<Item = Message>) -> Vec<Message> {
        self.head
            .iter()
            .cloned()
            .chain(extra)
            .chain(self.body.iter().map(|e| e.message.clone()))
            .collect()
    }

    /// Estimated tokens of head plus body.
    pub fn estimated_tokens(&self) -> u32 {
        estimate_message_tokens(&self.head)
            + self
                .body
                .iter()
                .map(|e| super::tokens::estimate_single_message_tokens(&e.message))
                .sum::<u32>()
    }

    fn token_ceiling(&self) -> u32 {
        (f64::from(self.token_budget) * self.config.context_ratio) as u32
    }

    /// Most recent assistant text in the body, for salvage.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.body
            .iter()
            .rev()
            .filter(|e| e.message.role == MessageRole::Assistant && !e.compacted)
            .map(|e| e.message.text())
            .find(|t| !t.trim().is_empty())
    }

    /// Push a message, compact if the token ceiling is exceeded, then trim.
    pub fn append(&mut self, message: Message, step: Option<u32>) -> AppendOutcome {
        self.body.push(WindowEntry::new(message, step));
        let compaction = if self.estimated_tokens() > self.token_ceiling() {
            self.compact_heavy(CompactionLevel::Ordinary)
        } else {
            CompactionReport::default()
        };
        AppendOutcome {
            evicted: self.trim(),
            compaction,
        }
    }

    /// Remove leading turn groups until the body fits both ceilings.
    ///
    /// The last group is never removed, so a single oversized group can leave
    /// the window above its token ceiling.
    pub fn trim(&mut self) -> Vec<EvictedMessage> {
        let groups = turn_groups(&self.body);
        let ceiling = self.token_ceiling();
        let mut tokens = self.estimated_tokens();
        let mut remaining = self.body.len();
        let mut cut = 0;

        for (start, end) in groups.iter().take(groups.len().saturating_sub(1)) {
            if remaining <= self.config.max_conversation_messages && tokens <= ceiling {
                break;
            }
            let group_tokens: u32 = self.body[*start..*end]
                .iter()
                .map(|e| super::tokens::estimate_single_message_tokens(&e.message))
                .sum();
            tokens = tokens.saturating_sub(group_tokens);
            remaining -= end - start;
            cut = *end;
        }

        if cut == 0 {
            return Vec::new();
        }
        debug!(
            "Window trim: evicting {} message(s), {} remain",
            cut,
            self.body.len() - cut
        );
        self.body
            .drain(..cut)
            .map(|e| EvictedMessage {
                message: e.message,
                step: e.step,
            })
            .collect()
    }

    /// Replace the lowest-importance content with placeholders.
    ///
    /// Selection is computed over every candidate, compacted or not, using
    /// original sizes, so re-running at the same level changes nothing.
    pub fn compact_heavy(&mut self, level: CompactionLevel) -> CompactionReport {
        let mut report = CompactionReport::default();
        self.retain_recent_vision(level, &mut report);

        let groups = turn_groups(&self.body);
        let protected_from = groups.last().map_or(self.body.len(), |(start, _)| *start);
        let candidates: Vec<usize> = (0..protected_from)
            .filter(|&i| self.is_candidate(i))
            .collect();
        if candidates.is_empty() {
            return report;
        }

        let max_size = candidates
            .iter()
            .map(|&i| self.body[i].original_chars)
            .max()
            .unwrap_or(1)
            .max(1);
        let denom = (candidates.len().saturating_sub(1)).max(1) as f64;
        let mut scored: Vec<(f64, usize)> = candidates
            .iter()
            .enumerate()
            .map(|(rank, &i)| {
                let entry = &self.body[i];
                let recency = if candidates.len() == 1 {
                    1.0
                } else {
                    rank as f64 / denom
                };
                let size = entry.original_chars as f64 / max_size as f64;
                let importance = RECENCY_WEIGHT * recency
                    + ROLE_WEIGHT * role_weight(entry)
                    + SIZE_WEIGHT * size;
                (importance, i)
            })
            .collect();
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let fraction = match level {
            CompactionLevel::Ordinary => self.config.compact_fraction,
            CompactionLevel::Critical => self.config.compact_fraction_critical,
        };
        let take = ((scored.len() as f64) * fraction).round() as usize;
        for &(_, idx) in scored.iter().take(take) {
            if self.body[idx].compacted {
                continue;
            }
            let before = self.body[idx].message.char_len();
            if let Some(caption) = self.compact_entry(idx) {
                report.vision_captions.push((self.body[idx].step, caption));
            }
            let after = self.body[idx].message.char_len();
            report.compacted += 1;
            report.freed_chars += before.saturating_sub(after);
        }

        if !report.is_noop() {
            info!(
                "Window compaction ({:?}): {} message(s), {} chars freed",
                level, report.compacted, report.freed_chars
            );
        }
        report
    }

    /// Keep only the most recent K vision messages in full.
    fn retain_recent_vision(&mut self, level: CompactionLevel, report: &mut CompactionReport) {
        let keep = match level {
            CompactionLevel::Ordinary => self.config.vision_keep,
            CompactionLevel::Critical => self.config.vision_keep_critical,
        };
        let vision: Vec<usize> = (0..self.body.len())
            .filter(|&i| self.body[i].vision && !self.body[i].compacted)
            .collect();
        let drop = vision.len().saturating_sub(keep);
        for &idx in vision.iter().take(drop) {
            let before = self.body[idx].message.char_len();
            if let Some(caption) = self.compact_entry(idx) {
                report.vision_captions.push((self.body[idx].step, caption));
            }
            report.compacted += 1;
            report.freed_chars += before.saturating_sub(self.body[idx].message.char_len());
        }
    }

    fn is_candidate(&self, idx: usize) -> bool {
        let entry = &self.body[idx];
        let msg = &entry.message;
        // Screenshots still in full are the retained most recent ones.
        if entry.vision {
            return entry.compacted;
        }
        match msg.role {
            MessageRole::Tool => true,
            MessageRole::Assistant if msg.has_tool_calls() => true,
            MessageRole::System => false,
            _ => entry.original_chars >= self.config.min_compact_chars,
        }
    }

    /// Replace one entry's content. Returns the caption for vision entries.
    fn compact_entry(&mut self, idx: usize) -> Option<String> {
        let tool_name = self.body[idx]
            .message
            .tool_call_id
            .as_deref()
            .and_then(|id| self.tool_name_for(idx, id));
        let entry = &mut self.body[idx];
        if entry.compacted {
            return None;
        }
        entry.compacted = true;
        let msg = &mut entry.message;
        let original = entry.original_chars;

        if msg.is_vision() {
            let caption = msg.text();
            msg.content = Some(MessageContent::Text(format!(
                "{COMPACTED_PREFIX} screenshot; caption: {caption}]"
            )));
            return Some(caption);
        }

        match msg.role {
            MessageRole::Tool => {
                let name = tool_name.unwrap_or_else(|| "the tool".to_string());
                msg.content = Some(MessageContent::Text(format!(
                    "{COMPACTED_PREFIX} {name} result, {original} chars removed; call {name} again to re-fetch]"
                )));
            }
            MessageRole::Assistant => {
                if let Some(content) = &msg.content {
                    let text = content.text();
                    if !text.is_empty() {
                        msg.content = Some(MessageContent::Text(format!(
                            "{COMPACTED_PREFIX} reasoning: {}…]",
                            truncate_chars(&text, 80)
                        )));
                    }
                }
                for call in msg.tool_calls.iter_mut().flatten() {
                    if let Some(short) = compact_arguments(&call.function.arguments) {
                        call.function.arguments = short;
                    }
                }
            }
            role => {
                let text = msg.text();
                msg.content = Some(MessageContent::Text(format!(
                    "{COMPACTED_PREFIX} {role} message, {original} chars: {}…]",
                    truncate_chars(&text, 80)
                )));
            }
        }
        None
    }

    /// Name of the tool whose call produced `call_id`, searching backwards.
    fn tool_name_for(&self, idx: usize, call_id: &str) -> Option<String> {
        self.body[..idx].iter().rev().find_map(|e| {
            e.message.tool_calls.as_ref().and_then(|calls| {
                calls
                    .iter()
                    .find(|c| c.id == call_id)
                    .map(|c| c.function.name.clone())
            })
        })
    }
}

/// Shortened stand-in for a large arguments payload, still valid JSON so the
/// call can be replayed to the provider.
fn compact_arguments(arguments: &str) -> Option<String> {
    let chars = arguments.chars().count();
    if chars <= MAX_COMPACTED_ARGUMENT_CHARS {
        return None;
    }
    Some(
        json!({
            "compacted": format!("{}…", truncate_chars(arguments, 80)),
            "original_chars": chars,
        })
        .to_string(),
    )
}

fn role_weight(entry: &WindowEntry) -> f64 {
    let msg = &entry.message;
    if msg.role == MessageRole::Tool {
        1.0
    } else if msg.has_tool_calls() {
        0.75
    } else if entry.vision {
        0.5
    } else {
        0.25
    }
}

/// Half-open `(start, end)` ranges of turn groups in `entries`.
pub fn turn_groups(entries: &[WindowEntry]) -> Vec<(usize, usize)> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let start = i;
        i += 1;
        if entries[start].message.has_tool_calls() {
            while i < entries.len() && entries[i].message.role == MessageRole::Tool {
                i += 1;
            }
            if i < entries.len() && entries[i].message.is_vision() {
                i += 1;
            }
        }
        groups.push((start, i));
    }
    groups
}

/// Whether every tool result follows an assistant call with its id, without
/// another assistant message in between.
pub fn check_turn_integrity(messages: &[Message]) -> bool {
    let mut open: Vec<String> = Vec::new();
    for msg in messages {
        match msg.role {
            MessageRole::Assistant => {
                open = msg
                    .tool_calls
                    .as_ref()
                    .map(|calls| calls.iter().map(|c| c.id.clone()).collect())
                    .unwrap_or_default();
            }
            MessageRole::Tool => {
                let Some(id) = msg.tool_call_id.as_deref() else {
                    return false;
                };
                let Some(pos) = open.iter().position(|o| o == id) else {
                    return false;
                };
                open.remove(pos);
            }
            _ => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;

    fn window(max: usize) -> ConversationWindow {
        let mut w = ConversationWindow::new(
            WindowConfig {
                max_conversation_messages: max,
                ..Default::default()
            },
            1_000_000,
        );
        w.set_head(vec![Message::system("You are a browser agent."), Message::user("Goal: find the price")]);
        w
    }

    fn push_tool_turn(w: &mut ConversationWindow, step: u32, calls: usize, result_chars: usize) -> Vec<EvictedMessage> {
        let tool_calls: Vec<ToolCall> = (0..calls)
            .map(|c| ToolCall::new(format!("s{step}c{c}"), "read_page", "{}"))
            .collect();
        let mut evicted = w
            .append(Message::assistant_tool_calls(Some(format!("step {step}")), tool_calls), Some(step))
            .evicted;
        for c in 0..calls {
            evicted.extend(
                w.append(
                    Message::tool_result(format!("s{step}c{c}"), "r".repeat(result_chars)),
                    Some(step),
                )
                .evicted,
            );
        }
        evicted
    }

    #[test]
    fn forty_text_turns_leave_head_plus_ceiling() {
        let mut w = window(28);
        let mut evicted = Vec::new();
        for i in 0..40 {
            evicted.extend(w.append(Message::user(format!("turn {i}")), Some(i)).evicted);
        }
        assert_eq!(w.head().len(), 2);
        assert_eq!(w.body_len(), 28);
        assert_eq!(evicted.len(), 12);
        assert_eq!(evicted[0].message.text(), "turn 0");
        assert_eq!(w.body()[0].message.text(), "turn 12");
    }

    #[test]
    fn groups_are_never_split() {
        let mut w = window(7);
        for step in 0..10 {
            push_tool_turn(&mut w, step, 3, 20);
            assert!(check_turn_integrity(&w.to_messages()), "step {step}");
            assert!(w.body_len() <= 7);
        }
        // Every retained group is whole: 4 messages each.
        assert_eq!(w.body_len() % 4, 0);
    }

    #[test]
    fn last_group_survives_even_when_oversized() {
        let mut w = window(2);
        push_tool_turn(&mut w, 0, 4, 10);
        assert_eq!(w.body_len(), 5);
        assert!(check_turn_integrity(&w.to_messages()));
    }

    #[test]
    fn token_ceiling_trims() {
        let mut w = ConversationWindow::new(WindowConfig::default(), 2_000);
        for i in 0..30 {
            w.append(Message::user(format!("{i} {}", "y".repeat(300))), Some(i));
        }
        assert!(w.estimated_tokens() <= 1_500);
    }

    #[test]
    fn vision_group_is_one_unit() {
        let entries: Vec<WindowEntry> = vec![
            Message::assistant_tool_calls(None, vec![ToolCall::new("a", "screenshot", "{}")]),
            Message::tool_result("a", "ok"),
            Message::vision("shot", "data:image/png;base64,AA"),
            Message::user("next"),
        ]
        .into_iter()
        .map(|m| WindowEntry::new(m, None))
        .collect();
        assert_eq!(turn_groups(&entries), vec![(0, 3), (3, 4)]);
    }

    #[test]
    fn compaction_keeps_indices_and_linkage() {
        let mut w = window(100);
        for step in 0..6 {
            push_tool_turn(&mut w, step, 1, 2_000);
        }
        let before = w.body_len();
        let report = w.compact_heavy(CompactionLevel::Critical);
        assert!(report.compacted > 0);
        assert!(report.freed_chars > 0);
        assert_eq!(w.body_len(), before);
        assert!(check_turn_integrity(&w.to_messages()));

        let compacted_tool = w
            .body()
            .iter()
            .find(|e| e.compacted && e.message.role == MessageRole::Tool)
            .unwrap();
        assert!(compacted_tool.message.text().starts_with(COMPACTED_PREFIX));
        assert!(compacted_tool.message.text().contains("read_page"));
        assert!(compacted_tool.message.tool_call_id.is_some());
    }

    #[test]
    fn compaction_is_idempotent() {
        let mut w = window(100);
        for step in 0..6 {
            push_tool_turn(&mut w, step, 1, 1_500);
        }
        w.compact_heavy(CompactionLevel::Ordinary);
        let snapshot: Vec<String> = w.body().iter().map(|e| e.message.text()).collect();
        let second = w.compact_heavy(CompactionLevel::Ordinary);
        assert!(second.is_noop());
        let after: Vec<String> = w.body().iter().map(|e| e.message.text()).collect();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn latest_group_is_never_compacted() {
        let mut w = window(100);
        for step in 0..4 {
            push_tool_turn(&mut w, step, 1, 1_000);
        }
        w.compact_heavy(CompactionLevel::Critical);
        let last = w.body().last().unwrap();
        assert!(!last.compacted);
        assert_eq!(last.message.text().len(), 1_000);
    }

    #[test]
    fn old_vision_reduced_to_caption() {
        let mut w = window(100);
        for i in 0..4 {
            w.append(Message::vision(format!("screenshot {i}"), "data:image/png;base64,AA"), Some(i));
            w.append(Message::user(format!("note {i}")), Some(i));
        }
        let report = w.compact_heavy(CompactionLevel::Ordinary);
        let captions: Vec<&str> = report.vision_captions.iter().map(|(_, c)| c.as_str()).collect();
        assert_eq!(captions, vec!["screenshot 0", "screenshot 1"]);
        let full = w.body().iter().filter(|e| e.message.is_vision()).count();
        assert_eq!(full, 2);

        let critical = w.compact_heavy(CompactionLevel::Critical);
        assert_eq!(critical.vision_captions.len(), 1);
        assert_eq!(w.body().iter().filter(|e| e.message.is_vision()).count(), 1);
    }

    #[test]
    fn integrity_check_detects_orphans() {
        let ok = vec![
            Message::assistant_tool_calls(None, vec![ToolCall::new("x", "click", "{}")]),
            Message::tool_result("x", "done"),
        ];
        assert!(check_turn_integrity(&ok));
        let orphan = vec![Message::user("hi"), Message::tool_result("x", "done")];
        assert!(!check_turn_integrity(&orphan));
        let interrupted = vec![
            Message::assistant_tool_calls(None, vec![ToolCall::new("x", "click", "{}")]),
            Message::assistant_text("thinking"),
            Message::tool_result("x", "done"),
        ];
        assert!(!check_turn_integrity(&interrupted));
    }

    #[test]
    fn last_assistant_text_skips_compacted() {
        let mut w = window(100);
        w.append(Message::assistant_text("answer: 42"), Some(1));
        w.append(Message::user("ok"), Some(2));
        assert_eq!(w.last_assistant_text().as_deref(), Some("answer: 42"));
    }

    #[test]
    fn compaction_shortens_large_call_arguments() {
        let mut w = window(100);
        let text = "lorem ipsum ".repeat(500);
        let args = serde_json::json!({"id": 4, "text": text}).to_string();
        w.append(
            Message::assistant_tool_calls(None, vec![ToolCall::new("t1", "type_text", args.clone())]),
            Some(1),
        );
        w.append(Message::tool_result("t1", "typed"), Some(1));
        push_tool_turn(&mut w, 2, 1, 10);

        let before = w.estimated_tokens();
        let report = w.compact_heavy(CompactionLevel::Critical);
        assert!(report.freed_chars >= args.len() - MAX_COMPACTED_ARGUMENT_CHARS);
        assert!(w.estimated_tokens() < before);

        let call = &w.body()[0].message.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "t1");
        assert!(call.function.arguments.chars().count() < MAX_COMPACTED_ARGUMENT_CHARS);
        let parsed: serde_json::Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert_eq!(parsed["original_chars"], args.chars().count());
        assert!(check_turn_integrity(&w.to_messages()));
    }

    #[test]
    fn small_call_arguments_survive_compaction() {
        assert_eq!(compact_arguments(r#"{"id": 3}"#), None);
    }
}
