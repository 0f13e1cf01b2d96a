//! Working state of the task, rendered into the per-turn task-state message.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::context::retrieval::RetrievalHit;
use crate::context::retrieval::format_hits;
use crate::truncate_chars;

/// Recent action descriptions kept for the recall query and the prompt.
const HISTORY_LEN: usize = 8;
/// Actions that feed the recall query.
const QUERY_HISTORY: usize = 3;
const HISTORY_ENTRY_CHARS: usize = 160;
/// Facts and unknowns kept; the oldest drop first.
const MAX_FACTS: usize = 16;
const MAX_UNKNOWNS: usize = 12;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub goal: String,
    pub facts: Vec<String>,
    pub unknowns: Vec<String>,
    /// Scratch memory written by the `remember` tool.
    pub scratch: BTreeMap<String, String>,
    pub history: VecDeque<String>,
    /// Approved plan, if any.
    pub plan: Vec<String>,
    /// Last known page URL.
    pub url: Option<String>,
}

impl TaskState {
    /// A goal asking several questions starts with each one as an unknown.
    pub fn new(goal: impl Into<String>) -> Self {
        let goal = goal.into();
        Self {
            unknowns: goal_questions(&goal),
            goal,
            ..Default::default()
        }
    }

    /// Record a one-line action description.
    pub fn push_history(&mut self, entry: &str) {
        self.history
            .push_back(truncate_chars(entry, HISTORY_ENTRY_CHARS).to_string());
        while self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }
    }

    /// Store a scratch value. Returns true when the value is new or changed.
    pub fn remember(&mut self, key: &str, value: &str) -> bool {
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        if self.scratch.get(&key) == Some(&value) {
            return false;
        }
        self.scratch.insert(key, value);
        true
    }

    /// Store a scratch value as a known fact. Unknowns naming the key are
    /// resolved. Returns true when the value is new or changed.
    pub fn learn(&mut self, key: &str, value: &str) -> bool {
        if !self.remember(key, value) {
            return false;
        }
        let key = key.trim();
        let prefix = format!("{key}: ");
        self.facts.retain(|f| !f.starts_with(&prefix));
        self.add_fact(format!("{prefix}{}", value.trim()));
        self.resolve_unknowns(key);
        true
    }

    pub fn add_fact(&mut self, fact: impl Into<String>) {
        push_bounded(&mut self.facts, fact.into(), MAX_FACTS);
    }

    pub fn add_unknown(&mut self, unknown: impl Into<String>) {
        push_bounded(&mut self.unknowns, unknown.into(), MAX_UNKNOWNS);
    }

    /// Drop every unknown mentioning `topic` (case-insensitive). Returns how
    /// many were dropped.
    pub fn resolve_unknowns(&mut self, topic: &str) -> usize {
        let topic = topic.trim().to_lowercase();
        if topic.is_empty() {
            return 0;
        }
        let before = self.unknowns.len();
        self.unknowns.retain(|u| !u.to_lowercase().contains(&topic));
        before - self.unknowns.len()
    }

    /// Query text for retrieval: goal, facts, unknowns, scratch keys, and the
    /// last few actions.
    pub fn recall_query(&self) -> String {
        let mut parts: Vec<&str> = vec![self.goal.as_str()];
        parts.extend(self.facts.iter().map(String::as_str));
        parts.extend(self.unknowns.iter().map(String::as_str));
        parts.extend(self.scratch.keys().map(String::as_str));
        let skip = self.history.len().saturating_sub(QUERY_HISTORY);
        parts.extend(self.history.iter().skip(skip).map(String::as_str));
        parts
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The synthetic system message sent before the conversation body.
    pub fn render(&self, running_summary: &str, recall: &[RetrievalHit], recall_chars: usize) -> String {
        let mut out = format!("## Task state\nGoal: {}\n", self.goal);
        if let Some(url) = &self.url {
            out.push_str(&format!("Current page: {url}\n"));
        }
        if !self.plan.is_empty() {
            out.push_str("\nApproved plan:\n");
            for (i, step) in self.plan.iter().enumerate() {
                out.push_str(&format!("{}. {step}\n", i + 1));
            }
        }
        if !self.facts.is_empty() {
            out.push_str("\nKnown facts:\n");
            for fact in &self.facts {
                out.push_str(&format!("- {fact}\n"));
            }
        }
        if !self.unknowns.is_empty() {
            out.push_str("\nStill unknown:\n");
            for unknown in &self.unknowns {
                out.push_str(&format!("- {unknown}\n"));
            }
        }
        if !self.scratch.is_empty() {
            out.push_str("\nScratch memory:\n");
            for (key, value) in &self.scratch {
                out.push_str(&format!("- {key}: {value}\n"));
            }
        }
        if !self.history.is_empty() {
            out.push_str("\nRecent actions:\n");
            for entry in &self.history {
                out.push_str(&format!("- {entry}\n"));
            }
        }
        if !running_summary.trim().is_empty() {
            out.push_str("\nEarlier in this run:\n");
            out.push_str(running_summary.trim());
            out.push('\n');
        }
        if !recall.is_empty() {
            out.push_str("\nRecalled from earlier steps:\n");
            out.push_str(&format_hits(recall, recall_chars));
            out.push('\n');
        }
        out
    }
}

fn push_bounded(items: &mut Vec<String>, item: String, max: usize) {
    if item.trim().is_empty() || items.contains(&item) {
        return;
    }
    items.push(item);
    if items.len() > max {
        items.drain(..items.len() - max);
    }
}

/// Separate questions of a multi-question goal.
fn goal_questions(goal: &str) -> Vec<String> {
    let questions: Vec<String> = goal
        .split_inclusive('?')
        .map(str::trim)
        .filter(|q| q.len() > 1 && q.ends_with('?'))
        .map(String::from)
        .collect();
    if questions.len() >= 2 { questions } else { Vec::new() }
}
