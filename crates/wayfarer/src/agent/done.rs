//! Completion contract for the `done` tool.
//!
//! A `done` call is only terminal when both `summary` and `answer` are
//! non-empty and the answer is backed by a structural page read: a free-text
//! search hit on its own is not evidence. Empty fields are first repaired
//! from the assistant's free-form text (strict JSON, then `answer:` style
//! labeled lines). A rejected call becomes a `CONTRACT_FAILED` tool result,
//! never a hard stop.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::{DriverResponse, ErrorCode};
use crate::tools::args::{BrowserAction, DoneArgs};

static ANSWER_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?im)\banswer\**\s*[:=]\s*(.+?)\s*$").ok());

static SUMMARY_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?im)\bsummary\**\s*[:=]\s*(.+?)\s*$").ok());

// ── Evidence ───────────────────────────────────────────────────────

/// Most recent qualifying page read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    #[default]
    None,
    StructuralRead,
    TextSearch,
}

/// Page-state flags the contract is checked against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceTracker {
    pub last: Evidence,
    pub structural_reads: u32,
    pub text_searches: u32,
}

impl EvidenceTracker {
    /// Record a successful action.
    pub fn observe(&mut self, action: &BrowserAction) {
        match action {
            BrowserAction::ReadPage(_) => {
                self.last = Evidence::StructuralRead;
                self.structural_reads += 1;
            }
            BrowserAction::SearchText(_) => {
                self.last = Evidence::TextSearch;
                self.text_searches += 1;
            }
            _ => {}
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Validation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractViolation {
    EmptySummary,
    EmptyAnswer,
    SearchWithoutRead,
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ContractViolation::EmptySummary => "summary is empty",
            ContractViolation::EmptyAnswer => "answer is empty",
            ContractViolation::SearchWithoutRead => {
                "the last evidence is a text search; call read_page to confirm it before done"
            }
        })
    }
}

/// Check a `done` payload against the contract.
pub fn validate_done(args: &DoneArgs, evidence: &EvidenceTracker) -> Result<(), Vec<ContractViolation>> {
    let mut violations = Vec::new();
    if args.summary.trim().is_empty() {
        violations.push(ContractViolation::EmptySummary);
    }
    if args.answer.trim().is_empty() {
        violations.push(ContractViolation::EmptyAnswer);
    }
    if evidence.last == Evidence::TextSearch {
        violations.push(ContractViolation::SearchWithoutRead);
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Tool result for a rejected `done`.
pub fn contract_failure(violations: &[ContractViolation]) -> DriverResponse {
    let reasons: Vec<String> = violations.iter().map(ToString::to_string).collect();
    DriverResponse::failure(
        ErrorCode::ContractFailed,
        format!("done rejected: {}", reasons.join("; ")),
    )
    .with("violations", reasons)
}

// ── Repair ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairSource {
    Json,
    LabeledLine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DoneRepair {
    pub args: DoneArgs,
    pub repaired: bool,
    pub source: Option<RepairSource>,
}

/// Fill empty `summary`/`answer` fields from the assistant's free text.
///
/// Fields that are already set are never overwritten.
pub fn repair_done(args: &DoneArgs, reasoning: &str) -> DoneRepair {
    let mut out = args.clone();
    let needs = |a: &DoneArgs| a.summary.trim().is_empty() || a.answer.trim().is_empty();
    if !needs(&out) || reasoning.trim().is_empty() {
        return DoneRepair {
            args: out,
            repaired: false,
            source: None,
        };
    }

    let mut source = None;
    if let Some(obj) = first_json_object(reasoning) {
        let filled = fill_from(&mut out, field(&obj, "summary"), field(&obj, "answer"));
        if filled {
            source = Some(RepairSource::Json);
        }
    }
    if needs(&out) {
        let summary = labeled(&SUMMARY_LINE, reasoning);
        let answer = labeled(&ANSWER_LINE, reasoning);
        if fill_from(&mut out, summary, answer) && source.is_none() {
            source = Some(RepairSource::LabeledLine);
        }
    }

    DoneRepair {
        repaired: source.is_some(),
        args: out,
        source,
    }
}

fn fill_from(args: &mut DoneArgs, summary: Option<String>, answer: Option<String>) -> bool {
    let mut filled = false;
    if args.summary.trim().is_empty()
        && let Some(s) = summary
    {
        args.summary = s;
        filled = true;
    }
    if args.answer.trim().is_empty()
        && let Some(a) = answer
    {
        args.answer = a;
        filled = true;
    }
    filled
}

fn field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    let value = obj.get(key)?;
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

/// First `{...}` in `text` that parses as a JSON object with a contract field.
fn first_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    text.char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(idx, _)| text.get(idx..))
        .find_map(|rest| {
            let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
            match stream.next() {
                Some(Ok(Value::Object(map)))
                    if map.contains_key("answer") || map.contains_key("summary") =>
                {
                    Some(map)
                }
                _ => None,
            }
        })
}

fn labeled(pattern: &LazyLock<Option<Regex>>, text: &str) -> Option<String> {
    let re = pattern.as_ref()?;
    re.captures_iter(text).find_map(|cap| {
        let value = cap
            .get(1)?
            .as_str()
            .trim()
            .trim_matches(|c| matches!(c, '"' | '\'' | '*' | '`'))
            .trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}
