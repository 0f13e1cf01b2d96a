//! Run-level token budget and the pre-call admission gate.
//!
//! [`BudgetState`] is recomputed every step from provider-reported usage and a
//! live estimate of the pending request. [`BudgetState::precheck`] refuses a
//! model call whose projected cost exceeds the remaining allowance: optional
//! work (summarization) gets a silent skip, the main loop gets a terminal
//! result that carries whatever partial answer could be salvaged.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::tokens::{estimate_request_tokens, estimate_tool_schema_tokens};
use crate::api::provider::ChatOptions;
use crate::{Message, ToolDef, UsageInfo};

/// Pressure ratio at which a one-time warning is emitted.
pub const WARNING_PRESSURE: f64 = 0.80;
/// Pressure ratio at which auto-compaction runs.
pub const CRITICAL_PRESSURE: f64 = 0.90;

/// Budget limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Total tokens the run may consume across all model calls.
    pub token_limit: u64,
    /// Context window assumed when the provider does not advertise one.
    pub context_window_tokens: u32,
    /// Tokens held back from the window for the reply.
    pub reserved_output_tokens: u32,
    /// Minimum steps between two pressure-triggered compactions.
    pub compact_cooldown_steps: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            token_limit: 2_000_000,
            context_window_tokens: 128_000,
            reserved_output_tokens: 4_096,
            compact_cooldown_steps: 3,
        }
    }
}

/// What to do when a request does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecheckPolicy {
    /// Caller abandons optional work quietly.
    Skip,
    /// Caller ends the run with an insufficient-budget result.
    Terminal,
}

/// Terminal result synthesized when the main loop runs out of budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsufficientBudget {
    pub reason: String,
    pub partial_answer: Option<String>,
}

/// Outcome of a budget precheck.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecheckOutcome {
    pub ok: bool,
    pub skipped: bool,
    pub estimated: u64,
    pub remaining: u64,
    pub terminal: Option<InsufficientBudget>,
}

/// Admission decision for a request of `estimated` tokens.
pub fn precheck_budget(
    remaining: u64,
    estimated: u64,
    policy: PrecheckPolicy,
    partial_answer: Option<&str>,
) -> PrecheckOutcome {
    if estimated <= remaining {
        return PrecheckOutcome {
            ok: true,
            skipped: false,
            estimated,
            remaining,
            terminal: None,
        };
    }
    match policy {
        PrecheckPolicy::Skip => {
            debug!("Budget precheck: skipping optional call ({estimated} > {remaining})");
            PrecheckOutcome {
                ok: false,
                skipped: true,
                estimated,
                remaining,
                terminal: None,
            }
        }
        PrecheckPolicy::Terminal => {
            warn!("Budget precheck: insufficient budget ({estimated} > {remaining})");
            PrecheckOutcome {
                ok: false,
                skipped: false,
                estimated,
                remaining,
                terminal: Some(InsufficientBudget {
                    reason: format!(
                        "insufficient token budget: next request needs ~{estimated} tokens, \
                         {remaining} remain"
                    ),
                    partial_answer: partial_answer
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                }),
            }
        }
    }
}

/// Budget accounting for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    pub token_limit: u64,
    pub used_tokens: u64,
    pub context_window_tokens: u32,
    pub reserved_output_tokens: u32,
    /// 0 normal, 1 warning, 2 critical.
    pub pressure_level: u8,
}

impl BudgetState {
    /// Fresh state; the provider's advertised window wins over the config.
    pub fn new(config: &BudgetConfig, advertised_window: Option<u32>) -> Self {
        Self {
            token_limit: config.token_limit,
            used_tokens: 0,
            context_window_tokens: advertised_window.unwrap_or(config.context_window_tokens),
            reserved_output_tokens: config.reserved_output_tokens,
            pressure_level: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.token_limit.saturating_sub(self.used_tokens)
    }

    /// Record provider-reported usage for a completed call.
    pub fn record_usage(&mut self, usage: &UsageInfo) {
        self.used_tokens += u64::from(usage.total());
    }

    /// Window tokens available to the prompt after the output reserve.
    pub fn usable_window(&self) -> u32 {
        self.context_window_tokens
            .saturating_sub(self.reserved_output_tokens)
            .max(1)
    }

    /// Recompute pressure from a projected request size against the full
    /// context window. Returns the ratio.
    pub fn update_pressure(&mut self, projected_tokens: u32) -> f64 {
        let ratio = f64::from(projected_tokens) / f64::from(self.context_window_tokens.max(1));
        self.pressure_level = if ratio >= CRITICAL_PRESSURE {
            2
        } else if ratio >= WARNING_PRESSURE {
            1
        } else {
            0
        };
        ratio
    }

    /// Pressure of the request about to be sent: messages, tool schemas, and
    /// expected output.
    pub fn request_pressure(&mut self, messages: &[Message], tools: &[ToolDef], options: &ChatOptions) -> f64 {
        let projected = estimate_request_tokens(messages, tools, options, Some(self.context_window_tokens));
        self.update_pressure(projected)
    }

    /// Admission control for a model call.
    pub fn precheck(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        options: &ChatOptions,
        policy: PrecheckPolicy,
        partial_answer: Option<&str>,
    ) -> PrecheckOutcome {
        let estimated = u64::from(estimate_request_tokens(
            messages,
            tools,
            options,
            Some(self.context_window_tokens),
        ));
        precheck_budget(self.remaining(), estimated, policy, partial_answer)
    }

    /// Token cost of the tool schemas alone; useful for logging.
    pub fn schema_overhead(tools: &[ToolDef]) -> u32 {
        estimate_tool_schema_tokens(tools)
    }
}
