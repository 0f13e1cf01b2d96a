//! Loop guards, self-heal bookkeeping, and the progress watchdog.
//!
//! Guard policy is a single table, [`GUARD_TABLE`], keyed by tool name and
//! error family. The first matching row decides the repeat threshold, whether
//! a firing is soft (never terminal), recoverable (terminal only when the
//! same code keeps firing), or an extraction nudge for `done`, and whether
//! the firing triggers a self-heal re-observation.
//!
//! Every counter lives in [`GuardState`], which is serializable so that a
//! checkpoint can resume a run mid-escalation.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::driver::{ErrorCode, ErrorFamily};
use crate::tools::reflection::RecoveryTemplate;

// ── Policy table ───────────────────────────────────────────────────

/// What happens when a guard fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recoverability {
    /// Warning only. The run never fails from this guard.
    Soft,
    /// Recovery instruction; repeated activations escalate to a hard failure.
    Recover,
    /// Force an "extract first" instruction. Never terminal.
    Extraction,
}

/// One row of the guard table. `None` matches anything.
#[derive(Debug, Clone, Copy)]
pub struct GuardRule {
    pub tool: Option<&'static str>,
    pub family: Option<ErrorFamily>,
    pub threshold: u32,
    pub recoverability: Recoverability,
    pub self_heal: bool,
    pub screenshot: bool,
    pub template: RecoveryTemplate,
}

const fn rule(
    tool: Option<&'static str>,
    family: Option<ErrorFamily>,
    threshold: u32,
    recoverability: Recoverability,
    self_heal: bool,
    screenshot: bool,
    template: RecoveryTemplate,
) -> GuardRule {
    GuardRule {
        tool,
        family,
        threshold,
        recoverability,
        self_heal,
        screenshot,
        template,
    }
}

use ErrorFamily as F;
use RecoveryTemplate as T;
use Recoverability::{Extraction, Recover, Soft};

/// First match wins; the final row is the catch-all.
pub const GUARD_TABLE: &[GuardRule] = &[
    rule(Some("click"), Some(F::Target), 3, Soft, true, true, T::MissingTarget),
    rule(Some("click"), Some(F::Vanished), 3, Soft, true, false, T::Vanished),
    rule(Some("done"), Some(F::Contract), 2, Extraction, false, false, T::ExtractionFirst),
    rule(None, Some(F::Target), 3, Recover, false, false, T::MissingTarget),
    rule(None, Some(F::Vanished), 3, Recover, false, false, T::Vanished),
    rule(None, Some(F::InvalidAction), 3, Recover, false, false, T::InvalidAction),
    rule(None, Some(F::WaitTimeout), 3, Recover, false, false, T::WaitTimeout),
    rule(None, None, 3, Recover, false, false, T::Generic),
];

/// The guard rule for a failing `(tool, code)` pair.
pub fn lookup(tool: &str, code: ErrorCode) -> &'static GuardRule {
    let family = code.family();
    GUARD_TABLE
        .iter()
        .find(|r| r.tool.is_none_or(|t| t == tool) && r.family.is_none_or(|f| f == family))
        .unwrap_or(&GUARD_TABLE[GUARD_TABLE.len() - 1])
}

// ── Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Consecutive firings of the same code on a recoverable rule before the
    /// run fails.
    pub hard_fail_after_activations: u32,
    /// Self-heal re-observations allowed per run.
    pub max_self_heals: u32,
    /// Steps without progress before a warning is injected.
    pub progress_warn_steps: u32,
    /// Steps without progress before the run fails.
    pub progress_fail_steps: u32,
    /// Repaired / total `done` attempts at which fidelity is flagged.
    pub repair_warn_ratio: f64,
    /// Minimum `done` attempts before the repair ratio is considered.
    pub repair_warn_min_attempts: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            hard_fail_after_activations: 3,
            max_self_heals: 2,
            progress_warn_steps: 6,
            progress_fail_steps: 12,
            repair_warn_ratio: 0.5,
            repair_warn_min_attempts: 2,
        }
    }
}

// ── Verdicts ───────────────────────────────────────────────────────

/// Outcome of feeding one tool failure through the guards.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    /// Below threshold.
    Continue,
    /// Inject a recovery instruction and keep going.
    Recover { message: String },
    /// Re-observe the page and inject the observation.
    SelfHeal {
        attempt: u32,
        max: u32,
        screenshot: bool,
        message: String,
    },
    /// The run must stop.
    HardFail { reason: String },
}

/// Outcome of the per-step progress check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watchdog {
    Ok,
    Warn(u32),
    Fail(u32),
}

// ── State ──────────────────────────────────────────────────────────

/// Consecutive repeats of one error code on one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeatCounter {
    pub tool: Option<String>,
    pub code: Option<ErrorCode>,
    pub count: u32,
}

impl RepeatCounter {
    fn bump(&mut self, tool: &str, code: ErrorCode) -> u32 {
        if self.tool.as_deref() == Some(tool) && self.code == Some(code) {
            self.count += 1;
        } else {
            self.tool = Some(tool.to_string());
            self.code = Some(code);
            self.count = 1;
        }
        self.count
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Every loop-guard counter for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardState {
    /// Recoverable rules (any tool).
    pub generic: RepeatCounter,
    /// Soft rules on the primary interaction tool.
    pub action: RepeatCounter,
    /// Tool and code of the most recent recoverable firing, and how many
    /// times in a row it fired. Kept apart from `generic`, which is cleared on
    /// every firing.
    #[serde(default)]
    pub activation_tool: Option<String>,
    pub activation_code: Option<ErrorCode>,
    pub activation_streak: u32,
    pub self_heals: u32,
    pub done_rejections: u32,
    pub done_attempts: u32,
    pub done_repairs: u32,
    pub repair_warned: bool,
    pub steps_without_progress: u32,
    pub progress_warned: bool,
    pub consecutive_rate_limits: u32,
    pub consecutive_errors: u32,
    pub no_tool_streak: u32,
}

impl GuardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wholesale reset at run start.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// A tool call succeeded: its repeat counters start over.
    pub fn record_success(&mut self, tool: &str) {
        if self.generic.tool.as_deref() == Some(tool) {
            self.generic.clear();
        }
        if self.activation_tool.as_deref() == Some(tool) {
            self.activation_tool = None;
            self.activation_code = None;
            self.activation_streak = 0;
        }
        if self.action.tool.as_deref() == Some(tool) {
            self.action.clear();
        }
        if tool == "done" {
            self.done_rejections = 0;
        }
    }

    /// Feed a failed tool call through the guard table.
    pub fn record_failure(&mut self, tool: &str, code: ErrorCode, config: &GuardConfig) -> GuardVerdict {
        let rule = lookup(tool, code);
        let repeats = match rule.recoverability {
            Soft => self.action.bump(tool, code),
            Recover => self.generic.bump(tool, code),
            Extraction => {
                self.done_rejections += 1;
                self.done_rejections
            }
        };
        if repeats < rule.threshold {
            debug!(tool, %code, repeats, threshold = rule.threshold, "guard below threshold");
            return GuardVerdict::Continue;
        }

        let message = rule.template.render(tool, code, repeats);
        match rule.recoverability {
            Soft => {
                self.action.clear();
                if rule.self_heal && self.self_heals < config.max_self_heals {
                    self.self_heals += 1;
                    info!(tool, %code, attempt = self.self_heals, "self-heal triggered");
                    GuardVerdict::SelfHeal {
                        attempt: self.self_heals,
                        max: config.max_self_heals,
                        screenshot: rule.screenshot,
                        message,
                    }
                } else {
                    warn!(tool, %code, "soft guard fired, self-heal budget spent");
                    GuardVerdict::Recover { message }
                }
            }
            Extraction => {
                self.done_rejections = 0;
                info!(%code, "done guard: forcing extraction first");
                GuardVerdict::Recover { message }
            }
            Recover => {
                self.generic.clear();
                if self.activation_code == Some(code) && self.activation_tool.as_deref() == Some(tool) {
                    self.activation_streak += 1;
                } else {
                    self.activation_tool = Some(tool.to_string());
                    self.activation_code = Some(code);
                    self.activation_streak = 1;
                }
                if self.activation_streak >= config.hard_fail_after_activations {
                    let reason = format!(
                        "`{tool}` kept failing with {code} after {} recovery attempts",
                        self.activation_streak
                    );
                    warn!(tool, %code, "loop guard escalated to hard failure");
                    GuardVerdict::HardFail { reason }
                } else {
                    warn!(tool, %code, streak = self.activation_streak, "loop guard fired");
                    GuardVerdict::Recover { message }
                }
            }
        }
    }

    /// Count a `done` attempt. Returns the repair ratio the first time it
    /// crosses the warning threshold.
    pub fn record_done_attempt(&mut self, repaired: bool, config: &GuardConfig) -> Option<f64> {
        self.done_attempts += 1;
        if repaired {
            self.done_repairs += 1;
        }
        let ratio = f64::from(self.done_repairs) / f64::from(self.done_attempts);
        if !self.repair_warned
            && self.done_attempts >= config.repair_warn_min_attempts
            && ratio >= config.repair_warn_ratio
        {
            self.repair_warned = true;
            return Some(ratio);
        }
        None
    }

    /// Repaired share of `done` attempts so far.
    pub fn repair_ratio(&self) -> f64 {
        if self.done_attempts == 0 {
            0.0
        } else {
            f64::from(self.done_repairs) / f64::from(self.done_attempts)
        }
    }

    /// Per-step progress check.
    pub fn record_step(&mut self, progressed: bool, config: &GuardConfig) -> Watchdog {
        if progressed {
            self.steps_without_progress = 0;
            self.progress_warned = false;
            return Watchdog::Ok;
        }
        self.steps_without_progress += 1;
        let n = self.steps_without_progress;
        if n >= config.progress_fail_steps {
            Watchdog::Fail(n)
        } else if n >= config.progress_warn_steps && !self.progress_warned {
            self.progress_warned = true;
            Watchdog::Warn(n)
        } else {
            Watchdog::Ok
        }
    }

    pub fn record_rate_limit(&mut self) -> u32 {
        self.consecutive_rate_limits += 1;
        self.consecutive_rate_limits
    }

    pub fn record_provider_error(&mut self) -> u32 {
        self.consecutive_rate_limits = 0;
        self.consecutive_errors += 1;
        self.consecutive_errors
    }

    pub fn record_provider_success(&mut self) {
        self.consecutive_rate_limits = 0;
        self.consecutive_errors = 0;
    }
}
