//! Recovery instructions fed back to the model.
//!
//! Loop guards pick a [`RecoveryTemplate`] from their policy table; this
//! module turns it into the text injected into the conversation.

use serde::{Deserialize, Serialize};

use crate::driver::ErrorCode;
use crate::truncate_chars;

/// Which recovery instruction a guard emits when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTemplate {
    /// The target id is unknown or not interactable.
    MissingTarget,
    /// The element detached between observation and action.
    Vanished,
    /// The action does not apply to the element or page.
    InvalidAction,
    /// A wait expired.
    WaitTimeout,
    /// Any other repeating error.
    Generic,
    /// Repeated `done` rejections: extract the answer before finishing.
    ExtractionFirst,
}

impl RecoveryTemplate {
    pub fn render(&self, tool: &str, code: ErrorCode, repeats: u32) -> String {
        let head = format!("[loop guard] `{tool}` failed {repeats} times in a row with {code}.");
        let body = match self {
            RecoveryTemplate::MissingTarget => {
                "The element id you are using does not exist on the current page. Ids change \
                 whenever the page re-renders. Call read_page or find_element to get fresh ids \
                 and pick a different target."
            }
            RecoveryTemplate::Vanished => {
                "The element disappeared before the action landed, usually because the page is \
                 still updating. Wait for the content you need with wait_for, read the page \
                 again, then retry with the new id."
            }
            RecoveryTemplate::InvalidAction => {
                "This action is not possible on that element. Check the element role in the \
                 last page read and choose a matching tool (type_text for inputs, select_option \
                 for selects, click for buttons and links)."
            }
            RecoveryTemplate::WaitTimeout => {
                "The condition you are waiting for never became true. Do not wait for it again. \
                 Read the page to see what actually loaded, or navigate elsewhere."
            }
            RecoveryTemplate::Generic => {
                "Repeating the same call will not help. Step back, re-read the page, and try a \
                 different approach."
            }
            RecoveryTemplate::ExtractionFirst => {
                "Your completion was rejected again. Before calling done, extract the answer: \
                 call read_page or get_text on the page that holds it, quote the exact value, \
                 then call done with both summary and answer filled in."
            }
        };
        format!("{head}\n{body}")
    }
}

/// Header for a re-observation injected by self-heal.
pub fn self_heal_note(tool: &str, code: ErrorCode, attempt: u32, max: u32) -> String {
    format!(
        "[self-heal {attempt}/{max}] `{tool}` keeps failing with {code}. The page was read again \
         below. Use only ids from this observation."
    )
}

/// Caption for the screenshot attached to a target-identification self-heal.
pub fn screenshot_hint() -> &'static str {
    "[self-heal] Screenshot of the current viewport. Locate the element visually, then use \
     find_element or click by x/y coordinates."
}

/// Instruction after the model answered without calling a tool.
pub fn tool_required_note(offered: &[&str]) -> String {
    format!(
        "You must respond by calling exactly one tool. Plain text replies are ignored. \
         Available now: {}.",
        offered.join(", ")
    )
}

/// Note after a generic provider error that the run tolerates.
pub fn provider_error_note(error: &str) -> String {
    format!(
        "[system] The previous model request failed ({}). Try a different approach.",
        truncate_chars(error, 200)
    )
}

/// Tool result for calls dropped because an earlier call navigated.
pub fn aborted_by_navigation(tool: &str) -> String {
    format!(
        "Not executed: an earlier action in this turn navigated to a new page, so `{tool}` was \
         planned against stale state. Read the new page first."
    )
}

/// Progress watchdog warning.
pub fn no_progress_note(steps: u32) -> String {
    format!(
        "[watchdog] {steps} steps without progress. No navigation, successful interaction, or \
         new information. Change strategy or call fail if the goal is unreachable."
    )
}

/// Context pressure warning, shown once per run.
pub fn pressure_note(ratio: f64) -> String {
    format!(
        "[context] The conversation is at {:.0}% of the context window. Older turns will be \
         compacted. Keep important facts in scratch memory with remember.",
        ratio * 100.0
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_name_tool_and_code() {
        let text = RecoveryTemplate::MissingTarget.render("click", ErrorCode::TargetMissing, 3);
        assert!(text.starts_with("[loop guard] `click` failed 3 times"));
        assert!(text.contains("MISSING_TARGET"));
        assert!(text.contains("read_page"));
    }

    #[test]
    fn extraction_first_mentions_done() {
        let text = RecoveryTemplate::ExtractionFirst.render("done", ErrorCode::ContractFailed, 2);
        assert!(text.contains("CONTRACT_FAILED"));
        assert!(text.contains("call done"));
    }

    #[test]
    fn helper_notes() {
        assert!(tool_required_note(&["navigate", "fail"]).ends_with("navigate, fail."));
        assert!(provider_error_note(&"x".repeat(500)).len() < 300);
        assert!(aborted_by_navigation("type_text").contains("`type_text`"));
        assert!(pressure_note(0.83).contains("83%"));
    }
}
