//! Per-step tool execution.
//!
//! Called by [`Orchestrator`](super::orchestrator::Orchestrator) once the
//! model has returned tool calls. Calls run strictly in received order: a
//! later call may depend on page state produced by an earlier one. After each
//! failing call the loop guards run, possibly scheduling a self-heal. A call
//! that navigates (or changes the page under it) short-circuits the rest of
//! the batch with an `ABORTED_BY_NAVIGATION` result per remaining call.
//!
//! Recovery notes, self-heal observations and screenshots are collected while
//! the batch runs and appended only after the last tool result, so the turn
//! group stays intact.

use serde_json::json;
use tracing::{debug, info, warn};

use super::config::AgentConfig;
use super::control::{Resolution, RunControl, WaitKind, wait};
use super::diagnostics::Diagnostics;
use super::done::{contract_failure, repair_done, validate_done};
use super::events::{AgentEvent, EventHandler, EventResponse};
use super::guards::GuardVerdict;
use super::orchestrator::{Outcome, RunState};
use super::state::RunStatus;
use crate::driver::cache::ObservationCache;
use crate::driver::{
    AutomationDriver, CONDITION_TIMEOUT, DriverError, DriverResponse, ErrorCode, ErrorFamily, HTTP_TIMEOUT,
    NAVIGATION_TIMEOUT, PageInfo, clamp_timeout,
};
use crate::tools::args::{DoneArgs, HttpRequestArgs, SubmitPlanArgs, WaitForArgs};
use crate::tools::reflection::{aborted_by_navigation, screenshot_hint, self_heal_note};
use crate::tools::{ActionKind, BrowserAction, parse_action};
use crate::{Message, ToolCall, truncate_chars};

/// Observation text injected by a self-heal is cut to this many characters.
const SELF_HEAL_OBSERVATION_CHARS: usize = 6_000;

// ── Context ────────────────────────────────────────────────────────

/// Borrowed collaborators for one batch.
pub(crate) struct ToolContext<'a> {
    pub config: &'a AgentConfig,
    pub driver: &'a dyn AutomationDriver,
    pub handler: &'a dyn EventHandler,
    pub control: &'a RunControl,
    pub diagnostics: &'a dyn Diagnostics,
    /// Screenshots may be sent to the model.
    pub vision: bool,
}

/// What a batch did, for the progress watchdog.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchOutcome {
    pub executed: usize,
    pub progressed: bool,
    pub aborted_by_navigation: usize,
}

struct CallOutcome {
    response: DriverResponse,
    progressed: bool,
    navigated: bool,
}

impl CallOutcome {
    fn new(response: DriverResponse) -> Self {
        Self {
            response,
            progressed: false,
            navigated: false,
        }
    }

    fn progressed(mut self, progressed: bool) -> Self {
        self.progressed = progressed;
        self
    }
}

/// Injections appended after the batch's tool results.
#[derive(Default)]
struct PostTurn {
    notes: Vec<String>,
    /// Only the latest screenshot is kept: one vision message per turn group.
    vision: Option<Message>,
}

// ── Batch ──────────────────────────────────────────────────────────

/// Execute one model turn's tool calls and record every result.
///
/// The assistant message carrying `calls` must already be in the window.
pub(crate) async fn execute_tool_calls(
    ctx: &ToolContext<'_>,
    state: &mut RunState,
    calls: &[ToolCall],
    reasoning: &str,
) -> BatchOutcome {
    let mut batch = BatchOutcome::default();
    let mut post = PostTurn::default();
    let mut navigated = false;

    for call in calls {
        let name = call.function.name.as_str();
        let response = if state.outcome.is_some() || ctx.control.is_aborted() {
            DriverResponse::failure(
                ErrorCode::Other,
                format!("Not executed: the run is finishing, so `{name}` was skipped."),
            )
        } else if navigated {
            batch.aborted_by_navigation += 1;
            DriverResponse::failure(ErrorCode::AbortedByNavigation, aborted_by_navigation(name))
        } else {
            ctx.handler.on_event(&AgentEvent::ToolExecuting {
                step: state.current_step,
                name,
                arguments: &call.function.arguments,
            });
            let outcome = run_call(ctx, state, call, reasoning, &mut post).await;
            batch.executed += 1;
            batch.progressed |= outcome.progressed;
            navigated |= outcome.navigated;
            outcome.response
        };
        record_result(ctx, state, call, &response);
    }

    if batch.aborted_by_navigation > 0 {
        info!(
            "Navigation mid-batch: {} queued call(s) dropped",
            batch.aborted_by_navigation
        );
    }
    if let Some(vision) = post.vision {
        state.append(vision, ctx.handler);
    }
    if !post.notes.is_empty() {
        state.append(Message::user(post.notes.join("\n\n")), ctx.handler);
    }
    batch
}

fn record_result(ctx: &ToolContext<'_>, state: &mut RunState, call: &ToolCall, response: &DriverResponse) {
    let name = call.function.name.as_str();
    let content = response.to_tool_content();
    ctx.handler.on_event(&AgentEvent::ToolResult {
        step: state.current_step,
        name,
        call_id: &call.id,
        success: response.success,
        code: response.code.as_deref(),
        result: &content,
    });
    let status = if response.success {
        "ok"
    } else {
        response.code.as_deref().unwrap_or("failed")
    };
    state.task.push_history(&format!(
        "{name}({}) -> {status}",
        truncate_chars(&call.function.arguments, 80)
    ));
    state.append(Message::tool_result(&call.id, content), ctx.handler);
}

// ── Single call ────────────────────────────────────────────────────

async fn run_call(
    ctx: &ToolContext<'_>,
    state: &mut RunState,
    call: &ToolCall,
    reasoning: &str,
    post: &mut PostTurn,
) -> CallOutcome {
    let name = call.function.name.as_str();
    let (action, outcome) = match parse_action(name, &call.function.arguments) {
        Ok(action) => {
            let outcome = dispatch(ctx, state, &action, reasoning).await;
            (Some(action), outcome)
        }
        Err(e) => {
            warn!(tool = name, "rejected tool arguments: {e}");
            (
                None,
                CallOutcome::new(DriverResponse::failure(ErrorCode::InvalidArguments, e.to_string())),
            )
        }
    };

    if outcome.response.success {
        state.guards.record_success(name);
        if let Some(action) = &action {
            state.evidence.observe(action);
        }
    } else if let Some(code) = outcome.response.error_code() {
        apply_guards(ctx, state, name, code, post).await;
    }
    if let Some(query) = action.as_ref().and_then(BrowserAction::search_query) {
        track_search(state, query, &outcome.response);
    }

    if ctx.vision
        && let Some(image) = outcome.response.screenshot()
    {
        let caption = match &state.task.url {
            Some(url) => format!("Screenshot from `{name}` on {url}"),
            None => format!("Screenshot from `{name}`"),
        };
        post.vision = Some(Message::vision(caption, image));
    }
    outcome
}

/// A search that finds nothing leaves an open unknown; a later hit for the
/// same query resolves it.
fn track_search(state: &mut RunState, query: &str, response: &DriverResponse) {
    if response.success {
        state.task.resolve_unknowns(query);
    } else if response
        .error_code()
        .is_some_and(|code| code.family() == ErrorFamily::Target)
    {
        state.task.add_unknown(format!("{} (not found on the page yet)", query.trim()));
    }
}

async fn dispatch(
    ctx: &ToolContext<'_>,
    state: &mut RunState,
    action: &BrowserAction,
    reasoning: &str,
) -> CallOutcome {
    if ctx.config.require_plan_approval
        && !state.plan_approved
        && !matches!(action, BrowserAction::SubmitPlan(_) | BrowserAction::Fail(_))
    {
        return CallOutcome::new(DriverResponse::failure(
            ErrorCode::PermissionDenied,
            "No approved plan yet. Call submit_plan with your steps first.",
        ));
    }

    match action {
        BrowserAction::Remember(args) => {
            let changed = state.task.learn(&args.key, &args.value);
            CallOutcome::new(DriverResponse::ok(json!({
                "stored": args.key.trim(),
                "changed": changed,
            })))
            .progressed(changed)
        }
        BrowserAction::SubmitPlan(args) => submit_plan(ctx, state, args).await,
        BrowserAction::Done(args) => finish_done(ctx, state, args, reasoning),
        BrowserAction::Fail(args) => {
            info!("Model gave up: {}", args.reason);
            state.outcome = Some(Outcome::Failed {
                reason: args.reason.clone(),
                partial_answer: state.partial_answer(),
            });
            CallOutcome::new(DriverResponse::ok(json!({ "acknowledged": true })))
        }
        BrowserAction::EvaluateJs(_) => {
            if !ctx.config.allow_scripts {
                return CallOutcome::new(DriverResponse::failure(
                    ErrorCode::PermissionDenied,
                    "Scripts are disabled for this run.",
                ));
            }
            match domain_permission(ctx, state).await {
                Ok(()) => drive(ctx, state, action).await,
                Err(response) => CallOutcome::new(response),
            }
        }
        _ => drive(ctx, state, action).await,
    }
}

/// Send an action to the automation driver, with caching and navigation
/// handling.
///
/// A call counts as navigating when it is a navigation action, when the
/// driver says so, or when the page identity differs before and after it.
async fn drive(ctx: &ToolContext<'_>, state: &mut RunState, action: &BrowserAction) -> CallOutcome {
    let kind = action.kind();
    let before = match ctx.driver.current_page().await {
        Ok(page) => Some(page),
        Err(e) => {
            debug!("page identity unavailable: {e}");
            None
        }
    };
    let cache_key = match (action, &before) {
        (BrowserAction::ReadPage(args), Some(page)) => Some(ObservationCache::key(
            &page.identity(),
            &format!("read_page:{:?}:{:?}", args.max_depth, args.max_nodes),
        )),
        _ => None,
    };

    if let Some(key) = &cache_key
        && let Some(payload) = state.cache.get(key)
        && let Ok(cached) = serde_json::from_value::<DriverResponse>(payload)
    {
        debug!("Observation cache hit: {key}");
        return CallOutcome::new(cached.with("cached", true));
    }

    let action = with_clamped_timeouts(action);
    let response = match ctx.driver.execute(&action).await {
        Ok(response) => response,
        Err(e) => driver_failure(e),
    };

    if !response.success {
        return CallOutcome::new(response);
    }
    if let Some(key) = cache_key
        && let Ok(payload) = serde_json::to_value(&response)
    {
        state.cache.put(key, payload);
    }
    if matches!(kind, ActionKind::Interact | ActionKind::Navigate | ActionKind::External) {
        state.cache.invalidate_all();
    }

    let mut page = match ctx.driver.current_page().await {
        Ok(after) => Some(after),
        Err(_) => before.clone(),
    };
    let page_changed = matches!(
        (&before, &page),
        (Some(b), Some(a)) if b.identity() != a.identity()
    );
    let navigated = kind == ActionKind::Navigate || response.navigated() || page_changed;
    if navigated {
        if page_changed && !response.navigated() {
            debug!("page changed under `{}`", action.name());
        }
        let timeout = clamp_timeout(None, NAVIGATION_TIMEOUT);
        match ctx.driver.wait_for_navigation(timeout).await {
            Ok(settled) if !settled.success => {
                warn!("Navigation did not settle: {}", settled.error.as_deref().unwrap_or("unknown"));
            }
            Err(e) => warn!("Navigation wait failed: {e}"),
            Ok(_) => {}
        }
        state.cache.invalidate_all();
        if let Ok(settled) = ctx.driver.current_page().await {
            page = Some(settled);
        }
        if let Some(page) = &page {
            state.task.url = (!page.is_blank()).then(|| page.url.clone());
        }
    }

    let progressed = match kind {
        ActionKind::Read | ActionKind::Search => {
            let identity = page.as_ref().map(PageInfo::identity).unwrap_or_default();
            state.record_observation(action.name(), &identity, &response.to_tool_content())
        }
        ActionKind::Interact | ActionKind::Navigate | ActionKind::External => true,
        _ => false,
    };
    CallOutcome {
        response,
        progressed,
        navigated,
    }
}

/// Clamp caller-supplied timeouts into their allowed windows.
fn with_clamped_timeouts(action: &BrowserAction) -> BrowserAction {
    match action {
        BrowserAction::WaitFor(args) => BrowserAction::WaitFor(WaitForArgs {
            timeout_ms: Some(clamp_timeout(args.timeout_ms, CONDITION_TIMEOUT).as_millis() as u64),
            ..args.clone()
        }),
        BrowserAction::HttpRequest(args) => BrowserAction::HttpRequest(HttpRequestArgs {
            timeout_ms: Some(clamp_timeout(args.timeout_ms, HTTP_TIMEOUT).as_millis() as u64),
            ..args.clone()
        }),
        other => other.clone(),
    }
}

/// In-band result for a transport-level driver failure.
fn driver_failure(error: DriverError) -> DriverResponse {
    match error {
        DriverError::Timeout(after) => DriverResponse::failure(
            ErrorCode::WaitTimeout,
            format!("driver call timed out after {after:?}"),
        ),
        other => DriverResponse::failure(ErrorCode::Other, other.to_string()),
    }
}

// ── Guards and self-heal ───────────────────────────────────────────

async fn apply_guards(
    ctx: &ToolContext<'_>,
    state: &mut RunState,
    tool: &str,
    code: ErrorCode,
    post: &mut PostTurn,
) {
    if code == ErrorCode::AbortedByNavigation {
        return;
    }
    match state.guards.record_failure(tool, code, &ctx.config.guards) {
        GuardVerdict::Continue => {}
        GuardVerdict::Recover { message } => {
            ctx.handler.on_event(&AgentEvent::GuardFired {
                tool,
                code: code.as_str(),
                message: &message,
            });
            post.notes.push(message);
        }
        GuardVerdict::SelfHeal {
            attempt,
            max,
            screenshot,
            message,
        } => {
            let screenshot = screenshot && ctx.vision;
            ctx.handler.on_event(&AgentEvent::GuardFired {
                tool,
                code: code.as_str(),
                message: &message,
            });
            ctx.handler.on_event(&AgentEvent::SelfHeal {
                tool,
                attempt,
                screenshot,
            });
            let mut note = format!("{message}\n\n{}", self_heal_note(tool, code, attempt, max));
            match ctx.driver.observe().await {
                Ok(observation) if observation.success => {
                    state.cache.invalidate_all();
                    note.push_str("\n\n");
                    note.push_str(truncate_chars(
                        &observation.to_tool_content(),
                        SELF_HEAL_OBSERVATION_CHARS,
                    ));
                }
                Ok(observation) => {
                    let error = observation.error.unwrap_or_default();
                    warn!(tool, "self-heal re-observation failed: {error}");
                    note.push_str(&format!("\n\n(Re-observation failed: {error})"));
                }
                Err(e) => {
                    warn!(tool, "self-heal re-observation failed: {e}");
                    note.push_str(&format!("\n\n(Re-observation failed: {e})"));
                }
            }
            post.notes.push(note);

            if screenshot {
                match ctx.driver.capture_screenshot().await {
                    Ok(shot) => {
                        if let Some(image) = shot.screenshot() {
                            post.vision = Some(Message::vision(screenshot_hint(), image));
                        }
                    }
                    Err(e) => debug!("self-heal screenshot unavailable: {e}"),
                }
            }
        }
        GuardVerdict::HardFail { reason } => {
            ctx.handler.on_event(&AgentEvent::GuardFired {
                tool,
                code: code.as_str(),
                message: &reason,
            });
            state.outcome = Some(Outcome::Failed {
                partial_answer: state.partial_answer(),
                reason,
            });
        }
    }
}

// ── Internal tools ─────────────────────────────────────────────────

fn finish_done(ctx: &ToolContext<'_>, state: &mut RunState, args: &DoneArgs, reasoning: &str) -> CallOutcome {
    let source = if reasoning.trim().is_empty() {
        state.window.last_assistant_text().unwrap_or_default()
    } else {
        reasoning.to_string()
    };
    let repair = repair_done(args, &source);
    if repair.repaired {
        info!(source = ?repair.source, "done payload repaired from free text");
    }
    if let Some(ratio) = state.guards.record_done_attempt(repair.repaired, &ctx.config.guards) {
        ctx.diagnostics.warn(
            "done_repair_ratio",
            &format!(
                "{:.0}% of done calls needed repair; tool-call fidelity is degrading",
                ratio * 100.0
            ),
        );
    }

    match validate_done(&repair.args, &state.evidence) {
        Ok(()) => {
            info!("done accepted");
            state.outcome = Some(Outcome::Done {
                summary: repair.args.summary.trim().to_string(),
                answer: repair.args.answer.trim().to_string(),
                repaired: repair.repaired,
            });
            CallOutcome::new(DriverResponse::ok(json!({
                "accepted": true,
                "repaired": repair.repaired,
            })))
        }
        Err(violations) => {
            let response = contract_failure(&violations);
            let reason = response.error.clone().unwrap_or_default();
            info!("done rejected: {reason}");
            ctx.handler.on_event(&AgentEvent::DoneRejected { reason: &reason });
            CallOutcome::new(response)
        }
    }
}

async fn submit_plan(ctx: &ToolContext<'_>, state: &mut RunState, args: &SubmitPlanArgs) -> CallOutcome {
    let steps: Vec<String> = args
        .steps
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if steps.is_empty() {
        return CallOutcome::new(DriverResponse::failure(
            ErrorCode::InvalidArguments,
            "submit_plan needs at least one step",
        ));
    }

    let resolution = if ctx.config.require_plan_approval {
        pause(ctx.control, ctx.handler, state, WaitKind::PlanApproval, |handler| {
            handler.on_event(&AgentEvent::PlanApprovalRequested { steps: &steps })
        })
        .await
    } else {
        Resolution::Approve
    };

    match resolution {
        Resolution::Approve => {
            info!("Plan approved ({} steps)", steps.len());
            let text = steps
                .iter()
                .enumerate()
                .map(|(i, s)| format!("{}. {s}", i + 1))
                .collect::<Vec<_>>()
                .join("\n");
            state.pin(Message::user(format!("Approved plan:\n{text}")), ctx.config.protected_head);
            state.task.plan = steps;
            state.plan_approved = true;
            CallOutcome::new(DriverResponse::ok(json!({ "approved": true }))).progressed(true)
        }
        Resolution::Deny(feedback) => {
            info!("Plan denied: {feedback}");
            CallOutcome::new(DriverResponse::ok(json!({
                "approved": false,
                "feedback": feedback,
            })))
        }
        Resolution::Aborted => {
            state.outcome = Some(Outcome::Failed {
                reason: "aborted while waiting for plan approval".into(),
                partial_answer: state.partial_answer(),
            });
            CallOutcome::new(DriverResponse::failure(ErrorCode::PermissionDenied, "run aborted"))
        }
    }
}

/// Gate scripts on the current domain. Grants last for the rest of the run.
async fn domain_permission(ctx: &ToolContext<'_>, state: &mut RunState) -> Result<(), DriverResponse> {
    let page = ctx.driver.current_page().await.map_err(driver_failure)?;
    let Some(domain) = page.domain() else {
        return Err(DriverResponse::failure(
            ErrorCode::PermissionDenied,
            "evaluate_js needs a page with a domain",
        ));
    };
    if state.granted_domains.contains(&domain) {
        return Ok(());
    }

    let resolution = pause(ctx.control, ctx.handler, state, WaitKind::DomainPermission, |handler| {
        handler.on_event(&AgentEvent::DomainPermissionRequested { domain: &domain })
    })
    .await;
    match resolution {
        Resolution::Approve => {
            info!("Scripts allowed on {domain}");
            state.granted_domains.insert(domain);
            Ok(())
        }
        Resolution::Deny(reason) => Err(DriverResponse::failure(
            ErrorCode::PermissionDenied,
            format!("Scripts on {domain} were denied: {reason}"),
        )),
        Resolution::Aborted => {
            state.outcome = Some(Outcome::Failed {
                reason: "aborted while waiting for domain permission".into(),
                partial_answer: state.partial_answer(),
            });
            Err(DriverResponse::failure(ErrorCode::PermissionDenied, "run aborted"))
        }
    }
}

// ── Pauses ─────────────────────────────────────────────────────────

/// Enter `paused_waiting_user` until the host answers.
///
/// The waiter is registered before `ask` emits the request event. An inline
/// `Approve`/`Deny` from the handler resolves the pause immediately; anything
/// else blocks on [`RunControl`] with no timeout.
pub(crate) async fn pause(
    control: &RunControl,
    handler: &dyn EventHandler,
    state: &mut RunState,
    kind: WaitKind,
    ask: impl FnOnce(&dyn EventHandler) -> Option<EventResponse>,
) -> Resolution {
    let rx = control.wait_for(kind);
    state.transition(RunStatus::PausedWaitingUser, handler);

    let resolution = match ask(handler) {
        Some(EventResponse::Approve) => Resolution::Approve,
        Some(EventResponse::Deny(reason)) => Resolution::Deny(reason),
        _ => {
            info!(?kind, "Waiting for the host");
            wait(rx).await
        }
    };
    // Clear a waiter left behind by an inline answer.
    control.resolve(kind, resolution.clone());

    if resolution != Resolution::Aborted {
        state.transition(RunStatus::Running, handler);
        handler.on_event(&AgentEvent::Resumed { kind });
    }
    resolution
}
