//! Host events, handlers, and the run result.
//!
//! The orchestrator reports everything the surrounding UI needs through
//! [`AgentEvent`]: status transitions, steps, tool results, pauses. Hosts
//! implement [`EventHandler`] to render, log, or answer pauses inline.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures |
//! | [`CompositeEventHandler`] | Several handlers in order |

use serde::Serialize;
use tracing::{debug, info, warn};

use super::control::WaitKind;
use super::state::RunStatus;
use crate::Message;
use crate::driver::InterventionKind;

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AgentEvent<'a> {
    StatusChanged {
        from: RunStatus,
        to: RunStatus,
    },
    StepStart {
        step: u32,
        max_steps: u32,
        context_tokens: u32,
        pressure: f64,
    },
    /// Assistant text returned alongside (or instead of) tool calls.
    Text(&'a str),
    Reasoning(&'a str),
    ToolExecuting {
        step: u32,
        name: &'a str,
        arguments: &'a str,
    },
    ToolResult {
        step: u32,
        name: &'a str,
        call_id: &'a str,
        success: bool,
        code: Option<&'a str>,
        result: &'a str,
    },
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
        used_tokens: u64,
        token_limit: u64,
    },
    /// The page needs a human (CAPTCHA, login). The run is paused until
    /// [`WaitKind::Intervention`] is resolved.
    InterventionRequired {
        kind: InterventionKind,
        url: &'a str,
    },
    /// The model submitted a plan. Answer inline with `Approve`/`Deny`, or
    /// resolve [`WaitKind::PlanApproval`] later.
    PlanApprovalRequested { steps: &'a [String] },
    /// A script wants to run on a domain that was not granted yet.
    DomainPermissionRequested { domain: &'a str },
    /// A pause was resolved.
    Resumed { kind: WaitKind },
    GuardFired {
        tool: &'a str,
        code: &'a str,
        message: &'a str,
    },
    SelfHeal {
        tool: &'a str,
        attempt: u32,
        screenshot: bool,
    },
    DoneRejected { reason: &'a str },
    Eviction {
        messages: usize,
        pending_chunks: usize,
    },
    Compaction {
        compacted: usize,
        freed_chars: usize,
        critical: bool,
    },
    Summarized {
        chunks: usize,
        messages: usize,
        fallback: bool,
    },
    ContextPressure { ratio: f64 },
    ProviderRetry {
        attempt: u32,
        delay_ms: u64,
        error: &'a str,
    },
    CheckpointSaved { step: u32, path: &'a str },
    Finished {
        status: RunStatus,
        reason: Option<&'a str>,
    },
}

/// Inline answer from a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventResponse {
    Approve,
    Deny(String),
    /// Add a user message to the conversation before the next model call.
    InjectMessage(String),
}

/// Observer of agent events.
///
/// Most events are informational and the return value is ignored. For
/// `PlanApprovalRequested` and `DomainPermissionRequested`, returning
/// `Approve` or `Deny` answers the pause without going through
/// [`RunControl`](super::control::RunControl).
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &AgentEvent<'_>) -> Option<EventResponse> {
        let _ = event;
        None
    }
}

pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&AgentEvent<'_>) -> Option<EventResponse> + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&AgentEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&AgentEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    fn on_event(&self, event: &AgentEvent<'_>) -> Option<EventResponse> {
        (self.0)(event)
    }
}

/// Dispatches to several handlers in order; the first response wins.
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &AgentEvent<'_>) -> Option<EventResponse> {
        let mut first = None;
        for handler in &self.handlers {
            let response = handler.on_event(event);
            if first.is_none() {
                first = response;
            }
        }
        first
    }
}

/// Logs events via `tracing`. Never answers pauses.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &AgentEvent<'_>) -> Option<EventResponse> {
        match event {
            AgentEvent::StatusChanged { from, to } => info!("status: {from} -> {to}"),
            AgentEvent::StepStart {
                step,
                max_steps,
                context_tokens,
                pressure,
            } => info!(
                "[step {step}/{max_steps}] ~{context_tokens} context tokens ({:.0}%)",
                pressure * 100.0
            ),
            AgentEvent::Text(text) => debug!("assistant: {}", crate::truncate_chars(text, 200)),
            AgentEvent::Reasoning(text) => debug!("reasoning: {}", crate::truncate_chars(text, 200)),
            AgentEvent::ToolExecuting { name, arguments, .. } => {
                debug!("executing {name} {}", crate::truncate_chars(arguments, 200))
            }
            AgentEvent::ToolResult {
                name,
                success,
                code,
                result,
                ..
            } => {
                if *success {
                    debug!("{name} ok ({} bytes)", result.len());
                } else {
                    info!("{name} failed: {}", code.unwrap_or("ERROR"));
                }
            }
            AgentEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
                used_tokens,
                token_limit,
            } => debug!(
                "tokens: prompt={prompt_tokens} completion={completion_tokens} ({used_tokens}/{token_limit})"
            ),
            AgentEvent::InterventionRequired { kind, url } => {
                warn!("human intervention required ({kind:?}) on {url}")
            }
            AgentEvent::PlanApprovalRequested { steps } => {
                info!("plan submitted for approval ({} steps)", steps.len())
            }
            AgentEvent::DomainPermissionRequested { domain } => {
                info!("script permission requested for {domain}")
            }
            AgentEvent::Resumed { kind } => info!("resumed after {kind:?}"),
            AgentEvent::GuardFired { tool, code, .. } => warn!("loop guard fired: {tool} {code}"),
            AgentEvent::SelfHeal {
                tool,
                attempt,
                screenshot,
            } => info!("self-heal #{attempt} for {tool} (screenshot: {screenshot})"),
            AgentEvent::DoneRejected { reason } => info!("done rejected: {reason}"),
            AgentEvent::Eviction {
                messages,
                pending_chunks,
            } => debug!("evicted {messages} message(s), {pending_chunks} chunk(s) pending"),
            AgentEvent::Compaction {
                compacted,
                freed_chars,
                critical,
            } => info!(
                "compacted {compacted} message(s), freed {freed_chars} chars{}",
                if *critical { " (critical)" } else { "" }
            ),
            AgentEvent::Summarized {
                chunks,
                messages,
                fallback,
            } => debug!("summarized {chunks} chunk(s) / {messages} message(s), fallback={fallback}"),
            AgentEvent::ContextPressure { ratio } => {
                warn!("context pressure at {:.0}%", ratio * 100.0)
            }
            AgentEvent::ProviderRetry {
                attempt,
                delay_ms,
                error,
            } => warn!("provider retry #{attempt} in {delay_ms}ms: {error}"),
            AgentEvent::CheckpointSaved { step, path } => debug!("checkpoint at step {step}: {path}"),
            AgentEvent::Finished { status, reason } => match reason {
                Some(reason) => info!("run finished: {status} ({reason})"),
                None => info!("run finished: {status}"),
            },
        }
        None
    }
}

// ── Run result ─────────────────────────────────────────────────────

/// Outcome of a complete run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub answer: Option<String>,
    pub summary: Option<String>,
    /// Human-readable reason for a failed run.
    pub reason: Option<String>,
    /// Best-effort answer salvaged from the last reasoning when the run did
    /// not complete.
    pub partial_answer: Option<String>,
    /// Whether the accepted `done` payload was repaired from free text.
    pub repaired: bool,
    pub steps: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(skip)]
    pub messages: Vec<Message>,
}

impl AgentRunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Done
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}
