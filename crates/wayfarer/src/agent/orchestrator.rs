//! The step loop.
//!
//! [`Orchestrator`] drives one run at a time: it keeps the conversation
//! window inside its budget, asks the model for the next action, executes the
//! returned tool calls through the [`AutomationDriver`], and feeds results,
//! guard notes, and recovery observations back into the window until `done`,
//! `fail`, or a terminal guard ends the run.
//!
//! Per step:
//!
//! 1. abort and step-limit checks
//! 2. human-intervention check (pauses the run)
//! 3. pressure update from the assembled request, compaction, summarization
//! 4. request assembly: head, task-state message, body
//! 5. budget precheck, model call, provider error policy
//! 6. tool execution and the progress watchdog
//! 7. checkpoint

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use super::config::AgentConfig;
use super::control::{Resolution, RunControl, WaitKind};
use super::diagnostics::{Diagnostics, ThrottledDiagnostics};
use super::done::EvidenceTracker;
use super::events::{AgentEvent, AgentRunResult, EventHandler};
use super::execution::{ToolContext, execute_tool_calls, pause};
use super::guards::{GuardState, Watchdog};
use super::prompt::{PromptVariants, build_system_prompt};
use super::state::RunStatus;
use super::task::TaskState;
use crate::api::provider::{ChatOptions, ErrorClass, ModelProvider, ProviderCapabilities, ProviderError, ToolChoice};
use crate::api::tracing::{generate_run_id, step_span_id};
use crate::context::budget::{BudgetState, CRITICAL_PRESSURE, PrecheckPolicy, WARNING_PRESSURE};
use crate::context::retrieval::{EntrySource, RetrievalMemory};
use crate::context::summarizer::{SummaryCompressor, SummaryMode};
use crate::context::tokens::estimate_message_tokens;
use crate::context::window::{CompactionLevel, CompactionReport, ConversationWindow, EvictedMessage};
use crate::driver::AutomationDriver;
use crate::driver::cache::ObservationCache;
use crate::tools::ToolCatalog;
use crate::tools::reflection::{no_progress_note, pressure_note, provider_error_note, tool_required_note};
use crate::{Message, ToolDef, UsageInfo, truncate_chars};

const PARTIAL_ANSWER_CHARS: usize = 2_000;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{provider}/{model} does not support tool calling")]
    ToolsUnsupported { provider: String, model: String },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

// ── Run state ──────────────────────────────────────────────────────

/// How the run ended, set by whichever component ends it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Done {
        summary: String,
        answer: String,
        repaired: bool,
    },
    Failed {
        reason: String,
        partial_answer: Option<String>,
    },
}

/// Mutable state of one run.
pub(crate) struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    /// Completed (counted) steps.
    pub step: u32,
    /// Step being executed.
    pub current_step: u32,
    pub window: ConversationWindow,
    pub compressor: SummaryCompressor,
    pub memory: RetrievalMemory,
    pub cache: ObservationCache,
    pub guards: GuardState,
    pub budget: BudgetState,
    pub task: TaskState,
    pub evidence: EvidenceTracker,
    pub granted_domains: BTreeSet<String>,
    pub plan_approved: bool,
    pub pressure: f64,
    pub pressure_warned: bool,
    pub last_compaction_step: Option<u32>,
    /// Fingerprint of the last result per read tool, for the watchdog.
    pub observations: BTreeMap<String, u64>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub outcome: Option<Outcome>,
}

impl RunState {
    fn new(run_id: String, goal: &str, config: &AgentConfig, capabilities: &ProviderCapabilities) -> Self {
        let budget = BudgetState::new(&config.budget, capabilities.context_window);
        Self {
            run_id,
            status: RunStatus::Idle,
            step: 0,
            current_step: 0,
            window: ConversationWindow::new(config.window.clone(), budget.usable_window()),
            compressor: SummaryCompressor::new(config.summary.clone()),
            memory: RetrievalMemory::new(config.retrieval.clone()),
            cache: ObservationCache::new(&config.cache),
            guards: GuardState::new(),
            budget,
            task: TaskState::new(goal),
            evidence: EvidenceTracker::default(),
            granted_domains: BTreeSet::new(),
            plan_approved: false,
            pressure: 0.0,
            pressure_warned: false,
            last_compaction_step: None,
            observations: BTreeMap::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            outcome: None,
        }
    }

    fn from_checkpoint(checkpoint: Checkpoint, config: &AgentConfig) -> Self {
        let mut window = checkpoint.window.with_config(config.window.clone());
        window.set_token_budget(checkpoint.budget.usable_window());
        let plan_approved = !checkpoint.task.plan.is_empty();
        Self {
            run_id: checkpoint.run_id,
            status: checkpoint.status,
            step: checkpoint.step,
            current_step: checkpoint.step,
            window,
            compressor: SummaryCompressor::new(config.summary.clone()).with_state(checkpoint.summary),
            memory: checkpoint.retrieval.with_config(config.retrieval.clone()),
            cache: ObservationCache::new(&config.cache),
            guards: checkpoint.guards,
            budget: checkpoint.budget,
            task: checkpoint.task,
            evidence: checkpoint.evidence,
            granted_domains: checkpoint.granted_domains.into_iter().collect(),
            plan_approved,
            pressure: 0.0,
            pressure_warned: false,
            last_compaction_step: None,
            observations: BTreeMap::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            outcome: None,
        }
    }

    /// Move to `to`, emitting `StatusChanged`. Illegal moves are logged and
    /// ignored.
    pub(crate) fn transition(&mut self, to: RunStatus, handler: &dyn EventHandler) {
        let from = self.status;
        if from == to {
            return;
        }
        if !from.can_transition(to) {
            warn!(%from, %to, "ignoring illegal status transition");
            return;
        }
        self.status = to;
        handler.on_event(&AgentEvent::StatusChanged { from, to });
    }

    /// Append to the window and route evictions and compactions.
    pub(crate) fn append(&mut self, message: Message, handler: &dyn EventHandler) {
        let outcome = self.window.append(message, Some(self.current_step));
        self.absorb_compaction(outcome.compaction, false, handler);
        self.absorb_eviction(outcome.evicted, handler);
    }

    fn absorb_compaction(&mut self, report: CompactionReport, critical: bool, handler: &dyn EventHandler) {
        if report.is_noop() {
            return;
        }
        for (step, caption) in &report.vision_captions {
            self.memory.index(caption, *step, EntrySource::VisionSummary);
        }
        handler.on_event(&AgentEvent::Compaction {
            compacted: report.compacted,
            freed_chars: report.freed_chars,
            critical,
        });
    }

    fn absorb_eviction(&mut self, evicted: Vec<EvictedMessage>, handler: &dyn EventHandler) {
        if evicted.is_empty() {
            return;
        }
        self.compressor.record_eviction(&evicted);
        handler.on_event(&AgentEvent::Eviction {
            messages: evicted.len(),
            pending_chunks: self.compressor.state().pending.len(),
        });
    }

    /// Add a message to the protected head while it has room. The task-state
    /// message carries the same content either way.
    pub(crate) fn pin(&mut self, message: Message, protected_head: usize) {
        let mut head = self.window.head().to_vec();
        if head.len() < protected_head {
            head.push(message);
            self.window.set_head(head);
        } else {
            debug!("protected head full, not pinning");
        }
    }

    /// Remember what a read returned. Returns true when it differs from the
    /// previous result of the same tool, i.e. the read taught something new.
    pub(crate) fn record_observation(&mut self, tool: &str, page_identity: &str, content: &str) -> bool {
        let mut hasher = DefaultHasher::new();
        page_identity.hash(&mut hasher);
        content.hash(&mut hasher);
        let fingerprint = hasher.finish();
        self.observations.insert(tool.to_string(), fingerprint) != Some(fingerprint)
    }

    /// Best-effort answer for a run that did not finish: the last assistant
    /// text, else the scratch memory.
    pub(crate) fn partial_answer(&self) -> Option<String> {
        if let Some(text) = self.window.last_assistant_text()
            && !text.trim().is_empty()
        {
            return Some(truncate_chars(text.trim(), PARTIAL_ANSWER_CHARS).to_string());
        }
        if self.task.scratch.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .task
            .scratch
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        Some(lines.join("\n"))
    }

    /// End the run as failed unless something already ended it.
    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Failed {
                reason: reason.into(),
                partial_answer: self.partial_answer(),
            });
        }
    }

    pub(crate) fn snapshot(&self) -> Checkpoint {
        Checkpoint {
            run_id: self.run_id.clone(),
            step: self.step,
            status: self.status,
            window: self.window.clone(),
            summary: self.compressor.state().clone(),
            retrieval: self.memory.clone(),
            guards: self.guards.clone(),
            budget: self.budget.clone(),
            task: self.task.clone(),
            evidence: self.evidence.clone(),
            granted_domains: self.granted_domains.iter().cloned().collect(),
            created_at: Utc::now(),
        }
    }
}

// ── Orchestrator ───────────────────────────────────────────────────

/// Runs browser tasks against a model provider and an automation driver.
///
/// ```ignore
/// let provider = OpenRouterClient::new(api_key, "openai/gpt-4o")?;
/// let driver = MyDriver::connect().await?;
/// let handler = LoggingHandler;
///
/// let orchestrator = Orchestrator::new(&provider, &driver, AgentConfig::default())?
///     .with_event_handler(&handler);
/// let result = orchestrator.run("Find the price of the blue kettle").await;
/// println!("{:?}", result.answer);
/// ```
///
/// The provider, driver, and handler are borrowed and must outlive the
/// orchestrator. [`Orchestrator::control`] hands out the abort/resume handle.
pub struct Orchestrator<'a> {
    provider: &'a dyn ModelProvider,
    driver: &'a dyn AutomationDriver,
    config: AgentConfig,
    capabilities: ProviderCapabilities,
    handler: &'a dyn EventHandler,
    diagnostics: Arc<dyn Diagnostics>,
    control: RunControl,
    variants: PromptVariants,
    catalog: ToolCatalog,
    checkpoints: Option<CheckpointStore>,
}

impl<'a> Orchestrator<'a> {
    /// Fails when the provider cannot call tools or the checkpoint directory
    /// cannot be created.
    pub fn new(
        provider: &'a dyn ModelProvider,
        driver: &'a dyn AutomationDriver,
        config: AgentConfig,
    ) -> Result<Self, AgentError> {
        let capabilities = provider.capabilities();
        if !capabilities.supports_tools {
            return Err(AgentError::ToolsUnsupported {
                provider: capabilities.provider,
                model: capabilities.model,
            });
        }
        let mut catalog = ToolCatalog::new().with_plan_tool(config.require_plan_approval);
        if !config.allow_scripts {
            catalog = catalog.without(&["evaluate_js"]);
        }
        let checkpoints = match &config.checkpoint_dir {
            Some(dir) => Some(CheckpointStore::new(dir.clone())?),
            None => None,
        };
        Ok(Self {
            provider,
            driver,
            config,
            capabilities,
            handler: &super::events::NoopHandler,
            diagnostics: Arc::new(ThrottledDiagnostics::default()),
            control: RunControl::new(),
            variants: PromptVariants::builtin(),
            catalog,
            checkpoints,
        })
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Share a control handle created by the host.
    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_prompt_variants(mut self, variants: PromptVariants) -> Self {
        self.variants = variants;
        self
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run a new task to completion.
    pub async fn run(&self, goal: &str) -> AgentRunResult {
        self.control.reset();
        let mut state = RunState::new(generate_run_id(), goal, &self.config, &self.capabilities);
        let system = build_system_prompt(
            &self.config.system_prompt,
            &self.capabilities,
            &self.variants,
            self.config.require_plan_approval,
            self.config.allow_scripts,
        );
        state.window.set_head(vec![Message::system(system), Message::user(goal)]);
        if let Ok(page) = self.driver.current_page().await
            && !page.is_blank()
        {
            state.task.url = Some(page.url);
        }
        self.drive(state).await
    }

    /// Continue a run from a checkpoint. Step numbering and counters carry
    /// over; the observation cache starts empty.
    pub async fn resume(&self, checkpoint: Checkpoint) -> AgentRunResult {
        self.control.reset();
        info!(run_id = %checkpoint.run_id, step = checkpoint.step, "Resuming from checkpoint");
        let state = RunState::from_checkpoint(checkpoint, &self.config);
        self.drive(state).await
    }

    async fn drive(&self, mut state: RunState) -> AgentRunResult {
        info!(
            run_id = %state.run_id,
            provider = %self.capabilities.provider,
            model = %self.capabilities.model,
            "Run started"
        );
        state.transition(RunStatus::Running, self.handler);
        let base_options = self.config.chat_options();
        let mut no_tool_retries = 0u32;

        while state.outcome.is_none() {
            if self.control.is_aborted() {
                state.fail("aborted by user");
                break;
            }
            if state.step >= self.config.max_steps {
                warn!(max_steps = self.config.max_steps, "Step limit reached");
                state.fail(format!(
                    "step limit of {} reached before the goal was completed",
                    self.config.max_steps
                ));
                break;
            }
            state.current_step = state.step + 1;
            let step = state.current_step;
            debug!(span = %step_span_id(&state.run_id, step), "step");

            if !self.check_intervention(&mut state).await {
                break;
            }

            let restricted = state.guards.no_tool_streak >= self.config.no_tool_streak_limit;
            let recovery: Vec<ToolDef>;
            let (tools, options): (&[ToolDef], ChatOptions) = if restricted {
                recovery = self.catalog.recovery(state.task.url.is_some());
                (recovery.as_slice(), base_options.clone().with_tool_choice(ToolChoice::Required))
            } else {
                (self.catalog.definitions(), base_options.clone())
            };
            self.manage_pressure(&mut state, tools, &options).await;

            let messages = self.request_messages(&state);
            let partial = state.partial_answer();
            let check = state.budget.precheck(
                &messages,
                tools,
                &options,
                PrecheckPolicy::Terminal,
                partial.as_deref(),
            );
            if let Some(terminal) = check.terminal {
                warn!(estimated = check.estimated, remaining = check.remaining, "Token budget exhausted");
                state.outcome = Some(Outcome::Failed {
                    reason: terminal.reason,
                    partial_answer: terminal.partial_answer,
                });
                break;
            }

            self.handler.on_event(&AgentEvent::StepStart {
                step,
                max_steps: self.config.max_steps,
                context_tokens: estimate_message_tokens(&messages),
                pressure: state.pressure,
            });
            debug!(
                step,
                tools = tools.len(),
                schema_tokens = BudgetState::schema_overhead(tools),
                estimated = check.estimated,
                restricted,
                "model request"
            );

            let completion = match self.provider.chat(&messages, tools, &options).await {
                Ok(completion) => {
                    state.guards.record_provider_success();
                    completion
                }
                Err(e) => {
                    self.handle_provider_error(&mut state, e).await;
                    continue;
                }
            };
            self.record_usage(&mut state, completion.usage.as_ref());

            if let Some(reasoning) = completion.reasoning.as_deref()
                && !reasoning.trim().is_empty()
            {
                self.handler.on_event(&AgentEvent::Reasoning(reasoning));
            }
            if let Some(text) = completion.content.as_deref()
                && !text.trim().is_empty()
            {
                self.handler.on_event(&AgentEvent::Text(text));
            }

            if completion.tool_calls.is_empty() {
                state.guards.no_tool_streak += 1;
                if let Some(text) = completion.content.as_deref()
                    && !text.trim().is_empty()
                {
                    state.append(Message::assistant_text(text), self.handler);
                }
                if state.guards.no_tool_streak >= self.config.no_tool_streak_limit
                    && no_tool_retries < self.config.max_no_tool_retries
                {
                    no_tool_retries += 1;
                    let offered = self.catalog.recovery(state.task.url.is_some());
                    let names: Vec<&str> = offered.iter().map(ToolDef::name).collect();
                    info!(
                        streak = state.guards.no_tool_streak,
                        retry = no_tool_retries,
                        "No tool call, restricting tools to {}",
                        names.join(", ")
                    );
                    state.append(Message::user(tool_required_note(&names)), self.handler);
                    continue;
                }
                self.finish_step(&mut state, false);
                continue;
            }

            state.guards.no_tool_streak = 0;
            no_tool_retries = 0;
            let reasoning = completion.reasoning_text();
            state.append(
                Message::assistant_tool_calls(completion.content.clone(), completion.tool_calls.clone()),
                self.handler,
            );
            let ctx = ToolContext {
                config: &self.config,
                driver: self.driver,
                handler: self.handler,
                control: &self.control,
                diagnostics: self.diagnostics.as_ref(),
                vision: self.config.vision && self.capabilities.supports_vision,
            };
            let batch = execute_tool_calls(&ctx, &mut state, &completion.tool_calls, &reasoning).await;
            debug!(
                executed = batch.executed,
                progressed = batch.progressed,
                aborted = batch.aborted_by_navigation,
                "batch finished"
            );
            self.finish_step(&mut state, batch.progressed);
        }

        self.finalize(state)
    }

    /// Detect a CAPTCHA or login wall and wait for the host. Returns false
    /// when the run must stop.
    async fn check_intervention(&self, state: &mut RunState) -> bool {
        let kind = match self.driver.detect_intervention().await {
            Ok(Some(kind)) => kind,
            Ok(None) => return true,
            Err(e) => {
                debug!("intervention check failed: {e}");
                return true;
            }
        };
        let url = self
            .driver
            .current_page()
            .await
            .map(|page| page.url)
            .unwrap_or_default();
        warn!(?kind, url, "Human intervention required");
        let resolution = pause(&self.control, self.handler, state, WaitKind::Intervention, |handler| {
            handler.on_event(&AgentEvent::InterventionRequired { kind, url: &url })
        })
        .await;
        match resolution {
            Resolution::Approve => {
                state.cache.invalidate_all();
                true
            }
            Resolution::Deny(reason) => {
                state.fail(format!("human intervention declined: {reason}"));
                false
            }
            Resolution::Aborted => {
                state.fail("aborted while waiting for human intervention");
                false
            }
        }
    }

    /// Pressure tiers: warn once, then compact, trim, and force a summary
    /// pass at the critical tier (with a cooldown).
    ///
    /// The ratio covers the whole request about to be sent (messages with the
    /// task-state block, tool schemas, expected output) against the model
    /// window.
    async fn manage_pressure(&self, state: &mut RunState, tools: &[ToolDef], options: &ChatOptions) {
        let messages = self.request_messages(state);
        let ratio = state.budget.request_pressure(&messages, tools, options);
        state.pressure = ratio;

        if ratio >= CRITICAL_PRESSURE {
            let step = state.current_step;
            let cooled = state
                .last_compaction_step
                .is_none_or(|last| step.saturating_sub(last) >= self.config.budget.compact_cooldown_steps);
            if cooled {
                info!(ratio, "Critical context pressure, compacting");
                let report = state.window.compact_heavy(CompactionLevel::Critical);
                state.absorb_compaction(report, true, self.handler);
                let evicted = state.window.trim();
                state.absorb_eviction(evicted, self.handler);
                state.last_compaction_step = Some(step);
                self.summarize(state, true).await;
            } else {
                debug!(ratio, "compaction cooling down");
            }
        }

        if ratio >= WARNING_PRESSURE && !state.pressure_warned {
            state.pressure_warned = true;
            self.diagnostics.warn(
                "context_pressure",
                &format!("context at {:.0}% of the usable window", ratio * 100.0),
            );
            self.handler.on_event(&AgentEvent::ContextPressure { ratio });
            state.append(Message::user(pressure_note(ratio)), self.handler);
        }

        self.summarize(state, false).await;
    }

    async fn summarize(&self, state: &mut RunState, force: bool) {
        if !state.compressor.should_summarize(force) {
            return;
        }
        let outcome = state
            .compressor
            .summarize(force, Some(self.provider), Some(&state.budget), &mut state.memory)
            .await;
        let Some(outcome) = outcome else {
            return;
        };
        self.record_usage(state, outcome.usage.as_ref());
        self.handler.on_event(&AgentEvent::Summarized {
            chunks: outcome.chunks,
            messages: outcome.messages,
            fallback: matches!(outcome.mode, SummaryMode::Fallback(_)),
        });
    }

    /// Head, then the task-state message, then the body.
    fn request_messages(&self, state: &RunState) -> Vec<Message> {
        let hits = state
            .memory
            .search(&state.task.recall_query(), self.config.retrieval.query_limit);
        let task_state = state.task.render(
            state.compressor.running(),
            &hits,
            self.config.retrieval.query_max_chars,
        );
        state.window.to_messages_with([Message::system(task_state)])
    }

    async fn handle_provider_error(&self, state: &mut RunState, err: ProviderError) {
        let message = err.to_string();
        match err.class() {
            ErrorClass::RateLimit => {
                let hits = state.guards.record_rate_limit();
                if hits > self.config.retry.max_rate_limit_retries {
                    error!(hits, "Rate limit retries exhausted");
                    state.fail(format!("rate limited {hits} times in a row: {message}"));
                    return;
                }
                let delay = self.config.retry.delay_for_attempt(hits - 1);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                warn!(attempt = hits, delay_ms, "Rate limited: {message}");
                self.handler.on_event(&AgentEvent::ProviderRetry {
                    attempt: hits,
                    delay_ms,
                    error: &message,
                });
                tokio::time::sleep(delay).await;
            }
            ErrorClass::Generic => {
                let errors = state.guards.record_provider_error();
                if errors > self.config.retry.max_generic_errors {
                    error!(errors, "Provider errors exhausted");
                    state.fail(format!("model request failed {errors} times in a row: {message}"));
                    return;
                }
                warn!(attempt = errors, "Provider error: {message}");
                self.handler.on_event(&AgentEvent::ProviderRetry {
                    attempt: errors,
                    delay_ms: 0,
                    error: &message,
                });
                state.append(Message::user(provider_error_note(&message)), self.handler);
            }
            ErrorClass::Fatal => {
                error!("Unrecoverable provider error: {message}");
                state.fail(format!("provider error: {message}"));
            }
        }
    }

    fn record_usage(&self, state: &mut RunState, usage: Option<&UsageInfo>) {
        let Some(usage) = usage else {
            return;
        };
        state.budget.record_usage(usage);
        state.prompt_tokens += u64::from(usage.prompt());
        state.completion_tokens += u64::from(usage.completion());
        self.handler.on_event(&AgentEvent::TokenUsage {
            prompt_tokens: usage.prompt(),
            completion_tokens: usage.completion(),
            used_tokens: state.budget.used_tokens,
            token_limit: state.budget.token_limit,
        });
    }

    /// Count the step, run the progress watchdog, and checkpoint.
    fn finish_step(&self, state: &mut RunState, progressed: bool) {
        state.step = state.current_step;
        if state.outcome.is_none() {
            match state.guards.record_step(progressed, &self.config.guards) {
                Watchdog::Ok => {}
                Watchdog::Warn(steps) => {
                    let note = no_progress_note(steps);
                    self.handler.on_event(&AgentEvent::GuardFired {
                        tool: "watchdog",
                        code: "NO_PROGRESS",
                        message: &note,
                    });
                    state.append(Message::user(note), self.handler);
                }
                Watchdog::Fail(steps) => {
                    warn!(steps, "No progress, ending run");
                    state.fail(format!("no progress for {steps} consecutive steps"));
                }
            }
        }
        self.save_checkpoint(state);
    }

    fn save_checkpoint(&self, state: &RunState) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        match store.save(&state.snapshot()) {
            Ok(path) => {
                self.handler.on_event(&AgentEvent::CheckpointSaved {
                    step: state.step,
                    path: &path.display().to_string(),
                });
            }
            Err(e) => warn!("Failed to save checkpoint: {e}"),
        }
    }

    fn finalize(&self, mut state: RunState) -> AgentRunResult {
        let outcome = match state.outcome.take() {
            Some(outcome) => outcome,
            None => Outcome::Failed {
                reason: "run ended without a result".into(),
                partial_answer: state.partial_answer(),
            },
        };
        let mut result = AgentRunResult {
            run_id: state.run_id.clone(),
            status: RunStatus::Failed,
            answer: None,
            summary: None,
            reason: None,
            partial_answer: None,
            repaired: false,
            steps: state.step,
            prompt_tokens: state.prompt_tokens,
            completion_tokens: state.completion_tokens,
            messages: Vec::new(),
        };
        match outcome {
            Outcome::Done {
                summary,
                answer,
                repaired,
            } => {
                result.status = RunStatus::Done;
                result.summary = Some(summary);
                result.answer = Some(answer);
                result.repaired = repaired;
            }
            Outcome::Failed { reason, partial_answer } => {
                result.reason = Some(reason);
                result.partial_answer = partial_answer;
            }
        }

        state.transition(result.status, self.handler);
        self.save_checkpoint(&state);
        match &result.reason {
            Some(reason) => info!(status = %result.status, steps = result.steps, "Run finished: {reason}"),
            None => info!(
                status = %result.status,
                steps = result.steps,
                tokens = result.total_tokens(),
                "Run finished"
            ),
        }
        self.handler.on_event(&AgentEvent::Finished {
            status: result.status,
            reason: result.reason.as_deref(),
        });
        result.messages = state.window.to_messages();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::{Value, json};

    use crate::agent::events::{EventResponse, FnEventHandler};
    use crate::api::provider::ProviderFuture;
    use crate::api::retry::RetryConfig;
    use crate::context::budget::BudgetConfig;
    use crate::agent::guards::GuardConfig;
    use crate::context::window::{COMPACTED_PREFIX, WindowConfig, check_turn_integrity};
    use crate::driver::{DriverFuture, DriverResponse, ErrorCode, InterventionKind, PageInfo};
    use crate::tools::BrowserAction;
    use crate::tools::catalog::RECOVERY_NO_PAGE;
    use crate::{ChatCompletion, MessageRole, ToolCall};

    // ── Scripted provider ──────────────────────────────────────────

    struct ScriptedProvider {
        capabilities: ProviderCapabilities,
        replies: Mutex<VecDeque<Result<ChatCompletion, ProviderError>>>,
        /// Offered tool names and tool choice of every request.
        requests: Mutex<Vec<(Vec<String>, ToolChoice)>>,
        /// Task-state block of every request.
        task_states: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<ChatCompletion, ProviderError>>) -> Self {
            Self {
                capabilities: ProviderCapabilities::new("scripted", "test-model"),
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                task_states: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<(Vec<String>, ToolChoice)> {
            self.requests.lock().unwrap().clone()
        }

        fn task_states(&self) -> Vec<String> {
            self.task_states.lock().unwrap().clone()
        }
    }

    impl ModelProvider for ScriptedProvider {
        fn capabilities(&self) -> ProviderCapabilities {
            self.capabilities.clone()
        }

        fn chat<'a>(
            &'a self,
            messages: &'a [Message],
            tools: &'a [ToolDef],
            options: &'a ChatOptions,
        ) -> ProviderFuture<'a> {
            Box::pin(async move {
                if let Some(task_state) = messages.iter().map(Message::text).find(|t| t.starts_with("## Task state")) {
                    self.task_states.lock().unwrap().push(task_state);
                }
                let names = tools.iter().map(|t| t.name().to_string()).collect();
                self.requests.lock().unwrap().push((names, options.tool_choice));
                let next = self.replies.lock().unwrap().pop_front();
                next.unwrap_or_else(|| {
                    Ok(ChatCompletion::with_calls(vec![call(
                        "end",
                        "fail",
                        json!({"reason": "script exhausted"}),
                    )]))
                })
            })
        }
    }

    // ── Scripted driver ────────────────────────────────────────────

    struct ScriptedDriver {
        url: Mutex<String>,
        /// Tools that silently move the page to another URL.
        moves: Mutex<HashMap<String, String>>,
        responses: Mutex<HashMap<String, VecDeque<DriverResponse>>>,
        executed: Mutex<Vec<String>>,
        navigation_waits: Mutex<u32>,
        intervention: Mutex<Option<InterventionKind>>,
    }

    impl ScriptedDriver {
        fn new(url: &str) -> Self {
            Self {
                url: Mutex::new(url.to_string()),
                moves: Mutex::new(HashMap::new()),
                responses: Mutex::new(HashMap::new()),
                executed: Mutex::new(Vec::new()),
                navigation_waits: Mutex::new(0),
                intervention: Mutex::new(None),
            }
        }

        fn script(self, tool: &str, responses: Vec<DriverResponse>) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert(tool.to_string(), responses.into());
            self
        }

        fn moves_to(self, tool: &str, url: &str) -> Self {
            self.moves.lock().unwrap().insert(tool.to_string(), url.to_string());
            self
        }

        fn with_intervention(self, kind: InterventionKind) -> Self {
            *self.intervention.lock().unwrap() = Some(kind);
            self
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    impl AutomationDriver for ScriptedDriver {
        fn execute<'a>(&'a self, action: &'a BrowserAction) -> DriverFuture<'a, DriverResponse> {
            Box::pin(async move {
                let name = action.name().to_string();
                self.executed.lock().unwrap().push(name.clone());
                if let Some(url) = self.moves.lock().unwrap().get(&name) {
                    *self.url.lock().unwrap() = url.clone();
                }
                let scripted = self
                    .responses
                    .lock()
                    .unwrap()
                    .get_mut(&name)
                    .and_then(VecDeque::pop_front);
                Ok(scripted.unwrap_or_else(|| DriverResponse::ok(json!({ "tool": name }))))
            })
        }

        fn current_page(&self) -> DriverFuture<'_, PageInfo> {
            Box::pin(async move { Ok(PageInfo::new(self.url.lock().unwrap().clone())) })
        }

        fn detect_intervention(&self) -> DriverFuture<'_, Option<InterventionKind>> {
            Box::pin(async move { Ok(self.intervention.lock().unwrap().take()) })
        }

        fn wait_for_navigation(&self, _timeout: Duration) -> DriverFuture<'_, DriverResponse> {
            Box::pin(async move {
                *self.navigation_waits.lock().unwrap() += 1;
                Ok(DriverResponse::ok(Value::Null))
            })
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    const SHOP: &str = "https://shop.example.com/kettle";

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall::new(id, name, args.to_string())
    }

    fn reply(calls: Vec<ToolCall>) -> Result<ChatCompletion, ProviderError> {
        Ok(ChatCompletion::with_calls(calls).with_usage(UsageInfo::new(100, 20)))
    }

    fn done(id: &str, summary: &str, answer: &str) -> ToolCall {
        call(id, "done", json!({"summary": summary, "answer": answer}))
    }

    fn config() -> AgentConfig {
        AgentConfig::default().with_retry(RetryConfig::immediate())
    }

    fn tool_results(result: &AgentRunResult) -> Vec<String> {
        result
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .map(Message::text)
            .collect()
    }

    // ── Scenarios ──────────────────────────────────────────────────

    #[tokio::test]
    async fn done_after_read_is_accepted() {
        let provider = ScriptedProvider::new(vec![
            reply(vec![call("c1", "read_page", json!({}))]),
            reply(vec![done("c2", "Read the product page", "19.99")]),
        ]);
        let driver = ScriptedDriver::new(SHOP);
        let orchestrator = Orchestrator::new(&provider, &driver, config()).unwrap();

        let result = orchestrator.run("Find the kettle price").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert_eq!(result.answer.as_deref(), Some("19.99"));
        assert!(!result.repaired);
        assert_eq!(result.steps, 2);
        assert_eq!(result.prompt_tokens, 200);
        assert_eq!(driver.executed(), vec!["read_page"]);
        assert!(check_turn_integrity(&result.messages));
    }

    #[tokio::test]
    async fn done_answer_is_repaired_from_text() {
        let provider = ScriptedProvider::new(vec![
            reply(vec![call("c1", "read_page", json!({}))]),
            Ok(ChatCompletion {
                content: Some("The cart total is visible.\nanswer: 42".into()),
                tool_calls: vec![call("c2", "done", json!({"summary": "Added up the cart"}))],
                ..Default::default()
            }),
        ]);
        let driver = ScriptedDriver::new(SHOP);
        let orchestrator = Orchestrator::new(&provider, &driver, config()).unwrap();

        let result = orchestrator.run("What is the cart total?").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert_eq!(result.answer.as_deref(), Some("42"));
        assert!(result.repaired);
    }

    #[tokio::test]
    async fn repeated_missing_target_triggers_one_self_heal() {
        let missing = || DriverResponse::failure(ErrorCode::TargetMissing, "no element with id 7");
        let provider = ScriptedProvider::new(vec![
            reply(vec![call("c1", "click", json!({"id": 7}))]),
            reply(vec![call("c2", "click", json!({"id": 7}))]),
            reply(vec![call("c3", "click", json!({"id": 7}))]),
            reply(vec![call("c4", "click", json!({"id": 9}))]),
            reply(vec![done("c5", "Clicked the buy button", "ordered")]),
        ]);
        let driver = ScriptedDriver::new(SHOP).script(
            "click",
            vec![missing(), missing(), missing(), DriverResponse::ok(json!({"clicked": true}))],
        );
        let heals = Mutex::new(0u32);
        let handler = FnEventHandler::new(|event| {
            if let AgentEvent::SelfHeal { .. } = event {
                *heals.lock().unwrap() += 1;
            }
            None
        });
        let orchestrator = Orchestrator::new(&provider, &driver, config())
            .unwrap()
            .with_event_handler(&handler);

        let result = orchestrator.run("Buy the kettle").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert_eq!(*heals.lock().unwrap(), 1);
        assert_eq!(
            driver.executed(),
            vec!["click", "click", "click", "read_page", "click"]
        );
        assert!(
            result
                .messages
                .iter()
                .any(|m| m.role == MessageRole::User && m.text().contains("self-heal"))
        );
        assert!(check_turn_integrity(&result.messages));
    }

    #[tokio::test]
    async fn exhausted_budget_ends_run_before_any_request() {
        let provider = ScriptedProvider::new(vec![reply(vec![done("c1", "s", "a")])]);
        let driver = ScriptedDriver::new(SHOP);
        let config = config().with_budget(BudgetConfig {
            token_limit: 50,
            ..Default::default()
        });
        let orchestrator = Orchestrator::new(&provider, &driver, config).unwrap();

        let result = orchestrator.run("Find the kettle price").await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.reason.unwrap().contains("insufficient token budget"));
        assert!(provider.requests().is_empty());
        assert_eq!(result.steps, 0);
    }

    #[tokio::test]
    async fn navigation_aborts_rest_of_batch() {
        let provider = ScriptedProvider::new(vec![
            reply(vec![
                call("c1", "click", json!({"id": 3})),
                call("c2", "read_page", json!({})),
                call("c3", "type_text", json!({"id": 4, "text": "kettle"})),
            ]),
            reply(vec![done("c4", "Opened the product", "opened")]),
        ]);
        let driver = ScriptedDriver::new(SHOP).script(
            "click",
            vec![DriverResponse::ok(json!({"clicked": true})).with("navigated", true)],
        );
        let orchestrator = Orchestrator::new(&provider, &driver, config()).unwrap();

        let result = orchestrator.run("Open the kettle").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert_eq!(driver.executed(), vec!["click"]);
        assert_eq!(*driver.navigation_waits.lock().unwrap(), 1);
        let aborted = tool_results(&result)
            .iter()
            .filter(|r| r.contains("ABORTED_BY_NAVIGATION"))
            .count();
        assert_eq!(aborted, 2);
        assert!(check_turn_integrity(&result.messages));
    }

    #[tokio::test]
    async fn text_only_streak_restricts_tools() {
        let provider = ScriptedProvider::new(vec![
            Ok(ChatCompletion::text("I will look around first.")),
            Ok(ChatCompletion::text("Still thinking about it.")),
            reply(vec![call("c1", "fail", json!({"reason": "cannot reach the shop"}))]),
        ]);
        let driver = ScriptedDriver::new("about:blank");
        let orchestrator = Orchestrator::new(&provider, &driver, config()).unwrap();

        let result = orchestrator.run("Find the kettle price").await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.reason.as_deref(), Some("cannot reach the shop"));
        assert_eq!(result.steps, 2);

        let requests = provider.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].1, ToolChoice::Auto);
        assert_eq!(requests[1].1, ToolChoice::Auto);
        let (tools, choice) = &requests[2];
        assert_eq!(*choice, ToolChoice::Required);
        let mut offered = tools.clone();
        offered.sort();
        let mut expected: Vec<String> = RECOVERY_NO_PAGE.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(offered, expected);
    }

    #[tokio::test]
    async fn rate_limits_are_retried() {
        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::RateLimited("slow down".into())),
            Err(ProviderError::Http {
                status: 429,
                body: "too many requests".into(),
            }),
            reply(vec![done("c1", "Answered from the goal", "yes")]),
        ]);
        let driver = ScriptedDriver::new(SHOP);
        let retries = Mutex::new(0u32);
        let handler = FnEventHandler::new(|event| {
            if let AgentEvent::ProviderRetry { .. } = event {
                *retries.lock().unwrap() += 1;
            }
            None
        });
        let orchestrator = Orchestrator::new(&provider, &driver, config())
            .unwrap()
            .with_event_handler(&handler);

        let result = orchestrator.run("Is the shop open?").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert_eq!(*retries.lock().unwrap(), 2);
        assert_eq!(result.steps, 1);
    }

    #[tokio::test]
    async fn repeated_provider_errors_fail_the_run() {
        let provider = ScriptedProvider::new(
            (0..4).map(|_| Err(ProviderError::Api("upstream exploded".into()))).collect(),
        );
        let driver = ScriptedDriver::new(SHOP);
        let orchestrator = Orchestrator::new(&provider, &driver, config()).unwrap();

        let result = orchestrator.run("Find the kettle price").await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.reason.unwrap().contains("upstream exploded"));
        assert_eq!(provider.requests().len(), 4);
    }

    #[tokio::test]
    async fn fatal_provider_error_fails_immediately() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Http {
            status: 401,
            body: "bad key".into(),
        })]);
        let driver = ScriptedDriver::new(SHOP);
        let orchestrator = Orchestrator::new(&provider, &driver, config()).unwrap();

        let result = orchestrator.run("Find the kettle price").await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(provider.requests().len(), 1);
    }

    #[test]
    fn provider_without_tools_is_rejected() {
        let mut provider = ScriptedProvider::new(Vec::new());
        provider.capabilities = provider.capabilities.clone().with_tools(false);
        let driver = ScriptedDriver::new(SHOP);
        assert!(matches!(
            Orchestrator::new(&provider, &driver, config()),
            Err(AgentError::ToolsUnsupported { .. })
        ));
    }

    #[tokio::test]
    async fn plan_is_approved_inline() {
        let provider = ScriptedProvider::new(vec![
            reply(vec![call("c1", "click", json!({"id": 1}))]),
            reply(vec![call("c2", "submit_plan", json!({"steps": ["open the shop", "read the price"]}))]),
            reply(vec![done("c3", "Followed the plan", "19.99")]),
        ]);
        let driver = ScriptedDriver::new(SHOP);
        let statuses = Mutex::new(Vec::new());
        let handler = FnEventHandler::new(|event| match event {
            AgentEvent::PlanApprovalRequested { .. } => Some(EventResponse::Approve),
            AgentEvent::StatusChanged { to, .. } => {
                statuses.lock().unwrap().push(*to);
                None
            }
            _ => None,
        });
        let orchestrator = Orchestrator::new(&provider, &driver, config().with_plan_approval(true))
            .unwrap()
            .with_event_handler(&handler);

        let result = orchestrator.run("Find the kettle price").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert!(driver.executed().is_empty());
        assert!(tool_results(&result)[0].contains("PERMISSION_DENIED"));
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                RunStatus::Running,
                RunStatus::PausedWaitingUser,
                RunStatus::Running,
                RunStatus::Done
            ]
        );
        assert!(result.messages.iter().any(|m| m.text().starts_with("Approved plan:")));
    }

    #[tokio::test]
    async fn abort_while_waiting_for_plan_fails_the_run() {
        let provider = ScriptedProvider::new(vec![reply(vec![call(
            "c1",
            "submit_plan",
            json!({"steps": ["open the shop"]}),
        )])]);
        let driver = ScriptedDriver::new(SHOP);
        let control = RunControl::new();
        let host = control.clone();
        let handler = FnEventHandler::new(move |event| {
            if let AgentEvent::PlanApprovalRequested { .. } = event {
                host.abort();
            }
            None
        });
        let orchestrator = Orchestrator::new(&provider, &driver, config().with_plan_approval(true))
            .unwrap()
            .with_control(control)
            .with_event_handler(&handler);

        let result = orchestrator.run("Find the kettle price").await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.reason.unwrap().contains("aborted"));
    }

    #[tokio::test]
    async fn script_permission_is_asked_once_per_domain() {
        let provider = ScriptedProvider::new(vec![
            reply(vec![call("c1", "evaluate_js", json!({"script": "document.title"}))]),
            reply(vec![call("c2", "evaluate_js", json!({"script": "location.href"}))]),
            reply(vec![done("c3", "Read the title", "Kettle")]),
        ]);
        let driver = ScriptedDriver::new(SHOP);
        let asked = Mutex::new(0u32);
        let handler = FnEventHandler::new(|event| match event {
            AgentEvent::DomainPermissionRequested { .. } => {
                *asked.lock().unwrap() += 1;
                Some(EventResponse::Approve)
            }
            _ => None,
        });
        let orchestrator = Orchestrator::new(&provider, &driver, config())
            .unwrap()
            .with_event_handler(&handler);

        let result = orchestrator.run("Read the page title").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert_eq!(*asked.lock().unwrap(), 1);
        assert_eq!(driver.executed(), vec!["evaluate_js", "evaluate_js"]);
    }

    #[tokio::test]
    async fn intervention_pauses_until_approved() {
        let provider = ScriptedProvider::new(vec![reply(vec![done("c1", "Solved after login", "ok")])]);
        let driver = ScriptedDriver::new(SHOP).with_intervention(InterventionKind::Captcha);
        let seen = Mutex::new(Vec::new());
        let handler = FnEventHandler::new(|event| match event {
            AgentEvent::InterventionRequired { url, .. } => {
                seen.lock().unwrap().push(url.to_string());
                Some(EventResponse::Approve)
            }
            _ => None,
        });
        let orchestrator = Orchestrator::new(&provider, &driver, config())
            .unwrap()
            .with_event_handler(&handler);

        let result = orchestrator.run("Log in").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert_eq!(*seen.lock().unwrap(), vec![SHOP.to_string()]);
    }

    #[tokio::test]
    async fn step_limit_keeps_partial_answer() {
        let thinking = |id: &str| {
            Ok(ChatCompletion {
                content: Some("The price looks like 19.99".into()),
                tool_calls: vec![call(id, "read_page", json!({}))],
                ..Default::default()
            })
        };
        let provider = ScriptedProvider::new(vec![thinking("c1"), thinking("c2")]);
        let driver = ScriptedDriver::new(SHOP);
        let orchestrator = Orchestrator::new(&provider, &driver, config().with_max_steps(2)).unwrap();

        let result = orchestrator.run("Find the kettle price").await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.reason.unwrap().contains("step limit of 2"));
        assert!(result.partial_answer.unwrap().contains("19.99"));
        assert_eq!(result.steps, 2);
        // The second read is served from the observation cache.
        assert_eq!(driver.executed(), vec!["read_page"]);
    }

    #[tokio::test]
    async fn resume_continues_from_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = ScriptedDriver::new(SHOP);

        let first = ScriptedProvider::new(vec![reply(vec![call("c1", "read_page", json!({}))])]);
        let config1 = config().with_max_steps(1).with_checkpoint_dir(tmp.path());
        let stopped = Orchestrator::new(&first, &driver, config1)
            .unwrap()
            .run("Find the kettle price")
            .await;
        assert_eq!(stopped.status, RunStatus::Failed);

        let store = CheckpointStore::new(tmp.path()).unwrap();
        let checkpoint = store.load_latest(&stopped.run_id).unwrap().unwrap();
        assert_eq!(checkpoint.step, 1);
        assert_eq!(checkpoint.evidence.structural_reads, 1);

        let second = ScriptedProvider::new(vec![reply(vec![done("c2", "Read the page", "19.99")])]);
        let config2 = config().with_max_steps(3).with_checkpoint_dir(tmp.path());
        let resumed = Orchestrator::new(&second, &driver, config2)
            .unwrap()
            .resume(checkpoint)
            .await;
        assert!(resumed.is_success(), "{:?}", resumed.reason);
        assert_eq!(resumed.run_id, stopped.run_id);
        assert_eq!(resumed.steps, 2);
        assert!(check_turn_integrity(&resumed.messages));
    }

    #[tokio::test]
    async fn silent_url_change_aborts_rest_of_batch() {
        let provider = ScriptedProvider::new(vec![
            reply(vec![
                call("c1", "click", json!({"id": 3})),
                call("c2", "read_page", json!({})),
                call("c3", "type_text", json!({"id": 4, "text": "kettle"})),
            ]),
            reply(vec![done("c4", "Opened the cart", "opened")]),
        ]);
        let cart = "https://shop.example.com/cart";
        let driver = ScriptedDriver::new(SHOP).moves_to("click", cart);
        let orchestrator = Orchestrator::new(&provider, &driver, config()).unwrap();

        let result = orchestrator.run("Open the cart").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert_eq!(driver.executed(), vec!["click"]);
        assert_eq!(*driver.navigation_waits.lock().unwrap(), 1);
        let aborted = tool_results(&result)
            .iter()
            .filter(|r| r.contains("ABORTED_BY_NAVIGATION"))
            .count();
        assert_eq!(aborted, 2);
        assert!(provider.task_states()[1].contains(&format!("Current page: {cart}")));
        assert!(check_turn_integrity(&result.messages));
    }

    #[tokio::test]
    async fn navigation_tool_aborts_batch_without_driver_flag() {
        let provider = ScriptedProvider::new(vec![
            reply(vec![
                call("c1", "navigate", json!({"url": SHOP})),
                call("c2", "click", json!({"id": 1})),
            ]),
            reply(vec![done("c3", "Opened the shop", "opened")]),
        ]);
        let driver = ScriptedDriver::new(SHOP);
        let orchestrator = Orchestrator::new(&provider, &driver, config()).unwrap();

        let result = orchestrator.run("Open the shop").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert_eq!(driver.executed(), vec!["navigate"]);
        assert_eq!(*driver.navigation_waits.lock().unwrap(), 1);
        assert!(tool_results(&result)[1].contains("ABORTED_BY_NAVIGATION"));
    }

    fn quick_watchdog() -> AgentConfig {
        config().with_guards(GuardConfig {
            progress_warn_steps: 2,
            progress_fail_steps: 3,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn identical_reads_trip_the_watchdog() {
        let provider = ScriptedProvider::new(
            (1..=5)
                .map(|i| reply(vec![call(&format!("c{i}"), "get_text", json!({}))]))
                .collect(),
        );
        let driver = ScriptedDriver::new(SHOP);
        let warnings = Mutex::new(0u32);
        let handler = FnEventHandler::new(|event| {
            if let AgentEvent::GuardFired { tool: "watchdog", .. } = event {
                *warnings.lock().unwrap() += 1;
            }
            None
        });
        let orchestrator = Orchestrator::new(&provider, &driver, quick_watchdog())
            .unwrap()
            .with_event_handler(&handler);

        let result = orchestrator.run("Find the kettle price").await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.reason.as_deref(), Some("no progress for 3 consecutive steps"));
        assert_eq!(result.steps, 4);
        assert_eq!(driver.executed().len(), 4);
        assert_eq!(*warnings.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn changing_reads_count_as_progress() {
        let mut replies: Vec<_> = (1..=4)
            .map(|i| reply(vec![call(&format!("c{i}"), "get_text", json!({}))]))
            .collect();
        replies.push(reply(vec![done("c5", "Watched the price", "18.49")]));
        let provider = ScriptedProvider::new(replies);
        let driver = ScriptedDriver::new(SHOP).script(
            "get_text",
            ["19.99", "19.49", "18.99", "18.49"]
                .iter()
                .map(|price| DriverResponse::ok(json!({ "text": format!("Kettle {price}") })))
                .collect(),
        );
        let orchestrator = Orchestrator::new(&provider, &driver, quick_watchdog()).unwrap();

        let result = orchestrator.run("Watch the kettle price").await;
        assert!(result.is_success(), "{:?}", result.reason);
        assert_eq!(result.steps, 5);
    }

    #[tokio::test]
    async fn facts_and_unknowns_reach_the_task_state() {
        let provider = ScriptedProvider::new(vec![
            reply(vec![call("c1", "search_text", json!({"query": "gift wrap"}))]),
            reply(vec![call("c2", "remember", json!({"key": "shipping", "value": "4.99"}))]),
            reply(vec![done("c3", "Found the shipping cost", "4.99")]),
        ]);
        let driver = ScriptedDriver::new(SHOP).script(
            "search_text",
            vec![DriverResponse::failure(ErrorCode::TargetMissing, "no match for gift wrap")],
        );
        let orchestrator = Orchestrator::new(&provider, &driver, config()).unwrap();

        let result = orchestrator
            .run("What is the kettle price? What does shipping cost?")
            .await;
        assert!(result.is_success(), "{:?}", result.reason);

        let states = provider.task_states();
        assert_eq!(states.len(), 3);
        assert!(states[0].contains("Still unknown:\n- What is the kettle price?\n- What does shipping cost?\n"));
        assert!(states[1].contains(
            "Still unknown:\n- What is the kettle price?\n- What does shipping cost?\n- gift wrap (not found on the page yet)\n"
        ));
        assert!(states[2].contains("Known facts:\n- shipping: 4.99\n"));
        assert!(states[2].contains("Still unknown:\n- What is the kettle price?\n- gift wrap (not found on the page yet)\n"));
    }

    #[tokio::test]
    async fn pressure_tiers_warn_compact_and_cool_down() {
        // Payload sizes in characters; 3.5 characters per token against a
        // one-million-token window.
        let text = |tokens: usize| DriverResponse::ok(json!({ "text": "x".repeat(tokens * 7 / 2) }));
        let provider = ScriptedProvider::new(vec![
            reply(vec![call("c1", "get_text", json!({}))]),
            reply(vec![call("c2", "get_text", json!({"id": 2}))]),
            reply(vec![call("c3", "get_text", json!({"id": 3}))]),
            reply(vec![done("c4", "Read the catalog", "done")]),
        ]);
        let driver = ScriptedDriver::new(SHOP).script("get_text", vec![text(850_000), text(60_000), text(880_000)]);
        let config = config()
            .with_max_tokens(1_000)
            .with_budget(BudgetConfig {
                token_limit: 100_000_000,
                context_window_tokens: 1_000_000,
                reserved_output_tokens: 0,
                compact_cooldown_steps: 3,
            })
            .with_window(WindowConfig {
                context_ratio: 1.0,
                ..Default::default()
            });

        let pressures = Mutex::new(Vec::new());
        let warnings = Mutex::new(Vec::new());
        let critical = Mutex::new(0u32);
        let handler = FnEventHandler::new(|event| {
            match event {
                AgentEvent::StepStart { pressure, .. } => pressures.lock().unwrap().push(*pressure),
                AgentEvent::ContextPressure { ratio } => warnings.lock().unwrap().push(*ratio),
                AgentEvent::Compaction { critical: true, .. } => *critical.lock().unwrap() += 1,
                _ => {}
            }
            None
        });
        let orchestrator = Orchestrator::new(&provider, &driver, config)
            .unwrap()
            .with_event_handler(&handler);

        let result = orchestrator.run("Read the whole catalog").await;
        assert!(result.is_success(), "{:?}", result.reason);

        let pressures = pressures.lock().unwrap().clone();
        assert_eq!(pressures.len(), 4);
        assert!(pressures[0] < WARNING_PRESSURE);
        assert!((WARNING_PRESSURE..CRITICAL_PRESSURE).contains(&pressures[1]), "{pressures:?}");
        assert!(pressures[2] >= CRITICAL_PRESSURE, "{pressures:?}");
        // Still critical one step later, but inside the cooldown.
        assert!(pressures[3] >= CRITICAL_PRESSURE, "{pressures:?}");

        assert_eq!(warnings.lock().unwrap().len(), 1);
        assert_eq!(*critical.lock().unwrap(), 1);
        assert!(
            tool_results(&result)
                .iter()
                .any(|r| r.starts_with(COMPACTED_PREFIX) && r.contains("get_text"))
        );
        assert!(result.messages.iter().any(|m| m.text().starts_with("[context]")));
        assert!(check_turn_integrity(&result.messages));
    }
}
