//! Configuration for an agent run.
//!
//! Everything has a default; a config file only needs the keys it changes.
//!
//! ```
//! use wayfarer::agent::config::AgentConfig;
//!
//! let config: AgentConfig = serde_json::from_str(r#"{
//!     "max_steps": 25,
//!     "window": { "max_conversation_messages": 28 },
//!     "guards": { "max_self_heals": 1 }
//! }"#).unwrap();
//! assert_eq!(config.max_steps, 25);
//! assert_eq!(config.window.max_conversation_messages, 28);
//! assert_eq!(config.retrieval.capacity, 120);
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::guards::GuardConfig;
use crate::api::provider::ChatOptions;
use crate::api::retry::RetryConfig;
use crate::context::budget::BudgetConfig;
use crate::context::retrieval::RetrievalConfig;
use crate::context::summarizer::SummaryConfig;
use crate::context::window::WindowConfig;
use crate::driver::cache::CacheConfig;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a browser automation agent. You act only \
through tool calls. Read the page before interacting, use element ids from the most recent \
read, and verify results on the page. When the goal is reached call done with a short \
summary and the exact answer. If the goal cannot be reached call fail with the reason.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_prompt: String,
    /// Counted steps; stalls retried without a tool call do not count.
    pub max_steps: u32,
    /// Head messages kept out of eviction (system prompt, goal, approved plan).
    pub protected_head: usize,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub disable_thinking: bool,
    /// Require a `submit_plan` approval before acting.
    pub require_plan_approval: bool,
    /// Offer `evaluate_js`.
    pub allow_scripts: bool,
    /// Consecutive text-only replies before tools are restricted.
    pub no_tool_streak_limit: u32,
    /// Restricted retries of one step before it counts anyway.
    pub max_no_tool_retries: u32,
    /// Attach screenshots as vision messages when the model supports them.
    pub vision: bool,
    /// Where to write per-step checkpoints. `None` disables them.
    pub checkpoint_dir: Option<PathBuf>,
    pub window: WindowConfig,
    pub summary: SummaryConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
    pub guards: GuardConfig,
    pub budget: BudgetConfig,
    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps: 40,
            protected_head: 3,
            max_tokens: None,
            temperature: None,
            disable_thinking: false,
            require_plan_approval: false,
            allow_scripts: true,
            no_tool_streak_limit: 2,
            max_no_tool_retries: 3,
            vision: true,
            checkpoint_dir: None,
            window: WindowConfig::default(),
            summary: SummaryConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache: CacheConfig::default(),
            guards: GuardConfig::default(),
            budget: BudgetConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_steps(mut self, steps: u32) -> Self {
        self.max_steps = steps;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_plan_approval(mut self, required: bool) -> Self {
        self.require_plan_approval = required;
        self
    }

    pub fn with_scripts(mut self, allowed: bool) -> Self {
        self.allow_scripts = allowed;
        self
    }

    pub fn with_vision(mut self, enabled: bool) -> Self {
        self.vision = enabled;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_window(mut self, window: WindowConfig) -> Self {
        self.window = window;
        self
    }

    pub fn with_guards(mut self, guards: GuardConfig) -> Self {
        self.guards = guards;
        self
    }

    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Request options for an ordinary step.
    pub fn chat_options(&self) -> ChatOptions {
        let mut options = ChatOptions::default();
        if let Some(max) = self.max_tokens {
            options = options.with_max_tokens(max);
        }
        if let Some(t) = self.temperature {
            options = options.with_temperature(t);
        }
        if self.disable_thinking {
            options = options.with_thinking_disabled();
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::provider::ToolChoice;

    #[test]
    fn defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_steps, 40);
        assert_eq!(config.protected_head, 3);
        assert_eq!(config.window.max_conversation_messages, 40);
        assert_eq!(config.cache.ttl_ms, 3_000);
        assert_eq!(config.summary.max_chunks_per_pass, 3);
        assert_eq!(config.guards.progress_fail_steps, 12);
        assert!(config.checkpoint_dir.is_none());
    }

    #[test]
    fn builders_and_options() {
        let config = AgentConfig::new()
            .with_max_steps(5)
            .with_max_tokens(900)
            .with_temperature(0.2)
            .with_plan_approval(true)
            .with_scripts(false);
        assert_eq!(config.max_steps, 5);
        assert!(config.require_plan_approval);
        assert!(!config.allow_scripts);
        let options = config.chat_options();
        assert_eq!(options.max_tokens, Some(900));
        assert_eq!(options.temperature, Some(0.2));
        assert_eq!(options.tool_choice, ToolChoice::Auto);
    }

    #[test]
    fn round_trips_through_json() {
        let config = AgentConfig::default().with_checkpoint_dir("/tmp/wayfarer");
        let json = serde_json::to_string(&config).unwrap();
        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
