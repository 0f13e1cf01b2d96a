//! Convenience re-exports for common `wayfarer` types.
//!
//! ```ignore
//! use wayfarer::prelude::*;
//! ```
//!
//! Covers what a host needs to run a task: the provider and driver traits,
//! [`Message`] constructors, the [`Orchestrator`] and its config, event
//! handlers, and checkpoints. Context-management internals stay in their
//! modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ChatCompletion, Message, ToolCall, ToolDef, UsageInfo, json_schema_for};

// ── Model provider ──────────────────────────────────────────────────
pub use crate::api::openrouter::OpenRouterClient;
pub use crate::api::provider::{
    ChatOptions, ModelProvider, ProviderCapabilities, ProviderError, ProviderFuture, ToolChoice,
};
pub use crate::api::retry::RetryConfig;

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    AgentConfig, AgentError, AgentEvent, AgentRunResult, Checkpoint, CheckpointStore,
    CompositeEventHandler, EventHandler, EventResponse, FnEventHandler, LoggingHandler,
    NoopHandler, Orchestrator, Resolution, RunControl, RunStatus, WaitKind,
};

// ── Driver ──────────────────────────────────────────────────────────
pub use crate::driver::{
    AutomationDriver, DriverError, DriverFuture, DriverResponse, ErrorCode, InterventionKind,
    PageInfo,
};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{BrowserAction, ToolCatalog};
