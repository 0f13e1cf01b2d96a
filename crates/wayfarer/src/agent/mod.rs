//! Agent runtime: the [`Orchestrator`] step loop and its supporting modules.
//!
//! - [`orchestrator::Orchestrator`] runs a task to completion. Start here.
//! - [`config::AgentConfig`] holds the run limits and every nested
//!   subsystem config.
//! - [`events`] has the [`EventHandler`] trait and [`AgentEvent`] enum for
//!   observing a run, plus [`LoggingHandler`], [`CompositeEventHandler`], and
//!   [`FnEventHandler`].
//! - [`control`] is the host's abort and resume handle.
//! - [`guards`] maps repeating tool failures to recovery, self-heal, or a
//!   hard failure.
//! - [`done`] validates and repairs the `done` payload.
//! - [`checkpoint`] saves and resumes runs.
//! - [`prompt`] assembles the system prompt with per-model variants.

pub mod checkpoint;
pub mod config;
pub mod control;
pub mod diagnostics;
pub mod done;
pub mod events;
pub(crate) mod execution;
pub mod guards;
pub mod orchestrator;
pub mod prompt;
pub mod state;
pub mod task;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
pub use config::AgentConfig;
pub use control::{Resolution, RunControl, WaitKind};
pub use diagnostics::{Diagnostics, ThrottledDiagnostics};
pub use events::{
    AgentEvent, AgentRunResult, CompositeEventHandler, EventHandler, EventResponse, FnEventHandler,
    LoggingHandler, NoopHandler,
};
pub use orchestrator::{AgentError, Orchestrator};
pub use prompt::{PromptVariant, PromptVariants, SystemPromptBuilder};
pub use state::RunStatus;
pub use task::TaskState;
