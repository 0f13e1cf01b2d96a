//! Conversation memory and context-budget management.
//!
//! The live history must fit a fixed token window while the run itself is
//! unbounded. Four layers cooperate:
//!
//! 1. **[`tokens`]** estimates cost without a tokenizer (chars / 3.5, flat
//!    image charge, per-message framing).
//! 2. **[`budget`]** tracks the run allowance and context pressure, and gates
//!    every model call through [`BudgetState::precheck`].
//! 3. **[`window`]** trims whole turn groups past the message/token ceilings
//!    and compacts low-importance payloads under pressure.
//! 4. **[`summarizer`]** folds evicted turns into a running summary and feeds
//!    fragments to **[`retrieval`]**, which answers per-turn recall queries.

pub mod budget;
pub mod retrieval;
pub mod summarizer;
pub mod tokens;
pub mod window;

pub use budget::{BudgetConfig, BudgetState, PrecheckOutcome, PrecheckPolicy};
pub use retrieval::{EntrySource, RetrievalConfig, RetrievalMemory};
pub use summarizer::{HistorySummary, SummaryCompressor, SummaryConfig};
pub use window::{CompactionLevel, ConversationWindow, WindowConfig};
