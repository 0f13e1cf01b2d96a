//! Browser tools exposed to the model.
//!
//! - [`args`]: typed arguments and the normalize → validate → decode pipeline.
//! - [`catalog`]: tool definitions and the restricted recovery sets.
//! - [`reflection`]: recovery instructions injected by the loop guards.

pub mod args;
pub mod catalog;
pub mod reflection;

pub use args::{ActionKind, ArgsError, BrowserAction, parse_action};
pub use catalog::ToolCatalog;
