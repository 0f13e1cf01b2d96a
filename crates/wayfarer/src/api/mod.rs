//! Model provider boundary.
//!
//! - [`provider`]: the [`ModelProvider`](provider::ModelProvider) trait,
//!   request options, capabilities, and the classified [`ProviderError`](provider::ProviderError).
//! - [`openrouter`]: an OpenAI-compatible HTTP client implementing the trait.
//! - [`retry`]: backoff policy for rate limits and consecutive errors.
//! - [`tracing`]: run correlation IDs.

pub mod openrouter;
pub mod provider;
pub mod retry;
pub mod tracing;
