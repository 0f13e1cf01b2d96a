//! Throttled warnings.
//!
//! Some warnings (context pressure, repair ratio, cache misses) can fire every
//! step. The orchestrator sends them through an injected [`Diagnostics`] sink
//! keyed by a stable string; [`ThrottledDiagnostics`] logs each key at most
//! once per interval and counts the rest.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

pub trait Diagnostics: Send + Sync {
    /// Report a warning. Returns whether it was emitted.
    fn warn(&self, key: &str, message: &str) -> bool;

    /// How many times `key` was reported, emitted or not.
    fn count(&self, key: &str) -> u64 {
        let _ = key;
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyState {
    last: Instant,
    count: u64,
    suppressed: u64,
}

/// Logs through `tracing`, at most once per key per interval.
pub struct ThrottledDiagnostics {
    interval: Duration,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl Default for ThrottledDiagnostics {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ThrottledDiagnostics {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Report as of `now`.
    pub fn warn_at(&self, key: &str, message: &str, now: Instant) -> bool {
        let Ok(mut keys) = self.keys.lock() else {
            warn!("{message}");
            return true;
        };
        match keys.get_mut(key) {
            Some(state) if now.saturating_duration_since(state.last) < self.interval => {
                state.count += 1;
                state.suppressed += 1;
                false
            }
            Some(state) => {
                let suppressed = state.suppressed;
                state.last = now;
                state.count += 1;
                state.suppressed = 0;
                if suppressed > 0 {
                    warn!(key, suppressed, "{message}");
                } else {
                    warn!(key, "{message}");
                }
                true
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last: now,
                        count: 1,
                        suppressed: 0,
                    },
                );
                warn!(key, "{message}");
                true
            }
        }
    }
}

impl Diagnostics for ThrottledDiagnostics {
    fn warn(&self, key: &str, message: &str) -> bool {
        self.warn_at(key, message, Instant::now())
    }

    fn count(&self, key: &str) -> u64 {
        self.keys
            .lock()
            .ok()
            .and_then(|k| k.get(key).map(|s| s.count))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_per_key() {
        let diag = ThrottledDiagnostics::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(diag.warn_at("pressure", "high", t0));
        assert!(!diag.warn_at("pressure", "high", t0 + Duration::from_secs(1)));
        assert!(diag.warn_at("repair", "ratio", t0 + Duration::from_secs(1)));
        assert!(diag.warn_at("pressure", "high", t0 + Duration::from_secs(11)));
        assert_eq!(diag.count("pressure"), 3);
        assert_eq!(diag.count("missing"), 0);
    }
}
