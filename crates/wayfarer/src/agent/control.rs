//! External control of a running agent: abort, resume, approvals.
//!
//! [`RunControl`] is a cheap cloneable handle shared between the orchestrator
//! and the host. Pauses register a waiter before the corresponding event is
//! emitted, so a host that resolves synchronously from inside its event
//! handler is never lost. Waiters have no timeout; [`RunControl::abort`]
//! resolves every pending one with [`Resolution::Aborted`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

/// What the run is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    /// CAPTCHA or login wall; the user finishes it in the browser.
    Intervention,
    PlanApproval,
    DomainPermission,
}

/// Host answer to a pause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Resume, or approve the plan / grant the domain.
    Approve,
    /// Refuse, with feedback passed to the model.
    Deny(String),
    Aborted,
}

#[derive(Default)]
struct Inner {
    aborted: AtomicBool,
    waiters: Mutex<HashMap<WaitKind, Vec<oneshot::Sender<Resolution>>>>,
}

#[derive(Clone, Default)]
pub struct RunControl {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControl")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Set the abort flag and release every pending waiter.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        let drained: Vec<_> = match self.inner.waiters.lock() {
            Ok(mut waiters) => waiters.drain().flat_map(|(_, senders)| senders).collect(),
            Err(_) => Vec::new(),
        };
        for sender in drained {
            let _ = sender.send(Resolution::Aborted);
        }
        debug!("run aborted");
    }

    /// Clear the abort flag for a fresh run.
    pub fn reset(&self) {
        self.inner.aborted.store(false, Ordering::SeqCst);
    }

    /// Register a waiter. Resolves immediately with `Aborted` after abort.
    pub fn wait_for(&self, kind: WaitKind) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        if self.is_aborted() {
            let _ = tx.send(Resolution::Aborted);
            return rx;
        }
        if let Ok(mut waiters) = self.inner.waiters.lock() {
            waiters.entry(kind).or_default().push(tx);
        }
        rx
    }

    /// Resolve every waiter of `kind`. Returns how many were waiting.
    pub fn resolve(&self, kind: WaitKind, resolution: Resolution) -> usize {
        let senders = match self.inner.waiters.lock() {
            Ok(mut waiters) => waiters.remove(&kind).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let count = senders.len();
        for sender in senders {
            let _ = sender.send(resolution.clone());
        }
        count
    }

    /// Whether anything is waiting on `kind`.
    pub fn is_waiting(&self, kind: WaitKind) -> bool {
        self.inner
            .waiters
            .lock()
            .map(|w| w.get(&kind).is_some_and(|s| !s.is_empty()))
            .unwrap_or(false)
    }
}

/// Await a waiter; a dropped sender counts as an abort.
pub async fn wait(rx: oneshot::Receiver<Resolution>) -> Resolution {
    rx.await.unwrap_or(Resolution::Aborted)
}
