//! C3: the pending-token registry (§4.3). A named slot maps a token string
//! to at-most-one waiter; `resolve` wakes whichever waiter is registered and
//! is a no-op if absent (wake-one, idempotent-if-absent, per §9).
//!
//! A single waiter can be registered against several token names at once
//! (e.g. `("OK", "ALREADY CONNECTED")`); whichever name is resolved first
//! wins and the receiver yields it. Implemented with cloned
//! `mpsc::Sender<&'static str>` handles of capacity 1 rather than a oneshot,
//! since a oneshot sender cannot be cloned across multiple token names.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// The registry is shared between the UART reader task (which resolves
/// tokens as it demuxes bytes) and every task that registers a waiter (the
/// AT engine, the send pipeline). Both access it across `await` points on
/// the same single-threaded runtime, so it is wrapped in a `Mutex` rather
/// than accessed through plain interior mutability — not for true
/// concurrency, but so the borrow checker admits the sharing.
pub type SharedTokens = Arc<Mutex<TokenRegistry>>;

pub struct TokenRegistry {
    waiters: HashMap<&'static str, mpsc::Sender<&'static str>>,
}

impl TokenRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { waiters: HashMap::new() }
    }

    /// Register a single waiter across every name in `tokens`. Returns a
    /// receiver that yields whichever token name is resolved first.
    pub fn register(&mut self, tokens: &[&'static str]) -> mpsc::Receiver<&'static str> {
        let (tx, rx) = mpsc::channel(1);
        for &t in tokens {
            self.waiters.insert(t, tx.clone());
        }
        rx
    }

    /// Wake whichever waiter is registered for `token`. Returns whether a
    /// waiter was actually present.
    pub fn resolve(&mut self, token: &str) -> bool {
        if let Some((&name, tx)) = self.waiters.remove_entry(token) {
            let _ = tx.try_send(name);
            true
        } else {
            false
        }
    }

    /// Remove registrations for `tokens` on every exit path, including
    /// timeout, so stale entries do not misroute later frames.
    pub fn unregister(&mut self, tokens: &[&'static str]) {
        for t in tokens {
            self.waiters.remove(t);
        }
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_wakes_the_registered_waiter() {
        let mut reg = TokenRegistry::new();
        let mut rx = reg.register(&["OK"]);
        assert!(reg.resolve("OK"));
        assert_eq!(rx.recv().await, Some("OK"));
    }

    #[tokio::test]
    async fn resolve_on_absent_token_is_a_harmless_no_op() {
        let mut reg = TokenRegistry::new();
        assert!(!reg.resolve("OK"));
    }

    #[tokio::test]
    async fn either_expected_token_wakes_the_same_waiter() {
        let mut reg = TokenRegistry::new();
        let mut rx = reg.register(&["OK", "ALREADY CONNECTED"]);
        assert!(reg.resolve("ALREADY CONNECTED"));
        assert_eq!(rx.recv().await, Some("ALREADY CONNECTED"));
    }

    #[tokio::test]
    async fn unregister_prevents_stale_misrouting() {
        let mut reg = TokenRegistry::new();
        let _rx = reg.register(&["OK"]);
        reg.unregister(&["OK"]);
        assert!(!reg.resolve("OK"));
    }
}
