//! Plan approval gate plumbing.
//!
//! When approval is required, the runner emits a `plan-approval-request` and
//! suspends until the hosting application resolves the decision.  The engine
//! only defines the waiting side; how the decision arrives (HTTP callback,
//! UI action, test script) is the host's concern.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{EngineError, Result};

/// Where the runner waits for a plan approval decision.
#[async_trait]
pub trait ApprovalSource: Send + Sync {
    /// Resolve to `true` (approved) or `false` (rejected) for this plan.
    async fn wait_decision(&self, plan_id: &str) -> Result<bool>;
}

/// Approves every plan without waiting.  The default when the host does not
/// wire up an approval flow.
pub struct AutoApprove;

#[async_trait]
impl ApprovalSource for AutoApprove {
    async fn wait_decision(&self, _plan_id: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Rendezvous between the suspended runner and an out-of-band decision.
///
/// The runner registers a waiter keyed by plan id; the host calls
/// [`ApprovalRegistry::resolve`] when the user decides.
#[derive(Default)]
pub struct ApprovalRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ApprovalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a decision for a pending plan.  Returns false when no run is
    /// waiting on that plan id.
    pub fn resolve(&self, plan_id: &str, approved: bool) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plan_id);
        match sender {
            Some(tx) => tx.send(approved).is_ok(),
            None => {
                tracing::warn!(plan_id, "approval decision for unknown plan");
                false
            }
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ApprovalSource for ApprovalRegistry {
    async fn wait_decision(&self, plan_id: &str) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plan_id.to_string(), tx);
        rx.await.map_err(|_| EngineError::ApprovalFailed {
            reason: "decision channel closed before a decision arrived".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn registry_delivers_decision_to_waiter() {
        let registry = Arc::new(ApprovalRegistry::new());
        let waiter = Arc::clone(&registry);
        let handle = tokio::spawn(async move { waiter.wait_decision("p1").await });

        // Let the waiter register before resolving.
        tokio::task::yield_now().await;
        while registry.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(registry.resolve("p1", false));
        assert_eq!(handle.await.unwrap().unwrap(), false);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn resolve_without_waiter_is_a_no_op() {
        let registry = ApprovalRegistry::new();
        assert!(!registry.resolve("missing", true));
    }

    #[tokio::test]
    async fn auto_approve_always_approves() {
        assert!(AutoApprove.wait_decision("any").await.unwrap());
    }
}
