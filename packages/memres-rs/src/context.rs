//! Per-call context: cancellation plus the caller's open transactions.
//!
//! Every resource operation takes a [`Context`]. It carries:
//! - a cancellation token, checked before each operation and during
//!   iteration of `find_all` results;
//! - at most one transaction node per engine, keyed by the engine's
//!   [`EngineKey`], so several engines can run transactions over the same
//!   logical operation without colliding.
//!
//! Contexts are immutable. `Engine::begin_tx` returns a new context that
//! shares the caller's cancellation (as a child token) and adds the new node.
//!
//! A single context is a single logical thread of control: concurrent
//! writes through clones of one transactional context share its node.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ResourceError, Result};
use crate::tx::TxNode;

/// Namespace key identifying one engine instance on a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineKey(Uuid);

impl EngineKey {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context passed to every engine operation.
#[derive(Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    txs: Arc<HashMap<EngineKey, Arc<TxNode>>>,
}

impl Context {
    /// Create a background context with no transactions and a fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context cancelled by `token`.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            txs: Arc::default(),
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The underlying cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true if this context carries a transaction for `key`.
    pub fn has_tx(&self, key: EngineKey) -> bool {
        self.txs.contains_key(&key)
    }

    /// Fails with [`ResourceError::Canceled`] if the context is cancelled.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ResourceError::Canceled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn tx(&self, key: EngineKey) -> Option<&Arc<TxNode>> {
        self.txs.get(&key)
    }

    /// Derive a context carrying `node` for `key`.
    ///
    /// Transactions of other engines are kept; cancellation is inherited.
    pub(crate) fn with_tx(&self, key: EngineKey, node: Arc<TxNode>) -> Context {
        let mut txs = HashMap::clone(&self.txs);
        txs.insert(key, node);
        Context {
            cancel: self.cancel.child_token(),
            txs: Arc::new(txs),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("transactions", &self.txs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::TxNode;

    #[test]
    fn test_check_reports_cancellation() {
        let ctx = Context::new();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(ResourceError::Canceled)));
    }

    #[test]
    fn test_derived_context_inherits_cancellation() {
        let parent = Context::new();
        let key = EngineKey::new();
        let child = parent.with_tx(key, Arc::new(TxNode::detached()));

        assert!(child.has_tx(key));
        assert!(!parent.has_tx(key));

        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_cancelling_child_leaves_parent() {
        let parent = Context::new();
        let child = parent.with_tx(EngineKey::new(), Arc::new(TxNode::detached()));
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_engines_do_not_collide() {
        let a = EngineKey::new();
        let b = EngineKey::new();
        assert_ne!(a, b);

        let ctx = Context::new()
            .with_tx(a, Arc::new(TxNode::detached()))
            .with_tx(b, Arc::new(TxNode::detached()));
        assert!(ctx.has_tx(a));
        assert!(ctx.has_tx(b));
        assert!(!Arc::ptr_eq(ctx.tx(a).unwrap(), ctx.tx(b).unwrap()));
    }

    #[test]
    fn test_external_token() {
        let token = CancellationToken::new();
        let ctx = Context::with_cancellation(token.clone());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(format!("{:?}", ctx).contains("cancelled: true"));
    }
}
