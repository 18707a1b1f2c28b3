//! Transaction nodes: scoped event logs layered over a parent.
//!
//! Each node owns the events written inside its transaction. Its parent is
//! either another node (nested transaction) or the engine. Nodes form a
//! chain that always ends at the engine; there are no cycles.
//!
//! ```text
//! engine log ── root node ── nested node ── nested node (leaf, on the Context)
//! ```
//!
//! The effective events of a node are its parent's effective events followed
//! by its own. Committing moves the node's events into its parent; only a
//! root-level commit hands events to the engine (and therefore to
//! subscribers). Once a node is done it accepts no further appends or state
//! transitions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ResourceError, Result};
use crate::event::Event;

/// What a node is layered on.
pub(crate) enum Parent {
    /// The engine. Holds the engine's count of open root-level nodes.
    Engine(Arc<AtomicUsize>),
    /// An enclosing transaction.
    Tx(Arc<TxNode>),
}

#[derive(Default)]
struct TxState {
    events: Vec<Arc<Event>>,
    done: bool,
}

/// Outcome of a successful commit.
pub(crate) enum Committed {
    /// Root-level commit; these events must be appended to the engine.
    Root(Vec<Arc<Event>>),
    /// Events were moved into the parent node.
    Nested(usize),
}

pub(crate) struct TxNode {
    parent: Parent,
    state: Mutex<TxState>,
}

impl TxNode {
    /// Create a node whose parent is the engine.
    pub(crate) fn root(open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        Self {
            parent: Parent::Engine(open),
            state: Mutex::new(TxState::default()),
        }
    }

    /// Create a node nested inside `parent`.
    pub(crate) fn nested(parent: Arc<TxNode>) -> Self {
        Self {
            parent: Parent::Tx(parent),
            state: Mutex::new(TxState::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::root(Arc::new(AtomicUsize::new(0)))
    }

    /// Acquire the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> MutexGuard<'_, TxState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_done(&self) -> bool {
        self.lock_state().done
    }

    /// Number of nodes between this one and the engine, counting itself.
    pub(crate) fn depth(&self) -> usize {
        match &self.parent {
            Parent::Engine(_) => 1,
            Parent::Tx(parent) => parent.depth() + 1,
        }
    }

    pub(crate) fn append(&self, event: Arc<Event>) -> Result<()> {
        let mut state = self.lock_state();
        if state.done {
            return Err(ResourceError::TxDone);
        }
        state.events.push(event);
        Ok(())
    }

    fn own_events(&self) -> Vec<Arc<Event>> {
        self.lock_state().events.clone()
    }

    /// Returns `base` (the engine log) followed by the own events of every
    /// node from the root down to this one.
    pub(crate) fn effective_events(&self, mut base: Vec<Arc<Event>>) -> Vec<Arc<Event>> {
        let mut chain: Vec<&TxNode> = vec![self];
        let mut current = self;
        while let Parent::Tx(parent) = &current.parent {
            chain.push(&**parent);
            current = &**parent;
        }
        for node in chain.into_iter().rev() {
            base.extend(node.own_events());
        }
        base
    }

    /// Move this node's events into its parent and mark it done.
    ///
    /// Fails with [`ResourceError::TxDone`] when this node, or the parent it
    /// would flush into, is already done. A failed commit leaves the node open.
    pub(crate) fn commit(&self) -> Result<Committed> {
        let mut state = self.lock_state();
        if state.done {
            return Err(ResourceError::TxDone);
        }

        match &self.parent {
            Parent::Tx(parent) => {
                let mut parent_state = parent.lock_state();
                if parent_state.done {
                    return Err(ResourceError::TxDone);
                }
                let moved = state.events.len();
                parent_state.events.append(&mut state.events);
                state.done = true;
                Ok(Committed::Nested(moved))
            }
            Parent::Engine(open) => {
                let events = std::mem::take(&mut state.events);
                state.done = true;
                open.fetch_sub(1, Ordering::AcqRel);
                Ok(Committed::Root(events))
            }
        }
    }

    /// Discard this node's events and mark it done. Returns the number discarded.
    pub(crate) fn rollback(&self) -> Result<usize> {
        let mut state = self.lock_state();
        if state.done {
            return Err(ResourceError::TxDone);
        }
        let discarded = state.events.len();
        state.events.clear();
        state.done = true;
        if let Parent::Engine(open) = &self.parent {
            open.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(discarded)
    }
}

impl Drop for TxNode {
    fn drop(&mut self) {
        // An abandoned root-level node must not hold back compaction forever.
        let done = self
            .state
            .get_mut()
            .map(|state| state.done)
            .unwrap_or_else(|poisoned| poisoned.into_inner().done);
        if let (false, Parent::Engine(open)) = (done, &self.parent) {
            open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
