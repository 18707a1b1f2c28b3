//! Human-readable rendering of an event log.
//!
//! A [`History`] is a detached copy of a log (the engine's, or the effective
//! log of a transactional context). Printing it yields one numbered line per
//! event with the call site that produced it:
//!
//! ```text
//!    0 Create app::Note id=4f0c… entity=Note { .. } at src/main.rs:12:20 (10:31:04.512993)
//!    1 DeleteAll app::Note at src/main.rs:19:9 (10:31:04.513101)
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::event::Event;

/// Snapshot of an event log, oldest event first.
#[derive(Clone, Default)]
pub struct History {
    events: Vec<Arc<Event>>,
}

impl History {
    pub(crate) fn new(events: Vec<Arc<Event>>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate over the recorded events in log order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(Arc::as_ref)
    }

    /// Emit one `info` record per event under the `memres::history` target.
    pub(crate) fn log(&self, scope: &'static str) {
        info!(
            target: "memres::history",
            scope,
            events = self.events.len(),
            "event history"
        );
        for (seq, event) in self.events.iter().enumerate() {
            info!(
                target: "memres::history",
                scope,
                seq,
                kind = %event.kind(),
                type_name = event.type_name(),
                id = event.id(),
                at = %event.trace(),
                "{}",
                event
            );
        }
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (seq, event) in self.events.iter().enumerate() {
            writeln!(f, "{:>4} {}", seq, event)?;
        }
        Ok(())
    }
}

impl fmt::Debug for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
