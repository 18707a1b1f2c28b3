//! Compaction: collapsing the engine log to one snapshot per live entity.
//!
//! Used when event logging is disabled. The rewritten log folds to the same
//! view as the original, so reads are unaffected; the history of updates and
//! deletions (and their call sites) is lost.

use std::sync::Arc;

use tracing::info;

use crate::event::Event;
use crate::view::View;

/// Replace `log` with one `Create` per live `(type-name, id)` pair.
///
/// Returns the number of events dropped.
pub(crate) fn compact(log: &mut Vec<Arc<Event>>) -> usize {
    let before = log.len();
    *log = View::fold(log.iter()).into_events();
    let dropped = before.saturating_sub(log.len());
    if dropped > 0 {
        info!(before, after = log.len(), "compacted event log");
    }
    dropped
}
