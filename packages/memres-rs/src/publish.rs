//! Publication: replaying committed events through matching subscriptions.
//!
//! A top-level commit hands its events to the engine's [`Publisher`] while it
//! still holds the engine log lock. Each event is routed to the subscriptions
//! open at that moment and the batch is queued in commit order. A single task
//! per engine drains that queue and enqueues each event on its subscriptions,
//! waiting for queue room as needed. Committers never
//! wait on subscriber queues, and no engine lock is held while the task waits.
//!
//! ```text
//! commit ──(log lock)──► append to log ──► submit(batch #n)
//!                                              │
//!                          publisher task ◄────┘
//!                              │ in order
//!                              ▼
//!                  subscription queues ──► workers
//! ```
//!
//! [`PublishProgress`] tracks how far the task has got, so closing a
//! subscription can first wait for everything committed before it.
//! Subscriber failures are handled on the subscription worker and never
//! abort publication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::event::Event;
use crate::subscription::{Matches, SubscriptionRegistry};

/// Events paired with the subscriptions matching their `(kind, type-name)`.
pub(crate) type Routes = Vec<(Arc<Event>, Matches)>;

/// Look up the open subscriptions for each event.
pub(crate) fn route(registry: &SubscriptionRegistry, events: Vec<Arc<Event>>) -> Routes {
    events
        .into_iter()
        .map(|event| {
            let matches = registry.matching(event.kind(), event.type_name());
            (event, matches)
        })
        .collect()
}

/// Enqueue every routed event on its subscriptions, in order.
///
/// Returns the number of deliveries enqueued. A subscription closed while
/// this runs may miss events.
pub(crate) async fn deliver(routes: &Routes) -> usize {
    let mut deliveries = 0usize;
    for (event, matches) in routes {
        for delivery in matches {
            delivery.publish(event).await;
            deliveries += 1;
        }
    }
    if deliveries > 0 {
        debug!(events = routes.len(), deliveries, "published committed events");
    }
    deliveries
}

// =============================================================================
// Progress
// =============================================================================

/// Sequence numbers of submitted and published commit batches.
#[derive(Debug)]
pub(crate) struct PublishProgress {
    submitted: AtomicU64,
    published: watch::Sender<u64>,
}

impl Default for PublishProgress {
    fn default() -> Self {
        let (published, _) = watch::channel(0);
        Self {
            submitted: AtomicU64::new(0),
            published,
        }
    }
}

impl PublishProgress {
    fn next(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn mark(&self, seq: u64) {
        self.published.send_replace(seq);
    }

    /// Wait until every batch submitted before this call has been published.
    pub(crate) async fn flushed(&self) {
        let target = self.submitted.load(Ordering::Acquire);
        let mut published = self.published.subscribe();
        // The sender lives in `self`, so this only ends once the target is reached.
        let _ = published.wait_for(|seq| *seq >= target).await;
    }
}

// =============================================================================
// Publisher
// =============================================================================

struct Batch {
    seq: u64,
    routes: Routes,
}

/// Ordered hand-off from committers to the engine's publication task.
pub(crate) struct Publisher {
    queue: mpsc::UnboundedSender<Batch>,
    /// Receiver waiting for the task; taken on the first submit.
    idle: Mutex<Option<mpsc::UnboundedReceiver<Batch>>>,
    registry: Arc<SubscriptionRegistry>,
    progress: Arc<PublishProgress>,
}

impl Publisher {
    pub(crate) fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        Self {
            queue,
            idle: Mutex::new(Some(receiver)),
            registry,
            progress: Arc::new(PublishProgress::default()),
        }
    }

    pub(crate) fn progress(&self) -> &Arc<PublishProgress> {
        &self.progress
    }

    /// Route a committed batch and queue it for publication. Never waits.
    ///
    /// Callers serialize submits (the engine holds its log lock), which fixes
    /// the publication order.
    pub(crate) fn submit(&self, events: Vec<Arc<Event>>) -> u64 {
        self.start();
        let routes = route(&self.registry, events);
        let seq = self.progress.next();
        if let Err(mpsc::error::SendError(batch)) = self.queue.send(Batch { seq, routes }) {
            warn!(
                seq,
                events = batch.routes.len(),
                "publisher task is gone, batch not published"
            );
            self.progress.mark(seq);
        }
        seq
    }

    fn start(&self) {
        let receiver = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(receiver) = receiver {
            tokio::spawn(run_publisher(receiver, Arc::clone(&self.progress)));
        }
    }
}

async fn run_publisher(mut queue: mpsc::UnboundedReceiver<Batch>, progress: Arc<PublishProgress>) {
    while let Some(batch) = queue.recv().await {
        deliver(&batch.routes).await;
        progress.mark(batch.seq);
    }
    debug!("publisher stopped");
}
