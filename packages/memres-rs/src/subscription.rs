//! Subscriptions: per-subscriber delivery queues and the registry index.
//!
//! Subscribers are indexed by `(event kind, type-name)`. Each subscription
//! owns:
//! - a cancellation flag, set when it is closed;
//! - one bounded queue, fed by the publication pipeline;
//! - one worker task that drains the queue and calls the subscriber in order.
//!
//! # Delivery
//!
//! | Event | Payload handed to `handle` |
//! |-------|----------------------------|
//! | `Create` / `Update` | the snapshot stored on the event |
//! | `DeleteByID` | `T::default()` with only its ID set |
//! | `DeleteAll` | `T::default()` |
//!
//! A subscription sees events in engine commit order. Delivery is
//! asynchronous: a commit returns once its events are handed to the engine's
//! publisher, not once they are handled. The publisher waits for queue
//! capacity, so a slow subscriber delays delivery rather than losing events,
//! and never blocks the committer.
//!
//! # Example
//!
//! ```ignore
//! use memres::{async_trait, Context, Subscriber};
//!
//! struct AuditTrail;
//!
//! #[async_trait]
//! impl Subscriber<Note> for AuditTrail {
//!     async fn handle(&self, _ctx: &Context, note: Note) -> anyhow::Result<()> {
//!         tracing::info!(id = %note.id, "note created");
//!         Ok(())
//!     }
//! }
//!
//! let sub = engine.subscribe_to_create::<Note, _>(&ctx, AuditTrail).await?;
//! // ...
//! sub.close().await?;
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::entity::{self, Entity};
use crate::error::{ResourceError, Result};
use crate::event::{Event, EventKind};
use crate::publish::PublishProgress;

// =============================================================================
// Subscriber Trait
// =============================================================================

/// Callback pair invoked by a subscription's worker.
///
/// Callbacks run on the subscription's own task and may write through the
/// engine. They must not close their own subscription.
#[async_trait]
pub trait Subscriber<T: Entity>: Send + Sync + 'static {
    /// Called once per matching committed event, in commit order.
    async fn handle(&self, ctx: &Context, entity: T) -> anyhow::Result<()>;

    /// Called with the error when `handle` fails.
    ///
    /// The error is a [`ResourceError::Subscriber`] wrapping the original.
    /// Failures returned from here are logged and dropped.
    async fn error(&self, ctx: &Context, err: anyhow::Error) -> anyhow::Result<()> {
        let _ = (ctx, err);
        Ok(())
    }
}

// =============================================================================
// Delivery (Type-Erased)
// =============================================================================

/// Type-erased view of one subscription, as stored in the registry.
#[async_trait]
pub(crate) trait Delivery: Send + Sync {
    /// Enqueue the payload for `event`; no-op once closed.
    async fn publish(&self, event: &Event);

    /// Stop accepting events, drain the queue and wait for the worker.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

struct Channel<T: Entity> {
    kind: EventKind,
    cancelled: AtomicBool,
    /// Serializes `publish` against `close`; `None` once closed.
    sender: tokio::sync::Mutex<Option<mpsc::Sender<T>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_ctx: Context,
}

impl<T: Entity> Channel<T> {
    fn payload(&self, event: &Event) -> Result<T> {
        match event.kind() {
            EventKind::Create | EventKind::Update => event
                .entity::<T>()
                .ok_or_else(|| ResourceError::not_found(T::type_name(), event.id())),
            EventKind::DeleteById => entity::with_id::<T>(event.id()),
            EventKind::DeleteAll => Ok(T::default()),
        }
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl<T: Entity> Delivery for Channel<T> {
    async fn publish(&self, event: &Event) {
        if self.is_closed() {
            return;
        }

        let payload = match self.payload(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    type_name = T::type_name(),
                    kind = %self.kind,
                    error = %e,
                    "could not build subscriber payload"
                );
                return;
            }
        };

        let sender = self.sender.lock().await;
        let Some(sender) = sender.as_ref() else {
            return;
        };
        if sender.send(payload).await.is_err() {
            warn!(
                type_name = T::type_name(),
                kind = %self.kind,
                "subscription worker is gone, event dropped"
            );
        }
    }

    async fn close(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::Release);

        // Waits for any in-flight publish; dropping the sender ends the worker
        // after it drains what is already queued.
        drop(self.sender.lock().await.take());

        let worker = self.take_worker();
        let joined = match worker {
            Some(handle) => handle.await,
            None => Ok(()),
        };
        self.worker_ctx.cancel();

        joined.map_err(|e| {
            ResourceError::Subscriber(anyhow::anyhow!("subscription worker failed: {e}"))
        })
    }

    fn is_closed(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

async fn run_worker<T, S>(
    subscriber: Arc<S>,
    mut queue: mpsc::Receiver<T>,
    ctx: Context,
    kind: EventKind,
) where
    T: Entity,
    S: Subscriber<T>,
{
    while let Some(entity) = queue.recv().await {
        if let Err(e) = subscriber.handle(&ctx, entity).await {
            warn!(
                type_name = T::type_name(),
                kind = %kind,
                error = %e,
                "subscriber failed to handle event"
            );
            let err = ResourceError::Subscriber(e);
            if let Err(e) = subscriber.error(&ctx, err.into()).await {
                error!(
                    type_name = T::type_name(),
                    kind = %kind,
                    error = %e,
                    "subscriber error handler failed"
                );
            }
        }
    }
    debug!(type_name = T::type_name(), kind = %kind, "subscription worker stopped");
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Handle to a registered subscriber.
///
/// Dropping the handle does not stop delivery; call [`Subscription::close`].
pub struct Subscription {
    delivery: Arc<dyn Delivery>,
    progress: Arc<PublishProgress>,
    kind: EventKind,
    type_name: &'static str,
}

impl Subscription {
    /// Start a worker for `subscriber` and return the handle plus the
    /// registry entry.
    pub(crate) fn spawn<T, S>(
        kind: EventKind,
        subscriber: S,
        capacity: usize,
        progress: Arc<PublishProgress>,
    ) -> (Subscription, Arc<dyn Delivery>)
    where
        T: Entity,
        S: Subscriber<T>,
    {
        let (sender, queue) = mpsc::channel::<T>(capacity.max(1));
        let worker_ctx = Context::new();
        let worker = tokio::spawn(run_worker(
            Arc::new(subscriber),
            queue,
            worker_ctx.clone(),
            kind,
        ));

        let channel: Arc<dyn Delivery> = Arc::new(Channel::<T> {
            kind,
            cancelled: AtomicBool::new(false),
            sender: tokio::sync::Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            worker_ctx,
        });

        let handle = Subscription {
            delivery: Arc::clone(&channel),
            progress,
            kind,
            type_name: T::type_name(),
        };
        (handle, channel)
    }

    /// Stop delivery.
    ///
    /// Events committed before this call are still handled before it returns.
    /// Calling `close` again is a no-op. Must not be awaited from this
    /// subscription's own `handle`.
    pub async fn close(&self) -> Result<()> {
        if !self.is_closed() {
            self.progress.flushed().await;
        }
        self.delivery.close().await
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.delivery.is_closed()
    }

    /// The event kind this subscription listens to.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The entity type-name this subscription listens to.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Subscriptions indexed by `(kind, type-name)`.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    index: DashMap<(EventKind, &'static str), Vec<Arc<dyn Delivery>>>,
}

pub(crate) type Matches = SmallVec<[Arc<dyn Delivery>; 4]>;

impl SubscriptionRegistry {
    pub(crate) fn register(
        &self,
        kind: EventKind,
        type_name: &'static str,
        delivery: Arc<dyn Delivery>,
    ) {
        self.index
            .entry((kind, type_name))
            .or_default()
            .push(delivery);
    }

    /// Open subscriptions for `(kind, type-name)`, pruning closed ones.
    ///
    /// The returned list is detached from the map so callers can await on it.
    pub(crate) fn matching(&self, kind: EventKind, type_name: &'static str) -> Matches {
        match self.index.get_mut(&(kind, type_name)) {
            Some(mut entry) => {
                entry.retain(|delivery| !delivery.is_closed());
                entry.iter().cloned().collect()
            }
            None => Matches::new(),
        }
    }

    /// Number of subscriptions that have not been closed.
    pub(crate) fn open_count(&self) -> usize {
        self.index
            .iter()
            .map(|entry| entry.value().iter().filter(|d| !d.is_closed()).count())
            .sum()
    }

    /// Remove and return every registered subscription.
    pub(crate) fn drain(&self) -> Vec<Arc<dyn Delivery>> {
        let keys: Vec<_> = self.index.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.index.remove(&key))
            .flat_map(|(_, deliveries)| deliveries)
            .collect()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("keys", &self.index.len())
            .field("open", &self.open_count())
            .finish()
    }
}

/// Adapter that lets a plain async closure act as a [`Subscriber`].
///
/// ```ignore
/// let sub = engine
///     .subscribe_to_delete_all::<Note, _>(&ctx, SubscriberFn::new(|_ctx: Context, _note: Note| async {
///         tracing::info!("notes wiped");
///         Ok(())
///     }))
///     .await?;
/// ```
pub struct SubscriberFn<T, F> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> SubscriberFn<T, F> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Subscriber<T> for SubscriberFn<T, F>
where
    T: Entity,
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &Context, entity: T) -> anyhow::Result<()> {
        (self.f)(ctx.clone(), entity).await
    }
}
