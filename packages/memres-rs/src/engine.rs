//! The resource engine: CRUD, transactions and subscriptions over an
//! in-process event log.
//!
//! The engine log holds every committed event in commit order. Reads fold the
//! effective log of the caller's context into a view; writes append to the
//! caller's transaction node, or to an implicit one that commits before the
//! call returns.
//!
//! # Example
//!
//! ```ignore
//! use memres::{Context, Engine};
//!
//! let engine = Engine::new();
//! let ctx = Context::new();
//!
//! let mut note = Note { body: "hello".into(), ..Default::default() };
//! engine.create(&ctx, &mut note).await?;
//!
//! let tx = engine.begin_tx(&ctx).await?;
//! engine.delete_by_id::<Note>(&tx, &note.id).await?;
//! assert!(engine.find_by_id::<Note>(&ctx, &note.id).await?.is_some());
//! engine.commit_tx(&tx).await?;
//! assert!(engine.find_by_id::<Note>(&ctx, &note.id).await?.is_none());
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tracing::{debug, info};

use crate::compaction;
use crate::context::{Context, EngineKey};
use crate::entity::{self, Entity};
use crate::error::{ResourceError, Result};
use crate::event::{Event, EventKind, Trace};
use crate::history::History;
use crate::publish::Publisher;
use crate::subscription::{Subscriber, Subscription, SubscriptionRegistry};
use crate::tx::{Committed, TxNode};
use crate::view::View;

/// Default capacity of each subscription's delivery queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of each subscription's delivery queue. Publication waits for
    /// room once a queue is full; commits do not.
    pub queue_capacity: usize,
    /// When false, the engine log is compacted to one snapshot per live
    /// entity after each top-level commit.
    pub event_logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            event_logging: true,
        }
    }
}

/// Builder for [`Engine`].
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the capacity of each subscription's delivery queue.
    ///
    /// Zero is treated as one.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Compact the engine log after every top-level commit.
    pub fn without_event_logging(mut self) -> Self {
        self.config.event_logging = false;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Engine {
        let key = EngineKey::new();
        debug!(
            engine = %key,
            queue_capacity = self.config.queue_capacity,
            event_logging = self.config.event_logging,
            "engine created"
        );
        let subscriptions = Arc::new(SubscriptionRegistry::default());
        Engine {
            inner: Arc::new(EngineInner {
                key,
                queue_capacity: self.config.queue_capacity,
                event_logging: AtomicBool::new(self.config.event_logging),
                events: Mutex::new(Vec::new()),
                open_roots: Arc::new(AtomicUsize::new(0)),
                publisher: Publisher::new(Arc::clone(&subscriptions)),
                subscriptions,
            }),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// In-memory, event-sourced resource engine.
///
/// Cloning is cheap; clones share the same log, transactions and
/// subscriptions.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    key: EngineKey,
    queue_capacity: usize,
    event_logging: AtomicBool,
    /// Held across take, append, submit and compact of a commit.
    events: Mutex<Vec<Arc<Event>>>,
    /// Open transaction nodes whose parent is this engine.
    open_roots: Arc<AtomicUsize>,
    publisher: Publisher,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine with default settings.
    pub fn new() -> Self {
        EngineBuilder::new().build()
    }

    /// Start configuring an engine; see [`EngineBuilder`].
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The key under which this engine stores transactions on a [`Context`].
    pub fn key(&self) -> EngineKey {
        self.inner.key
    }

    fn lock_events(&self) -> MutexGuard<'_, Vec<Arc<Event>>> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The engine log followed by the events of the context's transaction chain.
    fn effective_events(&self, ctx: &Context) -> Vec<Arc<Event>> {
        let base = self.lock_events().clone();
        match ctx.tx(self.key()) {
            Some(node) => node.effective_events(base),
            None => base,
        }
    }

    fn view(&self, ctx: &Context) -> View {
        View::fold(&self.effective_events(ctx))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns every live `T` visible to `ctx`.
    ///
    /// The result is a snapshot; later writes do not affect it.
    pub async fn find_all<T: Entity>(&self, ctx: &Context) -> Result<FindAll<T>> {
        ctx.check()?;
        let entities = self.view(ctx).all::<T>();
        Ok(FindAll::new(ctx.clone(), entities))
    }

    /// Returns a copy of the `T` with the given ID, if it is visible to `ctx`.
    pub async fn find_by_id<T: Entity>(&self, ctx: &Context, id: &str) -> Result<Option<T>> {
        ctx.check()?;
        Ok(self.view(ctx).get::<T>(id))
    }

    fn exists<T: Entity>(&self, ctx: &Context, id: &str) -> bool {
        !id.is_empty() && self.view(ctx).contains(T::type_name(), id)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a new entity and assign it a fresh ID.
    ///
    /// Fails with [`ResourceError::AlreadyHasId`] if the entity already has
    /// an ID. On failure the entity is left unchanged.
    #[track_caller]
    pub fn create<'a, T: Entity>(
        &'a self,
        ctx: &'a Context,
        entity: &'a mut T,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        let trace = Trace::capture();
        async move {
            ctx.check()?;
            let current = entity::require_id_field(&*entity)?;
            if !current.is_empty() {
                return Err(ResourceError::AlreadyHasId {
                    type_name: T::type_name(),
                    id: current.to_owned(),
                });
            }

            let id = entity::new_id();
            let mut stored = entity.clone();
            stored.set_id(id.clone())?;

            debug!(type_name = T::type_name(), id = %id, at = %trace, "create");
            self.write(ctx, Event::create(id, stored.clone(), trace))
                .await?;
            *entity = stored;
            Ok(())
        }
    }

    /// Replace a stored entity.
    ///
    /// Fails with [`ResourceError::NotFound`] if the entity's ID is empty or
    /// not visible to `ctx`.
    #[track_caller]
    pub fn update<'a, T: Entity>(
        &'a self,
        ctx: &'a Context,
        entity: &'a T,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        let trace = Trace::capture();
        async move {
            ctx.check()?;
            let id = entity::require_id_field(entity)?;
            if !self.exists::<T>(ctx, id) {
                return Err(ResourceError::not_found(T::type_name(), id));
            }

            debug!(type_name = T::type_name(), id, at = %trace, "update");
            self.write(ctx, Event::update(id.to_owned(), entity.clone(), trace))
                .await
        }
    }

    /// Remove the `T` with the given ID.
    ///
    /// Fails with [`ResourceError::NotFound`] if it is not visible to `ctx`.
    #[track_caller]
    pub fn delete_by_id<'a, T: Entity>(
        &'a self,
        ctx: &'a Context,
        id: &'a str,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        let trace = Trace::capture();
        async move {
            ctx.check()?;
            if !self.exists::<T>(ctx, id) {
                return Err(ResourceError::not_found(T::type_name(), id));
            }

            debug!(type_name = T::type_name(), id, at = %trace, "delete by id");
            self.write(ctx, Event::delete_by_id::<T>(id.to_owned(), trace))
                .await
        }
    }

    /// Remove every `T`. Succeeds even when there are none.
    #[track_caller]
    pub fn delete_all<'a, T: Entity>(
        &'a self,
        ctx: &'a Context,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        let trace = Trace::capture();
        async move {
            ctx.check()?;
            debug!(type_name = T::type_name(), at = %trace, "delete all");
            self.write(ctx, Event::delete_all::<T>(trace)).await
        }
    }

    /// Append to the context's transaction, or commit an implicit one.
    async fn write(&self, ctx: &Context, event: Event) -> Result<()> {
        let event = Arc::new(event);
        match ctx.tx(self.key()) {
            Some(node) => node.append(event),
            None => {
                let node = TxNode::root(Arc::clone(&self.inner.open_roots));
                node.append(event)?;
                self.commit_node(&node)
            }
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Open a transaction and return a context carrying it.
    ///
    /// Nests inside the transaction already on `ctx` for this engine, if any.
    /// Fails with [`ResourceError::TxDone`] when that transaction is finished.
    pub async fn begin_tx(&self, ctx: &Context) -> Result<Context> {
        ctx.check()?;
        let node = match ctx.tx(self.key()) {
            Some(parent) if parent.is_done() => return Err(ResourceError::TxDone),
            Some(parent) => TxNode::nested(Arc::clone(parent)),
            None => TxNode::root(Arc::clone(&self.inner.open_roots)),
        };
        debug!(engine = %self.key(), depth = node.depth(), "begin transaction");
        Ok(ctx.with_tx(self.key(), Arc::new(node)))
    }

    /// Commit the transaction on `ctx`.
    ///
    /// A nested commit moves its events into the enclosing transaction. A
    /// top-level commit appends them to the engine log and queues them for
    /// subscribers before returning; subscribers handle them later.
    ///
    /// The commit completes on the first poll. A future dropped before then
    /// leaves the transaction untouched.
    pub async fn commit_tx(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        let node = ctx.tx(self.key()).ok_or(ResourceError::NoTx)?;
        self.commit_node(node)
    }

    /// Discard the transaction on `ctx`.
    ///
    /// Events that nested transactions already committed into it are
    /// discarded with it.
    pub async fn rollback_tx(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        let node = ctx.tx(self.key()).ok_or(ResourceError::NoTx)?;
        let discarded = node.rollback()?;
        debug!(depth = node.depth(), discarded, "rolled back transaction");
        Ok(())
    }

    /// Runs without suspending. The log lock is taken before the node's, so
    /// commits reach the log and the publisher in the same order.
    fn commit_node(&self, node: &TxNode) -> Result<()> {
        let mut log = self.lock_events();
        match node.commit()? {
            Committed::Nested(moved) => {
                debug!(depth = node.depth(), moved, "committed nested transaction");
            }
            Committed::Root(events) => {
                log.extend(events.iter().cloned());
                let committed = events.len();
                let batch = self.inner.publisher.submit(events);
                debug!(committed, total = log.len(), batch, "committed transaction");
                if self.should_compact() {
                    compaction::compact(&mut log);
                }
            }
        }
        Ok(())
    }

    /// True when event logging is off and no top-level transaction is open.
    fn should_compact(&self) -> bool {
        if self.inner.event_logging.load(Ordering::Acquire) {
            return false;
        }
        let open = self.inner.open_roots.load(Ordering::Acquire);
        if open > 0 {
            debug!(open, "compaction deferred");
            return false;
        }
        true
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Deliver every committed `Create` of `T` to `subscriber`.
    pub async fn subscribe_to_create<T, S>(&self, ctx: &Context, subscriber: S) -> Result<Subscription>
    where
        T: Entity,
        S: Subscriber<T>,
    {
        self.subscribe::<T, S>(ctx, EventKind::Create, subscriber)
    }

    /// Deliver every committed `Update` of `T` to `subscriber`.
    pub async fn subscribe_to_update<T, S>(&self, ctx: &Context, subscriber: S) -> Result<Subscription>
    where
        T: Entity,
        S: Subscriber<T>,
    {
        self.subscribe::<T, S>(ctx, EventKind::Update, subscriber)
    }

    /// Deliver every committed `DeleteByID` of `T` to `subscriber`.
    ///
    /// Payloads are blank values carrying only the deleted ID.
    pub async fn subscribe_to_delete_by_id<T, S>(
        &self,
        ctx: &Context,
        subscriber: S,
    ) -> Result<Subscription>
    where
        T: Entity,
        S: Subscriber<T>,
    {
        self.subscribe::<T, S>(ctx, EventKind::DeleteById, subscriber)
    }

    /// Deliver every committed `DeleteAll` of `T` to `subscriber`.
    ///
    /// Payloads are `T::default()`.
    pub async fn subscribe_to_delete_all<T, S>(
        &self,
        ctx: &Context,
        subscriber: S,
    ) -> Result<Subscription>
    where
        T: Entity,
        S: Subscriber<T>,
    {
        self.subscribe::<T, S>(ctx, EventKind::DeleteAll, subscriber)
    }

    fn subscribe<T, S>(&self, ctx: &Context, kind: EventKind, subscriber: S) -> Result<Subscription>
    where
        T: Entity,
        S: Subscriber<T>,
    {
        ctx.check()?;
        let (subscription, delivery) = Subscription::spawn::<T, S>(
            kind,
            subscriber,
            self.inner.queue_capacity,
            Arc::clone(self.inner.publisher.progress()),
        );
        self.inner
            .subscriptions
            .register(kind, T::type_name(), delivery);
        debug!(%kind, type_name = T::type_name(), "subscribed");
        Ok(subscription)
    }

    /// Number of subscriptions that have not been closed.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.open_count()
    }

    /// Close every subscription, letting each drain its queue.
    ///
    /// Events committed before the call are delivered first. Returns the first
    /// close error, after all subscriptions have been closed.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.publisher.progress().flushed().await;
        let deliveries = self.inner.subscriptions.drain();
        info!(subscriptions = deliveries.len(), "shutting down engine");
        let results = join_all(deliveries.iter().map(|delivery| delivery.close())).await;
        results.into_iter().collect()
    }

    // =========================================================================
    // Log maintenance and inspection
    // =========================================================================

    /// Stop keeping history: from now on the log only holds one snapshot per
    /// live entity.
    ///
    /// Compacts immediately unless a top-level transaction is open.
    pub fn disable_event_logging(&self) {
        self.inner.event_logging.store(false, Ordering::Release);
        info!(engine = %self.key(), "event logging disabled");
        let mut log = self.lock_events();
        if self.should_compact() {
            compaction::compact(&mut log);
        }
    }

    /// Returns true unless [`disable_event_logging`](Self::disable_event_logging)
    /// was called or the engine was built without event logging.
    pub fn event_logging(&self) -> bool {
        self.inner.event_logging.load(Ordering::Acquire)
    }

    /// Number of events in the engine log.
    pub fn event_count(&self) -> usize {
        self.lock_events().len()
    }

    /// The engine log.
    pub fn history(&self) -> History {
        History::new(self.lock_events().clone())
    }

    /// The log as seen from `ctx`: the engine log plus the events of its
    /// transaction chain.
    pub fn context_history(&self, ctx: &Context) -> History {
        History::new(self.effective_events(ctx))
    }

    /// Log [`history`](Self::history) under the `memres::history` target.
    pub fn log_history(&self) {
        self.history().log("engine");
    }

    /// Log [`context_history`](Self::context_history) under the
    /// `memres::history` target.
    pub fn log_context_history(&self, ctx: &Context) {
        self.context_history(ctx).log("context");
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("key", &self.inner.key)
            .field("events", &self.event_count())
            .field("event_logging", &self.event_logging())
            .field("subscriptions", &self.inner.subscriptions)
            .finish()
    }
}

// =============================================================================
// FindAll
// =============================================================================

/// Result of [`Engine::find_all`]: a single-pass sequence of entities.
///
/// If the context is cancelled during iteration the sequence yields one
/// `Err(ResourceError::Canceled)` and ends.
pub struct FindAll<T> {
    ctx: Context,
    items: std::vec::IntoIter<T>,
    failed: bool,
}

impl<T> FindAll<T> {
    fn new(ctx: Context, items: Vec<T>) -> Self {
        Self {
            ctx,
            items: items.into_iter(),
            failed: false,
        }
    }
}

impl<T> Iterator for FindAll<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.ctx.is_cancelled() {
            self.failed = true;
            return Some(Err(ResourceError::Canceled));
        }
        self.items.next().map(Ok)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            (0, Some(0))
        } else {
            (0, Some(self.items.len() + 1))
        }
    }
}

impl<T> fmt::Debug for FindAll<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindAll")
            .field("remaining", &self.items.len())
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Note {
        id: String,
        body: String,
    }
    crate::entity!(Note, id);

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Blob {
        data: String,
    }
    crate::entity!(Blob);

    fn note(body: &str) -> Note {
        Note {
            body: body.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_is_readable() {
        let engine = Engine::new();
        let ctx = Context::new();
        let mut n = note("a");

        engine.create(&ctx, &mut n).await.unwrap();
        assert!(!n.id.is_empty());
        assert_eq!(engine.find_by_id::<Note>(&ctx, &n.id).await.unwrap(), Some(n));
        assert_eq!(engine.event_count(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_id() {
        let engine = Engine::new();
        let ctx = Context::new();
        let mut n = Note {
            id: "fixed".into(),
            body: "a".into(),
        };

        let err = engine.create(&ctx, &mut n).await.unwrap_err();
        assert!(matches!(err, ResourceError::AlreadyHasId { ref id, .. } if id == "fixed"));
        assert_eq!(engine.event_count(), 0);
    }

    #[tokio::test]
    async fn test_type_without_id_field() {
        let engine = Engine::new();
        let ctx = Context::new();
        let mut blob = Blob::default();

        assert!(matches!(
            engine.create(&ctx, &mut blob).await,
            Err(ResourceError::MissingIdField { .. })
        ));
        assert!(matches!(
            engine.update(&ctx, &blob).await,
            Err(ResourceError::MissingIdField { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_requires_visible_entity() {
        let engine = Engine::new();
        let ctx = Context::new();

        let err = engine.update(&ctx, &note("unsaved")).await.unwrap_err();
        assert!(err.is_not_found());

        let ghost = Note {
            id: "ghost".into(),
            body: "boo".into(),
        };
        assert!(engine.update(&ctx, &ghost).await.unwrap_err().is_not_found());
        assert_eq!(engine.event_count(), 0);
    }

    #[tokio::test]
    async fn test_update_replaces_snapshot() {
        let engine = Engine::new();
        let ctx = Context::new();
        let mut n = note("v1");
        engine.create(&ctx, &mut n).await.unwrap();

        n.body = "v2".into();
        engine.update(&ctx, &n).await.unwrap();

        let found = engine.find_by_id::<Note>(&ctx, &n.id).await.unwrap();
        assert_eq!(found.map(|n| n.body), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_delete_by_id_of_missing_is_not_found() {
        let engine = Engine::new();
        let ctx = Context::new();
        let err = engine.delete_by_id::<Note>(&ctx, "nope").await.unwrap_err();
        assert!(matches!(err, ResourceError::NotFound { ref id, .. } if id == "nope"));
    }

    #[tokio::test]
    async fn test_delete_all_is_unconditional() {
        let engine = Engine::new();
        let ctx = Context::new();
        engine.delete_all::<Note>(&ctx).await.unwrap();
        assert_eq!(engine.event_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_every_operation() {
        let engine = Engine::new();
        let ctx = Context::new();
        let mut n = note("a");
        engine.create(&ctx, &mut n).await.unwrap();
        let tx = engine.begin_tx(&ctx).await.unwrap();

        ctx.cancel();
        assert!(tx.is_cancelled());

        let mut fresh = note("b");
        assert!(engine.create(&ctx, &mut fresh).await.unwrap_err().is_canceled());
        assert!(fresh.id.is_empty());
        assert!(engine.find_all::<Note>(&ctx).await.unwrap_err().is_canceled());
        assert!(engine.find_by_id::<Note>(&ctx, &n.id).await.unwrap_err().is_canceled());
        assert!(engine.update(&ctx, &n).await.unwrap_err().is_canceled());
        assert!(engine.delete_by_id::<Note>(&ctx, &n.id).await.unwrap_err().is_canceled());
        assert!(engine.delete_all::<Note>(&ctx).await.unwrap_err().is_canceled());
        assert!(engine.begin_tx(&ctx).await.unwrap_err().is_canceled());
        assert!(engine.commit_tx(&tx).await.unwrap_err().is_canceled());
        assert!(engine.rollback_tx(&tx).await.unwrap_err().is_canceled());
        assert!(engine
            .subscribe_to_create::<Note, _>(&ctx, crate::SubscriberFn::new(
                |_ctx: Context, _note: Note| async { anyhow::Ok(()) }
            ))
            .await
            .unwrap_err()
            .is_canceled());
        assert_eq!(engine.event_count(), 1);
    }

    #[tokio::test]
    async fn test_find_all_stops_on_cancellation() {
        let engine = Engine::new();
        let ctx = Context::new();
        for body in ["a", "b", "c"] {
            engine.create(&ctx, &mut note(body)).await.unwrap();
        }

        let mut all = engine.find_all::<Note>(&ctx).await.unwrap();
        assert!(all.next().unwrap().is_ok());
        ctx.cancel();
        assert!(all.next().unwrap().unwrap_err().is_canceled());
        assert!(all.next().is_none());
    }

    #[tokio::test]
    async fn test_commit_and_rollback_require_tx() {
        let engine = Engine::new();
        let ctx = Context::new();
        assert!(matches!(engine.commit_tx(&ctx).await, Err(ResourceError::NoTx)));
        assert!(matches!(engine.rollback_tx(&ctx).await, Err(ResourceError::NoTx)));
    }

    #[tokio::test]
    async fn test_begin_inside_finished_tx_fails() {
        let engine = Engine::new();
        let tx = engine.begin_tx(&Context::new()).await.unwrap();
        engine.commit_tx(&tx).await.unwrap();
        assert!(matches!(engine.begin_tx(&tx).await, Err(ResourceError::TxDone)));
        assert!(matches!(engine.create(&tx, &mut note("x")).await, Err(ResourceError::TxDone)));
    }

    #[tokio::test]
    async fn test_trace_points_at_caller() {
        let engine = Engine::new();
        let ctx = Context::new();
        let line = line!() + 1;
        engine.create(&ctx, &mut note("a")).await.unwrap();

        let history = engine.history();
        let event = history.iter().next().unwrap();
        let loc = event.trace().location().unwrap();
        assert!(loc.file().ends_with("engine.rs"));
        assert_eq!(loc.line(), line);
        assert!(event.trace().to_string().contains(&format!("engine.rs:{line}:")));
    }

    #[tokio::test]
    async fn test_context_history_includes_tx_events() {
        let engine = Engine::new();
        let ctx = Context::new();
        engine.create(&ctx, &mut note("a")).await.unwrap();
        let tx = engine.begin_tx(&ctx).await.unwrap();
        engine.delete_all::<Note>(&tx).await.unwrap();

        assert_eq!(engine.history().len(), 1);
        let kinds: Vec<_> = engine.context_history(&tx).iter().map(Event::kind).collect();
        assert_eq!(kinds, vec![EventKind::Create, EventKind::DeleteAll]);
        engine.log_history();
        engine.log_context_history(&tx);
    }

    #[tokio::test]
    async fn test_builder_settings() {
        let engine = Engine::builder()
            .with_queue_capacity(8)
            .without_event_logging()
            .build();
        assert!(!engine.event_logging());
        assert_eq!(engine.inner.queue_capacity, 8);

        let engine = EngineBuilder::new()
            .with_config(EngineConfig::default())
            .build();
        assert!(engine.event_logging());
        assert_eq!(engine.inner.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let engine = Engine::new();
        let other = engine.clone();
        let ctx = Context::new();
        let mut n = note("a");
        engine.create(&ctx, &mut n).await.unwrap();

        assert_eq!(other.key(), engine.key());
        assert!(other.find_by_id::<Note>(&ctx, &n.id).await.unwrap().is_some());
    }
}
