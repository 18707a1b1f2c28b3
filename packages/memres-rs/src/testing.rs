//! Testing utilities for code built on memres.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! memres = { version = "0.1", features = ["testing"] }
//! ```
//!
//! ## Recording deliveries
//!
//! ```ignore
//! use memres::testing::RecordingSubscriber;
//!
//! let recorder = RecordingSubscriber::<Note>::new();
//! let sub = engine.subscribe_to_create(&ctx, recorder.clone()).await?;
//!
//! engine.create(&ctx, &mut note).await?;
//!
//! recorder.wait_for(1).await;
//! assert_eq!(recorder.received()[0].body, note.body);
//! ```
//!
//! ## Waiting on several subscribers
//!
//! ```ignore
//! use memres::testing::{DeliveryLatch, RecordingSubscriber};
//!
//! let latch = DeliveryLatch::shared(4);
//! let creates = RecordingSubscriber::<Note>::new().with_latch(latch.clone());
//! let deletes = RecordingSubscriber::<Note>::new().with_latch(latch.clone());
//!
//! // ... two creates and two deletes ...
//!
//! latch.wait().await;
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use crate::context::Context;
use crate::entity::Entity;
use crate::subscription::Subscriber;

// =============================================================================
// RecordingSubscriber
// =============================================================================

struct Recorded<T> {
    received: Mutex<Vec<T>>,
    errors: Mutex<Vec<String>>,
    notify: Notify,
}

/// Subscriber that records every payload it is handed.
///
/// Clones share the same record, so keep one clone for assertions and pass
/// the other to the engine.
pub struct RecordingSubscriber<T> {
    recorded: Arc<Recorded<T>>,
    fail_when: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    latch: Option<Arc<DeliveryLatch>>,
}

impl<T> Clone for RecordingSubscriber<T> {
    fn clone(&self) -> Self {
        Self {
            recorded: Arc::clone(&self.recorded),
            fail_when: self.fail_when.clone(),
            latch: self.latch.clone(),
        }
    }
}

impl<T: Entity> Default for RecordingSubscriber<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> RecordingSubscriber<T> {
    pub fn new() -> Self {
        Self {
            recorded: Arc::new(Recorded {
                received: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
            fail_when: None,
            latch: None,
        }
    }

    /// Make `handle` fail for payloads matching `predicate`.
    ///
    /// Failed payloads are still recorded.
    pub fn failing_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.fail_when = Some(Arc::new(predicate));
        self
    }

    /// Count each handled payload down on `latch`.
    pub fn with_latch(mut self, latch: Arc<DeliveryLatch>) -> Self {
        self.latch = Some(latch);
        self
    }

    fn lock_received(&self) -> MutexGuard<'_, Vec<T>> {
        self.recorded
            .received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_errors(&self) -> MutexGuard<'_, Vec<String>> {
        self.recorded
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Payloads received so far, in delivery order.
    pub fn received(&self) -> Vec<T> {
        self.lock_received().clone()
    }

    pub fn count(&self) -> usize {
        self.lock_received().len()
    }

    /// Messages of the errors passed to the `error` callback.
    pub fn errors(&self) -> Vec<String> {
        self.lock_errors().clone()
    }

    /// Wait until at least `n` payloads have been received.
    ///
    /// Wrap in `tokio::time::timeout` in tests that might hang.
    pub async fn wait_for(&self, n: usize) {
        loop {
            let notified = self.recorded.notify.notified();
            if self.count() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl<T: Entity> Subscriber<T> for RecordingSubscriber<T> {
    async fn handle(&self, _ctx: &Context, entity: T) -> anyhow::Result<()> {
        let fail = self.fail_when.as_ref().is_some_and(|f| f(&entity));
        let id = entity.lookup_id().unwrap_or_default().to_owned();
        self.lock_received().push(entity);
        self.recorded.notify.notify_waiters();
        if let Some(latch) = &self.latch {
            latch.count_down();
        }

        if fail {
            return Err(anyhow!("injected failure for {id:?}"));
        }
        Ok(())
    }

    async fn error(&self, _ctx: &Context, err: anyhow::Error) -> anyhow::Result<()> {
        self.lock_errors().push(format!("{err:#}"));
        Ok(())
    }
}

// =============================================================================
// DeliveryLatch
// =============================================================================

/// Counts down handled deliveries until an expected total is reached.
///
/// Subscribers call [`count_down`](Self::count_down) per delivery; the test
/// awaits [`wait`](Self::wait) under a timeout:
///
/// ```ignore
/// timeout(Duration::from_secs(5), latch.wait())
///     .await
///     .expect("deliveries missing");
/// ```
#[derive(Debug)]
pub struct DeliveryLatch {
    left: watch::Sender<usize>,
}

impl DeliveryLatch {
    pub fn new(expected: usize) -> Self {
        let (left, _) = watch::channel(expected);
        Self { left }
    }

    /// A latch to hand to several subscribers at once.
    pub fn shared(expected: usize) -> Arc<Self> {
        Arc::new(Self::new(expected))
    }

    /// Record one delivery.
    ///
    /// # Panics
    ///
    /// Panics once the expected total has already been reached.
    pub fn count_down(&self) {
        let mut overrun = false;
        self.left.send_modify(|left| match left.checked_sub(1) {
            Some(next) => *left = next,
            None => overrun = true,
        });
        assert!(!overrun, "DeliveryLatch counted more deliveries than expected");
    }

    /// Resolves once every expected delivery was counted.
    pub async fn wait(&self) {
        let mut left = self.left.subscribe();
        // `self` owns the sender, so the channel stays open while this waits.
        let _ = left.wait_for(|left| *left == 0).await;
    }

    pub fn remaining(&self) -> usize {
        *self.left.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }
}
