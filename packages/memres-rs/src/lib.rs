//! # memres
//!
//! An in-memory, event-sourced resource engine: CRUD over arbitrary record
//! types, nested transactions, and change notification that fires only when
//! events reach the engine.
//!
//! Application code programs against the resource operations
//! (`create` / `find_by_id` / `find_all` / `update` / `delete_by_id` /
//! `delete_all`); this crate backs them with an in-process event log so it can
//! serve as a test double, a local-development store, or a reference to check
//! other backends against.
//!
//! ## Architecture
//!
//! ```text
//! write ──► TxNode (context's, or implicit) ──commit──► parent TxNode
//!                                                          │
//!                                   outermost commit ──────┘
//!                                          │
//!                                          ▼
//!                                   engine event log ──► publish ──► subscription queues ──► workers
//!                                          │
//!                                          └─► compact (event logging disabled)
//!
//! read ──► fold(engine log ++ context's tx chain) ──► view[type][id]
//! ```
//!
//! ## Key Invariants
//!
//! 1. **The log is the truth** - the view is recomputed by folding events, never stored
//! 2. **Transactions are layered** - inner commits move events to the parent only
//! 3. **Commit gates publication** - subscribers see events only after the outermost commit
//! 4. **Per-subscription order** - each subscriber sees events in engine commit order
//! 5. **Subscriber failures stay local** - they never fail a write or a commit
//!
//! ## Example
//!
//! ```ignore
//! use memres::{entity, Context, Engine};
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Note {
//!     id: String,
//!     body: String,
//! }
//! entity!(Note, id);
//!
//! let engine = Engine::new();
//! let ctx = Context::new();
//!
//! let tx = engine.begin_tx(&ctx).await?;
//! let mut note = Note { body: "draft".into(), ..Default::default() };
//! engine.create(&tx, &mut note).await?;
//!
//! // Invisible outside the transaction until it commits.
//! assert!(engine.find_by_id::<Note>(&ctx, &note.id).await?.is_none());
//! engine.commit_tx(&tx).await?;
//! assert!(engine.find_by_id::<Note>(&ctx, &note.id).await?.is_some());
//! ```

mod compaction;
mod context;
mod engine;
mod entity;
mod error;
mod event;
mod history;
mod publish;
mod subscription;
mod tx;
mod view;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use crate::context::{Context, EngineKey};
pub use crate::engine::{Engine, EngineBuilder, EngineConfig, FindAll, DEFAULT_QUEUE_CAPACITY};
pub use crate::entity::{lookup_id, set_id, Entity};
pub use crate::error::{ResourceError, Result};
pub use crate::event::{Event, EventKind, Trace};
pub use crate::history::History;
pub use crate::subscription::{Subscriber, SubscriberFn, Subscription};

// Re-export async_trait for implementing Subscriber
pub use async_trait::async_trait;

// Re-export for contexts cancelled from outside
pub use tokio_util::sync::CancellationToken;
