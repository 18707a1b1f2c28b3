//! Event records: immutable descriptions of a single mutation.
//!
//! An [`Event`] carries its kind, the type-name and ID of the entity it
//! concerns, a by-value snapshot of the entity (for `Create` and `Update`),
//! the call site that produced it, and the time it was recorded. Events are
//! shared as `Arc<Event>` between transaction logs and the engine log and are
//! never mutated after construction.

use std::any::Any;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::entity::Entity;

/// The kind of mutation an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A new entity was stored.
    Create,
    /// An existing entity was replaced.
    Update,
    /// One entity was removed.
    DeleteById,
    /// Every entity of one type was removed.
    DeleteAll,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Create => write!(f, "Create"),
            EventKind::Update => write!(f, "Update"),
            EventKind::DeleteById => write!(f, "DeleteByID"),
            EventKind::DeleteAll => write!(f, "DeleteAll"),
        }
    }
}

/// Type-erased entity snapshot stored on an event.
pub(crate) trait Snapshot: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Entity> Snapshot for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Call site that produced an event, kept for history output only.
///
/// Records a single frame: the file, line and column of the code that called
/// the engine operation. Callers further up the stack are not kept. Snapshots
/// written by compaction have no call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trace(Option<&'static Location<'static>>);

impl Trace {
    /// Captures the location of the caller.
    #[track_caller]
    pub fn capture() -> Self {
        Self(Some(Location::caller()))
    }

    pub(crate) fn compacted() -> Self {
        Self(None)
    }

    /// The captured source location, if any.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        self.0
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(loc) => write!(f, "{}:{}:{}", loc.file(), loc.line(), loc.column()),
            None => write!(f, "<compacted>"),
        }
    }
}

/// One recorded mutation.
#[derive(Clone)]
pub struct Event {
    kind: EventKind,
    type_name: &'static str,
    id: String,
    entity: Option<Arc<dyn Snapshot>>,
    trace: Trace,
    recorded_at: DateTime<Utc>,
}

impl Event {
    fn new(
        kind: EventKind,
        type_name: &'static str,
        id: String,
        entity: Option<Arc<dyn Snapshot>>,
        trace: Trace,
    ) -> Self {
        Self {
            kind,
            type_name,
            id,
            entity,
            trace,
            recorded_at: Utc::now(),
        }
    }

    pub(crate) fn create<T: Entity>(id: String, entity: T, trace: Trace) -> Self {
        Self::new(
            EventKind::Create,
            T::type_name(),
            id,
            Some(Arc::new(entity)),
            trace,
        )
    }

    pub(crate) fn update<T: Entity>(id: String, entity: T, trace: Trace) -> Self {
        Self::new(
            EventKind::Update,
            T::type_name(),
            id,
            Some(Arc::new(entity)),
            trace,
        )
    }

    pub(crate) fn delete_by_id<T: Entity>(id: String, trace: Trace) -> Self {
        Self::new(EventKind::DeleteById, T::type_name(), id, None, trace)
    }

    pub(crate) fn delete_all<T: Entity>(trace: Trace) -> Self {
        Self::new(EventKind::DeleteAll, T::type_name(), String::new(), None, trace)
    }

    /// Synthetic `Create` carrying an existing snapshot, used by compaction.
    pub(crate) fn from_snapshot(
        type_name: &'static str,
        id: String,
        entity: Arc<dyn Snapshot>,
    ) -> Self {
        Self::new(
            EventKind::Create,
            type_name,
            id,
            Some(entity),
            Trace::compacted(),
        )
    }

    /// The mutation kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Type-name of the entity this event concerns.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Entity ID; empty for `DeleteAll`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Where the event was produced.
    pub fn trace(&self) -> Trace {
        self.trace
    }

    /// When the event was recorded.
    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    /// Returns a copy of the snapshot if this event carries one of type `T`.
    pub fn entity<T: Entity>(&self) -> Option<T> {
        self.entity
            .as_ref()
            .and_then(|snapshot| snapshot.as_any().downcast_ref::<T>())
            .cloned()
    }

    pub(crate) fn snapshot(&self) -> Option<&Arc<dyn Snapshot>> {
        self.entity.as_ref()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("id", &self.id)
            .field("entity", &self.entity)
            .field("trace", &self.trace)
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.type_name)?;
        if !self.id.is_empty() {
            write!(f, " id={}", self.id)?;
        }
        if let Some(entity) = &self.entity {
            write!(f, " entity={:?}", entity)?;
        }
        write!(
            f,
            " at {} ({})",
            self.trace,
            self.recorded_at.format("%H:%M:%S%.6f")
        )
    }
}
