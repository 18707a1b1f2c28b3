//! Materialized views: the fold of an event log into current state.
//!
//! A view maps `type-name → id → latest snapshot`. It is never stored; every
//! read folds the effective log from the beginning.
//!
//! | Event | Effect on the view |
//! |-------|--------------------|
//! | `Create(T, id, e)` | `view[T][id] = e` |
//! | `Update(T, id, e)` | `view[T][id] = e` (no existence check) |
//! | `DeleteByID(T, id)` | remove `view[T][id]` |
//! | `DeleteAll(T)` | remove the whole `view[T]` bucket |

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::entity::Entity;
use crate::event::{Event, EventKind, Snapshot};

type Bucket = BTreeMap<String, Arc<dyn Snapshot>>;

#[derive(Default)]
pub(crate) struct View {
    buckets: BTreeMap<&'static str, Bucket>,
}

impl View {
    /// Folds events in order.
    pub(crate) fn fold<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Arc<Event>>,
    {
        let mut view = View::default();
        let mut folded = 0usize;
        for event in events {
            view.apply(event);
            folded += 1;
        }
        trace!(events = folded, entities = view.len(), "folded view");
        view
    }

    pub(crate) fn apply(&mut self, event: &Event) {
        match event.kind() {
            EventKind::Create | EventKind::Update => {
                // Snapshot-less Create/Update events are never constructed.
                if let Some(snapshot) = event.snapshot() {
                    self.buckets
                        .entry(event.type_name())
                        .or_default()
                        .insert(event.id().to_owned(), Arc::clone(snapshot));
                }
            }
            EventKind::DeleteById => {
                if let Some(bucket) = self.buckets.get_mut(event.type_name()) {
                    bucket.remove(event.id());
                }
            }
            EventKind::DeleteAll => {
                self.buckets.remove(event.type_name());
            }
        }
    }

    /// Copies every live entity of type `T`.
    pub(crate) fn all<T: Entity>(&self) -> Vec<T> {
        self.buckets
            .get(T::type_name())
            .map(|bucket| {
                bucket
                    .values()
                    .filter_map(|snapshot| snapshot.as_any().downcast_ref::<T>())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copies the entity of type `T` with the given ID.
    pub(crate) fn get<T: Entity>(&self, id: &str) -> Option<T> {
        self.buckets
            .get(T::type_name())
            .and_then(|bucket| bucket.get(id))
            .and_then(|snapshot| snapshot.as_any().downcast_ref::<T>())
            .cloned()
    }

    pub(crate) fn contains(&self, type_name: &str, id: &str) -> bool {
        self.buckets
            .get(type_name)
            .is_some_and(|bucket| bucket.contains_key(id))
    }

    /// Number of live `(type-name, id)` pairs.
    pub(crate) fn len(&self) -> usize {
        self.buckets.values().map(BTreeMap::len).sum()
    }

    /// Rewrites the view as one `Create` event per live entity.
    pub(crate) fn into_events(self) -> Vec<Arc<Event>> {
        self.buckets
            .into_iter()
            .flat_map(|(type_name, bucket)| {
                bucket.into_iter().map(move |(id, snapshot)| {
                    Arc::new(Event::from_snapshot(type_name, id, snapshot))
                })
            })
            .collect()
    }
}
