//! Entity metadata: locating and assigning the ID of user records.
//!
//! The engine stores arbitrary record types. The only thing it needs from a
//! record is access to a single string ID field, which the [`Entity`] trait
//! exposes. Most types implement it with the [`entity!`](crate::entity!) macro:
//!
//! ```ignore
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Note {
//!     id: String,
//!     body: String,
//! }
//! memres::entity!(Note, id);
//! ```
//!
//! A record is *unsaved* while its ID is empty.

use std::fmt::Debug;

use crate::error::{ResourceError, Result};

/// A record type the engine can store.
///
/// `Default` supplies the zero value delivered to `DeleteAll` subscribers and
/// the blank value whose ID is set for `DeleteByID` subscribers.
pub trait Entity: Clone + Default + Debug + Send + Sync + 'static {
    /// Returns the current ID, or `None` when the type has no ID field.
    fn lookup_id(&self) -> Option<&str>;

    /// Assigns the ID field.
    ///
    /// Fails with [`ResourceError::MissingIdField`] when the type has no ID field.
    fn set_id(&mut self, id: String) -> Result<()>;

    /// Stable name of the entity type, used as the bucket key in views and
    /// the subscription index.
    fn type_name() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

/// Implements [`Entity`] for a struct.
///
/// `entity!(Type, field)` uses `field: String` as the ID. `entity!(Type)`
/// declares a type without an ID field; every engine write on it fails with
/// [`ResourceError::MissingIdField`].
#[macro_export]
macro_rules! entity {
    ($ty:ty, $field:ident) => {
        impl $crate::Entity for $ty {
            fn lookup_id(&self) -> ::std::option::Option<&str> {
                ::std::option::Option::Some(self.$field.as_str())
            }

            fn set_id(&mut self, id: ::std::string::String) -> $crate::Result<()> {
                self.$field = id;
                ::std::result::Result::Ok(())
            }
        }
    };
    ($ty:ty) => {
        impl $crate::Entity for $ty {
            fn lookup_id(&self) -> ::std::option::Option<&str> {
                ::std::option::Option::None
            }

            fn set_id(&mut self, _id: ::std::string::String) -> $crate::Result<()> {
                ::std::result::Result::Err($crate::ResourceError::MissingIdField {
                    type_name: <$ty as $crate::Entity>::type_name(),
                })
            }
        }
    };
}

/// Returns the entity's ID as an owned string, or `None` when it has no ID field.
pub fn lookup_id<T: Entity>(entity: &T) -> Option<String> {
    entity.lookup_id().map(str::to_owned)
}

/// Assigns `id` to the entity's ID field.
pub fn set_id<T: Entity>(entity: &mut T, id: impl Into<String>) -> Result<()> {
    entity.set_id(id.into())
}

/// Builds a blank `T` carrying only `id`.
pub(crate) fn with_id<T: Entity>(id: &str) -> Result<T> {
    let mut entity = T::default();
    entity.set_id(id.to_owned())?;
    Ok(entity)
}

/// Generates a fresh random ID.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Returns the ID of an entity that is about to be persisted.
///
/// Missing ID fields are an error; an empty ID is returned as-is so callers can
/// decide whether that means "unsaved" or "not found".
pub(crate) fn require_id_field<T: Entity>(entity: &T) -> Result<&str> {
    entity.lookup_id().ok_or(ResourceError::MissingIdField {
        type_name: T::type_name(),
    })
}
