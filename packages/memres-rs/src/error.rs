//! Structured error types for memres.
//!
//! `ResourceError` gives callers a pattern-matchable category for every way a
//! resource operation can fail. Subscriber callbacks return `anyhow::Result`;
//! their failures are logged by the subscription worker and never reach the
//! writer (see [`crate::Subscriber`]).
//!
//! # Example
//!
//! ```ignore
//! use memres::{Context, Engine, ResourceError};
//!
//! match engine.update(&ctx, &user).await {
//!     Ok(()) => {}
//!     Err(ResourceError::NotFound { type_name, id }) => {
//!         eprintln!("{type_name} {id} is gone");
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use thiserror::Error;

/// Errors returned by resource, transaction and subscription operations.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The context was cancelled before or during the operation.
    #[error("context canceled")]
    Canceled,

    /// The entity type has no designated ID field.
    #[error("{type_name} has no ID field")]
    MissingIdField {
        /// Type-name of the offending entity.
        type_name: &'static str,
    },

    /// `create` was called on an entity that already carries an ID.
    #[error("{type_name} already has an ID: {id}")]
    AlreadyHasId {
        /// Type-name of the entity.
        type_name: &'static str,
        /// The ID it already had.
        id: String,
    },

    /// The entity is not present in the effective view.
    #[error("{type_name} not found: {id:?}")]
    NotFound {
        /// Type-name of the entity.
        type_name: &'static str,
        /// The ID that was looked up.
        id: String,
    },

    /// The transaction on the context has already been committed or rolled back.
    #[error("transaction is already done")]
    TxDone,

    /// `commit_tx` / `rollback_tx` was called on a context without a transaction.
    #[error("no transaction on context")]
    NoTx,

    /// A subscriber callback failed.
    #[error("subscriber failed: {0}")]
    Subscriber(#[source] anyhow::Error),
}

impl ResourceError {
    /// Returns true if this is a [`ResourceError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResourceError::NotFound { .. })
    }

    /// Returns true if this is a [`ResourceError::Canceled`].
    pub fn is_canceled(&self) -> bool {
        matches!(self, ResourceError::Canceled)
    }

    pub(crate) fn not_found(type_name: &'static str, id: impl Into<String>) -> Self {
        ResourceError::NotFound {
            type_name,
            id: id.into(),
        }
    }
}

/// Result alias used throughout memres.
pub type Result<T> = std::result::Result<T, ResourceError>;
