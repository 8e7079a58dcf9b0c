//! # didmeta
//!
//! Pluggable metadata backends for data identifiers (DIDs).
//!
//! A DID is a named data object addressed by scope and name inside a virtual
//! organization (VO). This crate manages arbitrary key/value annotations on
//! DIDs across heterogeneous storage engines and lets callers query DIDs by
//! metadata predicates without knowing which physical store holds the
//! metadata.
//!
//! ## Architecture
//!
//! - Backend adapters implement one uniform contract, [`DidMetaPlugin`]
//! - A backend-agnostic filter language compiles to each engine's native
//!   query form via [`FilterEngine`]
//! - [`MetaPluginRegistry`] routes single-key operations by key ownership
//!   and fans filtered listings out across all active backends, suppressing
//!   duplicate DIDs through one shared [`DedupSet`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use didmeta::{MetaPluginRegistry, Scope, SqliteJsonDidMeta};
//!
//! let plugin = SqliteJsonDidMeta::in_memory()?;
//! let registry = MetaPluginRegistry::new(vec![Arc::new(plugin)]);
//! let scope = Scope::new("user.jdoe", "def");
//! registry.set_metadata(&scope, "dataset_1", "run_number", 176.into(), false)?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod filter;
pub mod models;
pub mod plugins;

// Re-exports for convenience
pub use config::MetaConfig;
pub use filter::{FilterEngine, FilterInput, FilterOperator, NativeQuery, QueryTarget};
pub use models::{DidListing, DidRecord, DidType, MetaDocument, Scope};
pub use plugins::{
    DedupSet, DidMetaPlugin, DidStream, ListOptions, MetaPluginRegistry, MongoDidMeta,
    SqliteJsonDidMeta,
};

/// Error type for didmeta operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `ConnectionParameterNotFound` | Required connection parameter neither passed nor configured |
/// | `DataIdentifierNotFound` | Read or delete target absent in the backend |
/// | `UnsupportedOperation` | Capability declined by a backend, or no backend claims a key on write |
/// | `UnsupportedFilterOperator` | Compiler cannot translate an operator for the target engine |
/// | `InvalidFilter` | Malformed filter wire shape, or coercion failure under strict mode |
/// | `Config` | Configuration value present but malformed |
/// | `Storage` | Backend client or I/O failure |
#[derive(Debug, ThisError)]
pub enum Error {
    /// A required connection parameter was neither passed explicitly nor
    /// resolvable from configuration.
    #[error("connection parameter '{0}' not found")]
    ConnectionParameterNotFound(String),

    /// No metadata document exists for the addressed DID (or the addressed
    /// key is absent on delete).
    #[error("data identifier not found: {0}")]
    DataIdentifierNotFound(String),

    /// The backend declines this capability.
    ///
    /// Raised when:
    /// - Recursive listing or recursive metadata propagation is requested
    ///   from an adapter that does not implement it
    /// - A write addresses a key no registered plugin manages
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The filter compiler cannot translate an operator for this target.
    #[error("unsupported filter operator '{operator}' for target '{target}'")]
    UnsupportedFilterOperator {
        /// The requested predicate operator.
        operator: String,
        /// The compilation target that declined it.
        target: String,
    },

    /// The filter input is malformed, or a predicate value could not be
    /// coerced to the target's native type under strict coercion.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// A configuration option is present but malformed.
    #[error("configuration option '{option}' is invalid: {cause}")]
    Config {
        /// The offending section/option pair.
        option: String,
        /// The underlying cause.
        cause: String,
    },

    /// A backend storage operation failed.
    #[error("storage operation '{operation}' failed: {cause}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

/// Result type alias for didmeta operations.
pub type Result<T> = std::result::Result<T, Error>;
