//! The metadata plugin contract.

use super::stream::DedupSet;
use crate::Result;
use crate::filter::FilterInput;
use crate::models::{DidListing, DidType, MetaDocument, Scope};
use serde_json::Value;

/// Lazy, single-pass, non-restartable sequence of listing results.
///
/// Dedup against the shared [`DedupSet`] happens as a side effect of
/// consumption: a DID is inserted into the set the moment it is yielded, so
/// callers running several plugins for one logical query must hand the same
/// set instance to all of them.
pub type DidStream = Box<dyn Iterator<Item = Result<DidListing>> + Send>;

/// Options for a `list_dids` call.
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Requested DID type. Accepted for contract parity; the shipped
    /// adapters do not track DID types and report the `"N/A"` sentinel in
    /// long mode.
    pub did_type: DidType,
    /// Case-insensitive matching, where the backend supports it.
    pub ignore_case: bool,
    /// Maximum number of DIDs to yield, counted after dedup.
    pub limit: Option<usize>,
    /// Number of post-dedup DIDs to skip before counting toward `limit`.
    pub offset: Option<usize>,
    /// Yield enriched [`DidListing::Record`]s instead of bare names.
    pub long: bool,
    /// Expand containers and datasets into their contents. A capability an
    /// adapter may decline with `UnsupportedOperation`.
    pub recursive: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            did_type: DidType::Collection,
            ignore_case: false,
            limit: None,
            offset: None,
            long: false,
            recursive: false,
        }
    }
}

impl ListOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the post-dedup limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the post-dedup offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Requests enriched records.
    #[must_use]
    pub const fn with_long(mut self, long: bool) -> Self {
        self.long = long;
        self
    }

    /// Requests recursive expansion.
    #[must_use]
    pub const fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Requests case-insensitive matching.
    #[must_use]
    pub const fn with_ignore_case(mut self, ignore_case: bool) -> Self {
        self.ignore_case = ignore_case;
        self
    }
}

/// Uniform contract every metadata backend adapter implements.
///
/// # Implementor Notes
///
/// - Methods use `&self` to enable sharing via `Arc<dyn DidMetaPlugin>`;
///   use interior mutability (e.g. `Mutex<Connection>`) for mutable state
/// - Writes are per-DID last-writer-wins; no cross-backend lock is taken
/// - System keys (storage row identifier, scope, name, VO) are set once at
///   document creation and silently dropped from user writes, never errored
pub trait DidMetaPlugin: Send + Sync {
    /// Returns the metadata document for a DID, system keys stripped.
    ///
    /// # Errors
    ///
    /// Returns `DataIdentifierNotFound` if this backend holds no document
    /// for the DID.
    fn get_metadata(&self, scope: &Scope, name: &str) -> Result<MetaDocument>;

    /// Sets a single metadata key.
    ///
    /// Equivalent to [`set_metadata_bulk`](Self::set_metadata_bulk) with a
    /// single-entry mapping.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` if `recursive` is requested and this
    /// backend declines it.
    fn set_metadata(
        &self,
        scope: &Scope,
        name: &str,
        key: &str,
        value: Value,
        recursive: bool,
    ) -> Result<()> {
        let mut metadata = MetaDocument::new();
        metadata.insert(key.to_string(), value);
        self.set_metadata_bulk(scope, name, metadata, recursive)
    }

    /// Upserts a metadata mapping.
    ///
    /// Creates the document if absent, deriving system keys from the DID
    /// identity at creation time only. Any system key present in the
    /// caller's mapping is discarded before the write executes.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` if `recursive` is requested and this
    /// backend declines it.
    fn set_metadata_bulk(
        &self,
        scope: &Scope,
        name: &str,
        metadata: MetaDocument,
        recursive: bool,
    ) -> Result<()>;

    /// Removes one key from a DID's metadata.
    ///
    /// Deleting a system key is not prevented here, unlike the write path;
    /// that is a documented caller responsibility.
    ///
    /// # Errors
    ///
    /// Returns `DataIdentifierNotFound` if the DID or the key is absent.
    fn delete_metadata(&self, scope: &Scope, name: &str, key: &str) -> Result<()>;

    /// Lists DIDs matching the filters, as a lazy single-pass stream.
    ///
    /// Every yielded DID is checked against `ignore_dids` first: an already
    /// present DID is skipped without counting toward `options.limit`;
    /// otherwise it is inserted before the next item is produced.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` (naming the plugin) if
    /// `options.recursive` is requested and this backend declines it, and
    /// compilation errors from the filter engine.
    fn list_dids(
        &self,
        scope: &Scope,
        filters: &FilterInput,
        options: &ListOptions,
        ignore_dids: &DedupSet,
    ) -> Result<DidStream>;

    /// Returns true if this backend is authoritative for `key`.
    fn manages_key(&self, key: &str) -> bool;

    /// Stable identifier for diagnostics and result tagging.
    fn plugin_name(&self) -> &str;
}
