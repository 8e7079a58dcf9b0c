//! Ordered plugin registry and cross-backend aggregation.
//!
//! The registry holds the active plugins in configuration order. That order
//! is also the tie-break when several plugins claim a key: first match
//! wins. Listings fan out to every plugin under one shared dedup set, so a
//! DID discovered via two backends is yielded exactly once, by whichever
//! stream reaches it first.

use super::stream::DedupSet;
use super::traits::{DidMetaPlugin, DidStream, ListOptions};
use crate::filter::FilterInput;
use crate::models::{DidListing, MetaDocument, Scope};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Attributes that belong to DID identity rather than to any one backend's
/// metadata; predicates on them are kept for every plugin during fan-out.
const IDENTITY_ATTRS: [&str; 3] = ["name", "scope", "vo"];

/// Ordered registry of active metadata plugins.
pub struct MetaPluginRegistry {
    plugins: Vec<Arc<dyn DidMetaPlugin>>,
}

impl MetaPluginRegistry {
    /// Creates a registry over plugins in configuration order.
    #[must_use]
    pub fn new(plugins: Vec<Arc<dyn DidMetaPlugin>>) -> Self {
        Self { plugins }
    }

    /// The active plugins, in order.
    #[must_use]
    pub fn plugins(&self) -> &[Arc<dyn DidMetaPlugin>] {
        &self.plugins
    }

    /// The first plugin claiming `key`, if any.
    fn plugin_for_key(&self, key: &str) -> Option<&Arc<dyn DidMetaPlugin>> {
        self.plugins.iter().find(|plugin| plugin.manages_key(key))
    }

    fn plugin_by_name(&self, name: &str) -> Option<&Arc<dyn DidMetaPlugin>> {
        self.plugins
            .iter()
            .find(|plugin| plugin.plugin_name().eq_ignore_ascii_case(name))
    }

    /// Returns the DID's metadata.
    ///
    /// With `plugin = None`, every backend's document is merged in registry
    /// order, earlier plugins winning key collisions; a backend without a
    /// document for the DID contributes nothing. With `plugin =
    /// Some(name)`, the result is restricted to that backend.
    ///
    /// # Errors
    ///
    /// Returns `DataIdentifierNotFound` when no backend (or the named
    /// backend) holds a document, or when the named backend does not exist.
    /// Other backend failures propagate unchanged.
    pub fn get_metadata(
        &self,
        scope: &Scope,
        name: &str,
        plugin: Option<&str>,
    ) -> Result<MetaDocument> {
        if let Some(plugin_name) = plugin {
            let plugin = self.plugin_by_name(plugin_name).ok_or_else(|| {
                Error::DataIdentifierNotFound(format!(
                    "no metadata plugin named '{plugin_name}' for DID '{scope}:{name}'"
                ))
            })?;
            return plugin.get_metadata(scope, name);
        }

        let mut merged = MetaDocument::new();
        let mut found = false;
        for plugin in &self.plugins {
            match plugin.get_metadata(scope, name) {
                Ok(document) => {
                    found = true;
                    for (key, value) in document {
                        merged.entry(key).or_insert(value);
                    }
                },
                Err(Error::DataIdentifierNotFound(_)) => {},
                Err(e) => return Err(e),
            }
        }
        if !found {
            return Err(Error::DataIdentifierNotFound(format!(
                "no metadata found for DID '{scope}:{name}'"
            )));
        }
        Ok(merged)
    }

    /// Sets a single metadata key on the backend that claims it.
    ///
    /// # Errors
    ///
    /// Fails closed with `UnsupportedOperation` if no plugin claims the
    /// key.
    pub fn set_metadata(
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

    /// Upserts a metadata mapping, partitioning keys by the first plugin
    /// that claims each.
    ///
    /// The whole mapping is routed before any write executes: an unclaimed
    /// key fails the call closed without touching any backend. The
    /// per-plugin writes themselves remain uncoordinated; there is no
    /// cross-backend rollback.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` when a key is unclaimed, and
    /// propagates backend write failures.
    pub fn set_metadata_bulk(
        &self,
        scope: &Scope,
        name: &str,
        metadata: MetaDocument,
        recursive: bool,
    ) -> Result<()> {
        let mut partitions: BTreeMap<usize, MetaDocument> = BTreeMap::new();
        for (key, value) in metadata {
            let index = self
                .plugins
                .iter()
                .position(|plugin| plugin.manages_key(&key))
                .ok_or_else(|| {
                    Error::UnsupportedOperation(format!("no metadata plugin manages key '{key}'"))
                })?;
            partitions.entry(index).or_default().insert(key, value);
        }

        for (index, partition) in partitions {
            debug!(
                plugin = self.plugins[index].plugin_name(),
                keys = partition.len(),
                "routing bulk metadata write"
            );
            self.plugins[index].set_metadata_bulk(scope, name, partition, recursive)?;
        }
        Ok(())
    }

    /// Deletes one key on the backend that claims it.
    ///
    /// # Errors
    ///
    /// Returns `DataIdentifierNotFound` when no plugin claims the key, and
    /// propagates the claiming backend's result.
    pub fn delete_metadata(&self, scope: &Scope, name: &str, key: &str) -> Result<()> {
        let plugin = self.plugin_for_key(key).ok_or_else(|| {
            Error::DataIdentifierNotFound(format!(
                "no metadata plugin manages key '{key}' for DID '{scope}:{name}'"
            ))
        })?;
        plugin.delete_metadata(scope, name, key)
    }

    /// Lists DIDs matching the filters across every plugin.
    ///
    /// Plugins are queried lazily in registry order under one shared dedup
    /// set. Each plugin only evaluates the sub-filters over keys it manages
    /// (predicates on identity attributes are kept for all); predicates on
    /// a foreign backend's keys are compiled as always-true for it. A
    /// plugin failure is yielded once and ends the stream, with no
    /// best-effort masking.
    #[must_use]
    pub fn list_dids(
        &self,
        scope: &Scope,
        filters: &FilterInput,
        options: &ListOptions,
        ignore_dids: &DedupSet,
    ) -> DidStream {
        Box::new(FanOutStream {
            plugins: self.plugins.clone(),
            scope: scope.clone(),
            filters: filters.clone(),
            options: options.clone(),
            ignore_dids: ignore_dids.clone(),
            current: None,
            next_index: 0,
            remaining_offset: options.offset.unwrap_or(0),
            remaining: options.limit,
            failed: false,
        })
    }
}

/// Lazy fan-out over the registry's plugins.
///
/// Offset and the overall limit are applied here, across plugins; each
/// plugin still receives a cap on its own contribution so it never yields
/// more than the fan-out can use.
struct FanOutStream {
    plugins: Vec<Arc<dyn DidMetaPlugin>>,
    scope: Scope,
    filters: FilterInput,
    options: ListOptions,
    ignore_dids: DedupSet,
    current: Option<DidStream>,
    next_index: usize,
    remaining_offset: usize,
    remaining: Option<usize>,
    failed: bool,
}

impl FanOutStream {
    fn open_next(&mut self) -> Option<Result<()>> {
        let plugin = self.plugins.get(self.next_index)?.clone();
        self.next_index += 1;

        let sub_filters = self
            .filters
            .retain_attrs(|attr| IDENTITY_ATTRS.contains(&attr) || plugin.manages_key(attr));

        // Offset is applied across the whole fan-out, so each plugin must
        // still produce the records the fan-out may yet skip.
        let mut plugin_options = self.options.clone();
        plugin_options.offset = None;
        plugin_options.limit = self
            .remaining
            .map(|remaining| remaining + self.remaining_offset);

        match plugin.list_dids(&self.scope, &sub_filters, &plugin_options, &self.ignore_dids) {
            Ok(stream) => {
                self.current = Some(stream);
                Some(Ok(()))
            },
            Err(e) => Some(Err(e)),
        }
    }
}

impl Iterator for FanOutStream {
    type Item = Result<DidListing>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed || self.remaining == Some(0) {
                return None;
            }
            if let Some(stream) = self.current.as_mut() {
                match stream.next() {
                    Some(Ok(item)) => {
                        if self.remaining_offset > 0 {
                            self.remaining_offset -= 1;
                            continue;
                        }
                        if let Some(remaining) = self.remaining.as_mut() {
                            *remaining -= 1;
                        }
                        return Some(Ok(item));
                    },
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    },
                    None => {
                        self.current = None;
                    },
                }
            } else {
                match self.open_next() {
                    Some(Ok(())) => {},
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    },
                    None => return None,
                }
            }
        }
    }
}
