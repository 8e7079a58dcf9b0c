//! Shared dedup set and the lazy listing stream adapter.

use crate::Result;
use crate::models::{DidListing, DidRecord};
use crate::plugins::ListOptions;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Helper to acquire a mutex lock with poison recovery.
///
/// If the mutex is poisoned by a panic in a previous critical section, the
/// inner value is recovered with a warning; the set is plain data and stays
/// valid.
fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("dedup set mutex was poisoned, recovering");
            poisoned.into_inner()
        },
    }
}

/// Caller-owned set of `"scope:name"` strings threaded through one logical
/// query.
///
/// The set is an input/output parameter, not read-only: every plugin stream
/// consuming under it inserts each DID it yields, which is what suppresses
/// duplicates across backend fan-out. Created (or accepted) at the start of
/// one listing, discarded at the end, never persisted.
///
/// Cloning is cheap and produces a handle to the same underlying set.
#[derive(Debug, Clone, Default)]
pub struct DedupSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl DedupSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set pre-seeded with DIDs to suppress.
    #[must_use]
    pub fn with_seed(dids: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(dids.into_iter().collect())),
        }
    }

    /// Inserts a DID, returning true if it was not yet present.
    ///
    /// Check and insertion are one atomic step, so concurrent consumers
    /// cannot both observe a DID as new; "first to acquire the lock" is the
    /// tie-break.
    #[must_use]
    pub fn check_and_insert(&self, did: &str) -> bool {
        acquire_lock(&self.inner).insert(did.to_string())
    }

    /// Returns true if the DID has already been observed.
    #[must_use]
    pub fn contains(&self, did: &str) -> bool {
        acquire_lock(&self.inner).contains(did)
    }

    /// Number of DIDs observed so far.
    #[must_use]
    pub fn len(&self) -> usize {
        acquire_lock(&self.inner).len()
    }

    /// Returns true if nothing has been observed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        acquire_lock(&self.inner).is_empty()
    }
}

/// One raw row produced by a backend query, before dedup and shaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDid {
    /// External scope of the DID.
    pub scope: String,
    /// DID name.
    pub name: String,
}

/// Lazy adapter from a backend's raw result rows to listing items.
///
/// Applies, in order and at consumption time: dedup against the shared set
/// (skipped rows are not yielded and not counted), offset over the
/// post-dedup sequence, then the post-dedup limit. A storage error from the
/// inner iterator is yielded once and ends the stream.
pub struct DedupStream<I> {
    inner: I,
    ignore_dids: DedupSet,
    long: bool,
    remaining_offset: usize,
    remaining: Option<usize>,
    done: bool,
}

impl<I> DedupStream<I>
where
    I: Iterator<Item = Result<RawDid>>,
{
    /// Wraps a raw row iterator per the listing options.
    pub fn new(inner: I, ignore_dids: DedupSet, options: &ListOptions) -> Self {
        Self {
            inner,
            ignore_dids,
            long: options.long,
            remaining_offset: options.offset.unwrap_or(0),
            remaining: options.limit,
            done: false,
        }
    }

    fn shape(&self, raw: RawDid) -> DidListing {
        if self.long {
            DidListing::Record(DidRecord {
                scope: raw.scope,
                name: raw.name,
                did_type: None,
                bytes: None,
                length: None,
            })
        } else {
            DidListing::Name(raw.name)
        }
    }
}

impl<I> Iterator for DedupStream<I>
where
    I: Iterator<Item = Result<RawDid>>,
{
    type Item = Result<DidListing>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == Some(0) {
            return None;
        }
        loop {
            match self.inner.next() {
                None => {
                    self.done = true;
                    return None;
                },
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                },
                Some(Ok(raw)) => {
                    let did = format!("{}:{}", raw.scope, raw.name);
                    if !self.ignore_dids.check_and_insert(&did) {
                        continue;
                    }
                    if self.remaining_offset > 0 {
                        self.remaining_offset -= 1;
                        continue;
                    }
                    if let Some(remaining) = self.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    return Some(Ok(self.shape(raw)));
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(names: &[&str]) -> Vec<Result<RawDid>> {
        names
            .iter()
            .map(|name| {
                Ok(RawDid {
                    scope: "test".to_string(),
                    name: (*name).to_string(),
                })
            })
            .collect()
    }

    fn names(stream: DedupStream<std::vec::IntoIter<Result<RawDid>>>) -> Vec<String> {
        stream
            .map(|item| item.unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_duplicates_within_one_stream_suppressed() {
        let set = DedupSet::new();
        let stream = DedupStream::new(
            rows(&["a", "b", "a"]).into_iter(),
            set,
            &ListOptions::default(),
        );
        assert_eq!(names(stream), vec!["a", "b"]);
    }

    #[test]
    fn test_shared_set_suppresses_across_streams() {
        let set = DedupSet::new();
        let first = DedupStream::new(
            rows(&["a", "b"]).into_iter(),
            set.clone(),
            &ListOptions::default(),
        );
        assert_eq!(names(first), vec!["a", "b"]);

        let second = DedupStream::new(
            rows(&["b", "c"]).into_iter(),
            set.clone(),
            &ListOptions::default(),
        );
        assert_eq!(names(second), vec!["c"]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_limit_counts_only_new_dids() {
        let set = DedupSet::with_seed(["test:a".to_string()]);
        let stream = DedupStream::new(
            rows(&["a", "b", "c", "d"]).into_iter(),
            set,
            &ListOptions::default().with_limit(2),
        );
        // "a" is already in the set: skipped without consuming the limit.
        assert_eq!(names(stream), vec!["b", "c"]);
    }

    #[test]
    fn test_offset_applies_after_dedup() {
        let set = DedupSet::with_seed(["test:a".to_string()]);
        let stream = DedupStream::new(
            rows(&["a", "b", "c", "d"]).into_iter(),
            set,
            &ListOptions::default().with_offset(1).with_limit(2),
        );
        assert_eq!(names(stream), vec!["c", "d"]);
    }

    #[test]
    fn test_long_mode_yields_records_with_sentinels() {
        let set = DedupSet::new();
        let mut stream = DedupStream::new(
            rows(&["a"]).into_iter(),
            set,
            &ListOptions::default().with_long(true),
        );
        let DidListing::Record(record) = stream.next().unwrap().unwrap() else {
            panic!("expected record");
        };
        assert_eq!(record.scope, "test");
        assert_eq!(record.name, "a");
        assert_eq!(record.did_type, None);
        assert_eq!(record.bytes, None);
    }

    #[test]
    fn test_error_ends_stream() {
        let set = DedupSet::new();
        let items: Vec<Result<RawDid>> = vec![
            Ok(RawDid {
                scope: "test".to_string(),
                name: "a".to_string(),
            }),
            Err(crate::Error::Storage {
                operation: "cursor_next".to_string(),
                cause: "connection reset".to_string(),
            }),
            Ok(RawDid {
                scope: "test".to_string(),
                name: "b".to_string(),
            }),
        ];
        let mut stream = DedupStream::new(items.into_iter(), set, &ListOptions::default());
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());
    }
}
