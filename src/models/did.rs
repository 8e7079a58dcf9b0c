//! DID identity and listing record types.

use serde::{Serialize, Serializer};
use std::fmt;

/// The default virtual organization. Scopes in this VO are not qualified.
const DEFAULT_VO: &str = "def";

/// A DID scope with its internal and external string forms.
///
/// The internal form is VO-qualified and used as a storage key prefix; the
/// external form is what users see. Both are treated as opaque strings by
/// every backend; nothing in this crate parses them back apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    internal: String,
    external: String,
    vo: String,
}

impl Scope {
    /// Creates a scope from its external form and VO tag.
    ///
    /// The internal form is derived as `"{vo}.{external}"`, except for the
    /// default VO (`"def"`) where internal and external coincide.
    #[must_use]
    pub fn new(external: impl Into<String>, vo: impl Into<String>) -> Self {
        let external = external.into();
        let vo = vo.into();
        let internal = if vo == DEFAULT_VO {
            external.clone()
        } else {
            format!("{vo}.{external}")
        };
        Self {
            internal,
            external,
            vo,
        }
    }

    /// Creates a scope from pre-resolved internal/external forms.
    ///
    /// For callers with their own identity service; all three strings are
    /// taken verbatim.
    #[must_use]
    pub fn from_parts(
        internal: impl Into<String>,
        external: impl Into<String>,
        vo: impl Into<String>,
    ) -> Self {
        Self {
            internal: internal.into(),
            external: external.into(),
            vo: vo.into(),
        }
    }

    /// The VO-qualified internal form.
    #[must_use]
    pub fn internal(&self) -> &str {
        &self.internal
    }

    /// The user-facing external form.
    #[must_use]
    pub fn external(&self) -> &str {
        &self.external
    }

    /// The virtual organization tag.
    #[must_use]
    pub fn vo(&self) -> &str {
        &self.vo
    }

    /// The storage key for a DID in this scope: `"{internal}:{name}"`.
    #[must_use]
    pub fn did_key(&self, name: &str) -> String {
        format!("{}:{}", self.internal, name)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.external)
    }
}

/// DID type requested in a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DidType {
    /// Any DID type.
    All,
    /// Datasets and containers (default).
    #[default]
    Collection,
    /// Datasets only.
    Dataset,
    /// Containers only.
    Container,
    /// Files only.
    File,
}

impl DidType {
    /// Returns the type as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Collection => "collection",
            Self::Dataset => "dataset",
            Self::Container => "container",
            Self::File => "file",
        }
    }
}

/// Serializes `None` as the literal `"N/A"` sentinel.
///
/// Backends that cannot supply enriched listing fields report this marker
/// rather than failing.
fn na_if_none<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Serialize,
    S: Serializer,
{
    match value {
        Some(v) => v.serialize(serializer),
        None => serializer.serialize_str("N/A"),
    }
}

/// Enriched listing record produced by `list_dids` in long mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DidRecord {
    /// External scope of the DID.
    pub scope: String,
    /// DID name.
    pub name: String,
    /// DID type, when the backend can supply it.
    #[serde(serialize_with = "na_if_none")]
    pub did_type: Option<DidType>,
    /// Size in bytes, when the backend can supply it.
    #[serde(serialize_with = "na_if_none")]
    pub bytes: Option<u64>,
    /// Number of contained DIDs, when the backend can supply it.
    #[serde(serialize_with = "na_if_none")]
    pub length: Option<u64>,
}

/// One item yielded by `list_dids`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DidListing {
    /// Bare DID name (short mode).
    Name(String),
    /// Enriched record (long mode).
    Record(DidRecord),
}

impl DidListing {
    /// The DID name, regardless of mode.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Record(record) => &record.name,
        }
    }
}
