//! Backend-agnostic filter expressions.
//!
//! Callers describe DID metadata predicates as a sequence of filter groups:
//! OR across groups, AND within a group. The wire shape consumed at the API
//! boundary is either a single JSON mapping or an array of mappings; a bare
//! mapping is treated as a one-element sequence for back compatibility.
//!
//! Non-equality operators are encoded as a key suffix: `"run_number.gte"`
//! compares with `>=`, a bare `"run_number"` key compares with equality.

mod engine;

pub use engine::{ColumnType, FilterEngine, NativeQuery, QueryTarget, SqlParam, TableModel};

use crate::{Error, Result};
use serde_json::Value;

/// Predicate operators of the filter language.
///
/// Equality is the operator every compilation target must support; targets
/// may decline the others per their own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// Equality.
    Eq,
    /// Inequality.
    Ne,
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Strictly greater than.
    Gt,
    /// Greater than or equal.
    Gte,
}

impl FilterOperator {
    /// Returns the operator as its wire suffix.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
        }
    }

    /// Parses a wire key suffix into an operator.
    #[must_use]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "ne" => Some(Self::Ne),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            _ => None,
        }
    }

    /// The document-query operator token (`$eq`, `$gt`, ...).
    #[must_use]
    pub const fn document_token(&self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
        }
    }

    /// The SQL comparison token.
    #[must_use]
    pub const fn sql_token(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }
}

/// One predicate: attribute, operator, value.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    /// Attribute name.
    pub attr: String,
    /// Comparison operator.
    pub op: FilterOperator,
    /// Comparison value (JSON scalar).
    pub value: Value,
}

impl Predicate {
    /// Creates a predicate.
    #[must_use]
    pub fn new(attr: impl Into<String>, op: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            attr: attr.into(),
            op,
            value: value.into(),
        }
    }
}

/// A conjunction of predicates (implicit AND).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterGroup {
    /// The AND-ed predicates of this group.
    pub predicates: Vec<Predicate>,
}

/// Parsed filter input: OR across groups, AND within a group.
///
/// An empty input (or an empty mapping) matches everything; injected
/// tenant-isolation filters still apply during compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterInput {
    groups: Vec<FilterGroup>,
}

impl FilterInput {
    /// A filter that matches everything.
    #[must_use]
    pub fn match_all() -> Self {
        Self {
            groups: vec![FilterGroup::default()],
        }
    }

    /// Builds filter input from already-parsed groups.
    #[must_use]
    pub fn from_groups(groups: Vec<FilterGroup>) -> Self {
        if groups.is_empty() {
            return Self::match_all();
        }
        Self { groups }
    }

    /// Parses the wire shape: a single JSON mapping or an array of mappings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFilter`] if the value is neither a mapping
    /// nor an array of mappings, or if a predicate value is not a scalar.
    pub fn parse(value: &Value) -> Result<Self> {
        let groups = match value {
            Value::Object(map) => vec![Self::parse_group(map)?],
            Value::Array(items) => {
                let mut groups = Vec::with_capacity(items.len());
                for item in items {
                    let Value::Object(map) = item else {
                        return Err(Error::InvalidFilter(
                            "filter sequence items must be mappings".to_string(),
                        ));
                    };
                    groups.push(Self::parse_group(map)?);
                }
                groups
            },
            Value::Null => Vec::new(),
            other => {
                return Err(Error::InvalidFilter(format!(
                    "filters must be a mapping or a sequence of mappings, got {other}"
                )));
            },
        };
        Ok(Self::from_groups(groups))
    }

    fn parse_group(map: &serde_json::Map<String, Value>) -> Result<FilterGroup> {
        let mut predicates = Vec::with_capacity(map.len());
        for (key, value) in map {
            if value.is_object() || value.is_array() {
                return Err(Error::InvalidFilter(format!(
                    "predicate value for '{key}' must be a scalar"
                )));
            }
            let (attr, op) = split_operator(key);
            predicates.push(Predicate {
                attr: attr.to_string(),
                op,
                value: value.clone(),
            });
        }
        Ok(FilterGroup { predicates })
    }

    /// The OR-ed groups of this input.
    #[must_use]
    pub fn groups(&self) -> &[FilterGroup] {
        &self.groups
    }

    /// Returns a copy keeping only predicates whose attribute satisfies
    /// `keep`.
    ///
    /// Used by the registry to compile predicates on a foreign backend's
    /// keys as always-true for the backend that does not manage them.
    #[must_use]
    pub fn retain_attrs(&self, keep: impl Fn(&str) -> bool) -> Self {
        let groups = self
            .groups
            .iter()
            .map(|group| FilterGroup {
                predicates: group
                    .predicates
                    .iter()
                    .filter(|p| keep(&p.attr))
                    .cloned()
                    .collect(),
            })
            .collect();
        Self { groups }
    }
}

/// Splits a wire key into attribute and operator.
///
/// The part after the last `.` is taken as an operator suffix when it names
/// one; otherwise the whole key is the attribute and the operator is
/// equality, so dotted attribute names stay usable.
fn split_operator(key: &str) -> (&str, FilterOperator) {
    if let Some((attr, suffix)) = key.rsplit_once('.') {
        if !attr.is_empty() {
            if let Some(op) = FilterOperator::from_suffix(suffix) {
                return (attr, op);
            }
        }
    }
    (key, FilterOperator::Eq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_mapping_is_one_group() {
        let input = FilterInput::parse(&json!({"project": "atlas", "run_number": 176})).unwrap();
        assert_eq!(input.groups().len(), 1);
        assert_eq!(input.groups()[0].predicates.len(), 2);
        assert!(
            input.groups()[0]
                .predicates
                .iter()
                .all(|p| p.op == FilterOperator::Eq)
        );
    }

    #[test]
    fn test_sequence_is_or_of_groups() {
        let input =
            FilterInput::parse(&json!([{"project": "atlas"}, {"project": "cms"}])).unwrap();
        assert_eq!(input.groups().len(), 2);
    }

    #[test]
    fn test_operator_suffixes() {
        let input = FilterInput::parse(&json!({
            "run_number.gte": 100,
            "run_number.lt": 200,
            "campaign.ne": "mc16"
        }))
        .unwrap();
        let group = &input.groups()[0];
        let ops: Vec<_> = group
            .predicates
            .iter()
            .map(|p| (p.attr.as_str(), p.op))
            .collect();
        assert!(ops.contains(&("run_number", FilterOperator::Gte)));
        assert!(ops.contains(&("run_number", FilterOperator::Lt)));
        assert!(ops.contains(&("campaign", FilterOperator::Ne)));
    }

    #[test]
    fn test_dotted_attr_without_operator_suffix() {
        let (attr, op) = split_operator("user.lifetime");
        assert_eq!(attr, "user.lifetime");
        assert_eq!(op, FilterOperator::Eq);
    }

    #[test]
    fn test_empty_mapping_matches_all() {
        let input = FilterInput::parse(&json!({})).unwrap();
        assert_eq!(input.groups().len(), 1);
        assert!(input.groups()[0].predicates.is_empty());
    }

    #[test]
    fn test_rejects_non_scalar_values() {
        assert!(FilterInput::parse(&json!({"meta": {"nested": 1}})).is_err());
        assert!(FilterInput::parse(&json!("project=atlas")).is_err());
        assert!(FilterInput::parse(&json!([42])).is_err());
    }

    #[test]
    fn test_retain_attrs_drops_foreign_keys() {
        let input = FilterInput::parse(&json!({"project": "atlas", "foreign": 1})).unwrap();
        let kept = input.retain_attrs(|attr| attr == "project");
        assert_eq!(kept.groups()[0].predicates.len(), 1);
        assert_eq!(kept.groups()[0].predicates[0].attr, "project");
    }
}
