//! Filter compiler: predicate groups to backend-native queries.
//!
//! Two compilation targets exist, matched exhaustively so a new backend kind
//! cannot be added without deciding its compiler path:
//!
//! - [`QueryTarget::Document`]: schema-less; yields a nested query object
//!   for document stores (`$or` across groups, implicit field conjunction
//!   within a group).
//! - [`QueryTarget::Relational`]: schema-bound to a [`TableModel`]; yields
//!   a SQL `WHERE` clause with positional parameters, comparing typed
//!   columns directly and everything else through `json_extract`.

use super::{FilterGroup, FilterInput, FilterOperator, Predicate};
use crate::{Error, Result};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tracing::debug;

/// Native type of a relational column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// TEXT affinity.
    Text,
    /// INTEGER affinity.
    Integer,
    /// REAL affinity.
    Real,
    /// Boolean, stored as 0/1.
    Boolean,
}

/// Schema descriptor for a relational compilation target.
///
/// Attributes naming a typed column compare against that column; all other
/// attributes compare against `json_extract(<json column>, '$.<attr>')`.
#[derive(Debug, Clone)]
pub struct TableModel {
    table: String,
    json_column: String,
    columns: HashMap<String, ColumnType>,
    case_insensitive: bool,
}

impl TableModel {
    /// Creates a model for `table` whose metadata document lives in
    /// `json_column`.
    #[must_use]
    pub fn new(table: impl Into<String>, json_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            json_column: json_column.into(),
            columns: HashMap::new(),
            case_insensitive: false,
        }
    }

    /// Declares a typed column.
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.insert(name.into(), ty);
        self
    }

    /// Makes text equality comparisons case-insensitive (`COLLATE NOCASE`).
    #[must_use]
    pub const fn with_nocase(mut self, nocase: bool) -> Self {
        self.case_insensitive = nocase;
        self
    }

    /// The table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The type of a declared column, if `attr` names one.
    #[must_use]
    pub fn column(&self, attr: &str) -> Option<ColumnType> {
        self.columns.get(attr).copied()
    }
}

/// Compilation target for one backend kind.
#[derive(Debug, Clone, Copy)]
pub enum QueryTarget<'a> {
    /// Schema-less document-store query.
    Document,
    /// Schema-bound relational query.
    Relational(&'a TableModel),
}

impl QueryTarget<'_> {
    const fn name(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Relational(_) => "relational",
        }
    }
}

/// A compiled backend-native query.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeQuery {
    /// Nested document-store query object.
    Document(Value),
    /// SQL `WHERE` clause with positional parameters.
    Sql {
        /// The clause text, `?`-parameterized.
        clause: String,
        /// Parameters in positional order.
        params: Vec<SqlParam>,
    },
}

/// One positional SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// Text value.
    Text(String),
    /// Integer value.
    Integer(i64),
    /// Floating-point value.
    Real(f64),
    /// SQL NULL.
    Null,
}

/// Compiles filter expressions into backend-native queries.
pub struct FilterEngine {
    groups: Vec<FilterGroup>,
    strict_coerce: bool,
}

impl FilterEngine {
    /// Creates an engine over parsed filter input.
    ///
    /// `strict_coerce` controls type coercion against schema-bound targets:
    /// a value that cannot be coerced to the column's native type is a
    /// compilation error under strict mode and a literal pass-through
    /// otherwise. Schema-less targets never coerce.
    #[must_use]
    pub fn new(input: FilterInput, strict_coerce: bool) -> Self {
        Self {
            groups: input.groups().to_vec(),
            strict_coerce,
        }
    }

    /// Compiles the filters for `target`.
    ///
    /// `additional_filters` are AND-ed into every OR branch; adapters use
    /// this to inject tenant isolation (scope and VO) so caller filters can
    /// never widen results across that boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedFilterOperator`] when the target cannot
    /// translate a predicate's operator, and [`Error::InvalidFilter`] on
    /// coercion failure under strict mode.
    pub fn compile(
        &self,
        target: &QueryTarget<'_>,
        additional_filters: &[Predicate],
    ) -> Result<NativeQuery> {
        debug!(
            target = target.name(),
            groups = self.groups.len(),
            "compiling filter expression"
        );
        match target {
            QueryTarget::Document => self.compile_document(additional_filters),
            QueryTarget::Relational(model) => self.compile_relational(model, additional_filters),
        }
    }

    fn compile_document(&self, additional_filters: &[Predicate]) -> Result<NativeQuery> {
        let mut branches = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let mut conditions: Map<String, Value> = Map::new();
            // Conditions that cannot be merged into the per-attribute
            // operator map: the same attribute and operator appearing from
            // both the caller and the injected filters must stay a
            // conjunction, not overwrite each other.
            let mut carried: Vec<Value> = Vec::new();
            for predicate in group.predicates.iter().chain(additional_filters) {
                let token = predicate.op.document_token();
                let entry = conditions
                    .entry(predicate.attr.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(ops) = entry {
                    if ops.contains_key(token) {
                        carried.push(Self::single_condition(predicate));
                    } else {
                        ops.insert(token.to_string(), predicate.value.clone());
                    }
                }
            }
            // A lone $eq collapses to the exact-match field form.
            let branch = conditions
                .into_iter()
                .map(|(attr, ops)| match &ops {
                    Value::Object(map) if map.len() == 1 && map.contains_key("$eq") => {
                        (attr, map["$eq"].clone())
                    },
                    _ => (attr, ops),
                })
                .collect::<Map<String, Value>>();
            if carried.is_empty() {
                branches.push(Value::Object(branch));
            } else {
                let mut all = vec![Value::Object(branch)];
                all.append(&mut carried);
                branches.push(json!({ "$and": all }));
            }
        }

        let query = match branches.len() {
            0 => json!({}),
            1 => branches.swap_remove(0),
            _ => json!({ "$or": branches }),
        };
        Ok(NativeQuery::Document(query))
    }

    fn single_condition(predicate: &Predicate) -> Value {
        let mut condition = Map::new();
        if predicate.op == FilterOperator::Eq {
            condition.insert(predicate.attr.clone(), predicate.value.clone());
        } else {
            let mut ops = Map::new();
            ops.insert(
                predicate.op.document_token().to_string(),
                predicate.value.clone(),
            );
            condition.insert(predicate.attr.clone(), Value::Object(ops));
        }
        Value::Object(condition)
    }

    fn compile_relational(
        &self,
        model: &TableModel,
        additional_filters: &[Predicate],
    ) -> Result<NativeQuery> {
        let mut branches = Vec::with_capacity(self.groups.len());
        let mut params = Vec::new();
        for group in &self.groups {
            let mut conditions = Vec::new();
            for predicate in group.predicates.iter().chain(additional_filters) {
                let condition = match model.column(&predicate.attr) {
                    Some(ty) => self.column_condition(model, predicate, ty, &mut params)?,
                    None => Self::json_condition(model, predicate, &mut params)?,
                };
                conditions.push(condition);
            }
            if conditions.is_empty() {
                branches.push("1=1".to_string());
            } else {
                branches.push(format!("({})", conditions.join(" AND ")));
            }
        }

        let clause = if branches.is_empty() {
            "1=1".to_string()
        } else {
            branches.join(" OR ")
        };
        Ok(NativeQuery::Sql { clause, params })
    }

    fn column_condition(
        &self,
        model: &TableModel,
        predicate: &Predicate,
        ty: ColumnType,
        params: &mut Vec<SqlParam>,
    ) -> Result<String> {
        let param = self.coerce(&predicate.value, ty, &predicate.attr)?;
        if matches!(param, SqlParam::Null) {
            return Self::null_condition(&predicate.attr, predicate.op, "relational");
        }
        let collate = if model.case_insensitive
            && ty == ColumnType::Text
            && matches!(predicate.op, FilterOperator::Eq | FilterOperator::Ne)
        {
            " COLLATE NOCASE"
        } else {
            ""
        };
        params.push(param);
        Ok(format!(
            "{} {} ?{collate}",
            predicate.attr,
            predicate.op.sql_token()
        ))
    }

    /// Attributes without a typed column compare through `json_extract`.
    /// Ordering operators are declined for them: extracted values carry
    /// text affinity for JSON strings, and lexical ordering silently lies
    /// about numbers.
    fn json_condition(
        model: &TableModel,
        predicate: &Predicate,
        params: &mut Vec<SqlParam>,
    ) -> Result<String> {
        if !matches!(predicate.op, FilterOperator::Eq | FilterOperator::Ne) {
            return Err(Error::UnsupportedFilterOperator {
                operator: predicate.op.as_str().to_string(),
                target: "relational".to_string(),
            });
        }
        let path = predicate.attr.replace('\'', "''");
        let lhs = format!("json_extract({}, '$.{path}')", model.json_column);
        let param = match &predicate.value {
            Value::String(s) => SqlParam::Text(s.clone()),
            Value::Number(n) => n.as_i64().map_or_else(
                || SqlParam::Real(n.as_f64().unwrap_or_default()),
                SqlParam::Integer,
            ),
            Value::Bool(b) => SqlParam::Integer(i64::from(*b)),
            Value::Null => SqlParam::Null,
            other => {
                return Err(Error::InvalidFilter(format!(
                    "predicate value for '{}' must be a scalar, got {other}",
                    predicate.attr
                )));
            },
        };
        if matches!(param, SqlParam::Null) {
            return Self::null_json_condition(&lhs, predicate.op);
        }
        params.push(param);
        Ok(format!("{lhs} {} ?", predicate.op.sql_token()))
    }

    fn null_condition(
        attr: &str,
        op: FilterOperator,
        target: &str,
    ) -> Result<String> {
        match op {
            FilterOperator::Eq => Ok(format!("{attr} IS NULL")),
            FilterOperator::Ne => Ok(format!("{attr} IS NOT NULL")),
            _ => Err(Error::UnsupportedFilterOperator {
                operator: op.as_str().to_string(),
                target: target.to_string(),
            }),
        }
    }

    fn null_json_condition(lhs: &str, op: FilterOperator) -> Result<String> {
        match op {
            FilterOperator::Eq => Ok(format!("{lhs} IS NULL")),
            FilterOperator::Ne => Ok(format!("{lhs} IS NOT NULL")),
            _ => unreachable!("ordering operators rejected before null handling"),
        }
    }

    /// Coerces a predicate value to the column's native type.
    fn coerce(&self, value: &Value, ty: ColumnType, attr: &str) -> Result<SqlParam> {
        let coerced = match (ty, value) {
            (_, Value::Null) => Some(SqlParam::Null),
            (ColumnType::Text, Value::String(s)) => Some(SqlParam::Text(s.clone())),
            (ColumnType::Text, Value::Number(n)) => Some(SqlParam::Text(n.to_string())),
            (ColumnType::Text, Value::Bool(b)) => Some(SqlParam::Text(b.to_string())),
            (ColumnType::Integer, Value::Number(n)) => n.as_i64().map(SqlParam::Integer),
            (ColumnType::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().ok().map(SqlParam::Integer)
            },
            (ColumnType::Real, Value::Number(n)) => n.as_f64().map(SqlParam::Real),
            (ColumnType::Real, Value::String(s)) => {
                s.trim().parse::<f64>().ok().map(SqlParam::Real)
            },
            (ColumnType::Boolean, Value::Bool(b)) => Some(SqlParam::Integer(i64::from(*b))),
            (ColumnType::Boolean, Value::String(s)) => match s.trim() {
                "true" | "True" | "1" => Some(SqlParam::Integer(1)),
                "false" | "False" | "0" => Some(SqlParam::Integer(0)),
                _ => None,
            },
            (ColumnType::Boolean, Value::Number(n)) => {
                n.as_i64().map(|i| SqlParam::Integer(i64::from(i != 0)))
            },
            _ => None,
        };

        match coerced {
            Some(param) => Ok(param),
            None if self.strict_coerce => Err(Error::InvalidFilter(format!(
                "cannot coerce value {value} for attribute '{attr}' to its column type"
            ))),
            // Non-strict: pass the literal through untouched.
            None => Ok(SqlParam::Text(literal_string(value))),
        }
    }
}

fn literal_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
