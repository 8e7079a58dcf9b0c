//! Relational metadata adapter backed by `SQLite` with a JSON column.
//!
//! Structurally identical implementer of the plugin contract: DID identity
//! lives in typed columns, user metadata in a JSON `meta` column queried
//! through `json_extract`.

use super::stream::{DedupSet, DedupStream, RawDid};
use super::traits::{DidMetaPlugin, DidStream, ListOptions};
use crate::config::MetaConfig;
use crate::filter::{
    ColumnType, FilterEngine, FilterInput, FilterOperator, NativeQuery, Predicate, QueryTarget,
    SqlParam, TableModel,
};
use crate::models::{MetaDocument, Scope};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

/// Keys owned by the storage layer, kept in typed columns and never present
/// in the JSON document.
const SYSTEM_KEYS: [&str; 4] = ["did", "scope", "name", "vo"];

const PLUGIN_NAME: &str = "JSON";
const CONFIG_SECTION: &str = "metadata";

/// Helper to acquire the connection lock with poison recovery.
///
/// If the mutex is poisoned by a panic in a previous critical section, the
/// inner value is recovered with a warning; the connection state is still
/// valid.
fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("sqlite mutex was poisoned, recovering");
            poisoned.into_inner()
        },
    }
}

/// Relational-JSON-column metadata plugin (`JSON`).
///
/// Does not support recursive listing or recursive metadata propagation.
pub struct SqliteJsonDidMeta {
    /// Connection to the `SQLite` database.
    conn: Mutex<Connection>,
    /// Path to the database file (None for in-memory).
    db_path: Option<PathBuf>,
    /// When set, the adapter only claims these keys; otherwise it claims
    /// every key.
    managed_keys: Option<HashSet<String>>,
    /// Strict type coercion for filter compilation.
    strict_coerce: bool,
}

impl SqliteJsonDidMeta {
    /// Creates an adapter over a database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let conn = Connection::open(&db_path).map_err(|e| Error::Storage {
            operation: "open_sqlite".to_string(),
            cause: e.to_string(),
        })?;
        let plugin = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
            managed_keys: None,
            strict_coerce: false,
        };
        plugin.initialize()?;
        Ok(plugin)
    }

    /// Creates an in-memory adapter (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage {
            operation: "open_sqlite_memory".to_string(),
            cause: e.to_string(),
        })?;
        let plugin = Self {
            conn: Mutex::new(conn),
            db_path: None,
            managed_keys: None,
            strict_coerce: false,
        };
        plugin.initialize()?;
        Ok(plugin)
    }

    /// Creates an adapter with the database path resolved from
    /// configuration (`sqlite_db_path`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionParameterNotFound`] if the path is not
    /// configured.
    pub fn from_config(config: &MetaConfig) -> Result<Self> {
        let path = config
            .get(CONFIG_SECTION, "sqlite_db_path")
            .ok_or_else(|| Error::ConnectionParameterNotFound("sqlite_db_path".to_string()))?;
        Self::new(path)
    }

    /// Restricts the keys this adapter claims via `manages_key`.
    ///
    /// Lets a registry partition key ownership between this and other
    /// plugins; without a restriction the adapter claims every key.
    #[must_use]
    pub fn with_managed_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.managed_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Enables strict type coercion during filter compilation.
    #[must_use]
    pub const fn with_strict_coerce(mut self, strict: bool) -> Self {
        self.strict_coerce = strict;
        self
    }

    /// Returns the database path.
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Initializes the database schema.
    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS did_meta (
                did TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                vo TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}'
            )",
            [],
        )
        .map_err(|e| Error::Storage {
            operation: "create_did_meta_table".to_string(),
            cause: e.to_string(),
        })?;

        // Index on the tenant-isolation columns every listing filters by.
        let _ = conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_did_meta_scope_vo ON did_meta(scope, vo)",
            [],
        );
        Ok(())
    }

    fn table_model(&self, ignore_case: bool) -> TableModel {
        TableModel::new("did_meta", "meta")
            .with_column("did", ColumnType::Text)
            .with_column("scope", ColumnType::Text)
            .with_column("name", ColumnType::Text)
            .with_column("vo", ColumnType::Text)
            .with_nocase(ignore_case)
    }

    fn read_document(&self, conn: &Connection, did: &str) -> Result<Option<MetaDocument>> {
        let raw: Option<String> = conn
            .query_row("SELECT meta FROM did_meta WHERE did = ?1", params![did], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| Error::Storage {
                operation: "select_meta".to_string(),
                cause: e.to_string(),
            })?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| Error::Storage {
                operation: "decode_meta".to_string(),
                cause: e.to_string(),
            })
        })
        .transpose()
    }

    fn write_document(&self, conn: &Connection, did: &str, document: &MetaDocument) -> Result<()> {
        let encoded = serde_json::to_string(document).map_err(|e| Error::Storage {
            operation: "encode_meta".to_string(),
            cause: e.to_string(),
        })?;
        conn.execute(
            "UPDATE did_meta SET meta = ?1 WHERE did = ?2",
            params![encoded, did],
        )
        .map_err(|e| Error::Storage {
            operation: "update_meta".to_string(),
            cause: e.to_string(),
        })?;
        Ok(())
    }
}

impl DidMetaPlugin for SqliteJsonDidMeta {
    #[instrument(skip(self), fields(plugin = PLUGIN_NAME))]
    fn get_metadata(&self, scope: &Scope, name: &str) -> Result<MetaDocument> {
        let conn = acquire_lock(&self.conn);
        let mut document = self.read_document(&conn, &scope.did_key(name))?.ok_or_else(|| {
            Error::DataIdentifierNotFound(format!("no metadata found for DID '{scope}:{name}'"))
        })?;
        for key in SYSTEM_KEYS {
            document.remove(key);
        }
        Ok(document)
    }

    fn set_metadata_bulk(
        &self,
        scope: &Scope,
        name: &str,
        mut metadata: MetaDocument,
        recursive: bool,
    ) -> Result<()> {
        if recursive {
            return Err(Error::UnsupportedOperation(format!(
                "'{PLUGIN_NAME}' metadata plugin does not support recursive metadata propagation"
            )));
        }
        for key in SYSTEM_KEYS {
            metadata.remove(key);
        }

        let did = scope.did_key(name);
        let conn = acquire_lock(&self.conn);
        match self.read_document(&conn, &did)? {
            Some(mut document) => {
                document.extend(metadata);
                self.write_document(&conn, &did, &document)
            },
            None => {
                let encoded = serde_json::to_string(&metadata).map_err(|e| Error::Storage {
                    operation: "encode_meta".to_string(),
                    cause: e.to_string(),
                })?;
                conn.execute(
                    "INSERT INTO did_meta (did, scope, name, vo, meta)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![did, scope.external(), name, scope.vo(), encoded],
                )
                .map_err(|e| Error::Storage {
                    operation: "insert_did_meta".to_string(),
                    cause: e.to_string(),
                })?;
                Ok(())
            },
        }
    }

    fn delete_metadata(&self, scope: &Scope, name: &str, key: &str) -> Result<()> {
        let did = scope.did_key(name);
        let conn = acquire_lock(&self.conn);
        let mut document = self.read_document(&conn, &did)?.ok_or_else(|| {
            Error::DataIdentifierNotFound(format!("no metadata found for DID '{scope}:{name}'"))
        })?;
        if document.remove(key).is_none() {
            return Err(Error::DataIdentifierNotFound(format!(
                "key '{key}' not found for DID '{scope}:{name}'"
            )));
        }
        self.write_document(&conn, &did, &document)
    }

    #[instrument(skip(self, filters, ignore_dids), fields(plugin = PLUGIN_NAME))]
    fn list_dids(
        &self,
        scope: &Scope,
        filters: &FilterInput,
        options: &ListOptions,
        ignore_dids: &DedupSet,
    ) -> Result<DidStream> {
        if options.recursive {
            return Err(Error::UnsupportedOperation(format!(
                "'{PLUGIN_NAME}' metadata plugin does not support recursive listing"
            )));
        }

        let model = self.table_model(options.ignore_case);
        let engine = FilterEngine::new(filters.clone(), self.strict_coerce);
        let additional = [
            Predicate::new("scope", FilterOperator::Eq, scope.external()),
            Predicate::new("vo", FilterOperator::Eq, scope.vo()),
        ];
        let (clause, sql_params) =
            match engine.compile(&QueryTarget::Relational(&model), &additional)? {
                NativeQuery::Sql { clause, params } => (clause, params),
                NativeQuery::Document(_) => {
                    unreachable!("relational target compiles to a sql query")
                },
            };
        let sql = format!("SELECT scope, name FROM did_meta WHERE {clause} ORDER BY rowid");
        debug!(sql, "executing relational query");

        let values: Vec<rusqlite::types::Value> = sql_params
            .iter()
            .map(|param| match param {
                SqlParam::Text(s) => rusqlite::types::Value::Text(s.clone()),
                SqlParam::Integer(i) => rusqlite::types::Value::Integer(*i),
                SqlParam::Real(f) => rusqlite::types::Value::Real(*f),
                SqlParam::Null => rusqlite::types::Value::Null,
            })
            .collect();

        // The statement borrows the connection, so the row set is
        // materialized here; dedup, offset and limit stay consumption-time
        // concerns of the stream.
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn.prepare(&sql).map_err(|e| Error::Storage {
            operation: "prepare_list_dids".to_string(),
            cause: e.to_string(),
        })?;
        let rows: Vec<Result<RawDid>> = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(RawDid {
                    scope: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .map_err(|e| Error::Storage {
                operation: "query_list_dids".to_string(),
                cause: e.to_string(),
            })?
            .map(|row| {
                row.map_err(|e| Error::Storage {
                    operation: "decode_row".to_string(),
                    cause: e.to_string(),
                })
            })
            .collect();

        Ok(Box::new(DedupStream::new(
            rows.into_iter(),
            ignore_dids.clone(),
            options,
        )))
    }

    fn manages_key(&self, key: &str) -> bool {
        self.managed_keys
            .as_ref()
            .is_none_or(|keys| keys.contains(key))
    }

    fn plugin_name(&self) -> &str {
        PLUGIN_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plugin() -> SqliteJsonDidMeta {
        SqliteJsonDidMeta::in_memory().unwrap()
    }

    fn meta(pairs: &[(&str, serde_json::Value)]) -> MetaDocument {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn collect_names(stream: DidStream) -> Vec<String> {
        stream
            .map(|item| item.unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_round_trip_strips_system_keys() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        plugin
            .set_metadata_bulk(
                &scope,
                "dataset_1",
                meta(&[
                    ("project", json!("atlas")),
                    ("run_number", json!(176)),
                    ("scope", json!("evil")),
                    ("vo", json!("evil")),
                ]),
                false,
            )
            .unwrap();

        let document = plugin.get_metadata(&scope, "dataset_1").unwrap();
        assert_eq!(document.len(), 2);
        assert_eq!(document["project"], json!("atlas"));
        assert_eq!(document["run_number"], json!(176));
    }

    #[test]
    fn test_system_keys_never_change_on_update() {
        let plugin = plugin();
        let scope = Scope::new("test", "tst");
        plugin
            .set_metadata(&scope, "file_1", "project", json!("atlas"), false)
            .unwrap();
        plugin
            .set_metadata_bulk(
                &scope,
                "file_1",
                meta(&[("scope", json!("hijacked")), ("name", json!("hijacked"))]),
                false,
            )
            .unwrap();

        // The identity columns still match the original DID, so a listing
        // under the original scope still finds it.
        let names = collect_names(
            plugin
                .list_dids(
                    &scope,
                    &FilterInput::match_all(),
                    &ListOptions::default(),
                    &DedupSet::new(),
                )
                .unwrap(),
        );
        assert_eq!(names, vec!["file_1"]);
    }

    #[test]
    fn test_idempotent_upsert() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        let payload = meta(&[("project", json!("atlas")), ("run_number", json!(176))]);
        plugin
            .set_metadata_bulk(&scope, "dataset_1", payload.clone(), false)
            .unwrap();
        let first = plugin.get_metadata(&scope, "dataset_1").unwrap();
        plugin
            .set_metadata_bulk(&scope, "dataset_1", payload, false)
            .unwrap();
        let second = plugin.get_metadata(&scope, "dataset_1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_get_and_delete_missing_did_not_found() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        assert!(matches!(
            plugin.get_metadata(&scope, "missing").unwrap_err(),
            Error::DataIdentifierNotFound(_)
        ));
        assert!(matches!(
            plugin.delete_metadata(&scope, "missing", "project").unwrap_err(),
            Error::DataIdentifierNotFound(_)
        ));
    }

    #[test]
    fn test_delete_missing_key_not_found() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        plugin
            .set_metadata(&scope, "dataset_1", "project", json!("atlas"), false)
            .unwrap();
        assert!(matches!(
            plugin
                .delete_metadata(&scope, "dataset_1", "campaign")
                .unwrap_err(),
            Error::DataIdentifierNotFound(_)
        ));
    }

    #[test]
    fn test_delete_then_get() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        plugin
            .set_metadata_bulk(
                &scope,
                "dataset_1",
                meta(&[("project", json!("atlas")), ("campaign", json!("mc16"))]),
                false,
            )
            .unwrap();
        plugin.delete_metadata(&scope, "dataset_1", "campaign").unwrap();
        let document = plugin.get_metadata(&scope, "dataset_1").unwrap();
        assert!(!document.contains_key("campaign"));
        assert!(document.contains_key("project"));
    }

    #[test]
    fn test_tenant_isolation_in_listing() {
        let plugin = plugin();
        let ours = Scope::new("test", "tst");
        let theirs = Scope::new("test", "other");
        plugin
            .set_metadata(&ours, "file_1", "project", json!("atlas"), false)
            .unwrap();
        plugin
            .set_metadata(&theirs, "file_1", "project", json!("atlas"), false)
            .unwrap();

        let names = collect_names(
            plugin
                .list_dids(
                    &ours,
                    &FilterInput::match_all(),
                    &ListOptions::default(),
                    &DedupSet::new(),
                )
                .unwrap(),
        );
        assert_eq!(names, vec!["file_1"]);

        // A filter matching both tenants' documents still stays inside the VO.
        let names = collect_names(
            plugin
                .list_dids(
                    &ours,
                    &FilterInput::parse(&json!({"project": "atlas"})).unwrap(),
                    &ListOptions::default(),
                    &DedupSet::new(),
                )
                .unwrap(),
        );
        assert_eq!(names, vec!["file_1"]);
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_list_filters_on_json_attributes() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        plugin
            .set_metadata_bulk(
                &scope,
                "dataset_1",
                meta(&[("project", json!("atlas")), ("run_number", json!(176))]),
                false,
            )
            .unwrap();
        plugin
            .set_metadata_bulk(
                &scope,
                "dataset_2",
                meta(&[("project", json!("cms")), ("run_number", json!(300))]),
                false,
            )
            .unwrap();

        let names = collect_names(
            plugin
                .list_dids(
                    &scope,
                    &FilterInput::parse(&json!({"project": "atlas"})).unwrap(),
                    &ListOptions::default(),
                    &DedupSet::new(),
                )
                .unwrap(),
        );
        assert_eq!(names, vec!["dataset_1"]);

        let names = collect_names(
            plugin
                .list_dids(
                    &scope,
                    &FilterInput::parse(&json!([{"project": "atlas"}, {"project": "cms"}]))
                        .unwrap(),
                    &ListOptions::default(),
                    &DedupSet::new(),
                )
                .unwrap(),
        );
        assert_eq!(names, vec!["dataset_1", "dataset_2"]);
    }

    #[test]
    fn test_list_ordering_on_typed_column() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        for name in ["a", "b", "c"] {
            plugin
                .set_metadata(&scope, name, "project", json!("atlas"), false)
                .unwrap();
        }
        let names = collect_names(
            plugin
                .list_dids(
                    &scope,
                    &FilterInput::parse(&json!({"name.gte": "b"})).unwrap(),
                    &ListOptions::default(),
                    &DedupSet::new(),
                )
                .unwrap(),
        );
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_ordering_on_json_attribute_rejected() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        let Err(err) = plugin.list_dids(
            &scope,
            &FilterInput::parse(&json!({"run_number.gt": 100})).unwrap(),
            &ListOptions::default(),
            &DedupSet::new(),
        ) else {
            panic!("expected compilation to fail");
        };
        assert!(matches!(err, Error::UnsupportedFilterOperator { .. }));
    }

    #[test]
    fn test_ignore_case_listing() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        plugin
            .set_metadata(&scope, "File_1", "project", json!("atlas"), false)
            .unwrap();
        let names = collect_names(
            plugin
                .list_dids(
                    &scope,
                    &FilterInput::parse(&json!({"name": "file_1"})).unwrap(),
                    &ListOptions::default().with_ignore_case(true),
                    &DedupSet::new(),
                )
                .unwrap(),
        );
        assert_eq!(names, vec!["File_1"]);
    }

    #[test]
    fn test_recursive_listing_unsupported() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        let Err(err) = plugin.list_dids(
            &scope,
            &FilterInput::match_all(),
            &ListOptions::default().with_recursive(true),
            &DedupSet::new(),
        ) else {
            panic!("expected recursive listing to be declined");
        };
        let Error::UnsupportedOperation(message) = err else {
            panic!("expected UnsupportedOperation");
        };
        assert!(message.contains("JSON"));
    }

    #[test]
    fn test_managed_keys_restriction() {
        let plugin = plugin().with_managed_keys(["project", "campaign"]);
        assert!(plugin.manages_key("project"));
        assert!(!plugin.manages_key("run_number"));
    }

    #[test]
    fn test_limit_post_dedup() {
        let plugin = plugin();
        let scope = Scope::new("test", "def");
        for name in ["a", "b", "c"] {
            plugin
                .set_metadata(&scope, name, "project", json!("atlas"), false)
                .unwrap();
        }
        let set = DedupSet::with_seed(["test:a".to_string()]);
        let names = collect_names(
            plugin
                .list_dids(
                    &scope,
                    &FilterInput::match_all(),
                    &ListOptions::default().with_limit(2),
                    &set,
                )
                .unwrap(),
        );
        // "a" is already known: exactly two new DIDs, not counting it.
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_from_config_missing_path() {
        let Err(err) = SqliteJsonDidMeta::from_config(&MetaConfig::new()) else {
            panic!("expected construction to fail");
        };
        assert!(matches!(
            err,
            Error::ConnectionParameterNotFound(ref p) if p == "sqlite_db_path"
        ));
    }
}
