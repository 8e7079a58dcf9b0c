//! Document-store metadata adapter backed by MongoDB.
//!
//! Reference implementation of the plugin contract. Documents live in one
//! collection keyed by `"{scope.internal}:{name}"`; identity fields are set
//! once on insert via `$setOnInsert` and protected from user writes.
//!
//! The driver client is thread-safe and connects lazily, so constructing
//! the adapter performs no network I/O. The database and collection handles
//! created at construction share one client across all callers.

use super::stream::{DedupSet, DedupStream, RawDid};
use super::traits::{DidMetaPlugin, DidStream, ListOptions};
use crate::config::MetaConfig;
use crate::filter::{FilterEngine, FilterInput, FilterOperator, NativeQuery, Predicate, QueryTarget};
use crate::models::{MetaDocument, Scope};
use crate::{Error, Result};
use mongodb::bson::{Bson, Document, doc, to_document};
use mongodb::options::UpdateOptions;
use mongodb::sync::{Client, Collection, Database};
use tracing::{debug, instrument};

/// Keys owned by the storage layer, set once at document creation.
const IMMUTABLE_KEYS: [&str; 4] = ["_id", "scope", "name", "vo"];

const PLUGIN_NAME: &str = "MONGO";
const CONFIG_SECTION: &str = "metadata";

/// Explicit connection parameters. Any field left `None` is resolved from
/// the configuration collaborator at construction time.
#[derive(Debug, Clone, Default)]
pub struct MongoParams {
    /// Service host (`mongo_service_host`).
    pub host: Option<String>,
    /// Service port (`mongo_service_port`).
    pub port: Option<u16>,
    /// Database name (`mongo_db`).
    pub db: Option<String>,
    /// Collection name (`mongo_collection`).
    pub collection: Option<String>,
    /// Optional user (`mongo_user`).
    pub user: Option<String>,
    /// Optional password (`mongo_password`).
    pub password: Option<String>,
}

/// Document-store metadata plugin (`MONGO`).
///
/// Does not support recursive listing or recursive metadata propagation.
pub struct MongoDidMeta {
    db: Database,
    col: Collection<Document>,
}

impl MongoDidMeta {
    /// Creates an adapter, resolving each missing connection parameter from
    /// the configuration collaborator independently.
    ///
    /// Missing optional credentials fall back to an anonymous connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionParameterNotFound`] per required
    /// parameter that is neither passed nor configured, and
    /// [`Error::Storage`] if the client rejects the connection string.
    pub fn new(params: MongoParams, config: &MetaConfig) -> Result<Self> {
        let host = resolve(params.host, config, "mongo_service_host")?;
        let port = match params.port {
            Some(port) => port,
            None => {
                let raw = config
                    .get_int(CONFIG_SECTION, "mongo_service_port")?
                    .ok_or_else(|| {
                        Error::ConnectionParameterNotFound("mongo_service_port".to_string())
                    })?;
                u16::try_from(raw).map_err(|_| Error::Config {
                    option: format!("{CONFIG_SECTION}.mongo_service_port"),
                    cause: format!("port {raw} out of range"),
                })?
            },
        };
        let db_name = resolve(params.db, config, "mongo_db")?;
        let col_name = resolve(params.collection, config, "mongo_collection")?;

        let user = params
            .user
            .or_else(|| config.get(CONFIG_SECTION, "mongo_user"));
        let password = params
            .password
            .or_else(|| config.get(CONFIG_SECTION, "mongo_password"));

        // Anonymous connection unless both credentials are present.
        let auth = match (user, password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                format!("{user}:{password}@")
            },
            _ => String::new(),
        };

        let uri = format!("mongodb://{auth}{host}:{port}/");
        let client = Client::with_uri_str(&uri).map_err(|e| Error::Storage {
            operation: "mongo_connect".to_string(),
            cause: e.to_string(),
        })?;
        let db = client.database(&db_name);
        let col = db.collection::<Document>(&col_name);
        debug!(
            host = %host,
            port,
            db = %db_name,
            collection = %col_name,
            "mongo metadata plugin ready"
        );

        Ok(Self { db, col })
    }

    /// Creates an adapter with every parameter resolved from configuration.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn from_config(config: &MetaConfig) -> Result<Self> {
        Self::new(MongoParams::default(), config)
    }

    /// Drops the backing collection. Test and tooling hook.
    ///
    /// # Errors
    ///
    /// Returns an error if the drop fails.
    pub fn drop_collection(&self) -> Result<()> {
        self.col.drop(None).map_err(|e| Error::Storage {
            operation: "drop_collection".to_string(),
            cause: e.to_string(),
        })
    }

    /// The backing database name.
    #[must_use]
    pub fn database_name(&self) -> &str {
        self.db.name()
    }
}

fn resolve(explicit: Option<String>, config: &MetaConfig, option: &str) -> Result<String> {
    explicit
        .or_else(|| config.get(CONFIG_SECTION, option))
        .ok_or_else(|| Error::ConnectionParameterNotFound(option.to_string()))
}

fn storage_err(operation: &str) -> impl Fn(mongodb::error::Error) -> Error + '_ {
    move |e| Error::Storage {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

impl DidMetaPlugin for MongoDidMeta {
    #[instrument(skip(self), fields(plugin = PLUGIN_NAME))]
    fn get_metadata(&self, scope: &Scope, name: &str) -> Result<MetaDocument> {
        let filter = doc! { "_id": scope.did_key(name) };
        let document = self
            .col
            .find_one(filter, None)
            .map_err(storage_err("find_one"))?
            .ok_or_else(|| {
                Error::DataIdentifierNotFound(format!("no metadata found for DID '{scope}:{name}'"))
            })?;

        let mut metadata = MetaDocument::new();
        for (key, value) in document {
            if IMMUTABLE_KEYS.contains(&key.as_str()) {
                continue;
            }
            metadata.insert(key, value.into_relaxed_extjson());
        }
        Ok(metadata)
    }

    fn set_metadata_bulk(
        &self,
        scope: &Scope,
        name: &str,
        metadata: MetaDocument,
        recursive: bool,
    ) -> Result<()> {
        if recursive {
            return Err(Error::UnsupportedOperation(format!(
                "'{PLUGIN_NAME}' metadata plugin does not support recursive metadata propagation"
            )));
        }

        let mut set_doc = Document::new();
        for (key, value) in metadata {
            if IMMUTABLE_KEYS.contains(&key.as_str()) {
                continue;
            }
            let value = Bson::try_from(value).map_err(|e| Error::Storage {
                operation: "encode_metadata".to_string(),
                cause: e.to_string(),
            })?;
            set_doc.insert(key, value);
        }

        let mut update = doc! {
            "$setOnInsert": {
                "scope": scope.external(),
                "vo": scope.vo(),
                "name": name,
            }
        };
        if !set_doc.is_empty() {
            update.insert("$set", set_doc);
        }

        self.col
            .update_one(
                doc! { "_id": scope.did_key(name) },
                update,
                UpdateOptions::builder().upsert(true).build(),
            )
            .map_err(storage_err("update_one"))?;
        Ok(())
    }

    fn delete_metadata(&self, scope: &Scope, name: &str, key: &str) -> Result<()> {
        let mut filter = doc! { "_id": scope.did_key(name) };
        filter.insert(key, doc! { "$exists": true });
        let mut unset = Document::new();
        unset.insert(key, "");

        let result = self
            .col
            .update_one(filter, doc! { "$unset": unset }, None)
            .map_err(storage_err("update_one"))?;
        if result.matched_count == 0 {
            return Err(Error::DataIdentifierNotFound(format!(
                "key '{key}' not found for DID '{scope}:{name}'"
            )));
        }
        Ok(())
    }

    /// `ignore_case` is accepted and ignored: exact matching only on this
    /// backend.
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

        let engine = FilterEngine::new(filters.clone(), false);
        let additional = [
            Predicate::new("scope", FilterOperator::Eq, scope.external()),
            Predicate::new("vo", FilterOperator::Eq, scope.vo()),
        ];
        let query = match engine.compile(&QueryTarget::Document, &additional)? {
            NativeQuery::Document(query) => query,
            NativeQuery::Sql { .. } => unreachable!("document target compiles to a document query"),
        };
        let query = to_document(&query).map_err(|e| Error::Storage {
            operation: "encode_query".to_string(),
            cause: e.to_string(),
        })?;
        debug!(?query, "executing document query");

        let cursor = self.col.find(query, None).map_err(storage_err("find"))?;
        let rows = cursor.map(|item| {
            let document = item.map_err(|e| Error::Storage {
                operation: "cursor_next".to_string(),
                cause: e.to_string(),
            })?;
            let decode = |field: &str| {
                document
                    .get_str(field)
                    .map(str::to_string)
                    .map_err(|e| Error::Storage {
                        operation: "decode_document".to_string(),
                        cause: format!("field '{field}': {e}"),
                    })
            };
            Ok(RawDid {
                scope: decode("scope")?,
                name: decode("name")?,
            })
        });
        Ok(Box::new(DedupStream::new(
            rows,
            ignore_dids.clone(),
            options,
        )))
    }

    fn manages_key(&self, _key: &str) -> bool {
        true
    }

    fn plugin_name(&self) -> &str {
        PLUGIN_NAME
    }
}
