//! Metadata plugin contract and backend adapters.
//!
//! Every backend implements [`DidMetaPlugin`], independent of its storage
//! technology. The registry holds the ordered set of active plugins, routes
//! single-key operations by key ownership and fans filtered listings out
//! across all of them under one shared dedup set.
//!
//! # Available Adapters
//!
//! | Adapter | Plugin name | Store |
//! |---------|-------------|-------|
//! | [`MongoDidMeta`] | `MONGO` | Document collection |
//! | [`SqliteJsonDidMeta`] | `JSON` | Relational table with a JSON column |

mod json;
mod mongo;
mod registry;
mod stream;
mod traits;

pub use json::SqliteJsonDidMeta;
pub use mongo::{MongoDidMeta, MongoParams};
pub use registry::MetaPluginRegistry;
pub use stream::{DedupSet, DedupStream, RawDid};
pub use traits::{DidMetaPlugin, DidStream, ListOptions};
