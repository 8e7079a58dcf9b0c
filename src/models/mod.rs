//! Core data types: DID identity, listing records, metadata documents.

mod did;

pub use did::{DidListing, DidRecord, DidType, Scope};

/// A metadata document: arbitrary string keys mapped to JSON values.
pub type MetaDocument = serde_json::Map<String, serde_json::Value>;
