//! Document store abstraction.
//!
//! [`DocumentStore`] is the persistence seam of the pipeline: one store is
//! opened at startup and handed to every component that writes or reads
//! documents. [`SqliteStore`] keeps JSON documents in SQLite,
//! [`MemoryStore`] is the in-process stand-in used by tests.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::DataType;

/// A stored document: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Collection names, one per entity.
pub mod collections {
    pub const AGENCIES: &str = "gtfs_agencies";
    pub const ROUTES: &str = "gtfs_routes";
    pub const STOPS: &str = "gtfs_stops";
    pub const TRIPS: &str = "gtfs_trips";
    pub const STOP_TIMES: &str = "gtfs_stop_times";
    pub const CALENDAR: &str = "gtfs_calendar";
    pub const TRANSFERS: &str = "gtfs_transfers";
    pub const SHAPES: &str = "gtfs_shapes";
    pub const PROCESSED_STATIONS: &str = "gtfs_processed_stations";
    pub const METADATA: &str = "gtfs_metadata";
}

/// Conjunction of field equality tests.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All documents carrying the given variant label.
    pub fn data_type(data_type: DataType) -> Self {
        Self::new().eq("data_type", data_type.as_str())
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((field.to_string(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    /// A `null` clause also matches documents that lack the field.
    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|(field, expected)| match doc.get(field) {
            Some(actual) => actual == expected,
            None => expected.is_null(),
        })
    }
}

/// An index over one or more document fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(fields: &[&str]) -> Self {
        Self {
            name: fields.join("_"),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(fields: &[&str]) -> Self {
        Self {
            unique: true,
            ..Self::new(fields)
        }
    }
}

/// Read options: field projection and result count limit.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn apply_projection(&self, doc: Document) -> Document {
        match &self.projection {
            Some(fields) => doc
                .into_iter()
                .filter(|(key, _)| fields.iter().any(|f| f == key))
                .collect(),
            None => doc,
        }
    }
}

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates the index if it does not exist yet; an existing index is left alone.
    async fn ensure_index(&self, collection: &str, index: &IndexSpec) -> Result<()>;

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<u64>;

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Sets the fields of `set` on the first document matching `filter`, or
    /// inserts a new document made of the filter fields and `set`.
    async fn upsert_one(&self, collection: &str, filter: &Filter, set: Document) -> Result<()>;

    /// Matching documents in insertion order.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Starts replacing every document matching `filter`.
    ///
    /// Nothing is visible to readers until [`ReplaceSession::commit`]; a
    /// session dropped without committing leaves the collection untouched.
    async fn begin_replace(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Result<Box<dyn ReplaceSession>>;
}

/// Staged replacement of a filtered document set, filled in batches.
#[async_trait::async_trait]
pub trait ReplaceSession: Send {
    async fn insert_many(&mut self, docs: Vec<Document>) -> Result<()>;

    /// Swaps the staged documents in and returns how many were written.
    async fn commit(self: Box<Self>) -> Result<u64>;
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(doc) => Ok(doc),
        other => anyhow::bail!("expected a JSON object, got {other}"),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

/// Renders the values a unique index is keyed on.
fn index_key(index: &IndexSpec, doc: &Document) -> String {
    let values: Vec<Value> = index
        .fields
        .iter()
        .map(|f| doc.get(f).cloned().unwrap_or(Value::Null))
        .collect();
    Value::Array(values).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_filter_matches_all_clauses() {
        let filter = Filter::data_type(DataType::Regular).eq("stop_id", "A1");
        assert!(filter.matches(&doc(json!({"stop_id": "A1", "data_type": "regular"}))));
        assert!(!filter.matches(&doc(json!({"stop_id": "A1", "data_type": "supplemented"}))));
        assert!(!filter.matches(&doc(json!({"data_type": "regular"}))));
    }

    #[test]
    fn test_null_clause_matches_missing_field() {
        let filter = Filter::new().eq("parent_station", Value::Null);
        assert!(filter.matches(&doc(json!({"stop_id": "A"}))));
        assert!(!filter.matches(&doc(json!({"parent_station": "A"}))));
    }

    #[test]
    fn test_projection_keeps_listed_fields() {
        let options = FindOptions::new().project(&["trip_id"]);
        let projected = options.apply_projection(doc(json!({"trip_id": "T1", "stop_id": "A1"})));
        assert_eq!(Value::Object(projected), json!({"trip_id": "T1"}));
    }

    #[test]
    fn test_index_names_follow_fields() {
        let index = IndexSpec::unique(&["data_type", "stop_id"]);
        assert_eq!(index.name, "data_type_stop_id");
        assert!(index.unique);
        assert!(!IndexSpec::new(&["stop_id"]).unique);
    }

    #[test]
    fn test_to_document_rejects_non_objects() {
        assert!(to_document(&"plain string").is_err());
        let doc = to_document(&json!({"id": "A"})).unwrap();
        assert_eq!(doc.get("id"), Some(&json!("A")));
    }
}
