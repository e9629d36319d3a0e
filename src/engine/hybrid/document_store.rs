//! [`Backend`] over the file-backed document store

use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

use super::error::{QueryError, Result};
use super::normalize::StoreFlavor;
use super::options::StorageFilter;
use super::pipeline::{self, FACET_ENTITIES, FACET_TOTAL};
use super::store::{Backend, FetchRequest, FetchResult};
use super::translate::document_match;
use crate::engine::nosql::document::as_oid;
use crate::engine::nosql::{Filter, NoSqlEngine};

pub struct DocumentStore {
    engine: Arc<NoSqlEngine>,
}

impl DocumentStore {
    pub fn new(engine: Arc<NoSqlEngine>) -> Self {
        Self { engine }
    }

    /// Open the store rooted at `path`, creating it when absent
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(NoSqlEngine::open_or_create(path)?)))
    }

    pub fn engine(&self) -> &NoSqlEngine {
        &self.engine
    }

    fn filter(filters: &[StorageFilter]) -> Result<Filter> {
        Ok(Filter::parse(&Value::Object(document_match(filters)))?)
    }

    fn raw_id(id: &Value) -> Result<&str> {
        as_oid(id).ok_or_else(|| QueryError::invalid_identifier("_id", id))
    }
}

impl Backend for DocumentStore {
    fn flavor(&self) -> StoreFlavor {
        StoreFlavor::Document
    }

    fn name(&self) -> &str {
        "nosql"
    }

    fn fetch_joined(&self, request: &FetchRequest) -> Result<FetchResult> {
        let stages = pipeline::compile(&request.plan, &request.options, request.by_id.as_ref());
        debug!(collection = %request.collection, stages = stages.len(), "Compiled pipeline");
        let pipeline = Value::Array(stages.clone());
        trace!(%pipeline, "Pipeline stages");

        let mut output = self.engine.aggregate(&request.collection, &stages)?;
        let Some(Value::Object(mut facets)) = output.pop() else {
            return Ok(FetchResult::default());
        };

        let entities = match facets.remove(FACET_ENTITIES) {
            Some(Value::Array(entities)) => entities,
            _ => Vec::new(),
        };
        let total = facets
            .get(FACET_TOTAL)
            .and_then(|counts| counts.get(0))
            .and_then(|count| count.get(FACET_TOTAL))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(FetchResult { entities, total })
    }

    fn explain(&self, request: &FetchRequest) -> Result<Value> {
        let stages = pipeline::compile(&request.plan, &request.options, request.by_id.as_ref());
        Ok(json!({ "collection": request.collection, "pipeline": stages }))
    }

    fn insert_many(&self, collection: &str, entities: Vec<Map<String, Value>>) -> Result<Vec<Value>> {
        let docs = entities.into_iter().map(Value::Object).collect();
        Ok(self.engine.insert_many(collection, docs)?)
    }

    fn update_by_id(&self, collection: &str, id: &Value, changes: Map<String, Value>) -> Result<Option<Value>> {
        Ok(self.engine.update_by_id(collection, Self::raw_id(id)?, &changes)?)
    }

    fn update_where(&self, collection: &str, filters: &[StorageFilter], changes: Map<String, Value>) -> Result<u64> {
        let updated = self.engine.update_many(collection, &Self::filter(filters)?, &changes)?;
        Ok(updated as u64)
    }

    fn delete_by_id(&self, collection: &str, id: &Value) -> Result<bool> {
        Ok(self.engine.delete_by_id(collection, Self::raw_id(id)?)?)
    }

    fn delete_where(&self, collection: &str, filters: &[StorageFilter]) -> Result<u64> {
        let deleted = self.engine.delete_many(collection, &Self::filter(filters)?)?;
        Ok(deleted as u64)
    }

    fn ping(&self) -> Result<()> {
        self.engine.list_collections()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::hybrid::operation::Operation;
    use crate::engine::hybrid::options::{FilterOp, StorageOptions};
    use crate::engine::hybrid::plan::JoinPlan;
    use crate::engine::nosql::document::oid;
    use tempfile::tempdir;

    fn request(collection: &str, ops: &[Operation]) -> FetchRequest {
        FetchRequest {
            collection: collection.to_string(),
            plan: JoinPlan::resolve(ops).unwrap(),
            options: StorageOptions::default(),
            by_id: None,
        }
    }

    #[test]
    fn test_fetch_parses_facets() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let engine = store.engine();
        engine.insert("customers", json!({"_id": oid("c1"), "name": "Ann"})).unwrap();
        engine.insert("orders", json!({"customerId": oid("c1")})).unwrap();
        engine.insert("orders", json!({"customerId": oid("zz")})).unwrap();

        let result = store
            .fetch_joined(&request("orders", &[Operation::one_left("customers", "customerId", "id", "customer")]))
            .unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.entities[0]["customer"]["name"], json!("Ann"));
        assert!(result.entities[1].get("customer").is_none());
    }

    #[test]
    fn test_missing_root_collection_is_empty() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let result = store.fetch_joined(&request("nothing", &[])).unwrap();
        assert_eq!(result.total, 0);
        assert!(result.entities.is_empty());
    }

    #[test]
    fn test_writes() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let mut first = Map::new();
        first.insert("status".into(), json!("open"));
        let stored = store.insert_many("orders", vec![first.clone(), first]).unwrap();
        let id = stored[0]["_id"].clone();

        let mut changes = Map::new();
        changes.insert("status".into(), json!("paid"));
        let updated = store.update_by_id("orders", &id, changes.clone()).unwrap().unwrap();
        assert_eq!(updated["status"], json!("paid"));

        let open = [StorageFilter { field: "status".into(), op: FilterOp::Eq, value: json!("open") }];
        assert_eq!(store.update_where("orders", &open, changes).unwrap(), 1);
        assert!(store.delete_by_id("orders", &id).unwrap());
        assert!(!store.delete_by_id("orders", &id).unwrap());
        assert_eq!(store.delete_where("orders", &[]).unwrap(), 1);
        assert!(store.update_by_id("orders", &json!("plain"), Map::new()).is_err());
    }
}
