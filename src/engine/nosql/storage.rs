//! NoSQL Storage Engine
//!
//! Main entry point for the document store. Reads take a shared lock and
//! writes an exclusive one, so a pipeline always sees one consistent state
//! of every collection it touches.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use super::aggregate::Pipeline;
use super::collection::{validate_collection_name, Collection};
use super::document::Document;
use super::error::{NoSqlError, Result};
use super::meta::StoreMeta;
use super::query::{Filter, Query};

/// The main NoSQL storage engine
pub struct NoSqlEngine {
    /// Store directory
    base_path: PathBuf,

    meta: StoreMeta,

    lock: RwLock<()>,
}

impl NoSqlEngine {
    /// Open an existing store
    pub fn open(path: &Path) -> Result<Self> {
        if !StoreMeta::exists(path) {
            return Err(NoSqlError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("document store not found at {}", path.display()),
            )));
        }

        let meta = StoreMeta::load(path)?;
        info!(path = ?path, format_version = meta.format_version, "Opened document store");

        Ok(Self { base_path: path.to_path_buf(), meta, lock: RwLock::new(()) })
    }

    /// Create a new store
    pub fn create(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;

        let meta = StoreMeta::new();
        meta.save(path)?;
        info!(path = ?path, "Created document store");

        Ok(Self { base_path: path.to_path_buf(), meta, lock: RwLock::new(()) })
    }

    /// Open or create a store
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if StoreMeta::exists(path) {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.lock.read().map_err(|_| NoSqlError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.lock.write().map_err(|_| NoSqlError::LockPoisoned)
    }

    /// Create a new collection
    pub fn create_collection(&self, name: &str) -> Result<Collection> {
        let _guard = self.write()?;
        Collection::create(&self.base_path, name)
    }

    /// Check if a collection exists
    pub fn collection_exists(&self, name: &str) -> bool {
        validate_collection_name(name).is_ok() && self.base_path.join(name).is_dir()
    }

    /// List all collections
    pub fn list_collections(&self) -> Result<Vec<String>> {
        let _guard = self.read()?;
        let mut collections = Vec::new();

        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) {
                if validate_collection_name(&name).is_ok() {
                    collections.push(name);
                }
            }
        }

        collections.sort();
        Ok(collections)
    }

    /// Drop a collection
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let _guard = self.write()?;
        Collection::open(&self.base_path, name)?.drop()
    }

    /// Query views of every document; a missing collection reads as empty
    fn load_views(&self, name: &str) -> Result<Vec<Value>> {
        match Collection::open(&self.base_path, name) {
            Ok(collection) => Ok(collection.all()?.iter().map(Document::to_json).collect()),
            Err(NoSqlError::CollectionNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    // ========== Documents ==========

    /// Insert one document, returning its stored view
    pub fn insert(&self, collection: &str, doc: Value) -> Result<Value> {
        let mut inserted = self.insert_many(collection, vec![doc])?;
        inserted
            .pop()
            .ok_or_else(|| NoSqlError::InvalidDocument("nothing inserted".to_string()))
    }

    /// Insert several documents; nothing is written if any is invalid
    pub fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>> {
        let _guard = self.write()?;
        let col = Collection::open_or_create(&self.base_path, collection)?;

        let docs = docs.into_iter().map(Document::from_value).collect::<Result<Vec<_>>>()?;
        let mut seen = HashSet::with_capacity(docs.len());
        for doc in &docs {
            if !seen.insert(doc.id.as_str()) || col.contains(&doc.id)? {
                return Err(NoSqlError::DuplicateId(doc.id.clone()));
            }
        }

        for doc in &docs {
            col.insert(doc)?;
        }
        debug!(collection, count = docs.len(), "Inserted documents");

        Ok(docs.iter().map(Document::to_json).collect())
    }

    /// Get a document view by raw id
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let _guard = self.read()?;
        let col = match Collection::open(&self.base_path, collection) {
            Ok(col) => col,
            Err(NoSqlError::CollectionNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !col.contains(id)? {
            return Ok(None);
        }
        Ok(Some(col.get(id)?.to_json()))
    }

    /// Query documents
    pub fn find(&self, collection: &str, query: &Query) -> Result<Vec<Value>> {
        let _guard = self.read()?;
        query.execute(self.load_views(collection)?)
    }

    /// Count documents matching a filter
    pub fn count(&self, collection: &str, filter: &Filter) -> Result<usize> {
        Ok(self.find(collection, &Query::new().filter(filter.clone()))?.len())
    }

    /// Merge `changes` into one document
    pub fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        changes: &Map<String, Value>,
    ) -> Result<Option<Value>> {
        let _guard = self.write()?;
        let col = match Collection::open(&self.base_path, collection) {
            Ok(col) => col,
            Err(NoSqlError::CollectionNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !col.contains(id)? {
            return Ok(None);
        }

        let mut doc = col.get(id)?;
        doc.merge(changes);
        col.put(&doc)?;
        Ok(Some(doc.to_json()))
    }

    /// Merge `changes` into every matching document
    pub fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        changes: &Map<String, Value>,
    ) -> Result<usize> {
        let _guard = self.write()?;
        let col = match Collection::open(&self.base_path, collection) {
            Ok(col) => col,
            Err(NoSqlError::CollectionNotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut updated = 0;
        for mut doc in col.all()? {
            if filter.matches(&doc.to_json())? {
                doc.merge(changes);
                col.put(&doc)?;
                updated += 1;
            }
        }
        debug!(collection, updated, "Updated documents");
        Ok(updated)
    }

    /// Delete one document; `false` when it did not exist
    pub fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool> {
        let _guard = self.write()?;
        let col = match Collection::open(&self.base_path, collection) {
            Ok(col) => col,
            Err(NoSqlError::CollectionNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !col.contains(id)? {
            return Ok(false);
        }
        col.delete(id)?;
        Ok(true)
    }

    /// Delete every matching document
    pub fn delete_many(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let _guard = self.write()?;
        let col = match Collection::open(&self.base_path, collection) {
            Ok(col) => col,
            Err(NoSqlError::CollectionNotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut deleted = 0;
        for doc in col.all()? {
            if filter.matches(&doc.to_json())? {
                col.delete(&doc.id)?;
                deleted += 1;
            }
        }
        debug!(collection, deleted, "Deleted documents");
        Ok(deleted)
    }

    /// Run an aggregation pipeline over one consistent snapshot
    pub fn aggregate(&self, collection: &str, stages: &[Value]) -> Result<Vec<Value>> {
        let pipeline = Pipeline::parse(stages)?;
        let _guard = self.read()?;

        let load = |name: &str| self.load_views(name);
        let docs = self.load_views(collection)?;
        debug!(collection, stages = pipeline.len(), input = docs.len(), "Running pipeline");
        pipeline.execute(docs, &load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_engine_lifecycle() {
        let dir = tempdir().unwrap();

        let engine = NoSqlEngine::create(dir.path()).unwrap();
        assert!(engine.list_collections().unwrap().is_empty());

        let stored = engine.insert("users", json!({"name": "Alice", "age": 30})).unwrap();
        assert!(engine.collection_exists("users"));

        let id = stored["_id"]["$oid"].as_str().unwrap().to_string();
        let retrieved = engine.get("users", &id).unwrap().unwrap();
        assert_eq!(retrieved["name"], json!("Alice"));

        let results = engine.find("users", &Query::new()).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_engine_reopen() {
        let dir = tempdir().unwrap();

        {
            let engine = NoSqlEngine::create(dir.path()).unwrap();
            engine.insert("test", json!({"x": 1})).unwrap();
        }

        {
            let engine = NoSqlEngine::open(dir.path()).unwrap();
            assert_eq!(engine.count("test", &Filter::all()).unwrap(), 1);
        }
    }

    #[test]
    fn test_insert_many_is_all_or_nothing() {
        let dir = tempdir().unwrap();
        let engine = NoSqlEngine::create(dir.path()).unwrap();

        let result = engine.insert_many(
            "items",
            vec![json!({"_id": {"$oid": "aa"}}), json!({"_id": {"$oid": "aa"}})],
        );

        assert!(matches!(result, Err(NoSqlError::DuplicateId(_))));
        assert!(engine.find("items", &Query::new()).unwrap().is_empty());
    }

    #[test]
    fn test_update_and_delete() {
        let dir = tempdir().unwrap();
        let engine = NoSqlEngine::create(dir.path()).unwrap();
        engine
            .insert_many("items", vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})])
            .unwrap();

        let big = Filter::parse(&json!({"n": {"$gte": 2}})).unwrap();
        let changes = json!({"big": true});
        assert_eq!(engine.update_many("items", &big, changes.as_object().unwrap()).unwrap(), 2);
        assert_eq!(engine.count("items", &Filter::eq("big", true)).unwrap(), 2);

        assert_eq!(engine.delete_many("items", &big).unwrap(), 2);
        assert_eq!(engine.count("items", &Filter::all()).unwrap(), 1);

        assert!(!engine.delete_by_id("items", "ffff").unwrap());
        assert!(engine.update_by_id("missing", "ffff", &Map::new()).unwrap().is_none());
    }

    #[test]
    fn test_aggregate_with_lookup() {
        let dir = tempdir().unwrap();
        let engine = NoSqlEngine::create(dir.path()).unwrap();
        engine.insert("customers", json!({"_id": {"$oid": "c1"}, "name": "Ann"})).unwrap();
        engine.insert("orders", json!({"total": 5, "customerId": {"$oid": "c1"}})).unwrap();

        let out = engine
            .aggregate(
                "orders",
                &[json!({"$lookup": {
                    "from": "customers", "localField": "customerId", "foreignField": "_id", "as": "customer"
                }})],
            )
            .unwrap();

        assert_eq!(out[0]["customer"][0]["name"], json!("Ann"));
        assert!(engine.aggregate("nothing", &[]).unwrap().is_empty());
    }
}
