//! Collection management for NoSQL storage
//!
//! Each collection is a directory holding one `<id>.json` file per document.
//! Natural document order is ascending id order, which for generated ids is
//! insertion order.

use std::fs;
use std::path::{Path, PathBuf};

use super::document::Document;
use super::error::{NoSqlError, Result};

/// A NoSQL collection (like a table in SQL)
pub struct Collection {
    /// Collection name
    pub name: String,

    /// Path to collection directory
    path: PathBuf,
}

impl Collection {
    /// Open an existing collection
    pub fn open(base_path: &Path, name: &str) -> Result<Self> {
        validate_collection_name(name)?;
        let path = base_path.join(name);

        if !path.is_dir() {
            return Err(NoSqlError::CollectionNotFound(name.to_string()));
        }

        Ok(Self { name: name.to_string(), path })
    }

    /// Create a new collection
    pub fn create(base_path: &Path, name: &str) -> Result<Self> {
        validate_collection_name(name)?;

        let path = base_path.join(name);

        if path.exists() {
            return Err(NoSqlError::CollectionAlreadyExists(name.to_string()));
        }

        fs::create_dir_all(&path)?;

        Ok(Self { name: name.to_string(), path })
    }

    /// Open a collection, creating it on first use
    pub fn open_or_create(base_path: &Path, name: &str) -> Result<Self> {
        match Self::open(base_path, name) {
            Err(NoSqlError::CollectionNotFound(_)) => Self::create(base_path, name),
            other => other,
        }
    }

    fn doc_path(&self, id: &str) -> Result<PathBuf> {
        validate_document_id(id)?;
        Ok(self.path.join(format!("{}.json", id)))
    }

    /// Check whether a document exists
    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.doc_path(id)?.exists())
    }

    /// Insert a document
    pub fn insert(&self, doc: &Document) -> Result<String> {
        let doc_path = self.doc_path(&doc.id)?;

        if doc_path.exists() {
            return Err(NoSqlError::DuplicateId(doc.id.clone()));
        }

        fs::write(doc_path, serde_json::to_string_pretty(doc)?)?;
        Ok(doc.id.clone())
    }

    /// Overwrite an existing document
    pub fn put(&self, doc: &Document) -> Result<()> {
        let doc_path = self.doc_path(&doc.id)?;

        if !doc_path.exists() {
            return Err(NoSqlError::DocumentNotFound(doc.id.clone()));
        }

        fs::write(doc_path, serde_json::to_string_pretty(doc)?)?;
        Ok(())
    }

    /// Get a document by ID
    pub fn get(&self, id: &str) -> Result<Document> {
        let doc_path = self.doc_path(id)?;

        if !doc_path.exists() {
            return Err(NoSqlError::DocumentNotFound(id.to_string()));
        }

        let content = fs::read_to_string(doc_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Delete a document
    pub fn delete(&self, id: &str) -> Result<()> {
        let doc_path = self.doc_path(id)?;

        if !doc_path.exists() {
            return Err(NoSqlError::DocumentNotFound(id.to_string()));
        }

        fs::remove_file(doc_path)?;
        Ok(())
    }

    /// List all document IDs in ascending order
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();

            if path.is_file() && path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem() {
                    ids.push(stem.to_string_lossy().to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Count documents
    pub fn count(&self) -> Result<usize> {
        Ok(self.list_ids()?.len())
    }

    /// Get all documents in natural order
    pub fn all(&self) -> Result<Vec<Document>> {
        self.list_ids()?.iter().map(|id| self.get(id)).collect()
    }

    /// Drop this collection
    pub fn drop(self) -> Result<()> {
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}

/// Validate collection name
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(NoSqlError::InvalidCollectionName("name cannot be empty".to_string()));
    }

    if name.starts_with('_') {
        return Err(NoSqlError::InvalidCollectionName(format!(
            "{}: name cannot start with underscore",
            name
        )));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(NoSqlError::InvalidCollectionName(format!("{}: name must be alphanumeric", name)));
    }

    Ok(())
}

/// Document ids double as file names
fn validate_document_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(NoSqlError::InvalidDocument(format!("invalid document id: {:?}", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_collection_crud() {
        let dir = tempdir().unwrap();

        let col = Collection::create(dir.path(), "users").unwrap();

        let id = col.insert(&doc(json!({"name": "Alice", "age": 30}))).unwrap();

        let mut retrieved = col.get(&id).unwrap();
        assert_eq!(retrieved.get("name"), Some(&json!("Alice")));

        retrieved.merge(json!({"age": 31}).as_object().unwrap());
        col.put(&retrieved).unwrap();
        assert_eq!(col.get(&id).unwrap().get("age"), Some(&json!(31)));

        col.delete(&id).unwrap();
        assert!(col.get(&id).is_err());
    }

    #[test]
    fn test_duplicate_and_invalid_ids() {
        let dir = tempdir().unwrap();
        let col = Collection::create(dir.path(), "users").unwrap();

        col.insert(&doc(json!({"_id": {"$oid": "a1"}}))).unwrap();
        assert!(matches!(
            col.insert(&doc(json!({"_id": {"$oid": "a1"}}))),
            Err(NoSqlError::DuplicateId(_))
        ));
        assert!(matches!(
            col.insert(&doc(json!({"_id": "../escape"}))),
            Err(NoSqlError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_natural_order_is_insertion_order() {
        let dir = tempdir().unwrap();
        let col = Collection::open_or_create(dir.path(), "items").unwrap();

        let ids: Vec<String> = (0..5).map(|i| col.insert(&doc(json!({"n": i}))).unwrap()).collect();
        let numbers: Vec<_> = col.all().unwrap().iter().map(|d| d.get("n").cloned()).collect();

        assert_eq!(col.list_ids().unwrap(), ids);
        assert_eq!(numbers, (0..5).map(|i| Some(json!(i))).collect::<Vec<_>>());
    }

    #[test]
    fn test_collection_names() {
        assert!(validate_collection_name("agents_policies").is_ok());
        assert!(validate_collection_name("_meta").is_err());
        assert!(validate_collection_name("bad/name").is_err());
    }
}
