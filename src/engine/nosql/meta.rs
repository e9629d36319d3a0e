//! Store marker file (`_meta.json`)
//!
//! Written once when a document store is created and checked on open so that
//! a directory laid out by an incompatible engine is rejected up front.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::error::{NoSqlError, Result};

/// On-disk layout version written by this engine
pub const FORMAT_VERSION: u32 = 2;

const META_FILE: &str = "_meta.json";
const ENGINE_NAME: &str = "airdb-docstore";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub engine: String,
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
}

impl StoreMeta {
    pub fn new() -> Self {
        Self {
            engine: ENGINE_NAME.to_string(),
            format_version: FORMAT_VERSION,
            created_at: Utc::now(),
        }
    }

    pub fn exists(base_path: &Path) -> bool {
        base_path.join(META_FILE).is_file()
    }

    /// Load and verify the marker
    pub fn load(base_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(base_path.join(META_FILE))?;
        let meta: StoreMeta = serde_json::from_str(&content)?;

        if meta.engine != ENGINE_NAME || meta.format_version != FORMAT_VERSION {
            return Err(NoSqlError::UnsupportedFormat {
                engine: meta.engine,
                version: meta.format_version,
            });
        }

        Ok(meta)
    }

    pub fn save(&self, base_path: &Path) -> Result<()> {
        fs::write(base_path.join(META_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl Default for StoreMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_meta_save_load() {
        let dir = tempdir().unwrap();
        StoreMeta::new().save(dir.path()).unwrap();

        let loaded = StoreMeta::load(dir.path()).unwrap();
        assert_eq!(loaded.format_version, FORMAT_VERSION);
        assert!(StoreMeta::exists(dir.path()));
    }

    #[test]
    fn test_foreign_layout_rejected() {
        let dir = tempdir().unwrap();
        let mut meta = StoreMeta::new();
        meta.format_version = 1;
        meta.save(dir.path()).unwrap();

        assert!(matches!(
            StoreMeta::load(dir.path()),
            Err(NoSqlError::UnsupportedFormat { version: 1, .. })
        ));
    }
}
