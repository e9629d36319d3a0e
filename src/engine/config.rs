//! Project configuration
//! Handles loading and validating airdb.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "airdb.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub project: ProjectConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// Relational backend
    Sqlite,
    /// Document backend rooted at `path`
    Nosql,
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseType::Sqlite => write!(f, "sqlite"),
            DatabaseType::Nosql => write!(f, "nosql"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_page_size: Option<i64>,
}

impl Config {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn default_for_project(name: &str) -> Self {
        Self {
            version: "0.1.0".to_string(),
            project: ProjectConfig { name: name.to_string() },
            database: DatabaseConfig {
                db_type: DatabaseType::Sqlite,
                path: PathBuf::from("./data/airdb.db"),
            },
            query: QueryConfig { max_page_size: Some(500) },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(max) = self.query.max_page_size {
            if max < 1 {
                return Err(ConfigError::Invalid(format!("query.maxPageSize must be at least 1, got {}", max)));
            }
        }
        Ok(())
    }

    /// Database location resolved against the project directory
    pub fn database_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.database.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut config = Config::default_for_project("demo");
        config.database.db_type = DatabaseType::Nosql;
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.project.name, "demo");
        assert_eq!(loaded.database.db_type, DatabaseType::Nosql);
        assert_eq!(loaded.query.max_page_size, Some(500));
    }

    #[test]
    fn test_query_section_is_optional() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"version": "0.1.0", "project": {"name": "x"}, "database": {"type": "sqlite", "path": "db.sqlite"}}"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.query.max_page_size, None);
        assert_eq!(config.database_path(dir.path()), dir.path().join("db.sqlite"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = tempdir().unwrap();
        assert!(matches!(Config::load(dir.path()), Err(ConfigError::NotFound(_))));

        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"version": "0.1.0", "project": {"name": "x"}, "database": {"type": "sqlite", "path": "a"}, "query": {"maxPageSize": 0}}"#,
        )
        .unwrap();
        assert!(matches!(Config::load(dir.path()), Err(ConfigError::Invalid(_))));

        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"version": "0.1.0", "project": {"name": "x"}, "database": {"type": "oracle", "path": "a"}}"#,
        )
        .unwrap();
        assert!(matches!(Config::load(dir.path()), Err(ConfigError::ParseError(_))));
    }
}
