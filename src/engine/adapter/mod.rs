//! Database Adapter Layer
//!
//! Trait-based abstraction over SQL backends. SQLite is the bundled
//! implementation; the dialect layer also renders PostgreSQL and MySQL text.

pub mod dialect;
pub mod sqlite;

pub use dialect::SqlDialect;
pub use sqlite::SqliteAdapter;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Universal result type for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Core database adapter trait
pub trait DatabaseAdapter: Send + Sync {
    /// Which SQL dialect this adapter speaks
    fn dialect(&self) -> SqlDialect;

    /// Execute a query that returns rows (SELECT, PRAGMA, etc.)
    fn query(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<QueryResult>;

    /// Execute a statement that modifies data
    fn execute(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<ExecResult>;

    /// Execute several statements without parameters
    fn execute_batch(&self, sql: &str) -> AdapterResult<()>;

    /// Run several queries inside one read transaction so they observe the
    /// same snapshot
    fn read_snapshot(&self, statements: &[Statement]) -> AdapterResult<Vec<QueryResult>>;

    /// Run several writes atomically
    fn write_batch(&self, statements: &[Statement]) -> AdapterResult<Vec<ExecResult>>;

    /// Get all user table names
    fn get_tables(&self) -> AdapterResult<Vec<String>>;

    /// Get column layout and primary key of a table
    fn get_table_schema(&self, table: &str) -> AdapterResult<TableSchema>;

    /// Test the connection is alive
    fn test_connection(&self) -> AdapterResult<()>;
}

/// SQL text plus its positional parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self { sql: sql.into(), params }
    }
}

/// SQL value for parameterized queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Blob(Vec<u8>),
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

/// Result from a SELECT-type query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Rows as column-name keyed objects
    pub fn into_maps(self) -> Vec<serde_json::Map<String, Value>> {
        let names: Vec<String> = self.columns.into_iter().map(|c| c.name).collect();
        self.rows
            .into_iter()
            .map(|row| names.iter().cloned().zip(row).collect())
            .collect()
    }
}

/// Metadata about a result column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: String,
}

/// Result from an INSERT/UPDATE/DELETE-type statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub affected_rows: u64,
    pub last_insert_id: Option<i64>,
    pub execution_time_ms: u64,
}

/// Table layout as reported by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// The single-column primary key, if there is exactly one
    pub fn primary_key(&self) -> Option<&str> {
        let mut keys = self.columns.iter().filter(|c| c.is_primary_key);
        match (keys.next(), keys.next()) {
            (Some(column), None) => Some(column.name.as_str()),
            _ => None,
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Column schema information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// Database adapter errors
#[derive(Debug)]
pub enum AdapterError {
    Connection(String),
    Query(String),
    Schema(String),
    NotFound(String),
    Validation(String),
    Internal(String),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::Connection(e) => write!(f, "Connection error: {}", e),
            AdapterError::Query(e) => write!(f, "Query error: {}", e),
            AdapterError::Schema(e) => write!(f, "Schema error: {}", e),
            AdapterError::NotFound(e) => write!(f, "Not found: {}", e),
            AdapterError::Validation(e) => write!(f, "Validation error: {}", e),
            AdapterError::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for AdapterError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sql_value_from_json() {
        assert_eq!(SqlValue::from(&json!(3)), SqlValue::Integer(3));
        assert_eq!(SqlValue::from(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(SqlValue::from(&json!(true)), SqlValue::Bool(true));
        assert_eq!(SqlValue::from(&json!(null)), SqlValue::Null);
        assert_eq!(SqlValue::from(&json!({"a": 1})), SqlValue::Text("{\"a\":1}".into()));
    }

    #[test]
    fn test_primary_key_requires_single_column() {
        let column = |name: &str, pk: bool| ColumnSchema {
            name: name.to_string(),
            col_type: "INTEGER".to_string(),
            nullable: !pk,
            default_value: None,
            is_primary_key: pk,
            is_auto_increment: pk,
        };

        let single = TableSchema { name: "t".into(), columns: vec![column("id", true), column("x", false)] };
        assert_eq!(single.primary_key(), Some("id"));

        let composite = TableSchema { name: "t".into(), columns: vec![column("a", true), column("b", true)] };
        assert_eq!(composite.primary_key(), None);
    }
}
