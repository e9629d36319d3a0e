//! SQLite Adapter
//!
//! Implements DatabaseAdapter for SQLite using rusqlite + r2d2 connection pooling.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, TransactionBehavior};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use super::dialect::SqlDialect;
use super::{
    AdapterError, AdapterResult, ColumnMeta, ColumnSchema, DatabaseAdapter, ExecResult, QueryResult,
    SqlValue, Statement, TableSchema,
};

type DbPool = Pool<SqliteConnectionManager>;
type DbConn = PooledConnection<SqliteConnectionManager>;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as Sql;
        Ok(ToSqlOutput::Owned(match self {
            SqlValue::Null => Sql::Null,
            SqlValue::Integer(i) => Sql::Integer(*i),
            SqlValue::Real(f) => Sql::Real(*f),
            SqlValue::Text(s) => Sql::Text(s.clone()),
            SqlValue::Bool(b) => Sql::Integer(i64::from(*b)),
            SqlValue::Blob(b) => Sql::Blob(b.clone()),
        }))
    }
}

pub struct SqliteAdapter {
    pool: DbPool,
    db_path: PathBuf,
}

impl SqliteAdapter {
    pub fn new(db_path: &Path) -> AdapterResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AdapterError::Connection(e.to_string()))?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;"));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| AdapterError::Connection(e.to_string()))?;

        let adapter = Self { pool, db_path: db_path.to_path_buf() };
        adapter.init()?;
        info!(path = ?db_path, "Opened SQLite database");
        Ok(adapter)
    }

    pub fn in_memory() -> AdapterResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys=ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| AdapterError::Connection(e.to_string()))?;

        Ok(Self { pool, db_path: PathBuf::from(":memory:") })
    }

    fn init(&self) -> AdapterResult<()> {
        let conn = self.get_conn()?;
        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| AdapterError::Schema(e.to_string()))?;
        Ok(())
    }

    fn get_conn(&self) -> AdapterResult<DbConn> {
        self.pool
            .get()
            .map_err(|e| AdapterError::Connection(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Convert a rusqlite ValueRef to serde_json Value
    fn value_ref_to_json(val: ValueRef<'_>) -> Value {
        match val {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => json!(i),
            ValueRef::Real(f) => json!(f),
            ValueRef::Text(t) => json!(String::from_utf8_lossy(t).to_string()),
            ValueRef::Blob(b) => json!(format!("BLOB({} bytes)", b.len())),
        }
    }

    fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> AdapterResult<QueryResult> {
        let start = Instant::now();

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let columns: Vec<ColumnMeta> = stmt
            .column_names()
            .iter()
            .map(|name| ColumnMeta {
                name: name.to_string(),
                col_type: String::from("TEXT"), // SQLite is dynamically typed
            })
            .collect();
        let width = columns.len();

        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let mut vals = Vec::with_capacity(width);
                for i in 0..width {
                    vals.push(Self::value_ref_to_json(row.get_ref(i)?));
                }
                Ok(vals)
            })
            .map_err(|e| AdapterError::Query(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        debug!(rows = rows.len(), elapsed_ms = start.elapsed().as_millis() as u64, "SQLite query");
        Ok(QueryResult { columns, rows, execution_time_ms: start.elapsed().as_millis() as u64 })
    }

    fn run_execute(conn: &Connection, sql: &str, params: &[SqlValue]) -> AdapterResult<ExecResult> {
        let start = Instant::now();

        let affected = conn
            .execute(sql, rusqlite::params_from_iter(params.iter()))
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        Ok(ExecResult {
            affected_rows: affected as u64,
            last_insert_id: Some(conn.last_insert_rowid()),
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

impl DatabaseAdapter for SqliteAdapter {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<QueryResult> {
        let conn = self.get_conn()?;
        Self::run_query(&conn, sql, params)
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<ExecResult> {
        let conn = self.get_conn()?;
        Self::run_execute(&conn, sql, params)
    }

    fn execute_batch(&self, sql: &str) -> AdapterResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(sql)
            .map_err(|e| AdapterError::Query(e.to_string()))
    }

    fn read_snapshot(&self, statements: &[Statement]) -> AdapterResult<Vec<QueryResult>> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let results = statements
            .iter()
            .map(|st| Self::run_query(&tx, &st.sql, &st.params))
            .collect::<AdapterResult<Vec<_>>>()?;

        tx.commit().map_err(|e| AdapterError::Query(e.to_string()))?;
        Ok(results)
    }

    fn write_batch(&self, statements: &[Statement]) -> AdapterResult<Vec<ExecResult>> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        // dropping the transaction on error rolls it back
        let results = statements
            .iter()
            .map(|st| Self::run_execute(&tx, &st.sql, &st.params))
            .collect::<AdapterResult<Vec<_>>>()?;

        tx.commit().map_err(|e| AdapterError::Query(e.to_string()))?;
        debug!(statements = statements.len(), "SQLite write batch committed");
        Ok(results)
    }

    fn get_tables(&self) -> AdapterResult<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        let tables = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| AdapterError::Query(e.to_string()))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| AdapterError::Query(e.to_string()))?;

        Ok(tables)
    }

    fn get_table_schema(&self, table: &str) -> AdapterResult<TableSchema> {
        let conn = self.get_conn()?;

        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", SqlDialect::Sqlite.quote_ident(table)))
            .map_err(|e| AdapterError::Schema(e.to_string()))?;

        let columns: Vec<ColumnSchema> = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let col_type: String = row.get(2)?;
                let not_null: i32 = row.get(3)?;
                let default: Option<String> = row.get(4)?;
                let pk: i32 = row.get(5)?;

                let is_auto = pk > 0 && col_type.eq_ignore_ascii_case("INTEGER");
                Ok(ColumnSchema {
                    name,
                    col_type,
                    nullable: not_null == 0,
                    default_value: default,
                    is_primary_key: pk > 0,
                    is_auto_increment: is_auto,
                })
            })
            .map_err(|e| AdapterError::Schema(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AdapterError::Schema(e.to_string()))?;

        if columns.is_empty() {
            return Err(AdapterError::NotFound(format!("table '{}'", table)));
        }

        Ok(TableSchema { name: table.to_string(), columns })
    }

    fn test_connection(&self) -> AdapterResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch("SELECT 1")
            .map_err(|e| AdapterError::Connection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seeded() -> SqliteAdapter {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter
            .execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, active INTEGER);
                 INSERT INTO users (name, active) VALUES ('ann', 1), ('bob', 0);",
            )
            .unwrap();
        adapter
    }

    #[test]
    fn test_query_with_params() {
        let adapter = seeded();
        let result = adapter
            .query("SELECT id, name FROM users WHERE active = ?1", &[SqlValue::Bool(true)])
            .unwrap();

        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.rows, vec![vec![json!(1), json!("ann")]]);
    }

    #[test]
    fn test_table_schema_reports_primary_key() {
        let adapter = seeded();
        let schema = adapter.get_table_schema("users").unwrap();

        assert_eq!(schema.primary_key(), Some("id"));
        assert!(schema.has_column("active"));
        assert!(matches!(adapter.get_table_schema("nope"), Err(AdapterError::NotFound(_))));
    }

    #[test]
    fn test_write_batch_rolls_back_on_error() {
        let adapter = seeded();
        let result = adapter.write_batch(&[
            Statement::new("INSERT INTO users (name) VALUES (?1)", vec![SqlValue::Text("cy".into())]),
            Statement::new("INSERT INTO users (name) VALUES (?1)", vec![SqlValue::Null]),
        ]);
        assert!(result.is_err());

        let count = adapter.query("SELECT COUNT(*) FROM users", &[]).unwrap();
        assert_eq!(count.rows[0][0], json!(2));
    }

    #[test]
    fn test_read_snapshot_runs_all_statements() {
        let dir = tempdir().unwrap();
        let adapter = SqliteAdapter::new(&dir.path().join("data.db")).unwrap();
        adapter
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT); INSERT INTO t (v) VALUES ('a');")
            .unwrap();

        let results = adapter
            .read_snapshot(&[
                Statement::new("SELECT COUNT(*) AS n FROM t", vec![]),
                Statement::new("SELECT v FROM t", vec![]),
            ])
            .unwrap();

        assert_eq!(results[0].rows[0][0], json!(1));
        assert_eq!(results[1].clone().into_maps()[0]["v"], json!("a"));
        assert_eq!(adapter.get_tables().unwrap(), vec!["t".to_string()]);
    }
}
