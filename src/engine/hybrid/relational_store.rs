//! [`Backend`] over a relational [`DatabaseAdapter`]

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use super::assemble::Assembler;
use super::error::{QueryError, Result};
use super::joins::{self, JoinQuery};
use super::normalize::{casing_round_trips, StoreFlavor};
use super::options::StorageFilter;
use super::store::{Backend, FetchRequest, FetchResult};
use super::translate::sql_where;
use crate::engine::adapter::{AdapterError, DatabaseAdapter, SqlValue, Statement, TableSchema};

pub struct RelationalStore {
    adapter: Arc<dyn DatabaseAdapter>,
}

impl RelationalStore {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &dyn DatabaseAdapter {
        self.adapter.as_ref()
    }

    fn describe(&self, table: &str) -> Result<TableSchema> {
        match self.adapter.get_table_schema(table) {
            Ok(schema) => {
                if let Some(column) = schema.column_names().find(|c| !casing_round_trips(c)) {
                    return Err(QueryError::InvalidOperation(format!(
                        "column '{}' of table '{}' has no lossless camelCase name",
                        column, table
                    )));
                }
                Ok(schema)
            }
            Err(AdapterError::NotFound(_)) => {
                Err(QueryError::InvalidOperation(format!("unknown table '{}'", table)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn primary_key(&self, table: &str) -> Result<String> {
        let schema = self.describe(table)?;
        schema.primary_key().map(str::to_string).ok_or_else(|| {
            QueryError::InvalidOperation(format!("table '{}' needs a single-column primary key", table))
        })
    }

    fn compile(&self, request: &FetchRequest) -> Result<JoinQuery> {
        joins::compile(
            &request.collection,
            &request.plan,
            &request.options,
            request.by_id.as_ref(),
            self.adapter.dialect(),
            |table| self.describe(table),
        )
    }

    fn select_by_ids(&self, table: &str, pk: &str, ids: &[Value]) -> Result<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let dialect = self.adapter.dialect();
        let placeholders: Vec<String> = (1..=ids.len()).map(|i| dialect.placeholder(i)).collect();
        let sql = format!(
            "SELECT * FROM {} WHERE {} IN ({})",
            dialect.quote_ident(table),
            dialect.quote_ident(pk),
            placeholders.join(", ")
        );
        let params: Vec<SqlValue> = ids.iter().map(SqlValue::from).collect();
        let mut rows = self.adapter.query(&sql, &params)?.into_maps();

        // return rows in the order of `ids`
        let mut ordered = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(position) = rows.iter().position(|row| row.get(pk) == Some(id)) {
                ordered.push(Value::Object(rows.swap_remove(position)));
            }
        }
        Ok(ordered)
    }

    fn set_clause(&self, changes: &Map<String, Value>) -> (String, Vec<SqlValue>) {
        let dialect = self.adapter.dialect();
        let assignments: Vec<String> = changes
            .keys()
            .enumerate()
            .map(|(i, column)| format!("{} = {}", dialect.quote_ident(column), dialect.placeholder(i + 1)))
            .collect();
        (assignments.join(", "), changes.values().map(SqlValue::from).collect())
    }
}

impl Backend for RelationalStore {
    fn flavor(&self) -> StoreFlavor {
        StoreFlavor::Relational
    }

    fn name(&self) -> &str {
        self.adapter.dialect().name()
    }

    fn fetch_joined(&self, request: &FetchRequest) -> Result<FetchResult> {
        let query = self.compile(request)?;
        debug!(sql = %query.select.sql, params = query.select.params.len(), "Compiled join query");

        let mut results = self
            .adapter
            .read_snapshot(&[query.select.clone(), query.count.clone()])?
            .into_iter();
        let (Some(rows), Some(count)) = (results.next(), results.next()) else {
            return Err(AdapterError::Internal("snapshot returned too few results".to_string()).into());
        };

        let entities = Assembler::new(&request.plan, &query).assemble(&rows.rows);
        let total = count
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_u64)
            .unwrap_or(0);
        debug!(rows = rows.rows.len(), entities = entities.len(), total, "Assembled join rows");

        Ok(FetchResult { entities, total })
    }

    fn explain(&self, request: &FetchRequest) -> Result<Value> {
        let query = self.compile(request)?;
        Ok(json!({
            "sql": query.select.sql,
            "params": query.select.params,
            "countSql": query.count.sql,
        }))
    }

    fn insert_many(&self, collection: &str, entities: Vec<Map<String, Value>>) -> Result<Vec<Value>> {
        let pk = self.primary_key(collection)?;
        let dialect = self.adapter.dialect();
        let table = dialect.quote_ident(collection);

        let statements: Vec<Statement> = entities
            .iter()
            .map(|entity| {
                if entity.is_empty() {
                    return Statement::new(format!("INSERT INTO {} DEFAULT VALUES", table), Vec::new());
                }
                let columns: Vec<String> = entity.keys().map(|c| dialect.quote_ident(c)).collect();
                let placeholders: Vec<String> = (1..=entity.len()).map(|i| dialect.placeholder(i)).collect();
                Statement::new(
                    format!("INSERT INTO {} ({}) VALUES ({})", table, columns.join(", "), placeholders.join(", ")),
                    entity.values().map(SqlValue::from).collect(),
                )
            })
            .collect();

        let results = self.adapter.write_batch(&statements)?;
        let ids: Vec<Value> = entities
            .iter()
            .zip(&results)
            .filter_map(|(entity, result)| match entity.get(&pk) {
                Some(id) if !id.is_null() => Some(id.clone()),
                _ => result.last_insert_id.map(Value::from),
            })
            .collect();
        debug!(table = collection, inserted = ids.len(), "Inserted rows");

        self.select_by_ids(collection, &pk, &ids)
    }

    fn update_by_id(&self, collection: &str, id: &Value, changes: Map<String, Value>) -> Result<Option<Value>> {
        let pk = self.primary_key(collection)?;
        let dialect = self.adapter.dialect();

        if !changes.is_empty() {
            let (set, mut params) = self.set_clause(&changes);
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = {}",
                dialect.quote_ident(collection),
                set,
                dialect.quote_ident(&pk),
                dialect.placeholder(params.len() + 1)
            );
            params.push(SqlValue::from(id));
            if self.adapter.execute(&sql, &params)?.affected_rows == 0 {
                return Ok(None);
            }
        }

        Ok(self.select_by_ids(collection, &pk, std::slice::from_ref(id))?.pop())
    }

    fn update_where(&self, collection: &str, filters: &[StorageFilter], changes: Map<String, Value>) -> Result<u64> {
        if changes.is_empty() {
            return Ok(0);
        }
        let dialect = self.adapter.dialect();
        let (set, mut params) = self.set_clause(&changes);
        let condition = sql_where(filters, dialect, None, params.len() + 1);

        let mut sql = format!("UPDATE {} SET {}", dialect.quote_ident(collection), set);
        if !condition.is_empty() {
            sql.push_str(&format!(" WHERE {}", condition.sql));
        }
        params.extend(condition.params);

        Ok(self.adapter.execute(&sql, &params)?.affected_rows)
    }

    fn delete_by_id(&self, collection: &str, id: &Value) -> Result<bool> {
        let pk = self.primary_key(collection)?;
        let dialect = self.adapter.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            dialect.quote_ident(collection),
            dialect.quote_ident(&pk),
            dialect.placeholder(1)
        );
        Ok(self.adapter.execute(&sql, &[SqlValue::from(id)])?.affected_rows > 0)
    }

    fn delete_where(&self, collection: &str, filters: &[StorageFilter]) -> Result<u64> {
        let dialect = self.adapter.dialect();
        let condition = sql_where(filters, dialect, None, 1);

        let mut sql = format!("DELETE FROM {}", dialect.quote_ident(collection));
        if !condition.is_empty() {
            sql.push_str(&format!(" WHERE {}", condition.sql));
        }
        Ok(self.adapter.execute(&sql, &condition.params)?.affected_rows)
    }

    fn ping(&self) -> Result<()> {
        Ok(self.adapter.test_connection()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::adapter::sqlite::SqliteAdapter;
    use crate::engine::adapter::{AdapterResult, ExecResult, QueryResult, SqlDialect};
    use crate::engine::hybrid::operation::Operation;
    use crate::engine::hybrid::options::{FilterOp, StorageOptions};
    use crate::engine::hybrid::plan::JoinPlan;

    fn store() -> RelationalStore {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter
            .execute_batch(
                "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, status TEXT);
                 INSERT INTO customers (name) VALUES ('Ann');
                 INSERT INTO orders (customer_id, status) VALUES (1, 'open'), (1, 'open'), (42, 'paid');",
            )
            .unwrap();
        RelationalStore::new(Arc::new(adapter))
    }

    fn request(ops: &[Operation]) -> FetchRequest {
        FetchRequest {
            collection: "orders".into(),
            plan: JoinPlan::resolve(ops).unwrap(),
            options: StorageOptions::default(),
            by_id: None,
        }
    }

    #[test]
    fn test_fetch_joined_assembles_rows() {
        let store = store();
        let result = store
            .fetch_joined(&request(&[Operation::one_left("customers", "customerId", "id", "customer")]))
            .unwrap();

        assert_eq!(result.total, 3);
        assert_eq!(result.entities[0]["customer"], json!({"id": 1, "name": "Ann"}));
        assert_eq!(result.entities[1]["customer"]["name"], json!("Ann"));
        assert!(result.entities[2].get("customer").is_none());
    }

    #[test]
    fn test_unknown_table_is_a_configuration_error() {
        let store = store();
        let err = store
            .fetch_joined(&request(&[Operation::one_left("buyers", "customerId", "id", "buyer")]))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_lossy_column_names_are_rejected() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter
            .execute_batch("CREATE TABLE addresses (id INTEGER PRIMARY KEY, address_2 TEXT);")
            .unwrap();
        let store = RelationalStore::new(Arc::new(adapter));

        let request = FetchRequest { collection: "addresses".into(), ..request(&[]) };
        let err = store.fetch_joined(&request).unwrap_err();
        assert!(matches!(err, QueryError::InvalidOperation(ref m) if m.contains("address_2")));
        assert!(err.is_configuration());
    }

    /// Reports another dialect over the SQLite connection
    struct Relabeled(SqliteAdapter, SqlDialect);

    impl DatabaseAdapter for Relabeled {
        fn dialect(&self) -> SqlDialect {
            self.1
        }
        fn query(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<QueryResult> {
            self.0.query(sql, params)
        }
        fn execute(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<ExecResult> {
            self.0.execute(sql, params)
        }
        fn execute_batch(&self, sql: &str) -> AdapterResult<()> {
            self.0.execute_batch(sql)
        }
        fn read_snapshot(&self, statements: &[Statement]) -> AdapterResult<Vec<QueryResult>> {
            self.0.read_snapshot(statements)
        }
        fn write_batch(&self, statements: &[Statement]) -> AdapterResult<Vec<ExecResult>> {
            self.0.write_batch(statements)
        }
        fn get_tables(&self) -> AdapterResult<Vec<String>> {
            self.0.get_tables()
        }
        fn get_table_schema(&self, table: &str) -> AdapterResult<TableSchema> {
            self.0.get_table_schema(table)
        }
        fn test_connection(&self) -> AdapterResult<()> {
            self.0.test_connection()
        }
    }

    #[test]
    fn test_name_follows_the_adapter_dialect() {
        assert_eq!(store().name(), "sqlite");

        let relabeled = Relabeled(SqliteAdapter::in_memory().unwrap(), SqlDialect::Postgres);
        assert_eq!(RelationalStore::new(Arc::new(relabeled)).name(), "postgres");
    }

    #[test]
    fn test_explain_shape() {
        let explained = store().explain(&request(&[])).unwrap();
        assert!(explained["sql"].as_str().unwrap().starts_with("SELECT"));
        assert_eq!(explained["countSql"], json!(r#"SELECT COUNT(*) FROM "orders" AS "r""#));
    }

    #[test]
    fn test_writes() {
        let store = store();
        let mut row = Map::new();
        row.insert("customer_id".into(), json!(1));
        row.insert("status".into(), json!("new"));
        let inserted = store.insert_many("orders", vec![row.clone(), row]).unwrap();
        assert_eq!(inserted[0]["id"], json!(4));
        assert_eq!(inserted[1]["id"], json!(5));

        let mut changes = Map::new();
        changes.insert("status".into(), json!("paid"));
        let updated = store.update_by_id("orders", &json!(4), changes.clone()).unwrap().unwrap();
        assert_eq!(updated["status"], json!("paid"));
        assert!(store.update_by_id("orders", &json!(99), changes.clone()).unwrap().is_none());

        let open = [StorageFilter { field: "status".into(), op: FilterOp::Eq, value: json!("open") }];
        assert_eq!(store.update_where("orders", &open, changes).unwrap(), 2);

        assert!(store.delete_by_id("orders", &json!(5)).unwrap());
        assert!(!store.delete_by_id("orders", &json!(5)).unwrap());
        let paid = [StorageFilter { field: "status".into(), op: FilterOp::Ne, value: json!("open") }];
        assert_eq!(store.delete_where("orders", &paid).unwrap(), 4);
    }
}
