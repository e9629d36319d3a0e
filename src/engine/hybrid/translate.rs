//! Translates normalized query options into store-native form
//!
//! Null handling is aligned across stores: a missing or null field equals
//! `null`, `ne`/`nin` keep null rows unless null is among the operands, and
//! range operators never match null. Nulls sort first ascending and last
//! descending; the primary key breaks ties.

use serde_json::{json, Map, Value};

use super::options::{FilterOp, StorageFilter, StorageSort};
use crate::engine::adapter::{SortDirection, SqlDialect, SqlValue};

// ========== document store ==========

fn document_operator(op: FilterOp) -> &'static str {
    match op {
        FilterOp::Eq => "$eq",
        FilterOp::Ne => "$ne",
        FilterOp::Gt => "$gt",
        FilterOp::Gte => "$gte",
        FilterOp::Lt => "$lt",
        FilterOp::Lte => "$lte",
        FilterOp::In => "$in",
        FilterOp::Nin => "$nin",
    }
}

/// `$match` body; operators on one field share a clause
pub fn document_match(filters: &[StorageFilter]) -> Map<String, Value> {
    let mut clauses = Map::new();
    for filter in filters {
        let entry = clauses
            .entry(filter.field.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(ops) = entry {
            ops.insert(document_operator(filter.op).to_string(), filter.value.clone());
        }
    }
    clauses
}

/// `$sort` body with the primary key as tiebreaker
pub fn document_sort(sort: Option<&StorageSort>, pk: &str) -> Map<String, Value> {
    let mut keys = Map::new();
    if let Some(sort) = sort {
        let direction = match sort.direction {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        };
        keys.insert(sort.field.clone(), json!(direction));
    }
    keys.entry(pk.to_string()).or_insert(json!(1));
    keys
}

// ========== relational store ==========

/// A piece of SQL with its positional parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlFragment {
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

struct ParamWriter {
    dialect: SqlDialect,
    next: usize,
    params: Vec<SqlValue>,
}

impl ParamWriter {
    fn push(&mut self, value: &Value) -> String {
        self.params.push(SqlValue::from(value));
        let placeholder = self.dialect.placeholder(self.next);
        self.next += 1;
        placeholder
    }
}

fn column(dialect: SqlDialect, alias: Option<&str>, field: &str) -> String {
    match alias {
        Some(alias) => dialect.qualified(alias, field),
        None => dialect.quote_ident(field),
    }
}

/// WHERE conditions joined with AND, without the keyword.
///
/// Placeholders are numbered from `first_param`.
pub fn sql_where(
    filters: &[StorageFilter],
    dialect: SqlDialect,
    alias: Option<&str>,
    first_param: usize,
) -> SqlFragment {
    let mut writer = ParamWriter { dialect, next: first_param, params: Vec::new() };
    let conditions: Vec<String> = filters
        .iter()
        .map(|f| condition(&mut writer, &column(dialect, alias, &f.field), f.op, &f.value))
        .collect();

    SqlFragment { sql: conditions.join(" AND "), params: writer.params }
}

fn condition(writer: &mut ParamWriter, col: &str, op: FilterOp, value: &Value) -> String {
    match op {
        FilterOp::Eq if value.is_null() => format!("{} IS NULL", col),
        FilterOp::Ne if value.is_null() => format!("{} IS NOT NULL", col),
        FilterOp::Eq => format!("{} = {}", col, writer.push(value)),
        FilterOp::Ne => format!("({} != {} OR {} IS NULL)", col, writer.push(value), col),
        FilterOp::Gt => format!("{} > {}", col, writer.push(value)),
        FilterOp::Gte => format!("{} >= {}", col, writer.push(value)),
        FilterOp::Lt => format!("{} < {}", col, writer.push(value)),
        FilterOp::Lte => format!("{} <= {}", col, writer.push(value)),
        FilterOp::In | FilterOp::Nin => {
            let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
            let has_null = items.iter().any(Value::is_null);
            let placeholders: Vec<String> =
                items.iter().filter(|v| !v.is_null()).map(|v| writer.push(v)).collect();
            let list = placeholders.join(", ");

            match (op, placeholders.is_empty(), has_null) {
                (FilterOp::In, true, false) => "1 = 0".to_string(),
                (FilterOp::In, true, true) => format!("{} IS NULL", col),
                (FilterOp::In, false, false) => format!("{} IN ({})", col, list),
                (FilterOp::In, false, true) => format!("({} IN ({}) OR {} IS NULL)", col, list, col),
                (_, true, false) => "1 = 1".to_string(),
                (_, true, true) => format!("{} IS NOT NULL", col),
                (_, false, false) => format!("({} NOT IN ({}) OR {} IS NULL)", col, list, col),
                (_, false, true) => format!("({} NOT IN ({}) AND {} IS NOT NULL)", col, list, col),
            }
        }
    }
}

/// ORDER BY terms without the keyword, ending with the primary key
pub fn sql_order(sort: Option<&StorageSort>, pk: &str, dialect: SqlDialect, alias: Option<&str>) -> String {
    let mut terms = Vec::with_capacity(2);
    if let Some(sort) = sort {
        let col = column(dialect, alias, &sort.field);
        let nulls = match (dialect, sort.direction) {
            (SqlDialect::Postgres, SortDirection::Asc) => " NULLS FIRST",
            (SqlDialect::Postgres, SortDirection::Desc) => " NULLS LAST",
            _ => "",
        };
        terms.push(format!("{} {}{}", col, sort.direction, nulls));
    }
    if sort.map(|s| s.field.as_str()) != Some(pk) {
        terms.push(format!("{} ASC", column(dialect, alias, pk)));
    }
    terms.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(field: &str, op: FilterOp, value: Value) -> StorageFilter {
        StorageFilter { field: field.to_string(), op, value }
    }

    #[test]
    fn test_document_match_merges_operators() {
        let clauses = document_match(&[
            filter("total", FilterOp::Gte, json!(10)),
            filter("total", FilterOp::Lt, json!(20)),
            filter("status", FilterOp::In, json!(["open"])),
        ]);

        assert_eq!(
            Value::Object(clauses),
            json!({"total": {"$gte": 10, "$lt": 20}, "status": {"$in": ["open"]}})
        );
    }

    #[test]
    fn test_document_sort_tiebreak() {
        let sort = StorageSort { field: "createdAt".into(), direction: SortDirection::Desc };
        let keys = document_sort(Some(&sort), "_id");
        assert_eq!(keys.keys().collect::<Vec<_>>(), vec!["createdAt", "_id"]);
        assert_eq!(keys["createdAt"], json!(-1));
        assert_eq!(Value::Object(document_sort(None, "_id")), json!({"_id": 1}));
    }

    #[test]
    fn test_sql_where_numbering() {
        let fragment = sql_where(
            &[filter("status", FilterOp::Eq, json!("open")), filter("total", FilterOp::Gt, json!(5))],
            SqlDialect::Postgres,
            Some("r"),
            3,
        );

        assert_eq!(fragment.sql, r#""r"."status" = $3 AND "r"."total" > $4"#);
        assert_eq!(fragment.params, vec![SqlValue::Text("open".into()), SqlValue::Integer(5)]);
    }

    #[test]
    fn test_sql_null_semantics() {
        let sql = |op, value| sql_where(&[filter("c", op, value)], SqlDialect::Sqlite, None, 1).sql;

        assert_eq!(sql(FilterOp::Eq, Value::Null), r#""c" IS NULL"#);
        assert_eq!(sql(FilterOp::Ne, json!(1)), r#"("c" != ?1 OR "c" IS NULL)"#);
        assert_eq!(sql(FilterOp::In, json!([])), "1 = 0");
        assert_eq!(sql(FilterOp::Nin, json!([])), "1 = 1");
        assert_eq!(sql(FilterOp::In, json!([1, null])), r#"("c" IN (?1) OR "c" IS NULL)"#);
        assert_eq!(sql(FilterOp::Nin, json!([1, 2])), r#"("c" NOT IN (?1, ?2) OR "c" IS NULL)"#);
        assert_eq!(sql(FilterOp::Nin, json!([null, 1])), r#"("c" NOT IN (?1) AND "c" IS NOT NULL)"#);
    }

    #[test]
    fn test_sql_order() {
        let sort = StorageSort { field: "created_at".into(), direction: SortDirection::Asc };
        assert_eq!(
            sql_order(Some(&sort), "id", SqlDialect::Postgres, Some("r")),
            r#""r"."created_at" ASC NULLS FIRST, "r"."id" ASC"#
        );
        assert_eq!(sql_order(None, "id", SqlDialect::Sqlite, None), r#""id" ASC"#);

        let by_pk = StorageSort { field: "id".into(), direction: SortDirection::Desc };
        assert_eq!(sql_order(Some(&by_pk), "id", SqlDialect::Mysql, None), "`id` DESC");
    }
}
