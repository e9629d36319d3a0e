//! Relational join compiler
//!
//! Compiles a join plan into one flattened SELECT. Root rows are filtered,
//! sorted and paged in a subquery aliased `t0`, so a page always holds whole
//! root entities no matter how many rows each join fans out to. Join `i` reads
//! from `t{i+1}` (and its junction from `t{i+1}_j`); every selected column is
//! aliased `"<table alias>.<column>"`.
//!
//! Only joins that are inner all the way from the root become `INNER JOIN`;
//! deeper inner joins stay `LEFT JOIN` and are pruned by the assembler. Roots
//! whose inner joins cannot match are excluded up front with `EXISTS`, which
//! keeps the count and page boundaries exact.

use serde_json::Value;

use super::error::{QueryError, Result};
use super::normalize::StoreFlavor;
use super::options::StorageOptions;
use super::plan::{JoinPlan, PlanNode};
use super::translate::{sql_order, sql_where};
use crate::engine::adapter::{SqlDialect, SqlValue, Statement, TableSchema};

const FLAVOR: StoreFlavor = StoreFlavor::Relational;
const ROOT_ALIAS: &str = "t0";
const INNER_ROOT_ALIAS: &str = "r";

/// Where one table's columns sit in a result row
#[derive(Debug, Clone, PartialEq)]
pub struct TableLayout {
    pub alias: String,
    pub columns: Vec<String>,
    pub offset: usize,
    /// Position of the primary key within `columns`
    pub pk: usize,
}

impl TableLayout {
    pub fn pk_position(&self) -> usize {
        self.offset + self.pk
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.columns.len()
    }
}

/// Compiled statements plus the row layout they produce
#[derive(Debug, Clone)]
pub struct JoinQuery {
    pub select: Statement,
    pub count: Statement,
    pub root: TableLayout,
    /// One layout per plan node, in plan order
    pub nodes: Vec<TableLayout>,
}

pub fn table_alias(node: usize) -> String {
    format!("t{}", node + 1)
}

fn primary_key(schema: &TableSchema) -> Result<usize> {
    let pk = schema.primary_key().ok_or_else(|| {
        QueryError::InvalidOperation(format!("table '{}' needs a single-column primary key", schema.name))
    })?;
    Ok(schema.columns.iter().position(|c| c.name == pk).unwrap_or_default())
}

fn require_column(schema: &TableSchema, column: &str) -> Result<()> {
    if schema.has_column(column) {
        Ok(())
    } else {
        Err(QueryError::InvalidOperation(format!(
            "table '{}' has no column '{}'",
            schema.name, column
        )))
    }
}

/// Compile `plan` over `root`.
///
/// `describe` resolves table schemas; every table touched must have a
/// single-column primary key.
pub fn compile<F>(
    root: &str,
    plan: &JoinPlan,
    options: &StorageOptions,
    by_id: Option<&Value>,
    dialect: SqlDialect,
    mut describe: F,
) -> Result<JoinQuery>
where
    F: FnMut(&str) -> Result<TableSchema>,
{
    let root_schema = describe(root)?;
    let root_pk = primary_key(&root_schema)?;
    let root_pk_name = root_schema.columns[root_pk].name.clone();

    for field in options.filters.iter().map(|f| &f.field).chain(options.sort.iter().map(|s| &s.field)) {
        if !root_schema.has_column(field) {
            return Err(QueryError::InvalidOptions(format!(
                "table '{}' has no column '{}'",
                root, field
            )));
        }
    }

    let mut schemas: Vec<TableSchema> = Vec::with_capacity(plan.len());
    for node in plan.nodes() {
        let op = &node.operation;
        let schema = describe(op.source())?;
        primary_key(&schema)?;
        require_column(&schema, &FLAVOR.storage_name(op.foreign_field()))?;

        let local = FLAVOR.storage_name(&node.local_leaf);
        match node.parent {
            Some(p) => require_column(&schemas[p], &local)?,
            None => require_column(&root_schema, &local)?,
        }

        if let Some(through) = op.as_through() {
            let junction = describe(&through.junction)?;
            primary_key(&junction)?;
            require_column(&junction, &FLAVOR.storage_name(&through.junction_local_field))?;
            require_column(&junction, &FLAVOR.storage_name(&through.junction_foreign_field))?;
        }
        schemas.push(schema);
    }

    // select list and layouts
    let mut select_columns = Vec::new();
    let mut layout_for = |alias: &str, schema: &TableSchema, pk: usize| {
        let offset = select_columns.len();
        for column in &schema.columns {
            select_columns.push(format!(
                "{} AS {}",
                dialect.qualified(alias, &column.name),
                dialect.quote_ident(&format!("{}.{}", alias, column.name))
            ));
        }
        TableLayout {
            alias: alias.to_string(),
            columns: schema.column_names().map(str::to_string).collect(),
            offset,
            pk,
        }
    };
    let root_layout = layout_for(ROOT_ALIAS, &root_schema, root_pk);
    let mut node_layouts = Vec::with_capacity(plan.len());
    for (i, schema) in schemas.iter().enumerate() {
        node_layouts.push(layout_for(&table_alias(i), schema, primary_key(schema)?));
    }

    // root filtering
    let filters = sql_where(&options.filters, dialect, Some(INNER_ROOT_ALIAS), 1);
    let mut params = filters.params;
    let mut conditions = Vec::new();
    if !filters.sql.is_empty() {
        conditions.push(filters.sql);
    }
    if let Some(id) = by_id {
        conditions.push(format!(
            "{} = {}",
            dialect.qualified(INNER_ROOT_ALIAS, &root_pk_name),
            dialect.placeholder(params.len() + 1)
        ));
        params.push(SqlValue::from(id));
    }
    for node in plan.roots().filter(|n| n.operation.is_inner()) {
        conditions.push(exists_clause(plan, node, INNER_ROOT_ALIAS, dialect));
    }
    let where_sql = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let root_table = format!("{} AS {}", dialect.quote_ident(root), dialect.quote_ident(INNER_ROOT_ALIAS));
    let mut subquery = format!(
        "SELECT {}.* FROM {}{}",
        dialect.quote_ident(INNER_ROOT_ALIAS),
        root_table,
        where_sql
    );
    if let Some(page) = options.page {
        subquery.push_str(&format!(
            " ORDER BY {} LIMIT {} OFFSET {}",
            sql_order(options.sort.as_ref(), &root_pk_name, dialect, Some(INNER_ROOT_ALIAS)),
            page.size,
            page.skip()
        ));
    }

    // joins
    let mut joins = String::new();
    for node in plan.nodes() {
        let op = &node.operation;
        let keyword = if plan.inner_from_root(node.index) { "INNER JOIN" } else { "LEFT JOIN" };
        let alias = table_alias(node.index);
        let carrier = node.parent.map(table_alias).unwrap_or_else(|| ROOT_ALIAS.to_string());
        let local = dialect.qualified(&carrier, &FLAVOR.storage_name(&node.local_leaf));
        let foreign = dialect.qualified(&alias, &FLAVOR.storage_name(op.foreign_field()));

        match op.as_through() {
            Some(through) => {
                let link = format!("{}_j", alias);
                joins.push_str(&format!(
                    " {} {} AS {} ON {} = {}",
                    keyword,
                    dialect.quote_ident(&through.junction),
                    dialect.quote_ident(&link),
                    dialect.qualified(&link, &FLAVOR.storage_name(&through.junction_local_field)),
                    local
                ));
                joins.push_str(&format!(
                    " {} {} AS {} ON {} = {}",
                    keyword,
                    dialect.quote_ident(op.source()),
                    dialect.quote_ident(&alias),
                    foreign,
                    dialect.qualified(&link, &FLAVOR.storage_name(&through.junction_foreign_field))
                ));
            }
            None => joins.push_str(&format!(
                " {} {} AS {} ON {} = {}",
                keyword,
                dialect.quote_ident(op.source()),
                dialect.quote_ident(&alias),
                foreign,
                local
            )),
        }
    }

    let mut order = vec![sql_order(options.sort.as_ref(), &root_pk_name, dialect, Some(ROOT_ALIAS))];
    for layout in &node_layouts {
        order.push(format!("{} ASC", dialect.qualified(&layout.alias, &layout.columns[layout.pk])));
    }

    let sql = format!(
        "SELECT {} FROM ({}) AS {}{} ORDER BY {}",
        select_columns.join(", "),
        subquery,
        dialect.quote_ident(ROOT_ALIAS),
        joins,
        order.join(", ")
    );
    let count_sql = format!("SELECT COUNT(*) FROM {}{}", root_table, where_sql);

    Ok(JoinQuery {
        select: Statement::new(sql, params.clone()),
        count: Statement::new(count_sql, params),
        root: root_layout,
        nodes: node_layouts,
    })
}

/// Correlated EXISTS for an inner join and its inner descendants
fn exists_clause(plan: &JoinPlan, node: &PlanNode, carrier: &str, dialect: SqlDialect) -> String {
    let op = &node.operation;
    let alias = format!("e{}", node.index);
    let local = dialect.qualified(carrier, &FLAVOR.storage_name(&node.local_leaf));
    let foreign = dialect.qualified(&alias, &FLAVOR.storage_name(op.foreign_field()));
    let mut conditions = Vec::new();

    let from = match op.as_through() {
        Some(through) => {
            let link = format!("{}_j", alias);
            conditions.push(format!(
                "{} = {}",
                dialect.qualified(&link, &FLAVOR.storage_name(&through.junction_local_field)),
                local
            ));
            format!(
                "{} AS {} JOIN {} AS {} ON {} = {}",
                dialect.quote_ident(&through.junction),
                dialect.quote_ident(&link),
                dialect.quote_ident(op.source()),
                dialect.quote_ident(&alias),
                foreign,
                dialect.qualified(&link, &FLAVOR.storage_name(&through.junction_foreign_field))
            )
        }
        None => {
            conditions.push(format!("{} = {}", foreign, local));
            format!("{} AS {}", dialect.quote_ident(op.source()), dialect.quote_ident(&alias))
        }
    };

    for child in plan.children(node.index).filter(|c| c.operation.is_inner()) {
        conditions.push(exists_clause(plan, child, &alias, dialect));
    }

    format!("EXISTS (SELECT 1 FROM {} WHERE {})", from, conditions.join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::adapter::{ColumnSchema, SortDirection};
    use crate::engine::hybrid::operation::{JoinKind, Operation};
    use crate::engine::hybrid::options::{FilterOp, Page, StorageFilter, StorageSort};
    use serde_json::json;

    fn table(name: &str, columns: &[&str]) -> TableSchema {
        TableSchema {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|c| ColumnSchema {
                    name: c.to_string(),
                    col_type: if *c == "id" { "INTEGER".into() } else { "TEXT".into() },
                    nullable: *c != "id",
                    default_value: None,
                    is_primary_key: *c == "id",
                    is_auto_increment: *c == "id",
                })
                .collect(),
        }
    }

    fn describe(name: &str) -> Result<TableSchema> {
        Ok(match name {
            "orders" => table("orders", &["id", "customer_id", "total"]),
            "customers" => table("customers", &["id", "name"]),
            "clients" => table("clients", &["id", "name"]),
            "policies" => table("policies", &["id", "client_id"]),
            "agents_policies" => table("agents_policies", &["id", "policy_id", "agent_id"]),
            "agents" => table("agents", &["id", "name"]),
            "keyless" => table("keyless", &["name"]),
            other => return Err(QueryError::InvalidOperation(format!("unknown table '{}'", other))),
        })
    }

    fn compile_sqlite(root: &str, ops: &[Operation], options: &StorageOptions) -> Result<JoinQuery> {
        let plan = JoinPlan::resolve(ops)?;
        compile(root, &plan, options, None, SqlDialect::Sqlite, describe)
    }

    #[test]
    fn test_left_one_join() {
        let query = compile_sqlite(
            "orders",
            &[Operation::one_left("customers", "customerId", "id", "customer")],
            &StorageOptions::default(),
        )
        .unwrap();

        assert_eq!(
            query.select.sql,
            concat!(
                r#"SELECT "t0"."id" AS "t0.id", "t0"."customer_id" AS "t0.customer_id", "t0"."total" AS "t0.total", "#,
                r#""t1"."id" AS "t1.id", "t1"."name" AS "t1.name" "#,
                r#"FROM (SELECT "r".* FROM "orders" AS "r") AS "t0" "#,
                r#"LEFT JOIN "customers" AS "t1" ON "t1"."id" = "t0"."customer_id" "#,
                r#"ORDER BY "t0"."id" ASC, "t1"."id" ASC"#
            )
        );
        assert_eq!(query.count.sql, r#"SELECT COUNT(*) FROM "orders" AS "r""#);
        assert_eq!(query.nodes[0].range(), 3..5);
        assert_eq!(query.nodes[0].pk_position(), 3);
    }

    #[test]
    fn test_paging_filters_and_inner_exists() {
        let options = StorageOptions {
            filters: vec![StorageFilter { field: "total".into(), op: FilterOp::Gt, value: json!(10) }],
            sort: Some(StorageSort { field: "total".into(), direction: SortDirection::Desc }),
            page: Some(Page { number: 3, size: 2 }),
        };
        let query = compile_sqlite(
            "orders",
            &[Operation::one_inner("customers", "customerId", "id", "customer")],
            &options,
        )
        .unwrap();

        let expected_where = r#" WHERE "r"."total" > ?1 AND EXISTS (SELECT 1 FROM "customers" AS "e0" WHERE "e0"."id" = "r"."customer_id")"#;
        assert!(query.select.sql.contains(&format!(
            r#"FROM "orders" AS "r"{} ORDER BY "r"."total" DESC, "r"."id" ASC LIMIT 2 OFFSET 4"#,
            expected_where
        )));
        assert!(query.select.sql.contains(r#"INNER JOIN "customers" AS "t1""#));
        assert_eq!(query.count.sql, format!(r#"SELECT COUNT(*) FROM "orders" AS "r"{}"#, expected_where));
        assert_eq!(query.count.params, vec![SqlValue::Integer(10)]);
    }

    #[test]
    fn test_through_join_and_nested_exists() {
        let ops = [
            Operation::many_inner("policies", "id", "clientId", "clientPolicies"),
            Operation::through(
                "agents_policies",
                "policyId",
                "agentId",
                "agents",
                "clientPolicies.id",
                "id",
                "agents",
                JoinKind::Inner,
            ),
        ];
        let query = compile_sqlite("clients", &ops, &StorageOptions::default()).unwrap();

        assert!(query.select.sql.contains(concat!(
            r#"INNER JOIN "agents_policies" AS "t2_j" ON "t2_j"."policy_id" = "t1"."id" "#,
            r#"INNER JOIN "agents" AS "t2" ON "t2"."id" = "t2_j"."agent_id""#
        )));
        assert!(query.select.sql.contains(concat!(
            r#"EXISTS (SELECT 1 FROM "policies" AS "e0" WHERE "e0"."client_id" = "r"."id" AND "#,
            r#"EXISTS (SELECT 1 FROM "agents_policies" AS "e1_j" JOIN "agents" AS "e1" ON "e1"."id" = "e1_j"."agent_id" "#,
            r#"WHERE "e1_j"."policy_id" = "e0"."id"))"#
        )));
        assert!(!query.select.sql.contains(r#""t2_j"."id" AS"#));
    }

    #[test]
    fn test_deep_inner_under_left_stays_left() {
        let ops = [
            Operation::many_left("policies", "id", "clientId", "clientPolicies"),
            Operation::through(
                "agents_policies",
                "policyId",
                "agentId",
                "agents",
                "clientPolicies.id",
                "id",
                "agents",
                JoinKind::Inner,
            ),
        ];
        let query = compile_sqlite("clients", &ops, &StorageOptions::default()).unwrap();
        assert!(!query.select.sql.contains("INNER JOIN"));
        assert!(!query.select.sql.contains("EXISTS"));
    }

    #[test]
    fn test_by_id_parameter() {
        let plan = JoinPlan::resolve(&[]).unwrap();
        let query = compile("orders", &plan, &StorageOptions::default(), Some(&json!(7)), SqlDialect::Postgres, describe)
            .unwrap();
        assert!(query.select.sql.contains(r#"WHERE "r"."id" = $1"#));
        assert_eq!(query.select.params, vec![SqlValue::Integer(7)]);
    }

    #[test]
    fn test_configuration_errors() {
        let missing_column = compile_sqlite(
            "orders",
            &[Operation::one_left("customers", "buyerId", "id", "customer")],
            &StorageOptions::default(),
        );
        assert!(matches!(missing_column, Err(QueryError::InvalidOperation(_))));

        let keyless = compile_sqlite(
            "orders",
            &[Operation::one_left("keyless", "customerId", "name", "k")],
            &StorageOptions::default(),
        );
        assert!(matches!(keyless, Err(QueryError::InvalidOperation(_))));

        let bad_sort = StorageOptions {
            sort: Some(StorageSort { field: "nope".into(), direction: SortDirection::Asc }),
            ..Default::default()
        };
        assert!(matches!(compile_sqlite("orders", &[], &bad_sort), Err(QueryError::InvalidOptions(_))));
    }
}
