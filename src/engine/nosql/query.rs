//! Query engine for NoSQL documents
//!
//! Filters are expressed as query documents in the familiar
//! `{"field": {"$op": value}}` shape and evaluated against the JSON view of a
//! document (see [`Document::to_json`](super::Document::to_json)).

use serde_json::{Map, Value};
use std::cmp::Ordering;

use super::document::{as_date_millis, as_oid};
use super::error::{NoSqlError, Result};
use super::expr::{is_truthy, Expr};

/// Field-level filter operators
#[derive(Debug, Clone)]
pub enum FilterOp {
    /// Equality
    Eq(Value),
    /// Not equal
    Ne(Value),
    /// Greater than
    Gt(Value),
    /// Greater than or equal
    Gte(Value),
    /// Less than
    Lt(Value),
    /// Less than or equal
    Lte(Value),
    /// In array of values
    In(Vec<Value>),
    /// Not in array of values
    NotIn(Vec<Value>),
    /// Field exists
    Exists(bool),
}

/// A parsed query document
#[derive(Debug, Clone)]
pub enum Filter {
    /// Every clause must match
    And(Vec<Filter>),
    /// At least one clause must match
    Or(Vec<Filter>),
    /// Operators applied to the values found at a dotted path
    Field { path: String, ops: Vec<FilterOp> },
    /// Aggregation expression evaluated against the whole document
    Expr(Expr),
}

impl Filter {
    /// Filter matching every document
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Field { path: field.to_string(), ops: vec![FilterOp::Eq(value.into())] }
    }

    /// Parse a query document
    pub fn parse(query: &Value) -> Result<Self> {
        let obj = query
            .as_object()
            .ok_or_else(|| NoSqlError::Query("query must be an object".to_string()))?;

        let mut clauses = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            let clause = match key.as_str() {
                "$and" => Filter::And(parse_clause_list(key, value)?),
                "$or" => Filter::Or(parse_clause_list(key, value)?),
                "$expr" => Filter::Expr(Expr::parse(value)?),
                other if other.starts_with('$') => {
                    return Err(NoSqlError::Query(format!("unknown top-level operator: {}", other)))
                }
                path => Filter::Field { path: path.to_string(), ops: parse_field_ops(value)? },
            };
            clauses.push(clause);
        }

        Ok(match clauses.len() {
            1 => clauses.remove(0),
            _ => Filter::And(clauses),
        })
    }

    /// Check if a document matches this filter
    pub fn matches(&self, doc: &Value) -> Result<bool> {
        match self {
            Filter::And(clauses) => {
                for clause in clauses {
                    if !clause.matches(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Or(clauses) => {
                for clause in clauses {
                    if clause.matches(doc)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Field { path, ops } => {
                let candidates = collect_path_values(doc, path);
                Ok(ops.iter().all(|op| op_matches(op, &candidates)))
            }
            Filter::Expr(expr) => Ok(is_truthy(expr.eval(doc)?.as_ref())),
        }
    }
}

fn parse_clause_list(key: &str, value: &Value) -> Result<Vec<Filter>> {
    value
        .as_array()
        .ok_or_else(|| NoSqlError::Query(format!("{} expects an array", key)))?
        .iter()
        .map(Filter::parse)
        .collect()
}

fn parse_field_ops(value: &Value) -> Result<Vec<FilterOp>> {
    let operators = match value {
        Value::Object(map) if map.keys().next().is_some_and(|k| k.starts_with('$')) => map,
        _ => return Ok(vec![FilterOp::Eq(value.clone())]),
    };

    // {"$oid": ..} and {"$date": ..} are values, not operators
    if as_oid(value).is_some() || as_date_millis(value).is_some() {
        return Ok(vec![FilterOp::Eq(value.clone())]);
    }

    operators
        .iter()
        .map(|(op, operand)| {
            Ok(match op.as_str() {
                "$eq" => FilterOp::Eq(operand.clone()),
                "$ne" => FilterOp::Ne(operand.clone()),
                "$gt" => FilterOp::Gt(operand.clone()),
                "$gte" => FilterOp::Gte(operand.clone()),
                "$lt" => FilterOp::Lt(operand.clone()),
                "$lte" => FilterOp::Lte(operand.clone()),
                "$in" => FilterOp::In(expect_array(op, operand)?),
                "$nin" => FilterOp::NotIn(expect_array(op, operand)?),
                "$exists" => FilterOp::Exists(is_truthy(Some(operand))),
                other => return Err(NoSqlError::Query(format!("unknown operator: {}", other))),
            })
        })
        .collect()
}

fn expect_array(op: &str, operand: &Value) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| NoSqlError::Query(format!("{} expects an array", op)))
}

fn op_matches(op: &FilterOp, candidates: &[Value]) -> bool {
    match op {
        FilterOp::Exists(should_exist) => candidates.is_empty() != *should_exist,
        FilterOp::Eq(expected) => equals_any(candidates, expected),
        FilterOp::Ne(expected) => !equals_any(candidates, expected),
        FilterOp::In(values) => values.iter().any(|v| equals_any(candidates, v)),
        FilterOp::NotIn(values) => !values.iter().any(|v| equals_any(candidates, v)),
        FilterOp::Gt(expected) => compares(candidates, expected, |o| o == Ordering::Greater),
        FilterOp::Gte(expected) => compares(candidates, expected, |o| o != Ordering::Less),
        FilterOp::Lt(expected) => compares(candidates, expected, |o| o == Ordering::Less),
        FilterOp::Lte(expected) => compares(candidates, expected, |o| o != Ordering::Greater),
    }
}

/// Missing fields compare equal to null
fn equals_any(candidates: &[Value], expected: &Value) -> bool {
    if candidates.is_empty() {
        return expected.is_null();
    }
    candidates.iter().any(|c| values_equal(c, expected))
}

/// Range comparisons only match values of the same type bracket
fn compares(candidates: &[Value], expected: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    candidates.iter().any(|c| {
        !c.is_null() && type_rank(c) == type_rank(expected) && accept(compare_values(c, expected))
    })
}

/// Collect every value reachable at a dotted path.
///
/// Arrays met along the way are traversed element-wise, and a terminal array
/// contributes both itself and its elements. Numeric segments index arrays.
pub fn collect_path_values(doc: &Value, path: &str) -> Vec<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    collect_into(doc, &segments, &mut out);
    out
}

fn collect_into(value: &Value, segments: &[&str], out: &mut Vec<Value>) {
    let Some((head, rest)) = segments.split_first() else {
        if let Value::Array(items) = value {
            out.push(value.clone());
            out.extend(items.iter().cloned());
        } else {
            out.push(value.clone());
        }
        return;
    };

    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                collect_into(child, rest, out);
            }
        }
        Value::Array(items) => match head.parse::<usize>() {
            Ok(index) => {
                if let Some(child) = items.get(index) {
                    collect_into(child, rest, out);
                }
            }
            Err(_) => {
                for item in items.iter().filter(|item| item.is_object()) {
                    collect_into(item, segments, out);
                }
            }
        },
        _ => {}
    }
}

/// Resolve a dotted path through nested objects only
pub fn resolve_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Set a dotted path, creating intermediate objects as needed
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else { return };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map.entry(segment.to_string()).or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove a dotted path if every parent exists
pub fn unset_path(doc: &mut Value, path: &str) {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (resolve_path_mut(doc, parent), leaf),
        None => (Some(doc), path),
    };
    if let Some(Value::Object(map)) = parent {
        map.remove(leaf);
    }
}

fn resolve_path_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get_mut(segment),
        _ => None,
    })
}

/// Structural equality with numeric comparison by value
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Canonical string for hashing values that compare equal
pub fn canonical_key(value: &Value) -> String {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_key).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let parts: Vec<String> =
                map.iter().map(|(k, v)| format!("{:?}:{}", k, canonical_key(v))).collect();
            format!("{{{}}}", parts.join(","))
        }
        other => other.to_string(),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) if as_oid(value).is_some() => 5,
        Value::Object(_) if as_date_millis(value).is_some() => 7,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 6,
    }
}

/// Total order over JSON values, grouping by type bracket first
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(l, r)| compare_values(l, r))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(_), Value::Object(_)) => {
            if let (Some(x), Some(y)) = (as_oid(a), as_oid(b)) {
                return x.cmp(y);
            }
            if let (Some(x), Some(y)) = (as_date_millis(a), as_date_millis(b)) {
                return x.cmp(&y);
            }
            canonical_key(a).cmp(&canonical_key(b))
        }
        _ => Ordering::Equal,
    }
}

/// Sort direction for [`Query`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn from_i64(direction: i64) -> Self {
        if direction < 0 { SortOrder::Desc } else { SortOrder::Asc }
    }
}

/// Sort documents by several keys; missing fields sort as null
pub fn sort_documents(docs: &mut [Value], keys: &[(String, SortOrder)]) {
    docs.sort_by(|a, b| {
        for (path, order) in keys {
            let left = resolve_path(a, path).unwrap_or(&Value::Null);
            let right = resolve_path(b, path).unwrap_or(&Value::Null);
            let ordering = compare_values(left, right);
            if ordering != Ordering::Equal {
                return if *order == SortOrder::Desc { ordering.reverse() } else { ordering };
            }
        }
        Ordering::Equal
    });
}

/// Query with a filter and paging options
#[derive(Debug, Clone)]
pub struct Query {
    pub filter: Filter,
    pub sort: Vec<(String, SortOrder)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

impl Query {
    pub fn new() -> Self {
        Self { filter: Filter::all(), sort: Vec::new(), skip: 0, limit: None }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sort(mut self, field: &str, order: SortOrder) -> Self {
        self.sort.push((field.to_string(), order));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Execute query on a list of document views
    pub fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            if self.filter.matches(&doc)? {
                results.push(doc);
            }
        }

        if !self.sort.is_empty() {
            sort_documents(&mut results, &self.sort);
        }

        let results = results.into_iter().skip(self.skip);
        Ok(match self.limit {
            Some(n) => results.take(n).collect(),
            None => results.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(query: Value, doc: Value) -> bool {
        Filter::parse(&query).unwrap().matches(&doc).unwrap()
    }

    #[test]
    fn test_filter_eq() {
        let doc = json!({"name": "Alice", "age": 30});

        assert!(matches(json!({"name": "Alice"}), doc.clone()));
        assert!(!matches(json!({"name": "Bob"}), doc.clone()));
        assert!(matches(json!({"age": {"$eq": 30.0}}), doc));
    }

    #[test]
    fn test_range_and_membership() {
        let doc = json!({"age": 30, "tags": ["a", "b"]});

        assert!(matches(json!({"age": {"$gte": 30, "$lt": 31}}), doc.clone()));
        assert!(!matches(json!({"age": {"$gt": "29"}}), doc.clone()));
        assert!(matches(json!({"tags": {"$in": ["b", "z"]}}), doc.clone()));
        assert!(matches(json!({"tags": {"$nin": ["z"]}}), doc.clone()));
        assert!(matches(json!({"tags.0": {"$exists": true}}), doc.clone()));
        assert!(!matches(json!({"tags.5": {"$exists": true}}), doc));
    }

    #[test]
    fn test_missing_fields() {
        let doc = json!({"name": "Alice"});

        assert!(matches(json!({"email": null}), doc.clone()));
        assert!(matches(json!({"email": {"$ne": "x"}}), doc.clone()));
        assert!(!matches(json!({"email": {"$gt": ""}}), doc));
    }

    #[test]
    fn test_oid_values_are_not_operators() {
        let doc = json!({"_id": {"$oid": "01"}, "customerId": {"$oid": "02"}});

        assert!(matches(json!({"customerId": {"$oid": "02"}}), doc.clone()));
        assert!(matches(json!({"_id": {"$in": [{"$oid": "01"}]}}), doc));
    }

    #[test]
    fn test_path_helpers() {
        let mut doc = json!({"a": {"b": 1}});
        set_path(&mut doc, "a.c.d", json!(2));
        assert_eq!(doc, json!({"a": {"b": 1, "c": {"d": 2}}}));

        unset_path(&mut doc, "a.b");
        unset_path(&mut doc, "x.y");
        assert_eq!(doc, json!({"a": {"c": {"d": 2}}}));

        let nested = json!({"items": [{"id": 1}, {"id": 2}, {"other": 3}]});
        assert_eq!(collect_path_values(&nested, "items.id"), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_query_execution() {
        let docs = vec![
            json!({"name": "Alice", "age": 30}),
            json!({"name": "Bob", "age": 25}),
            json!({"name": "Charlie", "age": 35}),
        ];

        let results = Query::new()
            .filter(Filter::parse(&json!({"age": {"$gte": 30}})).unwrap())
            .sort("age", SortOrder::Desc)
            .limit(1)
            .execute(docs)
            .unwrap();

        assert_eq!(results, vec![json!({"name": "Charlie", "age": 35})]);
    }
}
