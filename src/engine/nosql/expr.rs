//! Aggregation expressions
//!
//! Expressions are evaluated against a single document and yield `None` when
//! the result is *missing* (an absent field or `$$REMOVE`), which is distinct
//! from an explicit `null`.

use serde_json::{Map, Value};
use std::cmp::Ordering;

use super::document::{as_date_millis, as_oid};
use super::error::{NoSqlError, Result};
use super::query::{compare_values, values_equal};

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// `"$a.b"`
    Field(String),
    /// `"$$ROOT"`
    Root,
    /// `"$$REMOVE"`
    Remove,
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Size(Box<Expr>),
    IfNull(Vec<Expr>),
    Type(Box<Expr>),
    ArrayElemAt(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Expr {
    pub fn parse(value: &Value) -> Result<Expr> {
        match value {
            Value::String(s) if s == "$$ROOT" || s == "$$CURRENT" => Ok(Expr::Root),
            Value::String(s) if s == "$$REMOVE" => Ok(Expr::Remove),
            Value::String(s) if s.starts_with("$$") => {
                Err(NoSqlError::InvalidPipeline(format!("unknown variable: {}", s)))
            }
            Value::String(s) if s.starts_with('$') => Ok(Expr::Field(s[1..].to_string())),
            Value::Array(items) => Ok(Expr::Array(items.iter().map(Expr::parse).collect::<Result<_>>()?)),
            Value::Object(map) => parse_object(map, value),
            other => Ok(Expr::Literal(other.clone())),
        }
    }

    /// Evaluate against `doc`; `None` means missing
    pub fn eval(&self, doc: &Value) -> Result<Option<Value>> {
        Ok(match self {
            Expr::Literal(v) => Some(v.clone()),
            Expr::Field(path) => resolve_field(doc, path),
            Expr::Root => Some(doc.clone()),
            Expr::Remove => None,
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.eval(doc)?.unwrap_or(Value::Null));
                }
                Some(Value::Array(out))
            }
            Expr::Object(fields) => {
                let mut out = Map::new();
                for (key, expr) in fields {
                    if let Some(v) = expr.eval(doc)? {
                        out.insert(key.clone(), v);
                    }
                }
                Some(Value::Object(out))
            }
            Expr::Cond(test, then, otherwise) => {
                if is_truthy(test.eval(doc)?.as_ref()) {
                    then.eval(doc)?
                } else {
                    otherwise.eval(doc)?
                }
            }
            Expr::Compare(op, left, right) => {
                let l = left.eval(doc)?.unwrap_or(Value::Null);
                let r = right.eval(doc)?.unwrap_or(Value::Null);
                Some(Value::Bool(op.apply(&l, &r)))
            }
            Expr::And(items) => {
                for item in items {
                    if !is_truthy(item.eval(doc)?.as_ref()) {
                        return Ok(Some(Value::Bool(false)));
                    }
                }
                Some(Value::Bool(true))
            }
            Expr::Or(items) => {
                for item in items {
                    if is_truthy(item.eval(doc)?.as_ref()) {
                        return Ok(Some(Value::Bool(true)));
                    }
                }
                Some(Value::Bool(false))
            }
            Expr::Not(inner) => Some(Value::Bool(!is_truthy(inner.eval(doc)?.as_ref()))),
            Expr::Size(inner) => match inner.eval(doc)? {
                Some(Value::Array(items)) => Some(Value::from(items.len() as i64)),
                other => {
                    return Err(NoSqlError::Query(format!(
                        "$size expects an array, got {}",
                        type_name(other.as_ref())
                    )))
                }
            },
            Expr::IfNull(items) => {
                let Some((fallback, candidates)) = items.split_last() else {
                    return Ok(None);
                };
                for candidate in candidates {
                    match candidate.eval(doc)? {
                        Some(Value::Null) | None => continue,
                        found => return Ok(found),
                    }
                }
                fallback.eval(doc)?
            }
            Expr::Type(inner) => Some(Value::String(type_name(inner.eval(doc)?.as_ref()).to_string())),
            Expr::ArrayElemAt(array, index) => {
                let items = match array.eval(doc)? {
                    Some(Value::Array(items)) => items,
                    Some(Value::Null) | None => return Ok(None),
                    other => {
                        return Err(NoSqlError::Query(format!(
                            "$arrayElemAt expects an array, got {}",
                            type_name(other.as_ref())
                        )))
                    }
                };
                let index = index
                    .eval(doc)?
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| NoSqlError::Query("$arrayElemAt expects an integer index".to_string()))?;
                let position = if index < 0 { items.len() as i64 + index } else { index };
                usize::try_from(position).ok().and_then(|i| items.get(i).cloned())
            }
        })
    }
}

impl CompareOp {
    fn apply(self, left: &Value, right: &Value) -> bool {
        match self {
            CompareOp::Eq => values_equal(left, right),
            CompareOp::Ne => !values_equal(left, right),
            CompareOp::Gt => compare_values(left, right) == Ordering::Greater,
            CompareOp::Gte => compare_values(left, right) != Ordering::Less,
            CompareOp::Lt => compare_values(left, right) == Ordering::Less,
            CompareOp::Lte => compare_values(left, right) != Ordering::Greater,
        }
    }
}

fn parse_object(map: &Map<String, Value>, whole: &Value) -> Result<Expr> {
    let operator = map.keys().next().filter(|k| k.starts_with('$'));
    let Some(operator) = operator else {
        let fields = map
            .iter()
            .map(|(k, v)| Ok((k.clone(), Expr::parse(v)?)))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Expr::Object(fields));
    };

    if map.len() != 1 {
        return Err(NoSqlError::InvalidPipeline(format!(
            "expression object must have exactly one operator: {}",
            whole
        )));
    }
    // extended JSON values are literals
    if as_oid(whole).is_some() || as_date_millis(whole).is_some() {
        return Ok(Expr::Literal(whole.clone()));
    }

    let operand = &map[operator];
    let args = || -> Result<Vec<Expr>> {
        match operand {
            Value::Array(items) => items.iter().map(Expr::parse).collect(),
            single => Ok(vec![Expr::parse(single)?]),
        }
    };
    let exact = |n: usize| -> Result<Vec<Expr>> {
        let parsed = args()?;
        if parsed.len() != n {
            return Err(NoSqlError::InvalidPipeline(format!("{} expects {} arguments", operator, n)));
        }
        Ok(parsed)
    };

    let compare = |op: CompareOp| -> Result<Expr> {
        let mut parsed = exact(2)?;
        let right = parsed.pop().map(Box::new);
        let left = parsed.pop().map(Box::new);
        match (left, right) {
            (Some(l), Some(r)) => Ok(Expr::Compare(op, l, r)),
            _ => Err(NoSqlError::InvalidPipeline(format!("{} expects 2 arguments", operator))),
        }
    };

    match operator.as_str() {
        "$literal" => Ok(Expr::Literal(operand.clone())),
        "$eq" => compare(CompareOp::Eq),
        "$ne" => compare(CompareOp::Ne),
        "$gt" => compare(CompareOp::Gt),
        "$gte" => compare(CompareOp::Gte),
        "$lt" => compare(CompareOp::Lt),
        "$lte" => compare(CompareOp::Lte),
        "$and" => Ok(Expr::And(args()?)),
        "$or" => Ok(Expr::Or(args()?)),
        "$not" => Ok(Expr::Not(Box::new(single(exact(1)?)?))),
        "$size" => Ok(Expr::Size(Box::new(single(exact(1)?)?))),
        "$type" => Ok(Expr::Type(Box::new(single(exact(1)?)?))),
        "$ifNull" => {
            let parsed = args()?;
            if parsed.len() < 2 {
                return Err(NoSqlError::InvalidPipeline("$ifNull expects at least 2 arguments".to_string()));
            }
            Ok(Expr::IfNull(parsed))
        }
        "$arrayElemAt" => {
            let mut parsed = exact(2)?.into_iter();
            match (parsed.next(), parsed.next()) {
                (Some(array), Some(index)) => Ok(Expr::ArrayElemAt(Box::new(array), Box::new(index))),
                _ => Err(NoSqlError::InvalidPipeline("$arrayElemAt expects 2 arguments".to_string())),
            }
        }
        "$cond" => parse_cond(operand),
        other => Err(NoSqlError::InvalidPipeline(format!("unknown expression operator: {}", other))),
    }
}

fn single(mut parsed: Vec<Expr>) -> Result<Expr> {
    parsed
        .pop()
        .ok_or_else(|| NoSqlError::InvalidPipeline("missing expression argument".to_string()))
}

fn parse_cond(operand: &Value) -> Result<Expr> {
    let (test, then, otherwise) = match operand {
        Value::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
        Value::Object(map) => match (map.get("if"), map.get("then"), map.get("else")) {
            (Some(i), Some(t), Some(e)) => (i, t, e),
            _ => return Err(NoSqlError::InvalidPipeline("$cond requires if/then/else".to_string())),
        },
        _ => return Err(NoSqlError::InvalidPipeline("$cond expects 3 arguments".to_string())),
    };
    Ok(Expr::Cond(
        Box::new(Expr::parse(test)?),
        Box::new(Expr::parse(then)?),
        Box::new(Expr::parse(otherwise)?),
    ))
}

/// Resolve a field path; arrays along the path are mapped element-wise
fn resolve_field(doc: &Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    resolve_segments(doc, &segments)
}

fn resolve_segments(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => map.get(*head).and_then(|child| resolve_segments(child, rest)),
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(|item| resolve_segments(item, segments)).collect(),
        )),
        _ => None,
    }
}

/// Truthiness: false, null, missing and zero are false
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(_) => true,
    }
}

/// `$type` name of a value
pub fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None => "missing",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "bool",
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) if i32::try_from(i).is_ok() => "int",
            Some(_) => "long",
            None => "double",
        },
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(v @ Value::Object(_)) if as_oid(v).is_some() => "objectId",
        Some(v @ Value::Object(_)) if as_date_millis(v).is_some() => "date",
        Some(Value::Object(_)) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: Value, doc: Value) -> Option<Value> {
        Expr::parse(&expr).unwrap().eval(&doc).unwrap()
    }

    #[test]
    fn test_field_and_variables() {
        let doc = json!({"a": {"b": 1}, "list": [{"x": 1}, {"x": 2}]});
        assert_eq!(eval(json!("$a.b"), doc.clone()), Some(json!(1)));
        assert_eq!(eval(json!("$missing"), doc.clone()), None);
        assert_eq!(eval(json!("$list.x"), doc.clone()), Some(json!([1, 2])));
        assert_eq!(eval(json!("$$REMOVE"), doc.clone()), None);
        assert_eq!(eval(json!("$$ROOT"), doc.clone()), Some(doc));
    }

    #[test]
    fn test_type_and_cond() {
        let doc = json!({"o": {"k": 1}, "n": null});
        assert_eq!(eval(json!({"$type": "$o"}), doc.clone()), Some(json!("object")));
        assert_eq!(eval(json!({"$type": "$n"}), doc.clone()), Some(json!("null")));
        assert_eq!(eval(json!({"$type": "$nope"}), doc.clone()), Some(json!("missing")));

        let guarded = json!({"$cond": [{"$eq": [{"$type": "$o"}, "object"]}, "$o.k", "$$REMOVE"]});
        assert_eq!(eval(guarded, doc.clone()), Some(json!(1)));

        let removed = json!({"$cond": [{"$eq": [{"$type": "$n"}, "object"]}, 1, "$$REMOVE"]});
        assert_eq!(eval(removed, doc), None);
    }

    #[test]
    fn test_array_helpers() {
        let doc = json!({"items": [10, 20, 30]});
        assert_eq!(eval(json!({"$size": "$items"}), doc.clone()), Some(json!(3)));
        assert_eq!(eval(json!({"$arrayElemAt": ["$items", 0]}), doc.clone()), Some(json!(10)));
        assert_eq!(eval(json!({"$arrayElemAt": ["$items", -1]}), doc.clone()), Some(json!(30)));
        assert_eq!(eval(json!({"$arrayElemAt": ["$items", 9]}), doc.clone()), None);
        assert_eq!(
            eval(json!({"$size": {"$ifNull": ["$nothing", []]}}), doc),
            Some(json!(0))
        );
    }

    #[test]
    fn test_size_of_non_array_is_an_error() {
        let expr = Expr::parse(&json!({"$size": "$x"})).unwrap();
        assert!(expr.eval(&json!({"x": 1})).is_err());
    }

    #[test]
    fn test_logic() {
        let doc = json!({"a": 1, "b": 0});
        assert_eq!(eval(json!({"$and": ["$a", {"$gt": ["$a", "$b"]}]}), doc.clone()), Some(json!(true)));
        assert_eq!(eval(json!({"$or": ["$b", "$missing"]}), doc.clone()), Some(json!(false)));
        assert_eq!(eval(json!({"$not": ["$b"]}), doc), Some(json!(true)));
    }
}
