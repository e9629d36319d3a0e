//! Aggregation pipelines
//!
//! A pipeline is an array of single-key stage documents (`$match`, `$lookup`,
//! `$unwind`, `$group`, `$set`, `$unset`, `$replaceRoot`, `$sort`, `$skip`,
//! `$limit`, `$count`, `$facet`). Stages run in order over the JSON view of
//! the documents of one collection.

use serde_json::{Map, Value};
use std::collections::HashMap;

use super::error::{NoSqlError, Result};
use super::expr::Expr;
use super::query::{
    canonical_key, collect_path_values, resolve_path, set_path, sort_documents, unset_path, Filter,
    SortOrder,
};

#[derive(Debug, Clone)]
enum Accumulator {
    First(Expr),
    Last(Expr),
    Push(Expr),
    Sum(Expr),
}

#[derive(Debug, Clone)]
enum Stage {
    Match(Filter),
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    Unwind {
        path: String,
        include_array_index: Option<String>,
        preserve_null_and_empty: bool,
    },
    Group {
        key: Expr,
        accumulators: Vec<(String, Accumulator)>,
    },
    Set(Vec<(String, Expr)>),
    Unset(Vec<String>),
    ReplaceRoot(Expr),
    Sort(Vec<(String, SortOrder)>),
    Skip(usize),
    Limit(usize),
    Count(String),
    Facet(Vec<(String, Pipeline)>),
}

/// A parsed aggregation pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn parse(stages: &[Value]) -> Result<Self> {
        let stages = stages.iter().map(parse_stage).collect::<Result<Vec<_>>>()?;
        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the pipeline. `load` returns every document of a foreign
    /// collection, or an empty list when it does not exist.
    pub fn execute<F>(&self, docs: Vec<Value>, load: &F) -> Result<Vec<Value>>
    where
        F: Fn(&str) -> Result<Vec<Value>>,
    {
        let mut current = docs;
        for stage in &self.stages {
            current = match stage {
                Stage::Match(filter) => exec_match(current, filter)?,
                Stage::Lookup { from, local_field, foreign_field, as_field } => {
                    exec_lookup(current, &load(from)?, local_field, foreign_field, as_field)
                }
                Stage::Unwind { path, include_array_index, preserve_null_and_empty } => {
                    exec_unwind(current, path, include_array_index.as_deref(), *preserve_null_and_empty)
                }
                Stage::Group { key, accumulators } => exec_group(current, key, accumulators)?,
                Stage::Set(fields) => exec_set(current, fields)?,
                Stage::Unset(paths) => current
                    .into_iter()
                    .map(|mut doc| {
                        for path in paths {
                            unset_path(&mut doc, path);
                        }
                        doc
                    })
                    .collect(),
                Stage::ReplaceRoot(expr) => exec_replace_root(current, expr)?,
                Stage::Sort(keys) => {
                    sort_documents(&mut current, keys);
                    current
                }
                Stage::Skip(n) => current.into_iter().skip(*n).collect(),
                Stage::Limit(n) => current.into_iter().take(*n).collect(),
                Stage::Count(field) => {
                    if current.is_empty() {
                        Vec::new()
                    } else {
                        let mut out = Map::new();
                        out.insert(field.clone(), Value::from(current.len() as u64));
                        vec![Value::Object(out)]
                    }
                }
                Stage::Facet(facets) => {
                    let mut out = Map::new();
                    for (name, pipeline) in facets {
                        let result = pipeline.execute(current.clone(), load)?;
                        out.insert(name.clone(), Value::Array(result));
                    }
                    vec![Value::Object(out)]
                }
            };
        }
        Ok(current)
    }
}

fn invalid(message: impl Into<String>) -> NoSqlError {
    NoSqlError::InvalidPipeline(message.into())
}

fn parse_stage(stage: &Value) -> Result<Stage> {
    let obj = stage
        .as_object()
        .ok_or_else(|| invalid("each pipeline stage must be an object"))?;
    let mut entries = obj.iter();
    let (name, body) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => return Err(invalid("each pipeline stage must have exactly one key")),
    };

    Ok(match name.as_str() {
        "$match" => Stage::Match(Filter::parse(body)?),
        "$lookup" => {
            let field = |key: &str| -> Result<String> {
                body.get(key)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| invalid(format!("$lookup requires '{}' string", key)))
            };
            Stage::Lookup {
                from: field("from")?,
                local_field: field("localField")?,
                foreign_field: field("foreignField")?,
                as_field: field("as")?,
            }
        }
        "$unwind" => parse_unwind(body)?,
        "$group" => parse_group(body)?,
        "$set" | "$addFields" => {
            let fields = body
                .as_object()
                .ok_or_else(|| invalid(format!("{} must be an object", name)))?
                .iter()
                .map(|(k, v)| Ok((k.clone(), Expr::parse(v)?)))
                .collect::<Result<Vec<_>>>()?;
            Stage::Set(fields)
        }
        "$unset" => Stage::Unset(match body {
            Value::String(path) => vec![path.clone()],
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or_else(|| invalid("$unset expects field names")))
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(invalid("$unset expects a string or an array")),
        }),
        "$replaceRoot" => {
            let root = body
                .get("newRoot")
                .ok_or_else(|| invalid("$replaceRoot requires 'newRoot'"))?;
            Stage::ReplaceRoot(Expr::parse(root)?)
        }
        "$sort" => {
            let keys = body
                .as_object()
                .ok_or_else(|| invalid("$sort must be an object"))?
                .iter()
                .map(|(k, v)| match v.as_i64() {
                    Some(direction @ (1 | -1)) => Ok((k.clone(), SortOrder::from_i64(direction))),
                    _ => Err(invalid(format!("$sort direction for '{}' must be 1 or -1", k))),
                })
                .collect::<Result<Vec<_>>>()?;
            Stage::Sort(keys)
        }
        "$skip" => Stage::Skip(
            body.as_u64()
                .ok_or_else(|| invalid("$skip must be a non-negative integer"))? as usize,
        ),
        "$limit" => Stage::Limit(
            body.as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| invalid("$limit must be a positive integer"))? as usize,
        ),
        "$count" => Stage::Count(
            body.as_str()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| invalid("$count must be a non-empty string"))?
                .to_string(),
        ),
        "$facet" => {
            let facets = body
                .as_object()
                .ok_or_else(|| invalid("$facet must be an object"))?
                .iter()
                .map(|(name, stages)| {
                    let stages = stages
                        .as_array()
                        .ok_or_else(|| invalid(format!("facet '{}' must be an array", name)))?;
                    Ok((name.clone(), Pipeline::parse(stages)?))
                })
                .collect::<Result<Vec<_>>>()?;
            Stage::Facet(facets)
        }
        other => return Err(invalid(format!("unknown stage: {}", other))),
    })
}

fn strip_dollar(path: &str) -> Result<String> {
    path.strip_prefix('$')
        .filter(|p| !p.is_empty() && !p.starts_with('$'))
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("expected a field path, got '{}'", path)))
}

fn parse_unwind(body: &Value) -> Result<Stage> {
    match body {
        Value::String(path) => Ok(Stage::Unwind {
            path: strip_dollar(path)?,
            include_array_index: None,
            preserve_null_and_empty: false,
        }),
        Value::Object(obj) => {
            let path = obj
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("$unwind requires 'path'"))?;
            let include_array_index = match obj.get("includeArrayIndex") {
                None => None,
                Some(Value::String(name)) if !name.starts_with('$') => Some(name.clone()),
                Some(_) => return Err(invalid("includeArrayIndex must be a field name")),
            };
            Ok(Stage::Unwind {
                path: strip_dollar(path)?,
                include_array_index,
                preserve_null_and_empty: obj
                    .get("preserveNullAndEmptyArrays")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        }
        _ => Err(invalid("$unwind expects a path or an object")),
    }
}

fn parse_group(body: &Value) -> Result<Stage> {
    let obj = body.as_object().ok_or_else(|| invalid("$group must be an object"))?;
    let key = obj.get("_id").ok_or_else(|| invalid("$group requires '_id'"))?;
    let key = Expr::parse(key)?;

    let mut accumulators = Vec::new();
    for (name, spec) in obj.iter().filter(|(k, _)| k.as_str() != "_id") {
        let spec = spec
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| invalid(format!("accumulator '{}' must have one operator", name)))?;
        let (op, operand) = spec
            .iter()
            .next()
            .ok_or_else(|| invalid(format!("accumulator '{}' is empty", name)))?;
        let operand = Expr::parse(operand)?;
        let accumulator = match op.as_str() {
            "$first" => Accumulator::First(operand),
            "$last" => Accumulator::Last(operand),
            "$push" => Accumulator::Push(operand),
            "$sum" => Accumulator::Sum(operand),
            other => return Err(invalid(format!("unknown accumulator: {}", other))),
        };
        accumulators.push((name.clone(), accumulator));
    }

    Ok(Stage::Group { key, accumulators })
}

fn exec_match(docs: Vec<Value>, filter: &Filter) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        if filter.matches(&doc)? {
            out.push(doc);
        }
    }
    Ok(out)
}

/// Equality lookup. Null and missing local values never match anything.
fn exec_lookup(
    docs: Vec<Value>,
    foreign: &[Value],
    local_field: &str,
    foreign_field: &str,
    as_field: &str,
) -> Vec<Value> {
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (position, doc) in foreign.iter().enumerate() {
        let mut keys: Vec<String> = collect_path_values(doc, foreign_field)
            .iter()
            .filter(|v| !v.is_null())
            .map(canonical_key)
            .collect();
        keys.dedup();
        for key in keys {
            index.entry(key).or_default().push(position);
        }
    }

    docs.into_iter()
        .map(|mut doc| {
            let mut positions: Vec<usize> = collect_path_values(&doc, local_field)
                .iter()
                .filter(|v| !v.is_null())
                .filter_map(|v| index.get(&canonical_key(v)))
                .flatten()
                .copied()
                .collect();
            positions.sort_unstable();
            positions.dedup();

            let matched = positions.into_iter().map(|p| foreign[p].clone()).collect();
            set_path(&mut doc, as_field, Value::Array(matched));
            doc
        })
        .collect()
}

fn exec_unwind(
    docs: Vec<Value>,
    path: &str,
    include_array_index: Option<&str>,
    preserve: bool,
) -> Vec<Value> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match resolve_path(&doc, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for (i, item) in items.into_iter().enumerate() {
                    let mut copy = doc.clone();
                    set_path(&mut copy, path, item);
                    if let Some(field) = include_array_index {
                        set_path(&mut copy, field, Value::from(i as u64));
                    }
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    let mut copy = doc;
                    if matches!(resolve_path(&copy, path), Some(Value::Array(_))) {
                        unset_path(&mut copy, path);
                    }
                    if let Some(field) = include_array_index {
                        set_path(&mut copy, field, Value::Null);
                    }
                    out.push(copy);
                }
            }
            Some(_) => {
                let mut copy = doc;
                if let Some(field) = include_array_index {
                    set_path(&mut copy, field, Value::Null);
                }
                out.push(copy);
            }
        }
    }
    out
}

enum AccumulatorState {
    First(Option<Option<Value>>),
    Last(Option<Value>),
    Push(Vec<Value>),
    Sum(f64, bool),
}

impl AccumulatorState {
    fn new(accumulator: &Accumulator) -> Self {
        match accumulator {
            Accumulator::First(_) => AccumulatorState::First(None),
            Accumulator::Last(_) => AccumulatorState::Last(None),
            Accumulator::Push(_) => AccumulatorState::Push(Vec::new()),
            Accumulator::Sum(_) => AccumulatorState::Sum(0.0, true),
        }
    }

    fn feed(&mut self, accumulator: &Accumulator, doc: &Value) -> Result<()> {
        match (self, accumulator) {
            (AccumulatorState::First(slot), Accumulator::First(expr)) => {
                if slot.is_none() {
                    *slot = Some(expr.eval(doc)?);
                }
            }
            (AccumulatorState::Last(slot), Accumulator::Last(expr)) => *slot = expr.eval(doc)?,
            (AccumulatorState::Push(items), Accumulator::Push(expr)) => {
                if let Some(value) = expr.eval(doc)? {
                    items.push(value);
                }
            }
            (AccumulatorState::Sum(total, integral), Accumulator::Sum(expr)) => {
                if let Some(Value::Number(n)) = expr.eval(doc)? {
                    *integral &= n.is_i64() || n.is_u64();
                    *total += n.as_f64().unwrap_or(0.0);
                }
            }
            _ => return Err(invalid("accumulator state mismatch")),
        }
        Ok(())
    }

    fn finish(self) -> Option<Value> {
        match self {
            AccumulatorState::First(slot) => slot.flatten(),
            AccumulatorState::Last(slot) => slot,
            AccumulatorState::Push(items) => Some(Value::Array(items)),
            AccumulatorState::Sum(total, true) => Some(Value::from(total as i64)),
            AccumulatorState::Sum(total, false) => Some(Value::from(total)),
        }
    }
}

/// Groups are emitted in the order their key was first seen
fn exec_group(
    docs: Vec<Value>,
    key: &Expr,
    accumulators: &[(String, Accumulator)],
) -> Result<Vec<Value>> {
    let mut order: Vec<(Value, Vec<AccumulatorState>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for doc in &docs {
        let key_value = key.eval(doc)?.unwrap_or(Value::Null);
        let canonical = canonical_key(&key_value);
        let position = match positions.get(&canonical) {
            Some(p) => *p,
            None => {
                let states = accumulators.iter().map(|(_, acc)| AccumulatorState::new(acc)).collect();
                order.push((key_value, states));
                positions.insert(canonical, order.len() - 1);
                order.len() - 1
            }
        };
        for (state, (_, accumulator)) in order[position].1.iter_mut().zip(accumulators) {
            state.feed(accumulator, doc)?;
        }
    }

    Ok(order
        .into_iter()
        .map(|(key_value, states)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key_value);
            for (state, (name, _)) in states.into_iter().zip(accumulators) {
                if let Some(value) = state.finish() {
                    out.insert(name.clone(), value);
                }
            }
            Value::Object(out)
        })
        .collect())
}

/// All expressions see the input document; a missing result removes the field
fn exec_set(docs: Vec<Value>, fields: &[(String, Expr)]) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let mut computed = Vec::with_capacity(fields.len());
        for (path, expr) in fields {
            computed.push((path, expr.eval(&doc)?));
        }
        for (path, value) in computed {
            match value {
                Some(value) => set_path(&mut doc, path, value),
                None => unset_path(&mut doc, path),
            }
        }
        out.push(doc);
    }
    Ok(out)
}

fn exec_replace_root(docs: Vec<Value>, expr: &Expr) -> Result<Vec<Value>> {
    docs.iter()
        .map(|doc| match expr.eval(doc)? {
            Some(root @ Value::Object(_)) => Ok(root),
            other => Err(NoSqlError::Query(format!(
                "$replaceRoot expects an object, got {}",
                other.map(|v| v.to_string()).unwrap_or_else(|| "missing".to_string())
            ))),
        })
        .collect()
}
