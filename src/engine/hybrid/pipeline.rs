//! Document-store aggregation pipeline compiler
//!
//! Each join is lowered to the same stage pattern:
//!
//! 1. `$unwind` every enclosing array so the carrying entity is a single
//!    object (with `includeArrayIndex` so elements can be regrouped)
//! 2. `$lookup` into a temporary field, through the junction first when needed
//! 3. `$set` the alias on the carrier; joins under an absent carrier stay absent
//! 4. `$group`/`$replaceRoot` back out, innermost array first
//!
//! Inner joins propagate upward: an entity with an empty inner join is dropped
//! from its enclosing array, and the root entity is filtered out when the
//! failure reaches it. A one-join with inner children holds all of its matches
//! until they are checked and then keeps the first valid one. Sorting and paging run
//! last in a `$facet` next to the total count.

use serde_json::{json, Map, Value};

use super::normalize::StoreFlavor;
use super::options::StorageOptions;
use super::plan::{JoinPlan, PlanNode};
use super::translate::{document_match, document_sort};
use crate::engine::nosql::document::ID_FIELD;

/// Output field holding the page of entities
pub const FACET_ENTITIES: &str = "entities";
/// Output field holding `[{"total": n}]`
pub const FACET_TOTAL: &str = "total";

const FLAVOR: StoreFlavor = StoreFlavor::Document;

/// Compile a join plan into aggregation stages.
///
/// `by_id` restricts the root collection to one native primary key.
pub fn compile(plan: &JoinPlan, options: &StorageOptions, by_id: Option<&Value>) -> Vec<Value> {
    let mut stages = Vec::new();

    let mut clauses = document_match(&options.filters);
    if let Some(id) = by_id {
        clauses.insert(ID_FIELD.to_string(), id.clone());
    }
    if !clauses.is_empty() {
        stages.push(json!({ "$match": clauses }));
    }

    let deferred: Vec<(&PlanNode, Option<usize>)> = plan
        .nodes()
        .iter()
        .filter(|n| is_deferred(plan, n))
        .map(|n| (n, last_descendant(plan, n.index)))
        .collect();

    for node in plan.nodes() {
        compile_node(plan, node, &mut stages);

        let mut ready: Vec<&PlanNode> = deferred
            .iter()
            .filter(|(_, last)| *last == Some(node.index))
            .map(|(d, _)| *d)
            .collect();
        ready.sort_by_key(|d| std::cmp::Reverse(d.ancestors.len()));
        for d in ready {
            collapse_node(plan, d, &mut stages);
        }
    }

    stages.push(facet(options));
    stages
}

fn reference(path: &str) -> String {
    format!("${}", path)
}

fn join_path(parent: &str, leaf: &str) -> String {
    if parent.is_empty() {
        leaf.to_string()
    } else {
        format!("{}.{}", parent, leaf)
    }
}

fn index_field(node: usize, level: usize) -> String {
    format!("__i{}_{}", node, level)
}

/// Only write under `parent` when it is an object; phantom carriers stay absent
fn guarded(parent: &str, value: Value) -> Value {
    if parent.is_empty() {
        return value;
    }
    json!({ "$cond": [
        { "$eq": [{ "$type": reference(parent) }, "object"] },
        value,
        "$$REMOVE"
    ]})
}

fn is_present(path: &str, many: bool) -> Value {
    if many {
        json!({ "$gt": [{ "$size": { "$ifNull": [reference(path), []] } }, 0] })
    } else {
        json!({ "$ne": [{ "$type": reference(path) }, "missing"] })
    }
}

fn lookup(from: &str, local_field: &str, foreign_field: &str, as_field: &str) -> Value {
    json!({ "$lookup": {
        "from": from,
        "localField": local_field,
        "foreignField": foreign_field,
        "as": as_field
    }})
}

/// A one-join with an inner child can have matches that fail it, so it keeps
/// every match as an array until its subtree is compiled and then collapses to
/// the first one still standing
fn is_deferred(plan: &JoinPlan, node: &PlanNode) -> bool {
    !node.operation.is_many() && plan.children(node.index).any(|c| c.operation.is_inner())
}

/// Enclosing nodes that hold an array while `node` is compiled, outermost first
fn array_ancestors(plan: &JoinPlan, node: &PlanNode) -> Vec<usize> {
    node.ancestors
        .iter()
        .copied()
        .filter(|&a| {
            let ancestor = plan.node(a);
            ancestor.operation.is_many() || is_deferred(plan, ancestor)
        })
        .collect()
}

/// Plan index after which a deferred one-join can collapse
fn last_descendant(plan: &JoinPlan, index: usize) -> Option<usize> {
    plan.nodes()
        .iter()
        .filter(|n| n.ancestors.contains(&index))
        .map(|n| n.index)
        .max()
}

fn compile_node(plan: &JoinPlan, node: &PlanNode, stages: &mut Vec<Value>) {
    let i = node.index;
    let op = &node.operation;
    let parent_path = node.parent_path().join(".");
    let local = join_path(&parent_path, &FLAVOR.storage_name(&node.local_leaf));
    let foreign = FLAVOR.storage_name(op.foreign_field());
    let joined = format!("__j{}", i);
    let mut temps = vec![joined.clone()];
    let mut body = Vec::new();

    match op.as_through() {
        Some(through) => {
            let links = format!("__t{}", i);
            body.push(lookup(
                &through.junction,
                &local,
                &FLAVOR.storage_name(&through.junction_local_field),
                &links,
            ));
            let via = join_path(&links, &FLAVOR.storage_name(&through.junction_foreign_field));
            body.push(lookup(op.source(), &via, &foreign, &joined));
            temps.push(links);
        }
        None => body.push(lookup(op.source(), &local, &foreign, &joined)),
    }

    let deferred = is_deferred(plan, node);
    let value = if op.is_many() || deferred {
        json!(reference(&joined))
    } else {
        json!({ "$arrayElemAt": [reference(&joined), 0] })
    };
    let mut set = Map::new();
    set.insert(node.dotted_path(), guarded(&parent_path, value));
    body.push(json!({ "$set": set }));
    body.push(json!({ "$unset": temps }));

    compile_pass(plan, node, body, op.is_inner() && !deferred, stages);
}

/// Replace a deferred one-join's surviving matches with the first of them
fn collapse_node(plan: &JoinPlan, node: &PlanNode, stages: &mut Vec<Value>) {
    let path = node.dotted_path();
    let parent_path = node.parent_path().join(".");
    let mut set = Map::new();
    set.insert(path.clone(), guarded(&parent_path, json!({ "$arrayElemAt": [reference(&path), 0] })));

    compile_pass(plan, node, vec![json!({ "$set": set })], node.operation.is_inner(), stages);
}

/// Unwind the arrays around `node`, run `body` on the carrier, then regroup
/// innermost first while applying inner-join filtering
fn compile_pass(plan: &JoinPlan, node: &PlanNode, mut body: Vec<Value>, check_inner: bool, stages: &mut Vec<Value>) {
    let i = node.index;
    let arrays = array_ancestors(plan, node);
    let depth = arrays.len();

    for (level, &ancestor) in arrays.iter().enumerate() {
        stages.push(json!({ "$unwind": {
            "path": reference(&plan.node(ancestor).dotted_path()),
            "includeArrayIndex": index_field(i, level + 1),
            "preserveNullAndEmptyArrays": true
        }}));
    }
    stages.append(&mut body);

    // per unwind level: stages to run there, and extra conditions for keeping an element
    let mut actions: Vec<Vec<Value>> = vec![Vec::new(); depth + 1];
    let mut keep: Vec<Vec<Value>> = vec![Vec::new(); depth + 1];
    if check_inner {
        propagate_inner(plan, node, depth, &mut actions, &mut keep);
    }

    stages.append(&mut actions[depth]);
    for level in (1..=depth).rev() {
        let array = plan.node(arrays[level - 1]);
        let array_path = array.dotted_path();

        let mut key = Map::new();
        key.insert("r".to_string(), json!(reference(ID_FIELD)));
        for outer in 1..level {
            key.insert(format!("i{}", outer), json!(reference(&index_field(i, outer))));
        }

        let mut conditions = vec![json!({ "$ne": [reference(&index_field(i, level)), null] })];
        conditions.append(&mut keep[level]);

        stages.push(json!({ "$group": {
            "_id": key,
            "__doc": { "$first": "$$ROOT" },
            "__items": { "$push": {
                "$cond": [{ "$and": conditions }, reference(&array_path), "$$REMOVE"]
            }}
        }}));

        let carrier = array.parent_path().join(".");
        let guard = if carrier.is_empty() { String::new() } else { join_path("__doc", &carrier) };
        let mut restore = Map::new();
        restore.insert(join_path("__doc", &array_path), guarded(&guard, json!("$__items")));
        stages.push(json!({ "$set": restore }));
        stages.push(json!({ "$replaceRoot": { "newRoot": "$__doc" } }));
        stages.push(json!({ "$unset": [index_field(i, level)] }));
        stages.append(&mut actions[level - 1]);
    }
}

/// Walk from an inner join toward the root, recording where its failure lands.
///
/// The parent of an inner join is always an array level here: a many-join, or
/// a deferred one-join that collapses on its own pass.
fn propagate_inner(
    plan: &JoinPlan,
    node: &PlanNode,
    depth: usize,
    actions: &mut [Vec<Value>],
    keep: &mut [Vec<Value>],
) {
    let mut condition = is_present(&node.dotted_path(), node.operation.is_many());
    let mut level = depth;
    let mut current = node;

    loop {
        let Some(parent_index) = current.parent else {
            actions[level].push(json!({ "$match": { "$expr": condition } }));
            return;
        };
        let parent = plan.node(parent_index);

        keep[level].push(condition);
        if !parent.operation.is_many() || !parent.operation.is_inner() {
            return;
        }
        level -= 1;
        condition = is_present(&parent.dotted_path(), true);
        current = parent;
    }
}

fn facet(options: &StorageOptions) -> Value {
    let mut entities = vec![json!({ "$sort": document_sort(options.sort.as_ref(), ID_FIELD) })];
    if let Some(page) = options.page {
        if page.skip() > 0 {
            entities.push(json!({ "$skip": page.skip() }));
        }
        entities.push(json!({ "$limit": page.size }));
    }

    let mut facets = Map::new();
    facets.insert(FACET_ENTITIES.to_string(), Value::Array(entities));
    facets.insert(FACET_TOTAL.to_string(), json!([{ "$count": FACET_TOTAL }]));
    json!({ "$facet": facets })
}
