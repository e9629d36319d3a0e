//! Row-tree assembler
//!
//! Folds the flat rows of a join query back into nested entities in one pass.
//! Rows are grouped by primary key at every level in first-seen order, so the
//! root order and the join order of the SQL are kept. A null primary key means
//! the LEFT JOIN found nothing at that level.
//!
//! Entities missing an inner join are invalid: they are dropped from many-join
//! arrays and excluded when they are roots. A one-join slot takes the first
//! valid match and stays empty when there is none.

use serde_json::{Map, Value};
use std::collections::HashMap;

use super::joins::{JoinQuery, TableLayout};
use super::normalize::StoreFlavor;
use super::plan::JoinPlan;

#[derive(Debug, Default)]
struct Groups {
    order: Vec<Group>,
    index: HashMap<String, usize>,
}

#[derive(Debug)]
struct Group {
    fields: Map<String, Value>,
    /// One entry per child join, aligned with the plan's child order
    children: Vec<Groups>,
}

impl Groups {
    fn entry(&mut self, row: &[Value], layout: &TableLayout, child_count: usize) -> Option<&mut Group> {
        let pk = row.get(layout.pk_position()).unwrap_or(&Value::Null);
        if pk.is_null() {
            return None;
        }
        let key = pk.to_string();
        let position = match self.index.get(&key) {
            Some(&p) => p,
            None => {
                let fields = layout
                    .columns
                    .iter()
                    .zip(layout.range())
                    .map(|(name, i)| (name.clone(), row.get(i).cloned().unwrap_or(Value::Null)))
                    .collect();
                self.order.push(Group { fields, children: (0..child_count).map(|_| Groups::default()).collect() });
                self.index.insert(key, self.order.len() - 1);
                self.order.len() - 1
            }
        };
        self.order.get_mut(position)
    }
}

/// Nest joined rows into native-form entities
pub struct Assembler<'a> {
    plan: &'a JoinPlan,
    query: &'a JoinQuery,
    root_children: Vec<usize>,
}

impl<'a> Assembler<'a> {
    pub fn new(plan: &'a JoinPlan, query: &'a JoinQuery) -> Self {
        let root_children = plan.roots().map(|n| n.index).collect();
        Self { plan, query, root_children }
    }

    pub fn assemble(&self, rows: &[Vec<Value>]) -> Vec<Value> {
        let mut roots = Groups::default();
        for row in rows {
            if let Some(group) = roots.entry(row, &self.query.root, self.root_children.len()) {
                self.insert_children(group, &self.root_children, row);
            }
        }

        roots
            .order
            .into_iter()
            .filter_map(|group| self.build(group, &self.root_children))
            .map(Value::Object)
            .collect()
    }

    fn insert_children(&self, group: &mut Group, children: &[usize], row: &[Value]) {
        for (slot, &child) in children.iter().enumerate() {
            let grandchildren = &self.plan.node(child).children;
            let layout = &self.query.nodes[child];
            if let Some(nested) = group.children[slot].entry(row, layout, grandchildren.len()) {
                self.insert_children(nested, grandchildren, row);
            }
        }
    }

    /// `None` when an inner join under this entity came up empty
    fn build(&self, group: Group, children: &[usize]) -> Option<Map<String, Value>> {
        let mut entity = group.fields;

        for (&child, groups) in children.iter().zip(group.children) {
            let node = self.plan.node(child);
            let inner = node.operation.is_inner();
            let key = StoreFlavor::Relational.storage_name(node.alias());

            if node.operation.is_many() {
                let items: Vec<Value> = groups
                    .order
                    .into_iter()
                    .filter_map(|g| self.build(g, &node.children))
                    .map(Value::Object)
                    .collect();
                if inner && items.is_empty() {
                    return None;
                }
                entity.insert(key, Value::Array(items));
            } else {
                let first_valid = groups.order.into_iter().find_map(|g| self.build(g, &node.children));
                match first_valid {
                    Some(child_entity) => {
                        entity.insert(key, Value::Object(child_entity));
                    }
                    None if inner => return None,
                    None => {}
                }
            }
        }

        Some(entity)
    }
}
