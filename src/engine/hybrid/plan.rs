//! Join plan: resolves an ordered operation list into a tree
//!
//! Both compilers walk the same plan, so nesting rules are checked once here.

use super::error::{QueryError, Result};
use super::normalize::{is_api_identifier, API_ID};
use super::operation::Operation;

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub index: usize,
    pub operation: Operation,
    pub parent: Option<usize>,
    /// Enclosing nodes, outermost first
    pub ancestors: Vec<usize>,
    /// Alias path from the root entity, ending with this node's alias
    pub path: Vec<String>,
    /// Field on the carrying entity compared with the foreign field
    pub local_leaf: String,
    pub children: Vec<usize>,
}

impl PlanNode {
    pub fn alias(&self) -> &str {
        self.operation.alias()
    }

    pub fn dotted_path(&self) -> String {
        self.path.join(".")
    }

    /// Path of the carrying entity; empty for root-level joins
    pub fn parent_path(&self) -> &[String] {
        &self.path[..self.path.len() - 1]
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinPlan {
    nodes: Vec<PlanNode>,
}

impl JoinPlan {
    pub fn resolve(operations: &[Operation]) -> Result<Self> {
        let mut nodes: Vec<PlanNode> = Vec::with_capacity(operations.len());

        for (index, op) in operations.iter().enumerate() {
            check_operation(index, op)?;

            let (prefix, leaf) = match op.local_field().rsplit_once('.') {
                Some((prefix, leaf)) => (Some(prefix), leaf),
                None => (None, op.local_field()),
            };
            if !is_api_identifier(leaf) {
                return Err(invalid(index, format!("invalid local field '{}'", op.local_field())));
            }

            let parent = match prefix {
                None => None,
                Some(prefix) => {
                    let found = nodes.iter().position(|n| n.dotted_path() == prefix);
                    match found {
                        Some(p) => Some(p),
                        None => {
                            return Err(invalid(
                                index,
                                format!("'{}' does not name an earlier join alias", prefix),
                            ))
                        }
                    }
                }
            };

            let (ancestors, mut path) = match parent {
                Some(p) => {
                    let mut ancestors = nodes[p].ancestors.clone();
                    ancestors.push(p);
                    (ancestors, nodes[p].path.clone())
                }
                None => (Vec::new(), Vec::new()),
            };
            path.push(op.alias().to_string());

            let dotted = path.join(".");
            if nodes.iter().any(|n| n.dotted_path() == dotted) {
                return Err(invalid(index, format!("alias path '{}' is used twice", dotted)));
            }

            if let Some(p) = parent {
                nodes[p].children.push(index);
            }
            nodes.push(PlanNode {
                index,
                operation: op.clone(),
                parent,
                ancestors,
                path,
                local_leaf: leaf.to_string(),
                children: Vec::new(),
            });
        }

        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &PlanNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Joins attached directly to the root entity
    pub fn roots(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.iter().filter(|n| n.parent.is_none())
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = &PlanNode> {
        self.nodes[index].children.iter().map(move |&c| &self.nodes[c])
    }

    /// True when this node and every enclosing node are inner joins
    pub fn inner_from_root(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        node.operation.is_inner() && node.ancestors.iter().all(|&a| self.nodes[a].operation.is_inner())
    }
}

fn invalid(index: usize, message: String) -> QueryError {
    QueryError::InvalidOperation(format!("operation {}: {}", index, message))
}

fn check_operation(index: usize, op: &Operation) -> Result<()> {
    if op.source().is_empty() {
        return Err(invalid(index, "source is empty".into()));
    }
    let alias = op.alias();
    if alias.contains('.') {
        return Err(invalid(index, format!("alias '{}' must not contain '.'", alias)));
    }
    if !is_api_identifier(alias) || alias == API_ID || alias == "_id" {
        return Err(invalid(index, format!("invalid alias '{}'", alias)));
    }
    if op.local_field().is_empty() {
        return Err(invalid(index, "localField is empty".into()));
    }
    if !is_api_identifier(op.foreign_field()) {
        return Err(invalid(index, format!("invalid foreign field '{}'", op.foreign_field())));
    }
    if let Some(through) = op.as_through() {
        if through.junction.is_empty() {
            return Err(invalid(index, "junction is empty".into()));
        }
        for field in [&through.junction_local_field, &through.junction_foreign_field] {
            if !is_api_identifier(field) {
                return Err(invalid(index, format!("invalid junction field '{}'", field)));
            }
        }
    }
    Ok(())
}
