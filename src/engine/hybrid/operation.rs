//! Join operations
//!
//! One [`Operation`] describes one join step. Operation lists are ordered:
//! a `local_field` such as `"clientPolicies.id"` attaches the join under the
//! alias produced by an earlier operation; a plain `"customerId"` attaches it
//! to the root entity.

use serde::{Deserialize, Serialize};

/// Inner joins drop the carrying entity when nothing matches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Inner,
    #[default]
    Left,
}

/// `one` yields an object or nothing, `many` always yields an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

/// A direct join: `source.foreign_field = <carrier>.local_field`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    pub source: String,
    pub local_field: String,
    pub foreign_field: String,
    pub alias: String,
}

/// A many-to-many join through a junction collection.
///
/// `junction.junction_local_field = <carrier>.local_field` and
/// `source.foreign_field = junction.junction_foreign_field`. Junction rows
/// never appear in results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughJoin {
    pub junction: String,
    pub junction_local_field: String,
    pub junction_foreign_field: String,
    pub source: String,
    pub local_field: String,
    pub foreign_field: String,
    pub alias: String,
    #[serde(default)]
    pub kind: JoinKind,
}

/// One join step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Operation {
    JoinOneInner(Join),
    JoinOneLeft(Join),
    JoinManyInner(Join),
    JoinManyLeft(Join),
    JoinManyThrough(ThroughJoin),
}

impl Operation {
    pub fn one_inner(source: &str, local_field: &str, foreign_field: &str, alias: &str) -> Self {
        Operation::JoinOneInner(Join::new(source, local_field, foreign_field, alias))
    }

    pub fn one_left(source: &str, local_field: &str, foreign_field: &str, alias: &str) -> Self {
        Operation::JoinOneLeft(Join::new(source, local_field, foreign_field, alias))
    }

    pub fn many_inner(source: &str, local_field: &str, foreign_field: &str, alias: &str) -> Self {
        Operation::JoinManyInner(Join::new(source, local_field, foreign_field, alias))
    }

    pub fn many_left(source: &str, local_field: &str, foreign_field: &str, alias: &str) -> Self {
        Operation::JoinManyLeft(Join::new(source, local_field, foreign_field, alias))
    }

    /// Many-to-many via `junction`; see [`ThroughJoin`] for the key layout
    #[allow(clippy::too_many_arguments)]
    pub fn through(
        junction: &str,
        junction_local_field: &str,
        junction_foreign_field: &str,
        source: &str,
        local_field: &str,
        foreign_field: &str,
        alias: &str,
        kind: JoinKind,
    ) -> Self {
        Operation::JoinManyThrough(ThroughJoin {
            junction: junction.to_string(),
            junction_local_field: junction_local_field.to_string(),
            junction_foreign_field: junction_foreign_field.to_string(),
            source: source.to_string(),
            local_field: local_field.to_string(),
            foreign_field: foreign_field.to_string(),
            alias: alias.to_string(),
            kind,
        })
    }

    pub fn kind(&self) -> JoinKind {
        match self {
            Operation::JoinOneInner(_) | Operation::JoinManyInner(_) => JoinKind::Inner,
            Operation::JoinOneLeft(_) | Operation::JoinManyLeft(_) => JoinKind::Left,
            Operation::JoinManyThrough(t) => t.kind,
        }
    }

    pub fn cardinality(&self) -> Cardinality {
        match self {
            Operation::JoinOneInner(_) | Operation::JoinOneLeft(_) => Cardinality::One,
            _ => Cardinality::Many,
        }
    }

    pub fn is_inner(&self) -> bool {
        self.kind() == JoinKind::Inner
    }

    pub fn is_many(&self) -> bool {
        self.cardinality() == Cardinality::Many
    }

    pub fn source(&self) -> &str {
        match self {
            Operation::JoinManyThrough(t) => &t.source,
            Operation::JoinOneInner(j)
            | Operation::JoinOneLeft(j)
            | Operation::JoinManyInner(j)
            | Operation::JoinManyLeft(j) => &j.source,
        }
    }

    pub fn local_field(&self) -> &str {
        match self {
            Operation::JoinManyThrough(t) => &t.local_field,
            Operation::JoinOneInner(j)
            | Operation::JoinOneLeft(j)
            | Operation::JoinManyInner(j)
            | Operation::JoinManyLeft(j) => &j.local_field,
        }
    }

    pub fn foreign_field(&self) -> &str {
        match self {
            Operation::JoinManyThrough(t) => &t.foreign_field,
            Operation::JoinOneInner(j)
            | Operation::JoinOneLeft(j)
            | Operation::JoinManyInner(j)
            | Operation::JoinManyLeft(j) => &j.foreign_field,
        }
    }

    pub fn alias(&self) -> &str {
        match self {
            Operation::JoinManyThrough(t) => &t.alias,
            Operation::JoinOneInner(j)
            | Operation::JoinOneLeft(j)
            | Operation::JoinManyInner(j)
            | Operation::JoinManyLeft(j) => &j.alias,
        }
    }

    pub fn as_through(&self) -> Option<&ThroughJoin> {
        match self {
            Operation::JoinManyThrough(t) => Some(t),
            _ => None,
        }
    }
}

impl Join {
    pub fn new(source: &str, local_field: &str, foreign_field: &str, alias: &str) -> Self {
        Self {
            source: source.to_string(),
            local_field: local_field.to_string(),
            foreign_field: foreign_field.to_string(),
            alias: alias.to_string(),
        }
    }
}
