//! AirDB join engine
//!
//! Backend-agnostic relational joins: one ordered list of join operations runs
//! unchanged against the file-backed document store or a SQLite database and
//! returns the same nested, API-shaped entities from both.

pub mod engine;

pub use engine::hybrid::{
    Backend, DocumentStore, EntitySchema, FieldKind, FilterOp, JoinKind, Operation, PagedResult, QueryError,
    QueryOptions, RelationalStore, Repository, SortDirection,
};
