//! Hybrid join engine
//!
//! One join description, two stores: an ordered list of [`Operation`]s is
//! resolved into a [`JoinPlan`] and compiled either into an aggregation
//! pipeline for the document store or into a single SQL statement whose flat
//! rows are reassembled into the same nested shape.

pub mod assemble;
pub mod document_store;
pub mod error;
pub mod joins;
pub mod normalize;
pub mod operation;
pub mod options;
pub mod pipeline;
pub mod plan;
pub mod relational_store;
pub mod store;
pub mod translate;

pub use document_store::DocumentStore;
pub use error::{QueryError, Result};
pub use normalize::{EntitySchema, FieldKind, Normalizer, StoreFlavor};
pub use operation::{Cardinality, Join, JoinKind, Operation, ThroughJoin};
pub use options::{FilterOp, Page, PagedResult, QueryOptions};
pub use plan::JoinPlan;
pub use relational_store::RelationalStore;
pub use store::{Backend, FetchRequest, FetchResult, Repository};
pub use crate::engine::adapter::SortDirection;
