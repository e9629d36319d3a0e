//! AirDB document store
//!
//! A file-backed JSON document engine:
//! - one file per document, ObjectId-style ids
//! - Mongo-style query documents and aggregation pipelines
//! - extended JSON (`$oid`, `$date`) for ids and timestamps

pub mod aggregate;
pub mod collection;
pub mod document;
pub mod error;
pub mod expr;
pub mod meta;
pub mod query;
pub mod storage;

pub use aggregate::Pipeline;
pub use collection::Collection;
pub use document::Document;
pub use error::NoSqlError;
pub use meta::StoreMeta;
pub use query::{Filter, Query, SortOrder};
pub use storage::NoSqlEngine;
