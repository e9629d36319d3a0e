//! Query engine errors

use thiserror::Error;

use crate::engine::adapter::AdapterError;
use crate::engine::nosql::NoSqlError;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid operation list: {0}")]
    InvalidOperation(String),

    #[error("Invalid query options: {0}")]
    InvalidOptions(String),

    #[error("Invalid identifier for '{field}': {value}")]
    InvalidIdentifier { field: String, value: String },

    #[error("{collection} '{id}' not found")]
    NotFound { collection: String, id: String },

    #[error("Document store error: {0}")]
    Document(#[from] NoSqlError),

    #[error("Relational store error: {0}")]
    Relational(#[from] AdapterError),

    #[error("Store task failed: {0}")]
    Task(String),
}

impl QueryError {
    /// Caller mistakes detected before the store is touched
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            QueryError::InvalidOperation(_)
                | QueryError::InvalidOptions(_)
                | QueryError::InvalidIdentifier { .. }
        )
    }

    pub(crate) fn invalid_identifier(field: &str, value: impl ToString) -> Self {
        QueryError::InvalidIdentifier { field: field.to_string(), value: value.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
