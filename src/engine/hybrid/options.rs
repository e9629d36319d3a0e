//! Query options: filters, sorting and pagination
//!
//! ```json
//! {
//!   "filters": { "status": { "in": ["open", "paid"] }, "total": { "gte": 100 } },
//!   "orderBy": "createdAt",
//!   "sortDirection": "desc",
//!   "page": 2,
//!   "pageSize": 20
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::error::{QueryError, Result};
use super::normalize::is_api_identifier;
use crate::engine::adapter::SortDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
}

impl FilterOp {
    pub fn is_range(&self) -> bool {
        matches!(self, FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte)
    }

    pub fn is_set(&self) -> bool {
        matches!(self, FilterOp::In | FilterOp::Nin)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    /// field -> operator -> operand; operators on one field are ANDed
    pub filters: BTreeMap<String, BTreeMap<FilterOp, Value>>,
    pub order_by: Option<String>,
    pub sort_direction: SortDirection,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

/// A validated page window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u64,
    pub size: u64,
}

impl Page {
    /// Entities before this page. Pages from [`QueryOptions::page`] stay
    /// within `i64::MAX`, so the result is a valid SQL OFFSET.
    pub fn skip(&self) -> u64 {
        self.number.saturating_sub(1).saturating_mul(self.size)
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: Value) -> Self {
        self.filters.entry(field.to_string()).or_default().insert(op, value);
        self
    }

    pub fn order_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.order_by = Some(field.to_string());
        self.sort_direction = direction;
        self
    }

    pub fn paginate(mut self, page: i64, page_size: i64) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    pub fn is_paged(&self) -> bool {
        self.page.is_some() || self.page_size.is_some()
    }

    /// Page window, if any. A page size alone means the first page.
    pub fn page(&self) -> Result<Option<Page>> {
        match (self.page, self.page_size) {
            (None, None) => Ok(None),
            (Some(_), None) => Err(QueryError::InvalidOptions("page requires pageSize".into())),
            (page, Some(size)) => {
                let number = page.unwrap_or(1);
                if number < 1 {
                    return Err(QueryError::InvalidOptions(format!("page must be >= 1, got {}", number)));
                }
                if size < 1 {
                    return Err(QueryError::InvalidOptions(format!("pageSize must be >= 1, got {}", size)));
                }
                if (number - 1).checked_mul(size).is_none() {
                    return Err(QueryError::InvalidOptions(format!(
                        "page {} of size {} is out of range",
                        number, size
                    )));
                }
                Ok(Some(Page { number: number as u64, size: size as u64 }))
            }
        }
    }

    /// Check shape and bounds; returns the page window
    pub fn validate(&self, max_page_size: u64) -> Result<Option<Page>> {
        for (field, operators) in &self.filters {
            check_field(field)?;
            for (op, value) in operators {
                if op.is_set() && !value.is_array() {
                    return Err(QueryError::InvalidOptions(format!(
                        "'{}' on '{}' needs an array",
                        serde_json::to_string(op).unwrap_or_default().trim_matches('"'),
                        field
                    )));
                }
                if op.is_range() && value.is_null() {
                    return Err(QueryError::InvalidOptions(format!(
                        "range filter on '{}' cannot compare with null",
                        field
                    )));
                }
            }
        }
        if let Some(field) = &self.order_by {
            check_field(field)?;
        }

        let page = self.page()?;
        if let Some(page) = page {
            if page.size > max_page_size {
                return Err(QueryError::InvalidOptions(format!(
                    "pageSize {} exceeds the maximum of {}",
                    page.size, max_page_size
                )));
            }
        }
        Ok(page)
    }

    /// Bulk writes accept filters only
    pub fn validate_for_write(&self) -> Result<()> {
        if self.is_paged() {
            return Err(QueryError::InvalidOptions("bulk writes do not accept pagination".into()));
        }
        self.validate(u64::MAX).map(|_| ())
    }
}

fn check_field(field: &str) -> Result<()> {
    if field.contains('.') {
        return Err(QueryError::InvalidOptions(format!(
            "'{}': filtering and sorting on joined fields is not supported",
            field
        )));
    }
    if !is_api_identifier(field) {
        return Err(QueryError::InvalidOptions(format!("invalid field name '{}'", field)));
    }
    Ok(())
}

/// One native filter term
#[derive(Debug, Clone, PartialEq)]
pub struct StorageFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageSort {
    pub field: String,
    pub direction: SortDirection,
}

/// Options after normalization, in native field names and values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageOptions {
    pub filters: Vec<StorageFilter>,
    pub sort: Option<StorageSort>,
    pub page: Option<Page>,
}

/// A page of entities plus the total across all pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult {
    pub entities: Vec<Value>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
}

impl PagedResult {
    pub fn new(entities: Vec<Value>, total: u64, page: Option<Page>) -> Self {
        let (number, size) = match page {
            Some(p) => (p.number, p.size),
            None => (1, total),
        };
        let total_pages = if total == 0 || size == 0 { 0 } else { total.div_ceil(size) };
        Self { entities, total, page: number, page_size: size, total_pages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_json_shape() {
        let options: QueryOptions = serde_json::from_value(json!({
            "filters": {"status": {"in": ["open"]}, "total": {"gte": 10, "lt": 20}},
            "orderBy": "createdAt",
            "sortDirection": "desc",
            "page": 2,
            "pageSize": 5
        }))
        .unwrap();

        assert_eq!(options.filters["total"].len(), 2);
        assert_eq!(options.sort_direction, SortDirection::Desc);
        assert_eq!(options.validate(100).unwrap(), Some(Page { number: 2, size: 5 }));
    }

    #[test]
    fn test_page_rules() {
        assert_eq!(QueryOptions::new().validate(10).unwrap(), None);

        let size_only = QueryOptions { page_size: Some(3), ..Default::default() };
        assert_eq!(size_only.validate(10).unwrap(), Some(Page { number: 1, size: 3 }));

        let page_only = QueryOptions { page: Some(2), ..Default::default() };
        assert!(page_only.validate(10).is_err());

        assert!(QueryOptions::new().paginate(0, 5).validate(10).is_err());
        assert!(QueryOptions::new().paginate(1, 0).validate(10).is_err());
        assert!(QueryOptions::new().paginate(1, 11).validate(10).is_err());
        assert_eq!(Page { number: 3, size: 4 }.skip(), 8);
    }

    #[test]
    fn test_page_offset_out_of_range() {
        let far = QueryOptions::new().paginate(i64::MAX, 10);
        assert!(matches!(far.validate(100), Err(QueryError::InvalidOptions(_))));

        // the last page whose offset still fits
        let edge = QueryOptions::new().paginate(i64::MAX / 10 + 1, 10);
        let page = edge.validate(100).unwrap().unwrap();
        assert!(page.skip() <= i64::MAX as u64);

        assert_eq!(Page { number: u64::MAX, size: 10 }.skip(), u64::MAX);
    }

    #[test]
    fn test_filter_rules() {
        let not_array = QueryOptions::new().filter("status", FilterOp::In, json!("open"));
        assert!(matches!(not_array.validate(10), Err(QueryError::InvalidOptions(_))));

        let null_range = QueryOptions::new().filter("total", FilterOp::Gt, Value::Null);
        assert!(null_range.validate(10).is_err());

        let joined = QueryOptions::new().filter("customer.name", FilterOp::Eq, json!("x"));
        assert!(joined.validate(10).is_err());

        let snake = QueryOptions::new().order_by("created_at", SortDirection::Asc);
        assert!(snake.validate(10).is_err());

        let null_eq = QueryOptions::new().filter("deletedAt", FilterOp::Eq, Value::Null);
        assert!(null_eq.validate(10).is_ok());
    }

    #[test]
    fn test_writes_reject_pagination() {
        assert!(QueryOptions::new().paginate(1, 5).validate_for_write().is_err());
        assert!(QueryOptions::new().filter("a", FilterOp::Eq, json!(1)).validate_for_write().is_ok());
    }

    #[test]
    fn test_paged_result_totals() {
        let paged = PagedResult::new(vec![json!({}), json!({})], 5, Some(Page { number: 1, size: 2 }));
        assert_eq!(paged.total_pages, 3);

        let unpaged = PagedResult::new(vec![json!({})], 1, None);
        assert_eq!((unpaged.page, unpaged.page_size, unpaged.total_pages), (1, 1, 1));

        let empty = PagedResult::new(vec![], 0, None);
        assert_eq!(empty.total_pages, 0);
        assert_eq!(serde_json::to_value(&empty).unwrap()["totalPages"], json!(0));
    }
}
