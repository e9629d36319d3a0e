//! Identifier and casing normalization
//!
//! Entities cross the API boundary with camelCase keys, the primary key under
//! `id`, identifiers as strings and dates as RFC 3339 UTC strings with
//! millisecond precision. Each store keeps its own native form:
//!
//! | concern   | document store              | relational store               |
//! |-----------|-----------------------------|--------------------------------|
//! | keys      | camelCase, pk `_id`         | snake_case, pk `id`            |
//! | ids       | `{"$oid": "<hex>"}`         | INTEGER                        |
//! | dates     | `{"$date": <epoch millis>}` | TEXT `YYYY-MM-DD HH:MM:SS.sss` |
//! | booleans  | `true` / `false`            | `1` / `0`                      |
//!
//! Keys are always converted. Values are converted for the primary key and for
//! fields an [`EntitySchema`] declares; everything else passes through.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::error::{QueryError, Result};
use super::options::{FilterOp, QueryOptions, StorageFilter, StorageOptions, StorageSort};
use crate::engine::nosql::document::{as_date_millis, as_oid, oid, DATE_KEY, ID_FIELD};

/// Primary key name at the API boundary
pub const API_ID: &str = "id";

const API_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const SQL_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Which native conventions a store uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFlavor {
    Document,
    Relational,
}

impl StoreFlavor {
    /// Native name of an API field
    pub fn storage_name(&self, api: &str) -> String {
        match self {
            _ if api == API_ID || api == ID_FIELD => self.pk_name().to_string(),
            StoreFlavor::Document => api.to_string(),
            StoreFlavor::Relational => to_snake_case(api),
        }
    }

    /// API name of a native field
    pub fn api_name(&self, storage: &str) -> String {
        match self {
            StoreFlavor::Document if storage == ID_FIELD => API_ID.to_string(),
            StoreFlavor::Document => storage.to_string(),
            StoreFlavor::Relational => to_camel_case(storage),
        }
    }

    /// Native name of a dotted API path, segment by segment
    pub fn storage_path(&self, api_path: &str) -> String {
        api_path
            .split('.')
            .map(|segment| self.storage_name(segment))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Conventional primary key name
    pub fn pk_name(&self) -> &'static str {
        match self {
            StoreFlavor::Document => ID_FIELD,
            StoreFlavor::Relational => API_ID,
        }
    }
}

/// API field names: `_id`, or a lowercase letter followed by ASCII letters and digits
pub fn is_api_identifier(name: &str) -> bool {
    if name == ID_FIELD {
        return true;
    }
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase()) && chars.all(|c| c.is_ascii_alphanumeric())
}

pub fn to_snake_case(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 4);
    for c in camel.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

pub fn to_camel_case(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for c in snake.chars() {
        if c == '_' && !out.is_empty() {
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Whether a native column name survives the trip to camelCase and back.
/// `address_2`, `a__b` and `Name` do not.
pub fn casing_round_trips(column: &str) -> bool {
    to_snake_case(&to_camel_case(column)) == column
}

/// How a field's value is represented
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Id,
    Date,
    Bool,
    Scalar,
    One(EntitySchema),
    Many(EntitySchema),
}

static ID_KIND: FieldKind = FieldKind::Id;

/// Field kinds of one entity, keyed by API field name.
///
/// Serializes as a plain map, e.g.
/// `{"customerId": "id", "customer": {"one": {"createdAt": "date"}}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntitySchema {
    fields: BTreeMap<String, FieldKind>,
}

impl EntitySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.insert(name.to_string(), kind);
        self
    }

    /// Declared kind; the primary key is always an identifier
    pub fn kind_of(&self, api_field: &str) -> Option<&FieldKind> {
        match self.fields.get(api_field) {
            Some(kind) => Some(kind),
            None if api_field == API_ID => Some(&ID_KIND),
            None => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldKind)> {
        self.fields.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

static EMPTY_SCHEMA: std::sync::OnceLock<EntitySchema> = std::sync::OnceLock::new();

fn empty_schema() -> &'static EntitySchema {
    EMPTY_SCHEMA.get_or_init(EntitySchema::default)
}

/// Converts entities and filter values between API and native form
#[derive(Debug, Clone, Copy)]
pub struct Normalizer<'a> {
    flavor: StoreFlavor,
    schema: &'a EntitySchema,
}

impl<'a> Normalizer<'a> {
    pub fn new(flavor: StoreFlavor, schema: &'a EntitySchema) -> Self {
        Self { flavor, schema }
    }

    pub fn flavor(&self) -> StoreFlavor {
        self.flavor
    }

    fn nested(&self, schema: &'a EntitySchema) -> Self {
        Self { flavor: self.flavor, schema }
    }

    // ========== native -> API ==========

    /// Convert a native entity to API form
    pub fn to_api(&self, stored: &Value) -> Result<Value> {
        let Value::Object(map) = stored else {
            return Err(QueryError::invalid_identifier("<entity>", stored));
        };
        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            let api_key = self.flavor.api_name(key);
            let converted = self.value_to_api(&api_key, value)?;
            out.insert(api_key, converted);
        }
        Ok(Value::Object(out))
    }

    pub fn many_to_api(&self, stored: &[Value]) -> Result<Vec<Value>> {
        stored.iter().map(|entity| self.to_api(entity)).collect()
    }

    fn value_to_api(&self, field: &str, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self.schema.kind_of(field) {
            Some(FieldKind::Id) => self.id_to_api(field, value),
            Some(FieldKind::Date) => self.date_to_api(field, value),
            Some(FieldKind::Bool) => self.bool_to_api(field, value),
            Some(FieldKind::Scalar) => Ok(value.clone()),
            Some(FieldKind::One(schema)) => self.nested(schema).to_api(value),
            Some(FieldKind::Many(schema)) => match value {
                Value::Array(items) => Ok(Value::Array(self.nested(schema).many_to_api(items)?)),
                other => Err(QueryError::invalid_identifier(field, other)),
            },
            // undeclared joined entities still get key and pk conversion
            None => match value {
                Value::Object(_) if as_oid(value).is_none() && as_date_millis(value).is_none() => {
                    self.nested(empty_schema()).to_api(value)
                }
                Value::Array(items) if items.iter().all(Value::is_object) => {
                    Ok(Value::Array(self.nested(empty_schema()).many_to_api(items)?))
                }
                other => Ok(other.clone()),
            },
        }
    }

    fn id_to_api(&self, field: &str, value: &Value) -> Result<Value> {
        let id = match self.flavor {
            StoreFlavor::Document => as_oid(value).map(str::to_string),
            StoreFlavor::Relational => value.as_i64().map(|i| i.to_string()),
        };
        id.map(Value::String)
            .ok_or_else(|| QueryError::invalid_identifier(field, value))
    }

    fn date_to_api(&self, field: &str, value: &Value) -> Result<Value> {
        let instant = match self.flavor {
            StoreFlavor::Document => as_date_millis(value).and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            StoreFlavor::Relational => value
                .as_str()
                .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
                .map(|naive| naive.and_utc()),
        };
        instant
            .map(|dt| Value::String(dt.format(API_DATE_FORMAT).to_string()))
            .ok_or_else(|| QueryError::invalid_identifier(field, value))
    }

    fn bool_to_api(&self, field: &str, value: &Value) -> Result<Value> {
        match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) if self.flavor == StoreFlavor::Relational => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(QueryError::invalid_identifier(field, value)),
            },
            other => Err(QueryError::invalid_identifier(field, other)),
        }
    }

    // ========== API -> native ==========

    /// Convert an API entity to native form
    pub fn to_storage(&self, entity: &Value) -> Result<Value> {
        let Value::Object(map) = entity else {
            return Err(QueryError::invalid_identifier("<entity>", entity));
        };
        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            let api_key = if key == ID_FIELD { API_ID } else { key.as_str() };
            if !is_api_identifier(api_key) {
                return Err(QueryError::InvalidOptions(format!("invalid field name '{}'", key)));
            }
            out.insert(self.flavor.storage_name(api_key), self.storage_value(api_key, value)?);
        }
        Ok(Value::Object(out))
    }

    /// Convert one API value of `api_field` to native form
    pub fn storage_value(&self, api_field: &str, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self.schema.kind_of(api_field) {
            Some(FieldKind::Id) => self.id_to_storage(api_field, value),
            Some(FieldKind::Date) => self.date_to_storage(api_field, value),
            Some(FieldKind::Bool) => match (value, self.flavor) {
                (Value::Bool(b), StoreFlavor::Relational) => Ok(Value::from(i64::from(*b))),
                (Value::Bool(b), StoreFlavor::Document) => Ok(Value::Bool(*b)),
                (other, _) => Err(QueryError::invalid_identifier(api_field, other)),
            },
            Some(FieldKind::Scalar) => Ok(value.clone()),
            Some(FieldKind::One(schema)) => self.nested(schema).to_storage(value),
            Some(FieldKind::Many(schema)) => match value {
                Value::Array(items) => {
                    let nested = self.nested(schema);
                    Ok(Value::Array(items.iter().map(|v| nested.to_storage(v)).collect::<Result<_>>()?))
                }
                other => Err(QueryError::invalid_identifier(api_field, other)),
            },
            None => Ok(value.clone()),
        }
    }

    /// Native form of an API identifier string
    pub fn id_to_storage(&self, field: &str, value: &Value) -> Result<Value> {
        let raw = value
            .as_str()
            .ok_or_else(|| QueryError::invalid_identifier(field, value))?;
        match self.flavor {
            StoreFlavor::Document => {
                let valid = !raw.is_empty()
                    && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
                if !valid {
                    return Err(QueryError::invalid_identifier(field, raw));
                }
                Ok(oid(raw))
            }
            StoreFlavor::Relational => match raw.parse::<i64>() {
                Ok(id) if id.to_string() == raw => Ok(Value::from(id)),
                _ => Err(QueryError::invalid_identifier(field, raw)),
            },
        }
    }

    fn date_to_storage(&self, field: &str, value: &Value) -> Result<Value> {
        let instant = value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| QueryError::invalid_identifier(field, value))?;
        Ok(match self.flavor {
            StoreFlavor::Document => {
                let mut map = Map::with_capacity(1);
                map.insert(DATE_KEY.to_string(), Value::from(instant.timestamp_millis()));
                Value::Object(map)
            }
            StoreFlavor::Relational => Value::String(instant.naive_utc().format(SQL_DATE_FORMAT).to_string()),
        })
    }

    /// Native field name of a root-level API field
    pub fn storage_field(&self, api_field: &str) -> Result<String> {
        if !is_api_identifier(api_field) {
            return Err(QueryError::InvalidOptions(format!(
                "'{}' is not a root field name",
                api_field
            )));
        }
        Ok(self.flavor.storage_name(api_field))
    }

    /// Native filters and sort for already validated options
    pub fn options(&self, options: &QueryOptions) -> Result<StorageOptions> {
        let page = options.page()?;
        let mut filters = Vec::new();

        for (field, operators) in &options.filters {
            let api_field = if field == ID_FIELD { API_ID } else { field.as_str() };
            let storage_field = self.storage_field(api_field)?;
            for (op, value) in operators {
                let value = match (op, value) {
                    (FilterOp::In | FilterOp::Nin, Value::Array(items)) => Value::Array(
                        items
                            .iter()
                            .map(|item| self.storage_value(api_field, item))
                            .collect::<Result<_>>()?,
                    ),
                    _ => self.storage_value(api_field, value)?,
                };
                filters.push(StorageFilter { field: storage_field.clone(), op: *op, value });
            }
        }

        let sort = match &options.order_by {
            Some(field) => {
                let api_field = if field == ID_FIELD { API_ID } else { field.as_str() };
                Some(StorageSort { field: self.storage_field(api_field)?, direction: options.sort_direction })
            }
            None => None,
        };

        Ok(StorageOptions { filters, sort, page })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> EntitySchema {
        EntitySchema::new()
            .field("customerId", FieldKind::Id)
            .field("createdAt", FieldKind::Date)
            .field("paid", FieldKind::Bool)
            .field("customer", FieldKind::One(EntitySchema::new().field("since", FieldKind::Date)))
    }

    #[test]
    fn test_casing() {
        assert_eq!(to_snake_case("clientPolicies"), "client_policies");
        assert_eq!(to_camel_case("client_policies"), "clientPolicies");
        assert_eq!(to_camel_case(&to_snake_case("userID")), "userID");
        assert!(is_api_identifier("address2"));
        assert!(is_api_identifier("_id"));
        assert!(!is_api_identifier("client_id"));
        assert!(!is_api_identifier("Customer"));
    }

    #[test]
    fn test_columns_that_lose_their_name() {
        assert!(casing_round_trips("customer_id"));
        assert!(casing_round_trips("id"));
        assert!(!casing_round_trips("address_2"));
        assert!(!casing_round_trips("a__b"));
        assert!(!casing_round_trips("trailing_"));
        assert!(!casing_round_trips("Name"));
    }

    #[test]
    fn test_relational_round_trip() {
        let schema = schema();
        let n = Normalizer::new(StoreFlavor::Relational, &schema);
        let stored = json!({
            "id": 7,
            "customer_id": 3,
            "created_at": "2024-05-01 10:20:30.400",
            "paid": 1,
            "note": "x",
            "customer": {"id": 3, "since": "2020-01-01 00:00:00.000"}
        });

        let api = n.to_api(&stored).unwrap();
        assert_eq!(
            api,
            json!({
                "id": "7",
                "customerId": "3",
                "createdAt": "2024-05-01T10:20:30.400Z",
                "paid": true,
                "note": "x",
                "customer": {"id": "3", "since": "2020-01-01T00:00:00.000Z"}
            })
        );
        assert_eq!(n.to_storage(&api).unwrap(), stored);
    }

    #[test]
    fn test_document_round_trip() {
        let schema = schema();
        let n = Normalizer::new(StoreFlavor::Document, &schema);
        let stored = json!({
            "_id": {"$oid": "65f000000000000000000001"},
            "customerId": {"$oid": "65f000000000000000000002"},
            "createdAt": {"$date": 1714558830400i64},
            "paid": false,
            "lines": [{"_id": {"$oid": "aa"}, "qty": 2}]
        });

        let api = n.to_api(&stored).unwrap();
        assert_eq!(api["id"], json!("65f000000000000000000001"));
        assert_eq!(api["createdAt"], json!("2024-05-01T10:20:30.400Z"));
        assert_eq!(api["lines"], json!([{"id": "aa", "qty": 2}]));
        assert_eq!(n.to_storage(&api).unwrap(), stored);
    }

    #[test]
    fn test_invalid_identifiers() {
        let schema = schema();
        let relational = Normalizer::new(StoreFlavor::Relational, &schema);
        let document = Normalizer::new(StoreFlavor::Document, &schema);

        for bad in [json!("007"), json!("abc"), json!(7)] {
            assert!(matches!(
                relational.id_to_storage("id", &bad),
                Err(QueryError::InvalidIdentifier { .. })
            ));
        }
        assert!(document.id_to_storage("id", &json!("../x")).is_err());
        assert!(relational.storage_value("createdAt", &json!("yesterday")).is_err());
        assert!(relational.to_api(&json!({"paid": 2})).is_err());
    }

    #[test]
    fn test_options_are_converted() {
        let schema = schema();
        let n = Normalizer::new(StoreFlavor::Relational, &schema);
        let options = QueryOptions::new()
            .filter("customerId", FilterOp::In, json!(["1", "2"]))
            .filter("paid", FilterOp::Eq, json!(true))
            .order_by("createdAt", crate::engine::adapter::SortDirection::Desc);

        let storage = n.options(&options).unwrap();
        assert_eq!(storage.filters[0].field, "customer_id");
        assert_eq!(storage.filters[0].value, json!([1, 2]));
        assert_eq!(storage.filters[1].value, json!(1));
        assert_eq!(storage.sort.unwrap().field, "created_at");
    }

    #[test]
    fn test_schema_json_shape() {
        let schema: EntitySchema = serde_json::from_value(json!({
            "customerId": "id",
            "customer": {"one": {"since": "date"}},
            "lines": {"many": {}}
        }))
        .unwrap();

        assert_eq!(schema.kind_of("customerId"), Some(&FieldKind::Id));
        assert_eq!(schema.kind_of("id"), Some(&FieldKind::Id));
        assert!(matches!(schema.kind_of("lines"), Some(FieldKind::Many(_))));
        assert_eq!(schema.kind_of("other"), None);
    }
}
