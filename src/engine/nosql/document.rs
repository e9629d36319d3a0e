//! Document representation for NoSQL storage

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{NoSqlError, Result};

/// Key holding the native document id
pub const ID_FIELD: &str = "_id";

/// Extended-JSON key wrapping an object id
pub const OID_KEY: &str = "$oid";

/// Extended-JSON key wrapping a date (epoch milliseconds)
pub const DATE_KEY: &str = "$date";

/// A NoSQL document as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique document ID (24 hex chars, ObjectId layout)
    #[serde(rename = "_id")]
    pub id: String,

    /// The actual document data
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Document {
    /// Create a new document with generated ID
    pub fn new(data: Map<String, Value>) -> Self {
        Self::with_id(generate_object_id(), data)
    }

    /// Create a document with a specific ID
    pub fn with_id(id: String, mut data: Map<String, Value>) -> Self {
        data.remove(ID_FIELD);
        Self { id, data }
    }

    /// Build a document from its pipeline view, honouring a caller supplied `_id`
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut data) = value else {
            return Err(NoSqlError::InvalidDocument("document must be an object".to_string()));
        };

        match data.remove(ID_FIELD) {
            None | Some(Value::Null) => Ok(Self::new(data)),
            Some(id) => {
                let id = as_oid(&id)
                    .or_else(|| id.as_str())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| NoSqlError::InvalidDocument(format!("invalid _id: {}", id)))?
                    .to_string();
                Ok(Self::with_id(id, data))
            }
        }
    }

    /// Get a field from the document
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Merge fields into the document
    pub fn merge(&mut self, changes: &Map<String, Value>) {
        for (key, value) in changes {
            if key != ID_FIELD {
                self.data.insert(key.clone(), value.clone());
            }
        }
    }

    /// The document as seen by queries and pipelines: `_id` in `$oid` form plus data
    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.data.len() + 1);
        map.insert(ID_FIELD.to_string(), oid(&self.id));
        for (key, value) in &self.data {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}

/// Wrap a raw id string in its native `$oid` form
pub fn oid(id: &str) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(OID_KEY.to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

/// Extract the raw id from a `{"$oid": ...}` value
pub fn as_oid(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(OID_KEY).and_then(Value::as_str),
        _ => None,
    }
}

/// Extract epoch milliseconds from a `{"$date": ...}` value
pub fn as_date_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(DATE_KEY).and_then(Value::as_i64),
        _ => None,
    }
}

/// Generate an ObjectId-style identifier.
///
/// Layout: 4 bytes seconds since epoch, 5 bytes per-process random, 3 bytes
/// counter. Ids generated by one process sort in generation order.
pub fn generate_object_id() -> String {
    static PROCESS_RANDOM: OnceLock<[u8; 5]> = OnceLock::new();
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let random = PROCESS_RANDOM.get_or_init(|| {
        let bytes = uuid::Uuid::new_v4().into_bytes();
        [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]]
    });

    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::SeqCst) & 0x00FF_FFFF;

    let mut id = String::with_capacity(24);
    id.push_str(&format!("{:08x}", seconds));
    for byte in random {
        id.push_str(&format!("{:02x}", byte));
    }
    id.push_str(&format!("{:06x}", count));
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_creation() {
        let data = json!({"name": "test", "value": 42});
        let doc = Document::from_value(data).unwrap();
        assert_eq!(doc.id.len(), 24);
        assert_eq!(doc.get("name"), Some(&json!("test")));
    }

    #[test]
    fn test_caller_supplied_oid_is_kept() {
        let doc = Document::from_value(json!({"_id": {"$oid": "abc"}, "x": 1})).unwrap();
        assert_eq!(doc.id, "abc");
        assert!(doc.get("_id").is_none());
        assert_eq!(doc.to_json(), json!({"_id": {"$oid": "abc"}, "x": 1}));
    }

    #[test]
    fn test_object_ids_sort_in_generation_order() {
        let ids: Vec<String> = (0..50).map(|_| generate_object_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_extended_json_helpers() {
        assert_eq!(as_oid(&oid("ff")), Some("ff"));
        assert_eq!(as_oid(&json!("ff")), None);
        assert_eq!(as_date_millis(&json!({"$date": 1000})), Some(1000));
    }
}
