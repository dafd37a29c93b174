use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of one row: model name plus integer primary key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub model: String,
    pub pk: i64,
}

impl RecordKey {
    pub fn new(model: impl Into<String>, pk: i64) -> Self {
        Self {
            model: model.into(),
            pk,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.model, self.pk)
    }
}

/// In-memory copy of a row.
///
/// `pk` is cleared once the row has been physically removed, and
/// `deleted_at` mirrors the stored deletion timestamp (milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub model: String,
    pub pk: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl Record {
    pub fn new(model: impl Into<String>, pk: i64) -> Self {
        Self {
            model: model.into(),
            pk: Some(pk),
            deleted_at: None,
            values: Map::new(),
        }
    }

    pub fn key(&self) -> Option<RecordKey> {
        self.pk.map(|pk| RecordKey::new(self.model.clone(), pk))
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }
}
