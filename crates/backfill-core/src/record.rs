use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::profile::MigrationProfile;
use crate::store::Document;

/// A document considered for migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub id: String,
    pub partition_key: Option<String>,
    pub target: Option<String>,
    /// Every field of the source document, verbatim.
    pub attributes: Map<String, Value>,
}

/// The record whose target value is propagated to a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRecord {
    pub id: String,
    pub target: Option<String>,
    pub attributes: Map<String, Value>,
}

/// Interpret a field value as a key: non-blank strings and numbers count,
/// everything else is absent.
pub fn key_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A partition as addressed by queries: the rendered key used for lookups
/// and cache keys, plus the field value exactly as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub key: String,
    pub value: Value,
}

impl Partition {
    /// A partition whose stored value is the key itself.
    pub fn from_key(key: impl Into<String>) -> Self {
        let key = key.into();
        Partition {
            value: Value::String(key.clone()),
            key,
        }
    }
}

impl CandidateRecord {
    pub fn from_document(doc: &Document, profile: &MigrationProfile) -> Self {
        CandidateRecord {
            id: doc.id.clone(),
            partition_key: key_value(doc.fields.get(&profile.partition_field)),
            target: key_value(doc.fields.get(&profile.target_field)),
            attributes: doc.fields.clone(),
        }
    }

    pub fn is_migrated(&self) -> bool {
        self.target.is_some()
    }

    /// The record's partition with its raw stored value. Numeric keys stay
    /// numeric so queries match them.
    pub fn partition(&self, profile: &MigrationProfile) -> Option<Partition> {
        let key = self.partition_key.clone()?;
        let value = match self.attributes.get(&profile.partition_field) {
            Some(raw) if key_value(Some(raw)).as_deref() == Some(key.as_str()) => raw.clone(),
            _ => Value::String(key.clone()),
        };
        Some(Partition { key, value })
    }

    /// Still needs the target value and belongs to `partition_key`.
    pub fn needs_update(&self, partition_key: &str) -> bool {
        !self.is_migrated() && self.partition_key.as_deref() == Some(partition_key)
    }
}

impl JoinRecord {
    pub fn from_document(doc: &Document, profile: &MigrationProfile) -> Self {
        JoinRecord {
            id: doc.id.clone(),
            target: key_value(doc.fields.get(&profile.target_field)),
            attributes: doc.fields.clone(),
        }
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    /// The target field as stored on the join record, so numbers are
    /// written back as numbers.
    pub fn target_value(&self, profile: &MigrationProfile) -> Option<Value> {
        self.target.as_ref()?;
        self.attributes.get(&profile.target_field).cloned()
    }
}
