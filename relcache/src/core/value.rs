use crate::model::{Model, Reference};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Durable-row object: SQL column name -> stored value
pub type Row = serde_json::Map<String, JsonValue>;

/// Cache-record object: entity alias -> cached value
pub type Record = serde_json::Map<String, JsonValue>;

/// Primary key of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Integer(i64),
    String(String),
}

impl Id {
    /// Convert to the JSON representation used in rows and records
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Integer(i) => JsonValue::from(*i),
            Self::String(s) => JsonValue::from(s.as_str()),
        }
    }

    /// Read an id back from a row or record value
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Self::Integer),
            JsonValue::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Id {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Application-facing field value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    String(String),
    Boolean(bool),
    Date(DateTime<Utc>),
    Reference(Reference),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Interpret the value as an entity id. References yield the referenced id.
    pub fn as_id(&self) -> Option<Id> {
        match self {
            Self::Integer(i) => Some(Id::Integer(*i)),
            Self::String(s) => Some(Id::String(s.clone())),
            Self::Reference(reference) => Some(reference.id().clone()),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Reference(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Self::Date(date) => Some(date),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl From<Reference> for Value {
    fn from(value: Reference) -> Self {
        Self::Reference(value)
    }
}

impl From<Id> for Value {
    fn from(value: Id) -> Self {
        match value {
            Id::Integer(i) => Self::Integer(i),
            Id::String(s) => Self::String(s),
        }
    }
}

/// Application object: entity alias -> value
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Entity {
    fields: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field assignment
    pub fn with(mut self, alias: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(alias.into(), value.into());
        self
    }

    pub fn get(&self, alias: &str) -> Option<&Value> {
        self.fields.get(alias)
    }

    pub fn get_mut(&mut self, alias: &str) -> Option<&mut Value> {
        self.fields.get_mut(alias)
    }

    pub fn set(&mut self, alias: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(alias.into(), value.into());
    }

    pub fn remove(&mut self, alias: &str) -> Option<Value> {
        self.fields.remove(alias)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Read the entity id through the model's id field
    pub fn id(&self, model: &Model) -> Option<Id> {
        self.get(model.id()).and_then(Value::as_id)
    }
}

impl FromIterator<(String, Value)> for Entity {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}
