//! Conversions between the three representations of an entity:
//! application object (`Entity`), durable row (`Row`, keyed by SQL name) and
//! cache record (`Record`, keyed by entity alias).

use super::column::{Column, SqlType};
use super::reference::Reference;
use super::Model;
use crate::core::error::{RelCacheError, Result};
use crate::core::{Entity, Id, Record, Row, Value};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;

impl Model {
    /// Entity to durable row. Fields absent from the entity are left out of the row.
    pub fn entity_to_row(&self, entity: &Entity) -> Row {
        self.encode(entity, Column::sql_name)
    }

    /// Durable row to entity, coercing stored values back to column types
    pub fn row_to_entity(&self, row: &Row) -> Result<Entity> {
        self.decode(row, Column::sql_name)
    }

    /// Entity to cache record
    pub fn entity_to_record(&self, entity: &Entity) -> Record {
        self.encode(entity, Column::entity_alias)
    }

    /// Cache record to entity
    pub fn record_to_entity(&self, record: &Record) -> Result<Entity> {
        self.decode(record, Column::entity_alias)
    }

    pub fn m_entity_to_row(&self, entities: &[Entity]) -> Vec<Row> {
        entities.iter().map(|entity| self.entity_to_row(entity)).collect()
    }

    pub fn m_row_to_entity(&self, rows: &[Row]) -> Result<Vec<Entity>> {
        rows.iter().map(|row| self.row_to_entity(row)).collect()
    }

    pub fn m_entity_to_record(&self, entities: &[Entity]) -> Vec<Record> {
        entities
            .iter()
            .map(|entity| self.entity_to_record(entity))
            .collect()
    }

    pub fn m_record_to_entity(&self, records: &[Record]) -> Result<Vec<Entity>> {
        records
            .iter()
            .map(|record| self.record_to_entity(record))
            .collect()
    }

    fn encode(&self, entity: &Entity, key: fn(&Column) -> &str) -> serde_json::Map<String, JsonValue> {
        let mut output = serde_json::Map::new();
        for column in self.non_reference_columns() {
            if let Some(value) = entity.get(column.entity_alias()) {
                output.insert(key(column).to_string(), value_to_json(value));
            }
        }
        for column in self.reference_columns() {
            if let Some(value) = entity.get(column.entity_alias()) {
                let id = value
                    .as_id()
                    .map(|id| id.to_json())
                    .unwrap_or(JsonValue::Null);
                output.insert(key(column).to_string(), id);
            }
        }
        output
    }

    fn decode(&self, input: &serde_json::Map<String, JsonValue>, key: fn(&Column) -> &str) -> Result<Entity> {
        let mut entity = Entity::new();
        for column in self.non_reference_columns() {
            if let Some(raw) = input.get(key(column)) {
                let value = json_to_value(raw, column.sql_type()).map_err(|reason| {
                    RelCacheError::InvalidValue(format!(
                        "{}.{}: {}",
                        self.table_name(),
                        column.entity_alias(),
                        reason
                    ))
                })?;
                entity.set(column.entity_alias(), value);
            }
        }
        for column in self.reference_columns() {
            if let Some(raw) = input.get(key(column)) {
                entity.set(column.entity_alias(), reference_value(column, raw)?);
            }
        }
        Ok(entity)
    }
}

fn reference_value(column: &Column, raw: &JsonValue) -> Result<Value> {
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let id = Id::from_json(raw).ok_or_else(|| {
        RelCacheError::InvalidValue(format!(
            "{}: {} is not a valid reference id",
            column.entity_alias(),
            raw
        ))
    })?;
    Ok(Value::Reference(Reference::for_column(
        id,
        column.ref_model(),
        column.ref_alias(),
    )))
}

/// Encode an entity value for a row or a record
pub(crate) fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Integer(i) => JsonValue::from(*i),
        Value::String(s) => JsonValue::from(s.as_str()),
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Date(date) => JsonValue::from(date.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        Value::Reference(reference) => reference.id().to_json(),
    }
}

fn json_to_value(raw: &JsonValue, sql_type: SqlType) -> std::result::Result<Value, String> {
    if raw.is_null() {
        return Ok(Value::Null);
    }
    match sql_type {
        SqlType::Integer => json_to_integer(raw).map(Value::Integer),
        SqlType::String => Ok(Value::String(match raw {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })),
        SqlType::Boolean => Ok(Value::Boolean(json_to_bool(raw))),
        SqlType::Date => json_to_date(raw).map(Value::Date),
    }
}

fn json_to_integer(raw: &JsonValue) -> std::result::Result<i64, String> {
    match raw {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| format!("{n} is not an integer")),
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("\"{s}\" is not an integer")),
        JsonValue::Bool(b) => Ok(i64::from(*b)),
        other => Err(format!("{other} is not an integer")),
    }
}

/// Engines without a native boolean store 0/1 or text
fn json_to_bool(raw: &JsonValue) -> bool {
    match raw {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !matches!(s.trim(), "" | "0" | "false" | "FALSE" | "False"),
        JsonValue::Null => false,
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

fn json_to_date(raw: &JsonValue) -> std::result::Result<DateTime<Utc>, String> {
    match raw {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|date| date.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .map(|naive| naive.and_utc())
            })
            .map_err(|_| format!("\"{s}\" is not a date")),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| format!("{n} is not a timestamp")),
        other => Err(format!("{other} is not a date")),
    }
}
