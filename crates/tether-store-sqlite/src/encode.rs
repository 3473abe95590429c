//! Conversion between Tether values and SQLite storage values.
//!
//! Timestamps are stored as RFC 3339 strings, UUIDs as hyphenated lowercase
//! strings, booleans as 0/1. JSON and array columns are stored as compact
//! JSON text.

use rusqlite::types::Value as SqlValue;
use tether_core::Value;

use crate::{Error, Result};

pub fn encode_value(value: &Value) -> Result<SqlValue> {
  Ok(match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Int(i) => SqlValue::Integer(i64::from(*i)),
    Value::BigInt(i) => SqlValue::Integer(*i),
    Value::Float(f) => SqlValue::Real(*f),
    Value::Text(s) => SqlValue::Text(s.clone()),
    Value::Timestamp(t) => SqlValue::Text(t.to_rfc3339()),
    Value::Uuid(u) => SqlValue::Text(u.hyphenated().to_string()),
    Value::Json(json) => SqlValue::Text(serde_json::to_string(json)?),
    Value::Array(_) => SqlValue::Text(serde_json::to_string(&value.to_json())?),
  })
}

pub fn encode_params(values: &[Value]) -> Result<Vec<SqlValue>> { values.iter().map(encode_value).collect() }

/// Raw SQLite values come back untyped; the runtime decodes them against the
/// column declarations.
pub fn decode_value(column: &str, value: SqlValue) -> Result<Value> {
  Ok(match value {
    SqlValue::Null => Value::Null,
    SqlValue::Integer(i) => Value::BigInt(i),
    SqlValue::Real(f) => Value::Float(f),
    SqlValue::Text(s) => Value::Text(s),
    SqlValue::Blob(_) => return Err(Error::Blob(column.to_owned())),
  })
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};
  use uuid::Uuid;

  use super::*;

  #[test]
  fn booleans_and_timestamps_are_stored_as_plain_sqlite_types() {
    assert_eq!(encode_value(&Value::Bool(true)).unwrap(), SqlValue::Integer(1));
    let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    assert_eq!(
      encode_value(&Value::Timestamp(t)).unwrap(),
      SqlValue::Text("2024-05-01T12:00:00+00:00".into())
    );
  }

  #[test]
  fn arrays_are_stored_as_json_text() {
    let id = Uuid::nil();
    let value = Value::Array(vec![Value::Uuid(id), Value::Uuid(id)]);
    assert_eq!(
      encode_value(&value).unwrap(),
      SqlValue::Text(format!("[\"{id}\",\"{id}\"]"))
    );
  }

  #[test]
  fn blobs_are_refused() {
    assert!(matches!(decode_value("x", SqlValue::Blob(vec![1])), Err(Error::Blob(_))));
  }
}
