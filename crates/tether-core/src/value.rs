//! Property values, entity identifiers, and the conversions between driver
//! storage, JSON documents, and declared column types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  error::{Error, Result},
  schema::{Column, ScalarType},
};

// ─── Value ───────────────────────────────────────────────────────────────────

/// A single property value, as held in memory and bound as a statement
/// parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i32),
  BigInt(i64),
  Float(f64),
  Text(String),
  Timestamp(DateTime<Utc>),
  Uuid(Uuid),
  Json(serde_json::Value),
  Array(Vec<Value>),
}

impl Value {
  pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::Text(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Self::Int(i) => Some(i64::from(*i)),
      Self::BigInt(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Self::Float(f) => Some(*f),
      Self::Int(i) => Some(f64::from(*i)),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Self::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&[Value]> {
    match self {
      Self::Array(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_json(&self) -> Option<&serde_json::Value> {
    match self {
      Self::Json(j) => Some(j),
      _ => None,
    }
  }

  pub fn type_name(&self) -> &'static str {
    match self {
      Self::Null => "null",
      Self::Bool(_) => "boolean",
      Self::Int(_) => "integer",
      Self::BigInt(_) => "bigint",
      Self::Float(_) => "float",
      Self::Text(_) => "text",
      Self::Timestamp(_) => "timestamp",
      Self::Uuid(_) => "uuid",
      Self::Json(_) => "json",
      Self::Array(_) => "array",
    }
  }

  /// The JSON rendering used when a value is stored as a document, such as
  /// an array column on SQLite.
  pub fn to_json(&self) -> serde_json::Value {
    use serde_json::Value as J;
    match self {
      Self::Null => J::Null,
      Self::Bool(b) => J::Bool(*b),
      Self::Int(i) => J::from(*i),
      Self::BigInt(i) => J::from(*i),
      Self::Float(f) => J::from(*f),
      Self::Text(s) => J::String(s.clone()),
      Self::Timestamp(t) => J::String(t.to_rfc3339()),
      Self::Uuid(u) => J::String(u.to_string()),
      Self::Json(j) => j.clone(),
      Self::Array(items) => J::Array(items.iter().map(Self::to_json).collect()),
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Null => f.write_str("NULL"),
      Self::Text(s) => write!(f, "{s:?}"),
      other => write!(f, "{}", other.to_json()),
    }
  }
}

macro_rules! value_from {
  ($($ty:ty => $variant:ident),* $(,)?) => {
    $(impl From<$ty> for Value {
      fn from(v: $ty) -> Self { Self::$variant(v.into()) }
    })*
  };
}

value_from! {
  bool => Bool,
  i32 => Int,
  i64 => BigInt,
  f64 => Float,
  String => Text,
  &str => Text,
  DateTime<Utc> => Timestamp,
  Uuid => Uuid,
  serde_json::Value => Json,
}

impl<T: Into<Value>> From<Vec<T>> for Value {
  fn from(items: Vec<T>) -> Self {
    Self::Array(items.into_iter().map(Into::into).collect())
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(v: Option<T>) -> Self { v.map_or(Self::Null, Into::into) }
}

impl From<EntityId> for Value {
  fn from(id: EntityId) -> Self {
    match id {
      EntityId::Int(i) => Self::Int(i),
      EntityId::BigInt(i) => Self::BigInt(i),
      EntityId::Uuid(u) => Self::Uuid(u),
    }
  }
}

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// Primary key of a persisted instance. Every table in an inheritance chain
/// shares the same id for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum EntityId {
  Int(i32),
  BigInt(i64),
  Uuid(Uuid),
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Int(i) => write!(f, "{i}"),
      Self::BigInt(i) => write!(f, "{i}"),
      Self::Uuid(u) => write!(f, "{u}"),
    }
  }
}

impl From<i32> for EntityId {
  fn from(i: i32) -> Self { Self::Int(i) }
}

impl From<i64> for EntityId {
  fn from(i: i64) -> Self { Self::BigInt(i) }
}

impl From<Uuid> for EntityId {
  fn from(u: Uuid) -> Self { Self::Uuid(u) }
}

/// Primary key representation chosen per inheritance root.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PrimaryKeyKind {
  #[default]
  Uuid,
  Int,
  BigInt,
}

impl PrimaryKeyKind {
  pub fn scalar(self) -> ScalarType {
    match self {
      Self::Uuid => ScalarType::Uuid,
      Self::Int => ScalarType::Integer,
      Self::BigInt => ScalarType::BigInt,
    }
  }

  pub fn id_from_value(self, value: &Value) -> Result<EntityId> {
    let column = Column::new(self.scalar());
    match decode_raw(value.clone(), &column, "id")? {
      Value::Int(i) => Ok(EntityId::Int(i)),
      Value::BigInt(i) => Ok(EntityId::BigInt(i)),
      Value::Uuid(u) => Ok(EntityId::Uuid(u)),
      other => Err(Error::decode("id", format!("unexpected {}", other.type_name()))),
    }
  }

  pub fn id_from_json(self, json: &serde_json::Value) -> Result<EntityId> {
    let column = Column::new(self.scalar());
    match decode_json(json, &column, "id")? {
      Value::Int(i) => Ok(EntityId::Int(i)),
      Value::BigInt(i) => Ok(EntityId::BigInt(i)),
      Value::Uuid(u) => Ok(EntityId::Uuid(u)),
      other => Err(Error::decode("id", format!("unexpected {}", other.type_name()))),
    }
  }
}

// ─── Conformance ─────────────────────────────────────────────────────────────

/// Outcome of checking a value against a declared column.
#[derive(Debug, PartialEq)]
pub(crate) enum Conformed {
  /// The value (possibly widened, possibly with invalid array elements
  /// removed) can be stored. `dropped` counts removed elements.
  Accepted { value: Value, dropped: usize },
  Rejected,
}

fn conform_scalar(value: Value, ty: ScalarType) -> Option<Value> {
  match (ty, value) {
    (ScalarType::Text, v @ Value::Text(_))
    | (ScalarType::Integer, v @ Value::Int(_))
    | (ScalarType::BigInt, v @ Value::BigInt(_))
    | (ScalarType::Float, v @ Value::Float(_))
    | (ScalarType::Boolean, v @ Value::Bool(_))
    | (ScalarType::Timestamp, v @ Value::Timestamp(_))
    | (ScalarType::Uuid, v @ Value::Uuid(_))
    | (ScalarType::Json, v @ Value::Json(_)) => Some(v),
    (ScalarType::BigInt, Value::Int(i)) => Some(Value::BigInt(i64::from(i))),
    (ScalarType::Integer, Value::BigInt(i)) => i32::try_from(i).ok().map(Value::Int),
    (ScalarType::Float, Value::Int(i)) => Some(Value::Float(f64::from(i))),
    (ScalarType::Uuid, Value::Text(s)) => Uuid::parse_str(&s).ok().map(Value::Uuid),
    _ => None,
  }
}

/// Checks `value` against `column`, widening where lossless.
pub(crate) fn conform(value: Value, column: &Column) -> Conformed {
  if value.is_null() {
    return if column.nullable {
      Conformed::Accepted { value, dropped: 0 }
    } else {
      Conformed::Rejected
    };
  }

  if column.array {
    let Value::Array(items) = value else {
      return Conformed::Rejected;
    };
    let total = items.len();
    let kept: Vec<Value> = items
      .into_iter()
      .filter_map(|item| conform_scalar(item, column.ty))
      .collect();
    let dropped = total - kept.len();
    return Conformed::Accepted {
      value: Value::Array(kept),
      dropped,
    };
  }

  match conform_scalar(value, column.ty) {
    Some(value) => Conformed::Accepted { value, dropped: 0 },
    None => Conformed::Rejected,
  }
}

// ─── Decoding ────────────────────────────────────────────────────────────────

fn decode_raw_scalar(raw: Value, ty: ScalarType, what: &str) -> Result<Value> {
  let mismatch =
    |raw: &Value| Error::decode(what, format!("{} is not a {ty}", raw.type_name()));
  let v = match (ty, raw) {
    (_, Value::Null) => Value::Null,
    (ScalarType::Text, Value::Text(s)) => Value::Text(s),
    (ScalarType::Integer, Value::Int(i)) => Value::Int(i),
    (ScalarType::Integer, Value::BigInt(i)) => {
      Value::Int(i32::try_from(i).map_err(|e| Error::decode(what, e))?)
    }
    (ScalarType::BigInt, Value::BigInt(i)) => Value::BigInt(i),
    (ScalarType::BigInt, Value::Int(i)) => Value::BigInt(i64::from(i)),
    (ScalarType::BigInt, Value::Text(s)) => {
      Value::BigInt(s.parse().map_err(|e| Error::decode(what, e))?)
    }
    (ScalarType::Float, Value::Float(f)) => Value::Float(f),
    (ScalarType::Float, Value::BigInt(i)) => Value::Float(i as f64),
    (ScalarType::Float, Value::Int(i)) => Value::Float(f64::from(i)),
    (ScalarType::Boolean, Value::Bool(b)) => Value::Bool(b),
    (ScalarType::Boolean, Value::BigInt(i)) => Value::Bool(i != 0),
    (ScalarType::Boolean, Value::Int(i)) => Value::Bool(i != 0),
    (ScalarType::Timestamp, Value::Timestamp(t)) => Value::Timestamp(t),
    (ScalarType::Timestamp, Value::Text(s)) => Value::Timestamp(parse_timestamp(&s, what)?),
    (ScalarType::Uuid, Value::Uuid(u)) => Value::Uuid(u),
    (ScalarType::Uuid, Value::Text(s)) => {
      Value::Uuid(Uuid::parse_str(&s).map_err(|e| Error::decode(what, e))?)
    }
    (ScalarType::Json, Value::Json(j)) => Value::Json(j),
    (ScalarType::Json, Value::Text(s)) => Value::Json(serde_json::from_str(&s)?),
    (_, raw) => return Err(mismatch(&raw)),
  };
  Ok(v)
}

/// Decodes a value as returned by a driver into the representation declared
/// by `column`. Drivers without native arrays or JSON hand back text.
pub(crate) fn decode_raw(raw: Value, column: &Column, what: &str) -> Result<Value> {
  if !column.array {
    return decode_raw_scalar(raw, column.ty, what);
  }
  match raw {
    Value::Null => Ok(Value::Null),
    Value::Array(items) => items
      .into_iter()
      .map(|item| decode_raw_scalar(item, column.ty, what))
      .collect::<Result<Vec<_>>>()
      .map(Value::Array),
    Value::Text(s) => {
      let json: serde_json::Value = serde_json::from_str(&s)?;
      decode_json(&json, column, what)
    }
    Value::Json(json) => decode_json(&json, column, what),
    other => Err(Error::decode(
      what,
      format!("{} is not an array", other.type_name()),
    )),
  }
}

fn parse_timestamp(s: &str, what: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|t| t.with_timezone(&Utc))
    .or_else(|_| {
      // Postgres renders timestamps inside jsonb without the `T` separator.
      DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z").map(|t| t.with_timezone(&Utc))
    })
    .map_err(|e| Error::decode(what, e))
}

fn decode_json_scalar(json: &serde_json::Value, ty: ScalarType, what: &str) -> Result<Value> {
  use serde_json::Value as J;
  let mismatch = || Error::decode(what, format!("{json} is not a {ty}"));
  let v = match (ty, json) {
    (_, J::Null) => Value::Null,
    (ScalarType::Json, j) => Value::Json(j.clone()),
    (ScalarType::Text, J::String(s)) => Value::Text(s.clone()),
    (ScalarType::Integer, J::Number(n)) => {
      let i = n.as_i64().ok_or_else(mismatch)?;
      Value::Int(i32::try_from(i).map_err(|e| Error::decode(what, e))?)
    }
    (ScalarType::BigInt, J::Number(n)) => Value::BigInt(n.as_i64().ok_or_else(mismatch)?),
    (ScalarType::BigInt, J::String(s)) => {
      Value::BigInt(s.parse().map_err(|e| Error::decode(what, e))?)
    }
    (ScalarType::Float, J::Number(n)) => Value::Float(n.as_f64().ok_or_else(mismatch)?),
    (ScalarType::Boolean, J::Bool(b)) => Value::Bool(*b),
    (ScalarType::Boolean, J::Number(n)) => Value::Bool(n.as_i64().ok_or_else(mismatch)? != 0),
    (ScalarType::Timestamp, J::String(s)) => Value::Timestamp(parse_timestamp(s, what)?),
    (ScalarType::Uuid, J::String(s)) => {
      Value::Uuid(Uuid::parse_str(s).map_err(|e| Error::decode(what, e))?)
    }
    _ => return Err(mismatch()),
  };
  Ok(v)
}

/// Decodes a property out of an assembled JSON document.
pub(crate) fn decode_json(json: &serde_json::Value, column: &Column, what: &str) -> Result<Value> {
  if !column.array {
    return decode_json_scalar(json, column.ty, what);
  }
  match json {
    serde_json::Value::Null => Ok(Value::Null),
    serde_json::Value::Array(items) => items
      .iter()
      .map(|item| decode_json_scalar(item, column.ty, what))
      .collect::<Result<Vec<_>>>()
      .map(Value::Array),
    // SQLite nests array columns as their stored text when not wrapped.
    serde_json::Value::String(s) => {
      let inner: serde_json::Value = serde_json::from_str(s)?;
      decode_json(&inner, column, what)
    }
    other => Err(Error::decode(what, format!("{other} is not an array"))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn integer_widens_to_bigint_and_float() {
    let big = Column::new(ScalarType::BigInt);
    assert_eq!(
      conform(Value::Int(3), &big),
      Conformed::Accepted { value: Value::BigInt(3), dropped: 0 }
    );
    let float = Column::new(ScalarType::Float);
    assert_eq!(
      conform(Value::Int(3), &float),
      Conformed::Accepted { value: Value::Float(3.0), dropped: 0 }
    );
  }

  #[test]
  fn null_requires_nullable_column() {
    let text = Column::new(ScalarType::Text);
    assert_eq!(conform(Value::Null, &text), Conformed::Rejected);
    assert!(matches!(
      conform(Value::Null, &text.nullable()),
      Conformed::Accepted { value: Value::Null, .. }
    ));
  }

  #[test]
  fn array_elements_of_wrong_type_are_dropped() {
    let tags = Column::new(ScalarType::Text).array();
    let got = conform(
      Value::Array(vec![Value::from("a"), Value::Int(1), Value::from("b")]),
      &tags,
    );
    assert_eq!(
      got,
      Conformed::Accepted {
        value:   Value::from(vec!["a", "b"]),
        dropped: 1,
      }
    );
    assert_eq!(conform(Value::from("a"), &tags), Conformed::Rejected);
  }

  #[test]
  fn decode_text_array_from_sqlite_storage() {
    let tags = Column::new(ScalarType::Text).array();
    let got = decode_raw(Value::Text(r#"["x","y"]"#.into()), &tags, "tags").unwrap();
    assert_eq!(got, Value::from(vec!["x", "y"]));
  }

  #[test]
  fn decode_bigint_rendered_as_text_in_documents() {
    let big = Column::new(ScalarType::BigInt);
    let got = decode_json(&serde_json::json!("9007199254740993"), &big, "n").unwrap();
    assert_eq!(got, Value::BigInt(9_007_199_254_740_993));
  }

  #[test]
  fn decode_postgres_jsonb_timestamp() {
    let ts = Column::new(ScalarType::Timestamp);
    let got =
      decode_json(&serde_json::json!("2024-03-01T10:00:00.5+00:00"), &ts, "t").unwrap();
    assert!(matches!(got, Value::Timestamp(_)));
  }

  #[test]
  fn decode_rejects_mismatched_storage() {
    let uuid = Column::new(ScalarType::Uuid);
    assert!(decode_raw(Value::Float(1.5), &uuid, "id").is_err());
  }
}
