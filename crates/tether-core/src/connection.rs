//! The driver seam: a connection able to run parameterized queries and to
//! execute a batch of statements in one transaction.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::value::Value;

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Dialect {
  Postgres,
  Sqlite,
}

impl Dialect {
  /// Placeholder for the `n`th (1-based) parameter of a statement.
  pub fn placeholder(self, n: usize) -> String {
    match self {
      Self::Postgres => format!("${n}"),
      Self::Sqlite => "?".to_owned(),
    }
  }

  /// Suffix appended to every write statement.
  pub fn returning(self) -> &'static str {
    match self {
      Self::Postgres => " RETURNING 1",
      Self::Sqlite => "",
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
  pub sql:    String,
  pub params: Vec<Value>,
}

impl Statement {
  pub fn new(sql: impl Into<String>) -> Self {
    Self { sql: sql.into(), params: Vec::new() }
  }

  pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
    Self { sql: sql.into(), params }
  }
}

impl fmt::Display for Statement {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.sql)?;
    if !self.params.is_empty() {
      let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
      write!(f, " -- [{}]", params.join(", "))?;
    }
    Ok(())
  }
}

/// One result row. Values are whatever the driver's storage yields; the
/// core decodes them against the declared column types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
  pub columns: Vec<String>,
  pub values:  Vec<Value>,
}

impl Row {
  pub fn get(&self, column: &str) -> Option<&Value> {
    self
      .columns
      .iter()
      .position(|c| c == column)
      .and_then(|i| self.values.get(i))
  }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DriverError(Box<dyn std::error::Error + Send + Sync>);

impl DriverError {
  pub fn new<E>(err: E) -> Self
  where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
  {
    Self(err.into())
  }

  pub fn into_inner(self) -> Box<dyn std::error::Error + Send + Sync> { self.0 }
}

#[async_trait]
pub trait Connection: Send + Sync {
  fn dialect(&self) -> Dialect;

  async fn query(&self, statement: Statement) -> Result<Vec<Row>, DriverError>;

  /// Runs every statement inside one transaction, rolling back on the first
  /// failure. Returns the total number of affected rows.
  async fn transaction(&self, statements: Vec<Statement>) -> Result<u64, DriverError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn placeholders_per_dialect() {
    assert_eq!(Dialect::Postgres.placeholder(3), "$3");
    assert_eq!(Dialect::Sqlite.placeholder(3), "?");
    assert_eq!("SQLite".parse::<Dialect>().unwrap(), Dialect::Sqlite);
  }

  #[test]
  fn row_lookup_by_column() {
    let row = Row {
      columns: vec!["a1_id".into(), "a1_full_name".into()],
      values:  vec![Value::BigInt(1), Value::from("A")],
    };
    assert_eq!(row.get("a1_full_name"), Some(&Value::from("A")));
    assert_eq!(row.get("missing"), None);
  }
}
