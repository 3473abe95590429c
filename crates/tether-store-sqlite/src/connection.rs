//! [`SqliteConnection`], the SQLite implementation of [`Connection`].

use std::path::Path;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use tracing::debug;

use tether_core::{Connection, Dialect, DriverError, Row, Statement};

use crate::{
  Result,
  encode::{decode_value, encode_params},
};

// ─── Connection ──────────────────────────────────────────────────────────────

/// A Tether connection backed by a single SQLite database.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteConnection {
  conn: tokio_rusqlite::Connection,
}

impl SqliteConnection {
  /// Open (or create) a database at `path`.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  /// Open an in-memory database, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    // Hard deletes rely on cascades from the root table.
    conn
      .call(|conn| {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
      })
      .await?;
    Ok(Self { conn })
  }

  async fn fetch(&self, statement: Statement) -> Result<Vec<Row>> {
    let params = encode_params(&statement.params)?;
    let sql = statement.sql;
    let (columns, raw): (Vec<String>, Vec<Vec<SqlValue>>) = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
        let width = columns.len();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut raw = Vec::new();
        while let Some(row) = rows.next()? {
          let mut values = Vec::with_capacity(width);
          for i in 0..width {
            values.push(row.get::<_, SqlValue>(i)?);
          }
          raw.push(values);
        }
        Ok((columns, raw))
      })
      .await?;

    raw
      .into_iter()
      .map(|values| {
        let values = columns
          .iter()
          .zip(values)
          .map(|(column, value)| decode_value(column, value))
          .collect::<Result<Vec<_>>>()?;
        Ok(Row { columns: columns.clone(), values })
      })
      .collect()
  }

  async fn execute_all(&self, statements: Vec<Statement>) -> Result<u64> {
    let encoded = statements
      .into_iter()
      .map(|s| Ok((s.sql, encode_params(&s.params)?)))
      .collect::<Result<Vec<_>>>()?;
    let affected = self
      .conn
      .call(move |conn| {
        // Dropping the transaction on an early return rolls it back.
        let tx = conn.transaction()?;
        let mut affected = 0u64;
        for (sql, params) in &encoded {
          affected += tx.execute(sql, rusqlite::params_from_iter(params.iter()))? as u64;
        }
        tx.commit()?;
        Ok(affected)
      })
      .await?;
    Ok(affected)
  }
}

#[async_trait]
impl Connection for SqliteConnection {
  fn dialect(&self) -> Dialect { Dialect::Sqlite }

  async fn query(&self, statement: Statement) -> Result<Vec<Row>, DriverError> {
    self.fetch(statement).await.map_err(DriverError::new)
  }

  async fn transaction(&self, statements: Vec<Statement>) -> Result<u64, DriverError> {
    let count = statements.len();
    let affected = self.execute_all(statements).await.map_err(DriverError::new)?;
    debug!(statements = count, affected, "sqlite transaction committed");
    Ok(affected)
  }
}
