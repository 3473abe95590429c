//! Error type for `tether-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  /// Tether never writes BLOBs; one showing up means the table was not
  /// created by this runtime.
  #[error("column {0} holds a BLOB, which has no Tether value")]
  Blob(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
