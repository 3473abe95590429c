//! Error types for `tether-core`.

use thiserror::Error;

use crate::{connection::DriverError, value::EntityId};

#[derive(Debug, Error)]
pub enum Error {
  // ── Configuration ─────────────────────────────────────────────────────────
  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("invalid schema: {0}")]
  Schema(String),

  #[error("class '{0}' is not registered in the schema")]
  UnknownClass(String),

  #[error("cannot create an instance of class '{0}' since it is abstract")]
  AbstractClass(String),

  // ── Property / predicate ──────────────────────────────────────────────────
  #[error(
    "'{property}' is not a valid property of class {class}; valid properties: {}",
    valid.join(", ")
  )]
  UnknownProperty {
    class:    String,
    property: String,
    valid:    Vec<String>,
  },

  #[error("invalid predicate on '{property}': {reason}")]
  InvalidPredicate { property: String, reason: String },

  #[error("'{property}' of class {class} is not a {expected}")]
  WrongPropertyKind {
    class:    String,
    property: String,
    expected: &'static str,
  },

  #[error("entity belongs to a different Orm context")]
  ForeignEntity,

  #[error("entity handle no longer refers to a live instance")]
  StaleHandle,

  // ── Deletion ──────────────────────────────────────────────────────────────
  /// Non-nullable singular relations still point at the entity. The caller
  /// must list dependents, reassign or detach them, then delete again.
  #[error(
    "cannot delete {class} {id}: still required by {}; call list_dependents and reassign them first",
    dependents.join(", ")
  )]
  DeletionPrecondition {
    class:      String,
    id:         EntityId,
    dependents: Vec<String>,
  },

  // ── Persistence ───────────────────────────────────────────────────────────
  #[error("driver error: {0}")]
  Driver(#[from] DriverError),

  #[error("could not decode {what}: {reason}")]
  Decode { what: String, reason: String },

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}

impl Error {
  pub(crate) fn decode(what: impl Into<String>, reason: impl ToString) -> Self {
    Self::Decode {
      what:   what.into(),
      reason: reason.to_string(),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
