//! Core of the Tether object–relational runtime.
//!
//! An [`Orm`] context owns a [`Schema`], a [`Connection`], an identity map
//! guaranteeing one live [`Entity`] per `(class, id)`, and a [`Changeset`]
//! of intercepted writes that is persisted by one coalesced, deferred flush.
//! Reads compile [`Find`] requests into a single CTE query and fold the
//! results back through the identity map.
//!
//! This crate knows nothing about a specific database; drivers implement
//! [`Connection`].

pub mod changeset;
pub mod compile;
pub mod connection;
pub mod ddl;
pub mod entity;
pub mod error;
pub mod flush;
mod identity;
mod materialize;
pub mod model;
pub mod orm;
pub mod predicate;
mod scheduler;
pub mod schema;
pub mod scope;
pub mod value;

#[cfg(test)]
mod tests;

pub use changeset::{Changeset, InstanceChanges, RelationDelta};
pub use compile::{CompiledQuery, Shape, compile_find};
pub use connection::{Connection, Dialect, DriverError, Row, Statement};
pub use ddl::create_statements;
pub use entity::Entity;
pub use error::{Error, Result};
pub use flush::FlushReport;
pub use model::Model;
pub use orm::{FailedFlush, Orm, OrmConfig, Referencers};
pub use predicate::{Alias, Filter, Find, RawPredicate, Relations, Sql, Where};
pub use schema::{ClassDef, ClassWiki, Column, Relation, ScalarType, Schema, SchemaDef};
pub use scope::AliasScope;
pub use value::{EntityId, PrimaryKeyKind, Value};
