//! Typed wrappers over [`Entity`] for one class.

use crate::{entity::Entity, error::Result, value::Value};

/// A typed view of one schema class. Implementors are thin newtypes around
/// an [`Entity`] and are produced by [`Orm::find_as`](crate::Orm::find_as)
/// and [`Orm::create_as`](crate::Orm::create_as).
pub trait Model: Sized {
  const CLASS: &'static str;

  fn from_entity(entity: Entity) -> Self;

  fn entity(&self) -> &Entity;

  fn get(&self, prop: &str) -> Result<Value> { self.entity().get(prop) }

  fn set(&self, prop: &str, value: impl Into<Value>) -> Result<bool> { self.entity().set(prop, value) }
}
