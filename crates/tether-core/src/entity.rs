//! Entity handles: the explicit accessor interface through which every read
//! and write of a live instance goes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::{
  error::{Error, Result},
  identity::{RelationState, SlotId},
  orm::{Orm, Session},
  schema::{Property, UPDATED_AT},
  value::{Conformed, EntityId, Value, conform},
};

/// A counted handle on the unique live instance of one `(class, id)`.
///
/// Clones share the instance; equality is identity within one `Orm`
/// context.
pub struct Entity {
  orm:   Orm,
  slot:  SlotId,
  class: String,
  id:    EntityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
  Set,
  Push,
  Remove,
}

impl Entity {
  /// Wraps a slot on which one holder was already taken for this handle.
  pub(crate) fn from_counted(orm: Orm, slot: SlotId, class: String, id: EntityId) -> Self {
    Self { orm, slot, class, id }
  }

  pub(crate) fn orm(&self) -> &Orm { &self.orm }

  pub(crate) fn slot(&self) -> SlotId { self.slot }

  pub fn class(&self) -> &str { &self.class }

  pub fn id(&self) -> EntityId { self.id }

  pub fn updated_at(&self) -> Result<DateTime<Utc>> {
    Ok(self.orm.session().registry.get(self.slot)?.updated_at)
  }

  /// True once the instance was deleted through [`Orm::delete`].
  pub fn is_deleted(&self) -> bool {
    self.orm.session().registry.get(self.slot).is_ok_and(|r| r.deleted)
  }

  // ── Fields ────────────────────────────────────────────────────────────────

  /// Current in-memory value of a column, `id` or `updatedAt`.
  pub fn get(&self, prop: &str) -> Result<Value> {
    let property = self.orm.schema().classify(&self.class, prop)?;
    let session = self.orm.session();
    let record = session.registry.get(self.slot)?;
    match property {
      Property::Id => Ok(Value::from(record.id)),
      Property::UpdatedAt => Ok(Value::Timestamp(record.updated_at)),
      Property::Column { .. } => Ok(record.fields.get(prop).cloned().unwrap_or(Value::Null)),
      Property::Relation { .. } => Err(self.wrong_kind(prop, "column")),
    }
  }

  /// Whether a relation has been materialized (eagerly, lazily or by a
  /// write).
  pub fn is_loaded(&self, prop: &str) -> Result<bool> {
    self.orm.schema().relation(&self.class, prop)?;
    let session = self.orm.session();
    Ok(!matches!(session.registry.get(self.slot)?.relation(prop), RelationState::Unloaded))
  }

  /// Assigns a column. Returns `Ok(false)` when the value does not fit the
  /// column; the previous value is kept.
  pub fn set(&self, prop: &str, value: impl Into<Value>) -> Result<bool> {
    let value = value.into();
    self.write_field(prop, move |_| Some(value))
  }

  /// Edits a JSON column in place; the result is revalidated and recorded as
  /// a whole-value change.
  pub fn update_json(&self, prop: &str, edit: impl FnOnce(&mut serde_json::Value)) -> Result<bool> {
    self.write_field(prop, |current| {
      let mut json = match current {
        Value::Null => serde_json::Value::Null,
        Value::Json(json) => json,
        _ => return None,
      };
      edit(&mut json);
      Some(Value::Json(json))
    })
  }

  /// Edits an array column in place, see [`Entity::update_json`].
  pub fn update_array(&self, prop: &str, edit: impl FnOnce(&mut Vec<Value>)) -> Result<bool> {
    self.write_field(prop, |current| {
      let mut items = match current {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        _ => return None,
      };
      edit(&mut items);
      Some(Value::Array(items))
    })
  }

  fn write_field(&self, prop: &str, make: impl FnOnce(Value) -> Option<Value>) -> Result<bool> {
    let column = match self.orm.schema().classify(&self.class, prop)? {
      Property::Id | Property::UpdatedAt => {
        warn!(class = %self.class, prop, "id and updatedAt are managed by the runtime; write ignored");
        return Ok(false);
      }
      Property::Relation { .. } => return Err(self.wrong_kind(prop, "column")),
      Property::Column { column, .. } => column,
    };

    // The edit closure runs without the session lock held.
    let current = self.get(prop)?;
    let Some(candidate) = make(current) else {
      warn!(class = %self.class, prop, "stored value has an unexpected shape; write ignored");
      return Ok(false);
    };
    let value = match conform(candidate, column) {
      Conformed::Accepted { value, dropped } => {
        if dropped > 0 {
          warn!(class = %self.class, prop, dropped, "array elements of the wrong type dropped");
        }
        value
      }
      Conformed::Rejected => {
        warn!(class = %self.class, prop, expected = %column.ty, "value does not fit the column; write ignored");
        return Ok(false);
      }
    };

    let spawn = {
      let mut session = self.orm.session();
      let Session { registry, changes, scheduler, .. } = &mut *session;
      let record = registry.get_mut(self.slot)?;
      if record.deleted {
        warn!(class = %self.class, id = %self.id, prop, "write to a deleted instance ignored");
        return Ok(false);
      }
      let now = Utc::now();
      record.updated_at = now;
      record.fields.insert(prop.to_owned(), value.clone());
      changes.set_field(&self.class, self.id, prop, value, now);
      scheduler.request()
    };
    if spawn {
      self.orm.spawn_flush();
    }
    Ok(true)
  }

  // ── Relations ─────────────────────────────────────────────────────────────

  /// Target of a singular relation, loading it first when needed.
  pub async fn relation(&self, prop: &str) -> Result<Option<Entity>> {
    Ok(self.ensure_loaded(prop, false).await?.into_iter().next())
  }

  /// Members of a plural relation, loading them first when needed.
  pub async fn relations(&self, prop: &str) -> Result<Vec<Entity>> { self.ensure_loaded(prop, true).await }

  pub fn set_relation(&self, prop: &str, target: Option<&Entity>) -> Result<bool> {
    let targets: Vec<&Entity> = target.into_iter().collect();
    self.edit_relation(prop, false, Edit::Set, &targets)
  }

  pub fn set_relations(&self, prop: &str, targets: &[Entity]) -> Result<bool> {
    let mut seen = BTreeSet::new();
    let mut unique = Vec::with_capacity(targets.len());
    for target in targets {
      if seen.insert((target.class.as_str(), target.id)) {
        unique.push(target);
      } else {
        warn!(class = %self.class, prop, target = %target.id, "duplicate relation member dropped");
      }
    }
    self.edit_relation(prop, true, Edit::Set, &unique)
  }

  pub fn push_relation(&self, prop: &str, target: &Entity) -> Result<bool> {
    self.edit_relation(prop, true, Edit::Push, &[target])
  }

  pub fn remove_relation(&self, prop: &str, target: &Entity) -> Result<bool> {
    self.edit_relation(prop, true, Edit::Remove, &[target])
  }

  fn edit_relation(&self, prop: &str, many: bool, edit: Edit, targets: &[&Entity]) -> Result<bool> {
    let schema = self.orm.schema();
    let (owner, relation) = schema.relation(&self.class, prop)?;
    if relation.many != many {
      return Err(self.wrong_kind(prop, if many { "plural relation" } else { "singular relation" }));
    }
    for target in targets {
      if !self.orm.same_context(&target.orm) {
        return Err(Error::ForeignEntity);
      }
      if !schema.is_a(&target.class, &relation.target) {
        warn!(
          class = %self.class, prop, expected = %relation.target, got = %target.class,
          "relation target of the wrong class; write ignored"
        );
        return Ok(false);
      }
    }
    if edit == Edit::Set && !many && targets.is_empty() && !relation.nullable {
      warn!(class = %self.class, prop, "relation is not nullable; write ignored");
      return Ok(false);
    }
    let junction = owner.junction_table(prop);

    let spawn = {
      let mut session = self.orm.session();
      let Session { registry, changes, scheduler, .. } = &mut *session;
      if registry.get(self.slot)?.deleted {
        warn!(class = %self.class, id = %self.id, prop, "write to a deleted instance ignored");
        return Ok(false);
      }
      for target in targets {
        if registry.get(target.slot)?.deleted {
          warn!(class = %self.class, prop, target = %target.id, "deleted instance cannot be referenced");
          return Ok(false);
        }
      }

      let now = Utc::now();
      let current = registry.get(self.slot)?.relation(prop).clone();
      // (holders released afterwards, new state); `None` keeps the relation
      // unloaded.
      let (previous, next): (Vec<SlotId>, Option<RelationState>) = match (edit, current) {
        (Edit::Set, RelationState::Unloaded) => {
          changes.forced_unlink(junction, self.id);
          let delta = changes.reset_relation(&self.class, self.id, prop, now);
          targets.iter().for_each(|t| delta.add(t.id));
          (Vec::new(), Some(loaded_state(many, targets)))
        }
        (Edit::Set, current) => {
          let old = current.targets();
          let new: Vec<SlotId> = targets.iter().map(|t| t.slot).collect();
          if old == new {
            return Ok(true);
          }
          let delta = changes.relation(&self.class, self.id, prop, now);
          for slot in old.iter().filter(|s| !new.contains(s)) {
            delta.remove(registry.get(*slot)?.id);
          }
          for target in targets.iter().filter(|t| !old.contains(&t.slot)) {
            delta.add(target.id);
          }
          (old, Some(loaded_state(many, targets)))
        }
        (Edit::Push, RelationState::Unloaded) => {
          changes.relation(&self.class, self.id, prop, now).add(first(targets)?.id);
          (Vec::new(), None)
        }
        (Edit::Remove, RelationState::Unloaded) => {
          changes.relation(&self.class, self.id, prop, now).remove(first(targets)?.id);
          (Vec::new(), None)
        }
        (Edit::Push, current) => {
          let target = first(targets)?;
          let old = current.targets();
          if old.contains(&target.slot) {
            warn!(class = %self.class, prop, target = %target.id, "already a member; duplicate dropped");
            return Ok(false);
          }
          changes.relation(&self.class, self.id, prop, now).add(target.id);
          let mut slots = old.clone();
          slots.push(target.slot);
          (old, Some(RelationState::Many(slots)))
        }
        (Edit::Remove, current) => {
          let target = first(targets)?;
          let old = current.targets();
          if !old.contains(&target.slot) {
            return Ok(false);
          }
          changes.relation(&self.class, self.id, prop, now).remove(target.id);
          let slots = old.iter().copied().filter(|s| *s != target.slot).collect();
          (old, Some(RelationState::Many(slots)))
        }
      };

      if let Some(state) = next {
        let current = state.targets();
        current.iter().for_each(|slot| registry.retain(*slot));
        registry.attach(self.slot, prop, state)?;
        for slot in previous {
          if !current.contains(&slot) {
            registry.unlink(slot, self.slot, prop);
          }
          registry.release(slot);
        }
      }
      registry.get_mut(self.slot)?.updated_at = now;
      scheduler.request()
    };
    if spawn {
      self.orm.spawn_flush();
    }
    Ok(true)
  }

  /// Loads a relation once per instance; concurrent callers share the same
  /// in-flight load.
  async fn ensure_loaded(&self, prop: &str, many: bool) -> Result<Vec<Entity>> {
    let (_, relation) = self.orm.schema().relation(&self.class, prop)?;
    if relation.many != many {
      return Err(self.wrong_kind(prop, if many { "plural relation" } else { "singular relation" }));
    }

    let cell = {
      let mut session = self.orm.session();
      let record = session.registry.get_mut(self.slot)?;
      match record.relation(prop) {
        RelationState::Unloaded => Some(record.loading.entry(prop.to_owned()).or_default().clone()),
        _ => None,
      }
    };
    if let Some(cell) = cell {
      let loaded = cell
        .get_or_try_init(|| self.orm.load_relation(self.slot, prop))
        .await;
      if let Err(err) = loaded {
        error!(class = %self.class, id = %self.id, prop, error = %err, "lazy relation load failed");
        return Err(err);
      }
    }

    let targets = {
      let mut session = self.orm.session();
      let registry = &mut session.registry;
      let mut targets = Vec::new();
      for slot in registry.get(self.slot)?.relation(prop).targets() {
        let record = registry.get(slot)?;
        targets.push((slot, record.class.clone(), record.id));
      }
      targets.iter().for_each(|(slot, ..)| registry.retain(*slot));
      targets
    };
    Ok(
      targets
        .into_iter()
        .map(|(slot, class, id)| Entity::from_counted(self.orm.clone(), slot, class, id))
        .collect(),
    )
  }

  // ── Snapshot ──────────────────────────────────────────────────────────────

  /// JSON view of the in-memory state: scalars plus the ids of loaded
  /// relations.
  pub fn to_json(&self) -> Result<serde_json::Value> {
    let session = self.orm.session();
    let registry = &session.registry;
    let record = registry.get(self.slot)?;
    let mut object = serde_json::Map::new();
    object.insert("id".into(), Value::from(record.id).to_json());
    object.insert(UPDATED_AT.into(), Value::Timestamp(record.updated_at).to_json());
    for (prop, value) in &record.fields {
      object.insert(prop.clone(), value.to_json());
    }
    for (prop, state) in &record.relations {
      let id_of = |slot: &SlotId| registry.get(*slot).map(|r| Value::from(r.id).to_json());
      let json = match state {
        RelationState::Unloaded => continue,
        RelationState::One(None) => serde_json::Value::Null,
        RelationState::One(Some(slot)) => id_of(slot)?,
        RelationState::Many(slots) => serde_json::Value::Array(slots.iter().map(id_of).collect::<Result<_>>()?),
      };
      object.insert(prop.clone(), json);
    }
    Ok(serde_json::Value::Object(object))
  }

  fn wrong_kind(&self, prop: &str, expected: &'static str) -> Error {
    Error::WrongPropertyKind {
      class: self.class.clone(),
      property: prop.to_owned(),
      expected,
    }
  }
}

fn loaded_state(many: bool, targets: &[&Entity]) -> RelationState {
  if many {
    RelationState::Many(targets.iter().map(|t| t.slot).collect())
  } else {
    RelationState::One(targets.first().map(|t| t.slot))
  }
}

fn first<'a>(targets: &[&'a Entity]) -> Result<&'a Entity> {
  targets.first().copied().ok_or(Error::StaleHandle)
}

impl Clone for Entity {
  fn clone(&self) -> Self {
    self.orm.session().registry.retain(self.slot);
    Self {
      orm:   self.orm.clone(),
      slot:  self.slot,
      class: self.class.clone(),
      id:    self.id,
    }
  }
}

impl Drop for Entity {
  fn drop(&mut self) { self.orm.session().registry.release(self.slot); }
}

impl PartialEq for Entity {
  fn eq(&self, other: &Self) -> bool { self.orm.same_context(&other.orm) && self.slot == other.slot }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) { self.slot.hash(state) }
}

impl std::fmt::Debug for Entity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}({})", self.class, self.id)
  }
}
