//! Pending, not-yet-persisted changes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::value::{EntityId, Value};

/// Junction ids added and removed since the last flush. Adding an id that is
/// pending removal cancels the removal, and vice versa.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationDelta {
  pub added:   Vec<EntityId>,
  pub removed: Vec<EntityId>,
}

impl RelationDelta {
  pub fn add(&mut self, id: EntityId) {
    if let Some(pos) = self.removed.iter().position(|r| *r == id) {
      self.removed.remove(pos);
    } else if !self.added.contains(&id) {
      self.added.push(id);
    }
  }

  pub fn remove(&mut self, id: EntityId) {
    if let Some(pos) = self.added.iter().position(|a| *a == id) {
      self.added.remove(pos);
    } else if !self.removed.contains(&id) {
      self.removed.push(id);
    }
  }

  pub fn merge(&mut self, other: RelationDelta) {
    other.added.into_iter().for_each(|id| self.add(id));
    other.removed.into_iter().for_each(|id| self.remove(id));
  }

  pub fn is_empty(&self) -> bool { self.added.is_empty() && self.removed.is_empty() }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceChanges {
  pub is_new:     bool,
  pub updated_at: Option<DateTime<Utc>>,
  pub fields:     BTreeMap<String, Value>,
  pub relations:  BTreeMap<String, RelationDelta>,
}

impl InstanceChanges {
  /// True when nothing is left to persist: not new, no fields, and every
  /// relation delta cancelled out.
  pub fn is_idle(&self) -> bool {
    !self.is_new && self.fields.is_empty() && self.relations.values().all(RelationDelta::is_empty)
  }

  fn merge(&mut self, other: InstanceChanges) {
    self.is_new |= other.is_new;
    self.updated_at = match (self.updated_at, other.updated_at) {
      (Some(a), Some(b)) => Some(a.max(b)),
      (a, b) => a.or(b),
    };
    // Values written after the failed flush win over the failed ones.
    for (prop, value) in other.fields {
      self.fields.entry(prop).or_insert(value);
    }
    for (prop, delta) in other.relations {
      let mut merged = delta;
      if let Some(current) = self.relations.remove(&prop) {
        merged.merge(current);
      }
      self.relations.insert(prop, merged);
    }
  }
}

/// Everything one flush will persist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
  /// class → id → changes.
  pub classes:        BTreeMap<String, BTreeMap<EntityId, InstanceChanges>>,
  /// (root table, id) rows to hard-delete.
  pub deleted:        Vec<(String, EntityId)>,
  /// junction table → joining ids whose every row must be dropped.
  pub forced_unlinks: BTreeMap<String, Vec<EntityId>>,
}

impl Changeset {
  pub fn is_empty(&self) -> bool {
    self.classes.values().all(|instances| instances.values().all(InstanceChanges::is_idle))
      && self.deleted.is_empty()
      && self.forced_unlinks.is_empty()
  }

  pub fn instance(&mut self, class: &str, id: EntityId) -> &mut InstanceChanges {
    self.classes.entry(class.to_owned()).or_default().entry(id).or_default()
  }

  pub fn get(&self, class: &str, id: EntityId) -> Option<&InstanceChanges> {
    self.classes.get(class).and_then(|m| m.get(&id))
  }

  pub(crate) fn mark_new(&mut self, class: &str, id: EntityId, now: DateTime<Utc>) {
    let inst = self.instance(class, id);
    inst.is_new = true;
    inst.updated_at = Some(now);
  }

  pub(crate) fn set_field(&mut self, class: &str, id: EntityId, prop: &str, value: Value, now: DateTime<Utc>) {
    let inst = self.instance(class, id);
    inst.fields.insert(prop.to_owned(), value);
    inst.updated_at = Some(now);
  }

  pub(crate) fn relation(&mut self, class: &str, id: EntityId, prop: &str, now: DateTime<Utc>) -> &mut RelationDelta {
    let inst = self.instance(class, id);
    inst.updated_at = Some(now);
    inst.relations.entry(prop.to_owned()).or_default()
  }

  /// Replaces the pending delta of `prop`. Used together with a forced
  /// unlink, which drops every stored row of the relation anyway.
  pub(crate) fn reset_relation(&mut self, class: &str, id: EntityId, prop: &str, now: DateTime<Utc>) -> &mut RelationDelta {
    let delta = self.relation(class, id, prop, now);
    *delta = RelationDelta::default();
    delta
  }

  pub(crate) fn forced_unlink(&mut self, junction: String, id: EntityId) {
    let ids = self.forced_unlinks.entry(junction).or_default();
    if !ids.contains(&id) {
      ids.push(id);
    }
  }

  pub(crate) fn hard_delete(&mut self, root_table: String, id: EntityId) {
    if !self.deleted.iter().any(|(t, i)| *t == root_table && *i == id) {
      self.deleted.push((root_table, id));
    }
  }

  /// Drops every pending change of one instance.
  pub(crate) fn forget(&mut self, class: &str, id: EntityId) {
    if let Some(instances) = self.classes.get_mut(class) {
      instances.remove(&id);
    }
  }

  /// Folds `older` (a failed flush) underneath the current changes.
  pub(crate) fn merge_older(&mut self, older: Changeset) {
    for (class, instances) in older.classes {
      for (id, changes) in instances {
        self.instance(&class, id).merge(changes);
      }
    }
    for (table, id) in older.deleted {
      self.hard_delete(table, id);
    }
    for (junction, ids) in older.forced_unlinks {
      for id in ids {
        self.forced_unlink(junction.clone(), id);
      }
    }
  }

  pub fn instance_count(&self) -> usize { self.classes.values().map(BTreeMap::len).sum() }
}
