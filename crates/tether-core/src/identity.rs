//! Arena-backed identity map.
//!
//! Every live instance occupies one arena slot. A slot counts its strong
//! holders: [`Entity`](crate::Entity) handles and relation references held by
//! other records. When the count drops to zero the record is evicted, its
//! identity-map entry removed and its own references released in turn.
//! Records that reference each other in a cycle keep each other alive until
//! one side drops the reference.

use std::{
  collections::{BTreeMap, HashMap},
  sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;

use crate::{
  error::{Error, Result},
  value::{EntityId, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId {
  index:      u32,
  generation: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RelationState {
  Unloaded,
  One(Option<SlotId>),
  Many(Vec<SlotId>),
}

impl RelationState {
  pub fn targets(&self) -> Vec<SlotId> {
    match self {
      Self::Unloaded | Self::One(None) => Vec::new(),
      Self::One(Some(slot)) => vec![*slot],
      Self::Many(slots) => slots.clone(),
    }
  }
}

#[derive(Debug)]
pub(crate) struct Record {
  pub class:      String,
  pub id:         EntityId,
  pub updated_at: DateTime<Utc>,
  pub fields:     BTreeMap<String, Value>,
  pub relations:  BTreeMap<String, RelationState>,
  /// Single-flight guards for lazy relation loads.
  pub loading:    BTreeMap<String, Arc<OnceCell<()>>>,
  pub deleted:    bool,
}

impl Record {
  pub fn new(class: impl Into<String>, id: EntityId, updated_at: DateTime<Utc>) -> Self {
    Self {
      class: class.into(),
      id,
      updated_at,
      fields: BTreeMap::new(),
      relations: BTreeMap::new(),
      loading: BTreeMap::new(),
      deleted: false,
    }
  }

  pub fn relation(&self, prop: &str) -> &RelationState {
    static UNLOADED: RelationState = RelationState::Unloaded;
    self.relations.get(prop).unwrap_or(&UNLOADED)
  }

  fn references(&self) -> Vec<(String, SlotId)> {
    self
      .relations
      .iter()
      .flat_map(|(prop, state)| state.targets().into_iter().map(move |s| (prop.clone(), s)))
      .collect()
  }
}

#[derive(Debug)]
struct Slot {
  generation: u32,
  entry:      Option<(Record, usize)>,
}

#[derive(Debug, Default)]
struct Arena {
  slots: Vec<Slot>,
  free:  Vec<u32>,
  live:  usize,
}

impl Arena {
  fn insert(&mut self, record: Record) -> SlotId {
    self.live += 1;
    if let Some(index) = self.free.pop() {
      let slot = &mut self.slots[index as usize];
      slot.entry = Some((record, 1));
      return SlotId { index, generation: slot.generation };
    }
    let index = self.slots.len() as u32;
    self.slots.push(Slot { generation: 0, entry: Some((record, 1)) });
    SlotId { index, generation: 0 }
  }

  fn entry(&self, id: SlotId) -> Option<&(Record, usize)> {
    self
      .slots
      .get(id.index as usize)
      .filter(|s| s.generation == id.generation)
      .and_then(|s| s.entry.as_ref())
  }

  fn entry_mut(&mut self, id: SlotId) -> Option<&mut (Record, usize)> {
    self
      .slots
      .get_mut(id.index as usize)
      .filter(|s| s.generation == id.generation)
      .and_then(|s| s.entry.as_mut())
  }

  fn retain(&mut self, id: SlotId) {
    if let Some((_, count)) = self.entry_mut(id) {
      *count += 1;
    }
  }

  /// Drops one holder; returns the record when it was the last.
  fn release(&mut self, id: SlotId) -> Option<Record> {
    let (_, count) = self.entry_mut(id)?;
    *count -= 1;
    if *count > 0 {
      return None;
    }
    let slot = &mut self.slots[id.index as usize];
    let (record, _) = slot.entry.take()?;
    slot.generation = slot.generation.wrapping_add(1);
    self.free.push(id.index);
    self.live -= 1;
    Some(record)
  }
}

type Key = (String, EntityId);

/// Arena, identity map and backward relation index of one `Orm` context.
#[derive(Debug, Default)]
pub(crate) struct Registry {
  arena:    Arena,
  identity: HashMap<Key, SlotId>,
  /// target → (source slot, property) pairs referencing it.
  backrefs: HashMap<Key, Vec<(SlotId, String)>>,
}

impl Registry {
  pub fn lookup(&self, class: &str, id: EntityId) -> Option<SlotId> {
    self.identity.get(&(class.to_owned(), id)).copied()
  }

  /// Registers a new record with one holder.
  pub fn insert(&mut self, record: Record) -> SlotId {
    let key = (record.class.clone(), record.id);
    let slot = self.arena.insert(record);
    self.identity.insert(key, slot);
    slot
  }

  pub fn get(&self, slot: SlotId) -> Result<&Record> {
    self.arena.entry(slot).map(|(r, _)| r).ok_or(Error::StaleHandle)
  }

  pub fn get_mut(&mut self, slot: SlotId) -> Result<&mut Record> {
    self.arena.entry_mut(slot).map(|(r, _)| r).ok_or(Error::StaleHandle)
  }

  #[cfg(test)]
  pub fn holders(&self, slot: SlotId) -> usize { self.arena.entry(slot).map_or(0, |(_, c)| *c) }

  pub fn live(&self) -> usize { self.arena.live }

  pub fn retain(&mut self, slot: SlotId) { self.arena.retain(slot) }

  /// Drops one holder, evicting the record and cascading through the
  /// references it held when it was the last.
  pub fn release(&mut self, slot: SlotId) {
    let mut pending = vec![slot];
    while let Some(slot) = pending.pop() {
      let Some(record) = self.arena.release(slot) else {
        continue;
      };
      let key = (record.class.clone(), record.id);
      if self.identity.get(&key) == Some(&slot) {
        self.identity.remove(&key);
      }
      for (prop, target) in record.references() {
        self.unlink(target, slot, &prop);
        pending.push(target);
      }
    }
  }

  /// Removes the identity entry of a deleted instance so later reads never
  /// resolve to it.
  pub fn detach(&mut self, class: &str, id: EntityId) {
    self.identity.remove(&(class.to_owned(), id));
  }

  fn key_of(&self, slot: SlotId) -> Option<Key> {
    self.get(slot).ok().map(|r| (r.class.clone(), r.id))
  }

  pub fn link(&mut self, target: SlotId, source: SlotId, prop: &str) {
    let Some(key) = self.key_of(target) else {
      return;
    };
    let sources = self.backrefs.entry(key).or_default();
    if !sources.iter().any(|(s, p)| *s == source && p == prop) {
      sources.push((source, prop.to_owned()));
    }
  }

  pub fn unlink(&mut self, target: SlotId, source: SlotId, prop: &str) {
    let Some(key) = self.key_of(target) else {
      return;
    };
    if let Some(sources) = self.backrefs.get_mut(&key) {
      sources.retain(|(s, p)| !(*s == source && p == prop));
      if sources.is_empty() {
        self.backrefs.remove(&key);
      }
    }
  }

  pub fn take_backrefs(&mut self, class: &str, id: EntityId) -> Vec<(SlotId, String)> {
    self.backrefs.remove(&(class.to_owned(), id)).unwrap_or_default()
  }

  /// Installs a relation state on `source`, taking over one holder of every
  /// target and registering the backward links.
  pub fn attach(&mut self, source: SlotId, prop: &str, state: RelationState) -> Result<()> {
    let targets = state.targets();
    self.get_mut(source)?.relations.insert(prop.to_owned(), state);
    for target in targets {
      self.link(target, source, prop);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(id: i32) -> Record { Record::new("Person", EntityId::Int(id), Utc::now()) }

  #[test]
  fn last_release_evicts_and_frees_identity() {
    let mut reg = Registry::default();
    let slot = reg.insert(record(1));
    reg.retain(slot);
    assert_eq!(reg.holders(slot), 2);
    reg.release(slot);
    assert_eq!(reg.lookup("Person", EntityId::Int(1)), Some(slot));
    reg.release(slot);
    assert_eq!(reg.lookup("Person", EntityId::Int(1)), None);
    assert!(matches!(reg.get(slot), Err(Error::StaleHandle)));
    assert_eq!(reg.live(), 0);
  }

  #[test]
  fn reused_slot_gets_new_generation() {
    let mut reg = Registry::default();
    let first = reg.insert(record(1));
    reg.release(first);
    let second = reg.insert(record(2));
    assert_ne!(first, second);
    assert!(reg.get(first).is_err());
    assert_eq!(reg.get(second).unwrap().id, EntityId::Int(2));
  }

  #[test]
  fn relation_references_keep_targets_alive() {
    let mut reg = Registry::default();
    let child = reg.insert(record(1));
    let mother = reg.insert(record(2));
    reg.retain(mother);
    reg.attach(child, "mother", RelationState::One(Some(mother))).unwrap();

    // The handle on the mother goes away; the child still holds her.
    reg.release(mother);
    assert!(reg.get(mother).is_ok());

    // Dropping the child cascades and clears the backward link.
    reg.release(child);
    assert!(reg.get(mother).is_err());
    assert_eq!(reg.live(), 0);
    assert!(reg.take_backrefs("Person", EntityId::Int(2)).is_empty());
  }
}
