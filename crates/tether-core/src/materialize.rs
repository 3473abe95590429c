//! Folding query results back through the identity map.
//!
//! Parsing (row or document → [`Materialized`]) happens without the session
//! lock; folding into the registry happens under it.

use chrono::Utc;

use crate::{
  compile::{Shape, flat_column},
  connection::Row,
  error::{Error, Result},
  identity::{Record, RelationState, Registry, SlotId},
  schema::{ID, Schema, UPDATED_AT},
  scope::ScopeNode,
  value::{EntityId, Value, decode_json, decode_raw},
};

#[derive(Debug)]
pub(crate) struct Materialized {
  pub class:     String,
  pub id:        EntityId,
  pub scalars:   Vec<(String, Value)>,
  pub relations: Vec<(String, Loaded)>,
}

#[derive(Debug)]
pub(crate) enum Loaded {
  One(Option<Materialized>),
  Many(Vec<Materialized>),
}

fn entity_id(value: &Value) -> Result<EntityId> {
  match value {
    Value::Int(i) => Ok(EntityId::Int(*i)),
    Value::BigInt(i) => Ok(EntityId::BigInt(*i)),
    Value::Uuid(u) => Ok(EntityId::Uuid(*u)),
    other => Err(Error::decode(ID, format!("{} is not an id", other.type_name()))),
  }
}

fn assemble(node: &ScopeNode, scalars: Vec<(String, Value)>, relations: Vec<(String, Loaded)>) -> Result<Materialized> {
  let id = scalars
    .iter()
    .find(|(prop, _)| prop == ID)
    .map(|(_, v)| entity_id(v))
    .ok_or_else(|| Error::decode(ID, format!("{} row without an id", node.class)))??;
  Ok(Materialized { class: node.class.clone(), id, scalars, relations })
}

fn parse_flat(node: &ScopeNode, row: &Row) -> Result<Materialized> {
  let scalars = node
    .columns()
    .map(|(alias, col)| {
      let raw = row.get(&flat_column(alias, col)).cloned().unwrap_or(Value::Null);
      Ok((col.prop.clone(), decode_raw(raw, &col.column, &col.prop)?))
    })
    .collect::<Result<Vec<_>>>()?;
  assemble(node, scalars, Vec::new())
}

fn parse_document(node: &ScopeNode, doc: &serde_json::Value) -> Result<Materialized> {
  let object = doc
    .as_object()
    .ok_or_else(|| Error::decode(&node.class, "document is not an object"))?;
  let null = serde_json::Value::Null;

  let scalars = node
    .columns()
    .map(|(_, col)| {
      let json = object.get(&col.prop).unwrap_or(&null);
      Ok((col.prop.clone(), decode_json(json, &col.column, &col.prop)?))
    })
    .collect::<Result<Vec<_>>>()?;

  let mut relations = Vec::new();
  for (prop, rel) in node.relations.iter().filter(|(_, r)| r.eager) {
    let json = object.get(prop).unwrap_or(&null);
    let loaded = match json {
      serde_json::Value::Null if rel.node.many => Loaded::Many(Vec::new()),
      serde_json::Value::Null => Loaded::One(None),
      serde_json::Value::Array(items) => {
        Loaded::Many(items.iter().map(|item| parse_document(&rel.node, item)).collect::<Result<_>>()?)
      }
      serde_json::Value::String(text) => {
        let inner: serde_json::Value = serde_json::from_str(text)?;
        parse_nested(&rel.node, &inner)?
      }
      other => Loaded::One(Some(parse_document(&rel.node, other)?)),
    };
    relations.push((prop.clone(), loaded));
  }
  assemble(node, scalars, relations)
}

fn parse_nested(node: &ScopeNode, json: &serde_json::Value) -> Result<Loaded> {
  Ok(match json {
    serde_json::Value::Null if node.many => Loaded::Many(Vec::new()),
    serde_json::Value::Null => Loaded::One(None),
    serde_json::Value::Array(items) => {
      Loaded::Many(items.iter().map(|item| parse_document(node, item)).collect::<Result<_>>()?)
    }
    other => Loaded::One(Some(parse_document(node, other)?)),
  })
}

pub(crate) fn parse_row(node: &ScopeNode, shape: Shape, row: &Row) -> Result<Materialized> {
  match shape {
    Shape::Flat => parse_flat(node, row),
    Shape::Document => match row.get("json") {
      Some(Value::Json(doc)) => parse_document(node, doc),
      Some(Value::Text(text)) => parse_document(node, &serde_json::from_str(text)?),
      other => Err(Error::decode(
        &node.class,
        format!("expected a json column, got {}", other.map_or("nothing", Value::type_name)),
      )),
    },
  }
}

// ─── Folding ─────────────────────────────────────────────────────────────────

fn fold_loaded(reg: &mut Registry, schema: &Schema, loaded: Loaded) -> Result<RelationState> {
  Ok(match loaded {
    Loaded::One(None) => RelationState::One(None),
    Loaded::One(Some(m)) => RelationState::One(Some(fold(reg, schema, m)?)),
    Loaded::Many(items) => RelationState::Many(fold_all(reg, schema, items)?),
  })
}

/// Resolves one materialized instance to its slot, returning it with one
/// holder taken for the caller. A live instance keeps its scalar state; only
/// relations it had not loaded yet are filled in.
pub(crate) fn fold(reg: &mut Registry, schema: &Schema, m: Materialized) -> Result<SlotId> {
  let slot = match reg.lookup(&m.class, m.id) {
    Some(slot) => {
      reg.retain(slot);
      slot
    }
    None => {
      let mut record = Record::new(m.class.clone(), m.id, Utc::now());
      for (prop, value) in m.scalars {
        match (prop.as_str(), value) {
          (ID, _) => {}
          (UPDATED_AT, Value::Timestamp(ts)) => record.updated_at = ts,
          (UPDATED_AT, _) => {}
          (_, value) => {
            record.fields.insert(prop, value);
          }
        }
      }
      for (prop, _, _) in schema.all_relations(&m.class)? {
        record.relations.insert(prop.to_owned(), RelationState::Unloaded);
      }
      reg.insert(record)
    }
  };

  for (prop, loaded) in m.relations {
    let state = match fold_loaded(reg, schema, loaded) {
      Ok(state) => state,
      Err(err) => {
        reg.release(slot);
        return Err(err);
      }
    };
    let unloaded = matches!(reg.get(slot)?.relation(&prop), RelationState::Unloaded);
    if unloaded {
      reg.attach(slot, &prop, state)?;
    } else {
      state.targets().into_iter().for_each(|t| reg.release(t));
    }
  }
  Ok(slot)
}

/// Folds every instance; on failure the holders taken so far are returned.
pub(crate) fn fold_all(reg: &mut Registry, schema: &Schema, items: Vec<Materialized>) -> Result<Vec<SlotId>> {
  let mut slots = Vec::with_capacity(items.len());
  for m in items {
    match fold(reg, schema, m) {
      Ok(slot) => slots.push(slot),
      Err(err) => {
        slots.into_iter().for_each(|s| reg.release(s));
        return Err(err);
      }
    }
  }
  Ok(slots)
}
