//! Translation of a [`Changeset`] into the ordered statements of one flush
//! transaction.

use std::collections::BTreeMap;

use crate::{
  changeset::Changeset,
  connection::{Dialect, Statement},
  error::Result,
  predicate::Params,
  schema::{ID, Property, Schema, UPDATED_AT_COLUMN, to_snake_case},
  value::{EntityId, Value},
};

/// Outcome of a flush call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
  /// Statements executed in the transaction.
  pub statements: usize,
  /// The call found another flush in flight and did nothing.
  pub skipped:    bool,
}

impl FlushReport {
  pub(crate) fn skipped() -> Self { Self { statements: 0, skipped: true } }
}

#[derive(Debug, Default)]
struct TableRow {
  is_new: bool,
  values: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct TableChanges {
  depth:   usize,
  /// Column names of the table, in declaration order, `id` first.
  columns: Vec<String>,
  rows:    BTreeMap<EntityId, TableRow>,
}

#[derive(Debug, Default)]
struct JunctionChanges {
  many:    bool,
  added:   Vec<(EntityId, EntityId)>,
  removed: Vec<(EntityId, EntityId)>,
}

pub(crate) fn translate(schema: &Schema, dialect: Dialect, changes: &Changeset) -> Result<Vec<Statement>> {
  let mut statements = Vec::new();
  let returning = dialect.returning();

  // 1. forced unlinks of relations that were written without being loaded
  for (junction, ids) in &changes.forced_unlinks {
    let mut params = Params::new(dialect);
    let list = placeholders(&mut params, ids.iter().map(|id| Value::from(*id)));
    statements.push(Statement::with_params(
      format!("DELETE FROM {junction} WHERE joining_id IN ({list}){returning}"),
      params.into_values(),
    ));
  }

  // 2. hard deletes, keyed by root table; child tables and junctions cascade
  let mut deletes: BTreeMap<&str, Vec<EntityId>> = BTreeMap::new();
  for (table, id) in &changes.deleted {
    deletes.entry(table.as_str()).or_default().push(*id);
  }
  for (table, ids) in deletes {
    let mut params = Params::new(dialect);
    let list = placeholders(&mut params, ids.into_iter().map(Value::from));
    statements.push(Statement::with_params(
      format!("DELETE FROM {table} WHERE id IN ({list}){returning}"),
      params.into_values(),
    ));
  }

  // Distribute every instance's changes over the tables of its chain.
  let mut tables: BTreeMap<String, TableChanges> = BTreeMap::new();
  let mut junctions: BTreeMap<String, JunctionChanges> = BTreeMap::new();
  for (class, instances) in &changes.classes {
    let chain = schema.chain(class)?;
    for (id, inst) in instances.iter().filter(|(_, inst)| !inst.is_idle()) {
      for wiki in &chain {
        let table = tables.entry(wiki.table.clone()).or_insert_with(|| {
          let mut columns = vec![ID.to_owned()];
          columns.extend(wiki.columns.keys().map(|c| to_snake_case(c)));
          if wiki.is_root() {
            columns.push(UPDATED_AT_COLUMN.to_owned());
          }
          TableChanges { depth: wiki.depth, columns, rows: BTreeMap::new() }
        });
        let row = table.rows.entry(*id).or_default();
        row.is_new |= inst.is_new;
        if wiki.is_root() {
          if let Some(ts) = inst.updated_at {
            row.values.insert(UPDATED_AT_COLUMN.to_owned(), Value::Timestamp(ts));
          }
        }
      }

      for (prop, value) in &inst.fields {
        if let Property::Column { owner, .. } = schema.classify(class, prop)? {
          if let Some(table) = tables.get_mut(&owner.table) {
            if let Some(row) = table.rows.get_mut(id) {
              row.values.insert(to_snake_case(prop), value.clone());
            }
          }
        }
      }

      for (prop, delta) in &inst.relations {
        if delta.is_empty() {
          continue;
        }
        let (owner, relation) = schema.relation(class, prop)?;
        let junction = junctions
          .entry(owner.junction_table(prop))
          .or_insert_with(|| JunctionChanges { many: relation.many, ..JunctionChanges::default() });
        junction.added.extend(delta.added.iter().map(|target| (*id, *target)));
        junction.removed.extend(delta.removed.iter().map(|target| (*id, *target)));
      }
    }
  }

  // 3. inserts, ancestors before descendants
  let mut ordered: Vec<(&String, &TableChanges)> = tables.iter().collect();
  ordered.sort_by(|(a_name, a), (b_name, b)| (a.depth, *a_name).cmp(&(b.depth, *b_name)));
  for (name, table) in &ordered {
    let new_rows: Vec<(&EntityId, &TableRow)> = table.rows.iter().filter(|(_, r)| r.is_new).collect();
    if new_rows.is_empty() {
      continue;
    }
    let mut params = Params::new(dialect);
    let tuples: Vec<String> = new_rows
      .iter()
      .map(|(id, row)| {
        let values = table.columns.iter().map(|col| {
          if col == ID {
            Value::from(**id)
          } else {
            row.values.get(col).cloned().unwrap_or(Value::Null)
          }
        });
        format!("({})", placeholders(&mut params, values))
      })
      .collect();
    statements.push(Statement::with_params(
      format!("INSERT INTO {name} ({}) VALUES {}{returning}", table.columns.join(", "), tuples.join(", ")),
      params.into_values(),
    ));
  }

  // 4. updates of the columns that changed
  for (name, table) in &ordered {
    for (id, row) in table.rows.iter().filter(|(_, r)| !r.is_new && !r.values.is_empty()) {
      let mut params = Params::new(dialect);
      let sets: Vec<String> = row
        .values
        .iter()
        .map(|(col, value)| format!("{col} = {}", params.push(value.clone())))
        .collect();
      let key = params.push(Value::from(*id));
      statements.push(Statement::with_params(
        format!("UPDATE {name} SET {} WHERE id = {key}{returning}", sets.join(", ")),
        params.into_values(),
      ));
    }
  }

  // 5. junction deletes, then 6. junction inserts
  for (junction, pairs) in &junctions {
    if pairs.removed.is_empty() {
      continue;
    }
    let mut params = Params::new(dialect);
    let tuples = pair_tuples(&mut params, &pairs.removed);
    statements.push(Statement::with_params(
      format!("DELETE FROM {junction} WHERE (joining_id, joined_id) IN (VALUES {tuples}){returning}"),
      params.into_values(),
    ));
  }
  for (junction, pairs) in &junctions {
    if pairs.added.is_empty() {
      continue;
    }
    let mut params = Params::new(dialect);
    let tuples = pair_tuples(&mut params, &pairs.added);
    // A pair pushed onto an unloaded collection may already be stored.
    let conflict = if pairs.many { " ON CONFLICT (joining_id, joined_id) DO NOTHING" } else { "" };
    statements.push(Statement::with_params(
      format!("INSERT INTO {junction} (joining_id, joined_id) VALUES {tuples}{conflict}{returning}"),
      params.into_values(),
    ));
  }

  Ok(statements)
}

fn placeholders(params: &mut Params, values: impl Iterator<Item = Value>) -> String {
  values.map(|v| params.push(v)).collect::<Vec<_>>().join(", ")
}

fn pair_tuples(params: &mut Params, pairs: &[(EntityId, EntityId)]) -> String {
  pairs
    .iter()
    .map(|(joining, joined)| {
      let a = params.push(Value::from(*joining));
      let b = params.push(Value::from(*joined));
      format!("({a}, {b})")
    })
    .collect::<Vec<_>>()
    .join(", ")
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;
  use crate::schema::{ClassDef, Column, Relation, ScalarType, SchemaDef};
  use crate::value::PrimaryKeyKind;

  fn schema() -> Schema {
    let def = SchemaDef::new()
      .class(ClassDef::new("Being").abstract_class().column("age", Column::new(ScalarType::Integer).nullable()))
      .class(
        ClassDef::new("Person")
          .parent("Being")
          .column("fullName", Column::new(ScalarType::Text))
          .relation("friends", Relation::many("Person")),
      );
    Schema::build(def, PrimaryKeyKind::Int).unwrap()
  }

  #[test]
  fn new_instance_inserts_into_every_chain_table_parent_first() {
    let schema = schema();
    let now = Utc::now();
    let mut changes = Changeset::default();
    let id = EntityId::Int(1);
    changes.mark_new("Person", id, now);
    changes.set_field("Person", id, "fullName", Value::from("A"), now);
    changes.set_field("Person", id, "fullName", Value::from("B"), now);

    let stmts = translate(&schema, Dialect::Sqlite, &changes).unwrap();
    assert_eq!(stmts.len(), 2);
    assert_eq!(stmts[0].sql, "INSERT INTO being (id, age, updated_at) VALUES (?, ?, ?)");
    assert_eq!(stmts[0].params[..2], [Value::Int(1), Value::Null]);
    assert_eq!(stmts[1].sql, "INSERT INTO person (id, full_name) VALUES (?, ?)");
    assert_eq!(stmts[1].params, vec![Value::Int(1), Value::from("B")]);
  }

  #[test]
  fn inherited_field_updates_parent_table() {
    let schema = schema();
    let now = Utc::now();
    let mut changes = Changeset::default();
    changes.set_field("Person", EntityId::Int(4), "age", Value::Int(30), now);

    let stmts = translate(&schema, Dialect::Postgres, &changes).unwrap();
    assert_eq!(stmts.len(), 1);
    assert_eq!(stmts[0].sql, "UPDATE being SET age = $1, updated_at = $2 WHERE id = $3 RETURNING 1");
    assert_eq!(stmts[0].params[0], Value::Int(30));
    assert_eq!(stmts[0].params[2], Value::Int(4));
  }

  #[test]
  fn junction_deletes_precede_inserts() {
    let schema = schema();
    let now = Utc::now();
    let mut changes = Changeset::default();
    let delta = changes.relation("Person", EntityId::Int(1), "friends", now);
    delta.add(EntityId::Int(2));
    delta.remove(EntityId::Int(3));

    let stmts = translate(&schema, Dialect::Sqlite, &changes).unwrap();
    let sqls: Vec<&str> = stmts.iter().map(|s| s.sql.as_str()).collect();
    assert_eq!(sqls, [
      "UPDATE being SET updated_at = ? WHERE id = ?",
      "DELETE FROM person___friends_jt WHERE (joining_id, joined_id) IN (VALUES (?, ?))",
      "INSERT INTO person___friends_jt (joining_id, joined_id) VALUES (?, ?) ON CONFLICT (joining_id, joined_id) DO NOTHING",
    ]);
  }

  #[test]
  fn cancelled_delta_issues_no_statement() {
    let schema = schema();
    let now = Utc::now();
    let mut changes = Changeset::default();
    let delta = changes.relation("Person", EntityId::Int(1), "friends", now);
    delta.add(EntityId::Int(2));
    delta.remove(EntityId::Int(2));

    assert!(changes.is_empty());
    let stmts = translate(&schema, Dialect::Sqlite, &changes).unwrap();
    assert!(stmts.is_empty());
  }

  #[test]
  fn unlinks_and_deletes_come_first() {
    let schema = schema();
    let now = Utc::now();
    let mut changes = Changeset::default();
    changes.mark_new("Person", EntityId::Int(9), now);
    changes.hard_delete("being".into(), EntityId::Int(5));
    changes.forced_unlink("person___friends_jt".into(), EntityId::Int(6));

    let stmts = translate(&schema, Dialect::Sqlite, &changes).unwrap();
    assert_eq!(stmts[0].sql, "DELETE FROM person___friends_jt WHERE joining_id IN (?)");
    assert_eq!(stmts[1].sql, "DELETE FROM being WHERE id IN (?)");
    assert!(stmts[2].sql.starts_with("INSERT INTO being"));
  }
}
