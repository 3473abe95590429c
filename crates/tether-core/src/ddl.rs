//! `CREATE TABLE` statements for a schema. Diffing and migrations are out of
//! scope; tables are created if missing and otherwise left alone.

use crate::{
  connection::{Dialect, Statement},
  schema::{Column, ScalarType, Schema, UPDATED_AT_COLUMN, to_snake_case},
};

fn sql_type(dialect: Dialect, column: &Column) -> String {
  let base = match (dialect, column.ty) {
    (Dialect::Postgres, ScalarType::Text) => "TEXT",
    (Dialect::Postgres, ScalarType::Integer) => "INTEGER",
    (Dialect::Postgres, ScalarType::BigInt) => "BIGINT",
    (Dialect::Postgres, ScalarType::Float) => "DOUBLE PRECISION",
    (Dialect::Postgres, ScalarType::Boolean) => "BOOLEAN",
    (Dialect::Postgres, ScalarType::Timestamp) => "TIMESTAMPTZ",
    (Dialect::Postgres, ScalarType::Uuid) => "UUID",
    (Dialect::Postgres, ScalarType::Json) => "JSONB",
    (Dialect::Sqlite, ScalarType::Integer | ScalarType::BigInt | ScalarType::Boolean) => "INTEGER",
    (Dialect::Sqlite, ScalarType::Float) => "REAL",
    (Dialect::Sqlite, _) => "TEXT",
  };
  match (dialect, column.array, column.ty) {
    (Dialect::Postgres, true, ScalarType::Json) => "JSONB".to_owned(),
    (Dialect::Postgres, true, _) => format!("{base}[]"),
    (Dialect::Sqlite, true, _) => "TEXT".to_owned(),
    _ => base.to_owned(),
  }
}

fn column_def(dialect: Dialect, name: &str, column: &Column) -> String {
  let mut def = format!("{name} {}", sql_type(dialect, column));
  if !column.nullable {
    def.push_str(" NOT NULL");
  }
  if column.unique {
    def.push_str(" UNIQUE");
  }
  def
}

/// Statements creating every class table, then every junction table.
pub fn create_statements(schema: &Schema, dialect: Dialect) -> Vec<Statement> {
  let mut classes: Vec<_> = schema.classes().collect();
  classes.sort_by(|a, b| (a.depth, &a.name).cmp(&(b.depth, &b.name)));

  let mut statements = Vec::new();
  for wiki in &classes {
    let id_type = sql_type(dialect, &wiki.id_column());
    let mut defs = vec![match &wiki.parent {
      None => format!("id {id_type} PRIMARY KEY"),
      Some(parent) => {
        let parent_table = schema.class(parent).map(|p| p.table.clone()).unwrap_or_else(|_| to_snake_case(parent));
        format!("id {id_type} PRIMARY KEY REFERENCES {parent_table} (id) ON DELETE CASCADE")
      }
    }];
    for (prop, column) in &wiki.columns {
      defs.push(column_def(dialect, &to_snake_case(prop), column));
    }
    if wiki.is_root() {
      defs.push(column_def(dialect, UPDATED_AT_COLUMN, &Column::updated_at()));
    }
    statements.push(Statement::new(format!(
      "CREATE TABLE IF NOT EXISTS {} ({})",
      wiki.table,
      defs.join(", ")
    )));
  }

  for wiki in &classes {
    for (prop, relation) in &wiki.relations {
      let Ok(target) = schema.class(&relation.target) else {
        continue;
      };
      let joining = sql_type(dialect, &wiki.id_column());
      let joined = sql_type(dialect, &target.id_column());
      let unique = if relation.many { "UNIQUE (joining_id, joined_id)" } else { "UNIQUE (joining_id)" };
      statements.push(Statement::new(format!(
        "CREATE TABLE IF NOT EXISTS {junction} (\
         joining_id {joining} NOT NULL REFERENCES {owner} (id) ON DELETE CASCADE, \
         joined_id {joined} NOT NULL REFERENCES {target} (id) ON DELETE CASCADE, {unique})",
        junction = wiki.junction_table(prop),
        owner = wiki.table,
        target = target.table,
      )));
    }
  }
  statements
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    schema::{ClassDef, Relation, SchemaDef},
    value::PrimaryKeyKind,
  };

  fn schema() -> Schema {
    let def = SchemaDef::new()
      .class(ClassDef::new("Being").abstract_class())
      .class(
        ClassDef::new("Person")
          .parent("Being")
          .column("fullName", Column::new(ScalarType::Text))
          .column("tags", Column::new(ScalarType::Text).array().nullable())
          .relation("mother", Relation::one("Person"))
          .relation("friends", Relation::many("Person")),
      );
    Schema::build(def, PrimaryKeyKind::BigInt).unwrap()
  }

  #[test]
  fn sqlite_tables_parent_first_with_cascade() {
    let stmts = create_statements(&schema(), Dialect::Sqlite);
    let sqls: Vec<&str> = stmts.iter().map(|s| s.sql.as_str()).collect();
    assert_eq!(sqls[0], "CREATE TABLE IF NOT EXISTS being (id INTEGER PRIMARY KEY, updated_at TEXT NOT NULL)");
    assert_eq!(
      sqls[1],
      "CREATE TABLE IF NOT EXISTS person (id INTEGER PRIMARY KEY REFERENCES being (id) ON DELETE CASCADE, \
       full_name TEXT NOT NULL, tags TEXT)"
    );
    assert!(sqls.contains(
      &"CREATE TABLE IF NOT EXISTS person___mother_jt (joining_id INTEGER NOT NULL REFERENCES person (id) \
        ON DELETE CASCADE, joined_id INTEGER NOT NULL REFERENCES person (id) ON DELETE CASCADE, UNIQUE (joining_id))"
    ));
    assert!(sqls.iter().any(|s| s.contains("person___friends_jt") && s.contains("UNIQUE (joining_id, joined_id)")));
  }

  #[test]
  fn postgres_types() {
    let stmts = create_statements(&schema(), Dialect::Postgres);
    assert!(stmts[0].sql.contains("id BIGINT PRIMARY KEY"));
    assert!(stmts[0].sql.contains("updated_at TIMESTAMPTZ NOT NULL"));
    assert!(stmts[1].sql.contains("tags TEXT[]"));
  }
}
