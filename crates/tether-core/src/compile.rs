//! CTE assembly: turns a [`ScopeTree`] into a single SQL statement.
//!
//! Without eager relations the result is `SELECT * FROM root_cte`, one flat
//! row per matching root with columns named `<alias>_<column>`. With eager
//! relations every root row is folded into one JSON document:
//!
//! ```text
//! WITH root_cte AS (...),           -- filtered root rows
//!      a3_cte AS (...),             -- one document per related row
//!      a1a3_cte AS (...),           -- one-to-many bridge, grouped by joining_id
//!      selected_cte AS (...)        -- root documents with nested relations
//! SELECT json FROM selected_cte
//! ```

use crate::{
  connection::{Dialect, Statement},
  error::Result,
  predicate::{Find, Params},
  schema::{Column, ScalarType, Schema},
  scope::{ColumnScope, ScopeNode, ScopeTree},
  value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
  /// One row per root, columns named `<alias>_<column>`.
  Flat,
  /// One `json` column per root holding the nested document.
  Document,
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
  pub sql:    String,
  pub params: Vec<Value>,
  pub shape:  Shape,
}

impl CompiledQuery {
  pub fn statement(&self) -> Statement { Statement::with_params(self.sql.clone(), self.params.clone()) }
}

/// Compiles a find request against a schema without a live context.
pub fn compile_find(schema: &Schema, dialect: Dialect, class: &str, find: &Find) -> Result<CompiledQuery> {
  let tree = ScopeTree::build(schema, class, find)?;
  Ok(compile(&tree, dialect))
}

pub(crate) fn compile(tree: &ScopeTree, dialect: Dialect) -> CompiledQuery {
  let mut compiler = Compiler { dialect, params: Params::new(dialect), ctes: Vec::new() };
  let root_cte = compiler.root_cte(tree);
  compiler.ctes.push(format!("root_cte AS ({root_cte})"));

  let (tail, shape) = if tree.root.has_eager() {
    compiler.relation_ctes(&tree.root);
    compiler.selected_cte(&tree.root);
    ("SELECT json FROM selected_cte", Shape::Document)
  } else {
    ("SELECT * FROM root_cte", Shape::Flat)
  };

  let sql = format!("WITH {} {tail}", compiler.ctes.join(", "));
  CompiledQuery { sql, params: compiler.params.into_values(), shape }
}

/// Column name used for a root column in the flat shape.
pub(crate) fn flat_column(alias: &str, column: &ColumnScope) -> String {
  format!("{alias}_{}", column.name)
}

struct Compiler {
  dialect: Dialect,
  params:  Params,
  ctes:    Vec<String>,
}

impl Compiler {
  // ── root_cte ──────────────────────────────────────────────────────────────

  fn root_cte(&mut self, tree: &ScopeTree) -> String {
    let root = &tree.root;
    let select: Vec<String> = root
      .columns()
      .map(|(alias, col)| format!("{alias}.{} AS {}", col.name, flat_column(alias, col)))
      .collect();

    let mut from = base_table(root);
    let mut predicates = Vec::new();
    let mut distinct = false;
    self.filter_joins(root, &mut from, &mut predicates, &mut distinct);
    for sql in &tree.raw {
      predicates.push(sql.render(None, &mut self.params));
    }

    let mut out = format!(
      "SELECT {}{} FROM {from}",
      if distinct { "DISTINCT " } else { "" },
      select.join(", ")
    );
    if !predicates.is_empty() {
      out.push_str(" WHERE ");
      out.push_str(&predicates.join(" AND "));
    }
    out
  }

  fn filter_joins(
    &mut self,
    node: &ScopeNode,
    from: &mut String,
    predicates: &mut Vec<String>,
    distinct: &mut bool,
  ) {
    for (column, filter) in &node.predicates {
      predicates.push(filter.render(column, &mut self.params));
    }
    for rel in node.relations.values().filter(|r| r.filtered) {
      *distinct = true;
      let child = &rel.node;
      let jt = format!("jt_{}_{}", node.alias, child.alias);
      from.push_str(&format!(
        " LEFT JOIN {junction} {jt} ON {jt}.joining_id = {parent}.id \
         LEFT JOIN {table} {alias} ON {alias}.id = {jt}.joined_id",
        junction = rel.junction,
        parent = node.alias,
        table = child.tables[0].table,
        alias = child.alias,
      ));
      from.push_str(&chain_joins(child));
      self.filter_joins(child, from, predicates, distinct);
    }
  }

  // ── relation CTEs ─────────────────────────────────────────────────────────

  fn relation_ctes(&mut self, node: &ScopeNode) {
    for rel in node.relations.values().filter(|r| r.eager) {
      let child = &rel.node;
      self.relation_ctes(child);

      let id_ref = format!("{}.id", child.alias);
      let mut pairs: Vec<(String, String)> = child
        .columns()
        .map(|(alias, col)| (col.prop.clone(), self.value_expr(&format!("{alias}.{}", col.name), &col.column)))
        .collect();
      let (joins, nested) = self.eager_joins(child, &id_ref);
      pairs.extend(nested);
      let doc = self.object(&pairs);
      self.ctes.push(format!(
        "{alias}_cte AS (SELECT {id_ref} AS id, {doc} AS json FROM {from}{joins})",
        alias = child.alias,
        from = base_table(child),
      ));

      if child.many {
        let bridge = format!("{}{}", node.alias, child.alias);
        let agg = self.aggregate(&format!("{}.json", child.alias));
        self.ctes.push(format!(
          "{bridge}_cte AS (SELECT jt.joining_id AS id, {agg} AS json FROM {junction} jt \
           JOIN {alias}_cte {alias} ON {alias}.id = jt.joined_id GROUP BY jt.joining_id)",
          junction = rel.junction,
          alias = child.alias,
        ));
      }
    }
  }

  fn selected_cte(&mut self, root: &ScopeNode) {
    let id_col = root
      .lookup(crate::schema::ID)
      .map(|(alias, col)| flat_column(alias, col))
      .unwrap_or_else(|| format!("{}_id", root.alias));
    let id_ref = format!("root_cte.{id_col}");
    let mut pairs: Vec<(String, String)> = root
      .columns()
      .map(|(alias, col)| {
        (col.prop.clone(), self.value_expr(&format!("root_cte.{}", flat_column(alias, col)), &col.column))
      })
      .collect();
    let (joins, nested) = self.eager_joins(root, &id_ref);
    pairs.extend(nested);
    let doc = self.object(&pairs);
    self.ctes.push(format!("selected_cte AS (SELECT {id_ref} AS id, {doc} AS json FROM root_cte{joins})"));
  }

  /// Joins that attach every eager relation of `node` to a row whose id is
  /// `id_ref`, plus the document key/value pairs they contribute.
  fn eager_joins(&self, node: &ScopeNode, id_ref: &str) -> (String, Vec<(String, String)>) {
    let mut joins = String::new();
    let mut pairs = Vec::new();
    for (prop, rel) in node.relations.iter().filter(|(_, r)| r.eager) {
      let child = &rel.node.alias;
      if rel.node.many {
        let bridge = format!("{}{child}", node.alias);
        joins.push_str(&format!(" LEFT JOIN {bridge}_cte {bridge} ON {bridge}.id = {id_ref}"));
        pairs.push((prop.clone(), self.empty_array_default(&format!("{bridge}.json"))));
      } else {
        let jt = format!("jt_{}_{child}", node.alias);
        joins.push_str(&format!(
          " LEFT JOIN {junction} {jt} ON {jt}.joining_id = {id_ref} \
           LEFT JOIN {child}_cte {child} ON {child}.id = {jt}.joined_id",
          junction = rel.junction,
        ));
        pairs.push((prop.clone(), self.nested(&format!("{child}.json"))));
      }
    }
    (joins, pairs)
  }

  // ── dialect pieces ────────────────────────────────────────────────────────

  fn object(&self, pairs: &[(String, String)]) -> String {
    let args: Vec<String> = pairs.iter().map(|(k, v)| format!("'{k}', {v}")).collect();
    match self.dialect {
      Dialect::Postgres => format!("jsonb_build_object({})", args.join(", ")),
      Dialect::Sqlite => format!("json_object({})", args.join(", ")),
    }
  }

  fn aggregate(&self, expr: &str) -> String {
    match self.dialect {
      Dialect::Postgres => format!("jsonb_agg({expr})"),
      Dialect::Sqlite => format!("json_group_array(json({expr}))"),
    }
  }

  fn nested(&self, expr: &str) -> String {
    match self.dialect {
      Dialect::Postgres => expr.to_owned(),
      Dialect::Sqlite => format!("json({expr})"),
    }
  }

  fn empty_array_default(&self, expr: &str) -> String {
    match self.dialect {
      Dialect::Postgres => format!("COALESCE({expr}, '[]'::jsonb)"),
      Dialect::Sqlite => format!("json(COALESCE({expr}, '[]'))"),
    }
  }

  /// How a column value is placed into a document. 64-bit integers travel
  /// as text.
  fn value_expr(&self, expr: &str, column: &Column) -> String {
    match (self.dialect, column.ty, column.array) {
      (Dialect::Postgres, ScalarType::BigInt, false) => format!("{expr}::text"),
      (Dialect::Postgres, ScalarType::BigInt, true) => format!("{expr}::text[]"),
      (Dialect::Postgres, ..) => expr.to_owned(),
      (Dialect::Sqlite, ScalarType::BigInt, false) => format!("CAST({expr} AS TEXT)"),
      (Dialect::Sqlite, _, true) | (Dialect::Sqlite, ScalarType::Json, _) => format!("json({expr})"),
      (Dialect::Sqlite, ..) => expr.to_owned(),
    }
  }
}

fn base_table(node: &ScopeNode) -> String {
  format!("{} {}{}", node.tables[0].table, node.alias, chain_joins(node))
}

/// Joins the ancestor tables of a node onto its own row.
fn chain_joins(node: &ScopeNode) -> String {
  node
    .tables
    .iter()
    .skip(1)
    .map(|t| format!(" JOIN {table} {alias} ON {alias}.id = {base}.id", table = t.table, alias = t.alias, base = node.alias))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    predicate::{Filter, Find, Relations, Sql, Where},
    schema::{ClassDef, Relation, Schema, SchemaDef},
    value::PrimaryKeyKind,
  };

  fn schema() -> Schema {
    let def = SchemaDef::new()
      .class(ClassDef::new("Being").abstract_class().column("age", Column::new(ScalarType::Integer).nullable()))
      .class(
        ClassDef::new("Person")
          .parent("Being")
          .column("fullName", Column::new(ScalarType::Text))
          .column("savings", Column::new(ScalarType::BigInt).nullable())
          .relation("mother", Relation::one("Person").nullable()),
      )
      .class(ClassDef::new("House").column("tags", Column::new(ScalarType::Text).array()).relation("tenants", Relation::many("Person")));
    Schema::build(def, PrimaryKeyKind::Int).unwrap()
  }

  fn compiled(class: &str, find: Find, dialect: Dialect) -> CompiledQuery {
    let schema = schema();
    let tree = ScopeTree::build(&schema, class, &find).unwrap();
    compile(&tree, dialect)
  }

  #[test]
  fn flat_query_joins_parent_table() {
    let q = compiled("Person", Find::new().where_eq("fullName", "A"), Dialect::Sqlite);
    assert_eq!(q.shape, Shape::Flat);
    assert_eq!(
      q.sql,
      "WITH root_cte AS (SELECT a1.id AS a1_id, a1.full_name AS a1_full_name, a1.savings AS a1_savings, \
       a2.age AS a2_age, a2.updated_at AS a2_updated_at FROM person a1 JOIN being a2 ON a2.id = a1.id \
       WHERE a1.full_name = ?) SELECT * FROM root_cte"
    );
    assert_eq!(q.params, vec![Value::from("A")]);
  }

  #[test]
  fn postgres_numbers_placeholders() {
    let find = Find::new().filter(Where::new().eq("fullName", "A").filter("age", Filter::sql(Sql::raw("> ").bind(3))));
    let q = compiled("Person", find, Dialect::Postgres);
    assert!(q.sql.contains("WHERE a1.full_name = $1 AND a2.age > $2"));
  }

  #[test]
  fn eager_singular_relation_builds_document() {
    let q = compiled("Person", Find::new().relation("mother"), Dialect::Sqlite);
    assert_eq!(q.shape, Shape::Document);
    assert!(q.sql.starts_with("WITH root_cte AS (SELECT a1.id AS a1_id"));
    assert!(q.sql.contains(
      "a3_cte AS (SELECT a3.id AS id, json_object('id', a3.id, 'fullName', a3.full_name, \
       'savings', CAST(a3.savings AS TEXT), 'age', a4.age, 'updatedAt', a4.updated_at) AS json \
       FROM person a3 JOIN being a4 ON a4.id = a3.id)"
    ));
    assert!(q.sql.contains(
      "LEFT JOIN person___mother_jt jt_a1_a3 ON jt_a1_a3.joining_id = root_cte.a1_id \
       LEFT JOIN a3_cte a3 ON a3.id = jt_a1_a3.joined_id"
    ));
    assert!(q.sql.contains("'mother', json(a3.json)"));
    assert!(q.sql.ends_with("SELECT json FROM selected_cte"));
  }

  #[test]
  fn eager_plural_relation_uses_bridge() {
    let q = compiled("House", Find::new().relation("tenants"), Dialect::Postgres);
    assert!(q.sql.contains(
      "a1a2_cte AS (SELECT jt.joining_id AS id, jsonb_agg(a2.json) AS json FROM house___tenants_jt jt \
       JOIN a2_cte a2 ON a2.id = jt.joined_id GROUP BY jt.joining_id)"
    ));
    assert!(q.sql.contains("'tenants', COALESCE(a1a2.json, '[]'::jsonb)"));
    assert!(q.sql.contains("'savings', a2.savings::text"));
    let a2 = q.sql.find("a2_cte AS").unwrap();
    let bridge = q.sql.find("a1a2_cte AS").unwrap();
    let selected = q.sql.find("selected_cte AS").unwrap();
    assert!(a2 < bridge && bridge < selected);
  }

  #[test]
  fn nested_eager_relations_emit_children_first() {
    let relations = Relations::new().nested("tenants", Relations::new().with("mother"));
    let q = compiled("House", Find::new().relations(relations), Dialect::Sqlite);
    let mother = q.sql.find("a4_cte AS").unwrap();
    let tenant = q.sql.find("a2_cte AS").unwrap();
    assert!(mother < tenant);
    assert!(q.sql.contains("json_group_array(json(a2.json))"));
    assert!(q.sql.contains("'tags', json(root_cte.a1_tags)"));
  }

  #[test]
  fn relation_filter_uses_distinct_join() {
    let find = Find::new().filter(Where::new().relation("mother", Where::new().eq("fullName", "B")));
    let q = compiled("Person", find, Dialect::Sqlite);
    assert_eq!(q.shape, Shape::Flat);
    assert!(q.sql.contains("SELECT DISTINCT a1.id AS a1_id"));
    assert!(q.sql.contains(
      "LEFT JOIN person___mother_jt jt_a1_a3 ON jt_a1_a3.joining_id = a1.id \
       LEFT JOIN person a3 ON a3.id = jt_a1_a3.joined_id JOIN being a4 ON a4.id = a3.id"
    ));
    assert!(q.sql.contains("WHERE a3.full_name = ?"));
  }

  #[test]
  fn raw_predicates_follow_property_filters() {
    let find = Find::new()
      .where_eq("fullName", "A")
      .raw(|s| Ok(Sql::new().alias(&s.col("age")?).text(" < ").bind(40)));
    let q = compiled("Person", find, Dialect::Sqlite);
    assert!(q.sql.contains("WHERE a1.full_name = ? AND a2.age < ?"));
    assert_eq!(q.params, vec![Value::from("A"), Value::Int(40)]);
  }
}
