//! Scope descriptor tree: for one read, which tables, columns, relations
//! and predicates are in play, each with a stable alias (`a1`, `a2`, ...).

use std::collections::{BTreeMap, btree_map::Entry};

use crate::{
  error::{Error, Result},
  predicate::{Alias, Filter, Find, Relations, Sql, Where, WhereEntry},
  schema::{Column, ID, Property, Schema, UPDATED_AT, UPDATED_AT_COLUMN, to_snake_case},
};

#[derive(Debug, Clone)]
pub(crate) struct ColumnScope {
  pub prop:   String,
  pub name:   String,
  pub column: Column,
}

/// One table of an inheritance chain.
#[derive(Debug, Clone)]
pub(crate) struct TableScope {
  pub alias:   String,
  pub table:   String,
  pub columns: Vec<ColumnScope>,
}

#[derive(Debug, Clone)]
pub(crate) struct RelationScope {
  pub junction: String,
  pub node:     ScopeNode,
  /// Materialized into the result document.
  pub eager:    bool,
  /// Joined into the root CTE so predicates can reach it.
  pub filtered: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ScopeNode {
  pub class:      String,
  pub alias:      String,
  pub many:       bool,
  /// The class table first, then its ancestors up to the root table.
  pub tables:     Vec<TableScope>,
  pub relations:  BTreeMap<String, RelationScope>,
  /// Qualified column and its filter.
  pub predicates: Vec<(String, Filter)>,
}

impl ScopeNode {
  fn new(schema: &Schema, aliases: &mut Aliases, class: &str, many: bool) -> Result<Self> {
    let chain = schema.chain(class)?;
    let mut tables = Vec::with_capacity(chain.len());
    for (i, wiki) in chain.iter().enumerate() {
      let mut columns = Vec::new();
      if i == 0 {
        columns.push(ColumnScope {
          prop:   ID.to_owned(),
          name:   ID.to_owned(),
          column: wiki.id_column(),
        });
      }
      for (prop, column) in &wiki.columns {
        columns.push(ColumnScope {
          prop:   prop.clone(),
          name:   to_snake_case(prop),
          column: column.clone(),
        });
      }
      if wiki.is_root() {
        columns.push(ColumnScope {
          prop:   UPDATED_AT.to_owned(),
          name:   UPDATED_AT_COLUMN.to_owned(),
          column: Column::updated_at(),
        });
      }
      tables.push(TableScope { alias: aliases.next(), table: wiki.table.clone(), columns });
    }
    let alias = tables.first().map(|t| t.alias.clone()).unwrap_or_default();
    Ok(Self {
      class: class.to_owned(),
      alias,
      many,
      tables,
      relations: BTreeMap::new(),
      predicates: Vec::new(),
    })
  }

  /// Qualifying alias and column for a scalar property.
  pub fn lookup(&self, prop: &str) -> Option<(&str, &ColumnScope)> {
    self.tables.iter().find_map(|t| {
      t.columns.iter().find(|c| c.prop == prop).map(|c| (t.alias.as_str(), c))
    })
  }

  /// Every scalar column with its table alias, in emission order.
  pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnScope)> {
    self
      .tables
      .iter()
      .flat_map(|t| t.columns.iter().map(move |c| (t.alias.as_str(), c)))
  }

  pub fn has_eager(&self) -> bool { self.relations.values().any(|r| r.eager) }
}

#[derive(Debug, Default)]
pub(crate) struct Aliases(usize);

impl Aliases {
  fn next(&mut self) -> String {
    self.0 += 1;
    format!("a{}", self.0)
  }
}

fn ensure_relation<'n>(
  schema: &Schema,
  aliases: &mut Aliases,
  node: &'n mut ScopeNode,
  prop: &str,
) -> Result<&'n mut RelationScope> {
  let (owner, relation) = schema.relation(&node.class, prop)?;
  match node.relations.entry(prop.to_owned()) {
    Entry::Occupied(e) => Ok(e.into_mut()),
    Entry::Vacant(v) => {
      let child = ScopeNode::new(schema, aliases, &relation.target, relation.many)?;
      Ok(v.insert(RelationScope {
        junction: owner.junction_table(prop),
        node:     child,
        eager:    false,
        filtered: false,
      }))
    }
  }
}

fn apply_relations(
  schema: &Schema,
  aliases: &mut Aliases,
  node: &mut ScopeNode,
  relations: &Relations,
) -> Result<()> {
  for (prop, inner) in &relations.0 {
    let rel = ensure_relation(schema, aliases, node, prop)?;
    rel.eager = true;
    apply_relations(schema, aliases, &mut rel.node, inner)?;
  }
  Ok(())
}

fn apply_where(schema: &Schema, aliases: &mut Aliases, node: &mut ScopeNode, filter: &Where) -> Result<()> {
  for (prop, entry) in &filter.entries {
    match entry {
      WhereEntry::Column(f) => {
        if let Property::Relation { .. } = schema.classify(&node.class, prop)? {
          return Err(Error::InvalidPredicate {
            property: prop.clone(),
            reason:   "is a relation; filter it with a nested Where".into(),
          });
        }
        let (alias, col) = node.lookup(prop).ok_or_else(|| Error::UnknownProperty {
          class:    node.class.clone(),
          property: prop.clone(),
          valid:    schema.properties(&node.class),
        })?;
        f.validate(prop, &col.column)?;
        let qualified = format!("{alias}.{}", col.name);
        node.predicates.push((qualified, f.clone()));
      }
      WhereEntry::Relation(nested) => {
        let rel = ensure_relation(schema, aliases, node, prop)?;
        rel.filtered = true;
        apply_where(schema, aliases, &mut rel.node, nested)?;
      }
    }
  }
  Ok(())
}

/// Handed to raw predicate builders to resolve properties into aliases.
pub struct AliasScope<'a> {
  schema:  &'a Schema,
  aliases: &'a mut Aliases,
  node:    &'a mut ScopeNode,
}

impl AliasScope<'_> {
  pub fn class(&self) -> &str { &self.node.class }

  /// The qualified column for a scalar property (including `id`).
  pub fn col(&self, prop: &str) -> Result<Alias> {
    if let Property::Relation { .. } = self.schema.classify(&self.node.class, prop)? {
      return Err(Error::InvalidPredicate {
        property: prop.to_owned(),
        reason:   "is a relation, not a column; use relation() to reach its columns".into(),
      });
    }
    let (alias, col) = self.node.lookup(prop).ok_or_else(|| Error::UnknownProperty {
      class:    self.node.class.clone(),
      property: prop.to_owned(),
      valid:    self.schema.properties(&self.node.class),
    })?;
    Ok(Alias(format!("{alias}.{}", col.name)))
  }

  /// Scope of a related class, joined so its columns can appear in the
  /// predicate.
  pub fn relation(&mut self, prop: &str) -> Result<AliasScope<'_>> {
    let rel = ensure_relation(self.schema, self.aliases, self.node, prop)?;
    rel.filtered = true;
    Ok(AliasScope {
      schema:  self.schema,
      aliases: &mut *self.aliases,
      node:    &mut rel.node,
    })
  }
}

/// The scope of one read request.
#[derive(Debug, Clone)]
pub(crate) struct ScopeTree {
  pub root: ScopeNode,
  pub raw:  Vec<Sql>,
}

impl ScopeTree {
  pub fn build(schema: &Schema, class: &str, find: &Find) -> Result<Self> {
    let wiki = schema.class(class)?;
    if wiki.is_abstract {
      return Err(Error::AbstractClass(class.to_owned()));
    }
    let mut aliases = Aliases::default();
    let mut root = ScopeNode::new(schema, &mut aliases, class, false)?;
    apply_relations(schema, &mut aliases, &mut root, &find.relations)?;
    apply_where(schema, &mut aliases, &mut root, &find.filter)?;

    let mut raw = Vec::with_capacity(find.raw.len());
    for builder in &find.raw {
      let mut scope = AliasScope { schema, aliases: &mut aliases, node: &mut root };
      raw.push(builder(&mut scope)?);
    }
    Ok(Self { root, raw })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    schema::{ClassDef, Relation, ScalarType, SchemaDef},
    value::PrimaryKeyKind,
  };

  fn schema() -> Schema {
    let def = SchemaDef::new()
      .class(ClassDef::new("Being").abstract_class().column("age", Column::new(ScalarType::Integer).nullable()))
      .class(
        ClassDef::new("Person")
          .parent("Being")
          .column("fullName", Column::new(ScalarType::Text))
          .relation("mother", Relation::one("Person").nullable()),
      );
    Schema::build(def, PrimaryKeyKind::Int).unwrap()
  }

  #[test]
  fn aliases_cover_inheritance_chain() {
    let schema = schema();
    let tree = ScopeTree::build(&schema, "Person", &Find::new()).unwrap();
    let aliases: Vec<_> = tree.root.tables.iter().map(|t| (t.alias.as_str(), t.table.as_str())).collect();
    assert_eq!(aliases, [("a1", "person"), ("a2", "being")]);
    assert_eq!(tree.root.lookup("age").map(|(a, c)| (a, c.name.as_str())), Some(("a2", "age")));
    assert_eq!(tree.root.lookup("updatedAt").map(|(a, _)| a), Some("a2"));
  }

  #[test]
  fn raw_builder_resolves_relation_columns() {
    let schema = schema();
    let find = Find::new().raw(|s| {
      let mother = s.relation("mother")?;
      let name = mother.col("fullName")?;
      Ok(Sql::new().alias(&name).text(" = ").bind("B"))
    });
    let tree = ScopeTree::build(&schema, "Person", &find).unwrap();
    let mother = &tree.root.relations["mother"];
    assert!(mother.filtered && !mother.eager);
    assert_eq!(mother.junction, "person___mother_jt");
    assert_eq!(mother.node.alias, "a3");
    assert_eq!(tree.raw.len(), 1);
  }

  #[test]
  fn relation_used_as_column_is_rejected() {
    let schema = schema();
    let find = Find::new().raw(|s| s.col("mother").map(|a| Sql::new().alias(&a)));
    assert!(matches!(
      ScopeTree::build(&schema, "Person", &find),
      Err(Error::InvalidPredicate { .. })
    ));
    let find = Find::new().where_eq("mother", 1);
    assert!(matches!(
      ScopeTree::build(&schema, "Person", &find),
      Err(Error::InvalidPredicate { .. })
    ));
  }

  #[test]
  fn unknown_relation_selector_names_alternatives() {
    let schema = schema();
    let err = ScopeTree::build(&schema, "Person", &Find::new().relation("father")).unwrap_err();
    match err {
      Error::UnknownProperty { valid, .. } => assert!(valid.contains(&"mother".to_owned())),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn abstract_class_cannot_be_found() {
    let schema = schema();
    assert!(matches!(
      ScopeTree::build(&schema, "Being", &Find::new()),
      Err(Error::AbstractClass(_))
    ));
  }
}
