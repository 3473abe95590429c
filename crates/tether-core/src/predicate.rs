//! Typed predicate building blocks: column filters, raw SQL fragments with
//! bound parameters, and the `Where`/`Find` request trees.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
  connection::Dialect,
  error::{Error, Result},
  schema::Column,
  scope::AliasScope,
  value::{Conformed, Value, conform},
};

// ─── Aliases and fragments ───────────────────────────────────────────────────

/// A qualified column reference such as `a3.full_name`, obtained from an
/// [`AliasScope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias(pub(crate) String);

impl Alias {
  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Alias {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
  Text(String),
  Param(Value),
  Alias(Alias),
  Column,
}

/// A raw SQL fragment. Text is emitted as-is, values are bound as
/// parameters, and `#` (or [`Sql::column`]) stands for the filtered column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sql {
  parts: Vec<Part>,
}

impl Sql {
  pub fn new() -> Self { Self::default() }

  pub fn raw(text: impl Into<String>) -> Self { Self::new().text(text) }

  pub fn text(mut self, text: impl Into<String>) -> Self {
    self.parts.push(Part::Text(text.into()));
    self
  }

  pub fn bind(mut self, value: impl Into<Value>) -> Self {
    self.parts.push(Part::Param(value.into()));
    self
  }

  pub fn alias(mut self, alias: &Alias) -> Self {
    self.parts.push(Part::Alias(alias.clone()));
    self
  }

  pub fn column(mut self) -> Self {
    self.parts.push(Part::Column);
    self
  }

  fn mentions_column(&self) -> bool {
    self.parts.iter().any(|p| match p {
      Part::Column => true,
      Part::Text(t) => t.contains('#'),
      _ => false,
    })
  }

  /// Renders the fragment, substituting `column` for `#`. Root-level raw
  /// predicates render without a column and keep `#` literal.
  pub(crate) fn render(&self, column: Option<&str>, params: &mut Params) -> String {
    let mut out = String::new();
    if let Some(col) = column {
      if !self.mentions_column() {
        out.push_str(col);
        out.push(' ');
      }
    }
    for part in &self.parts {
      match part {
        Part::Text(t) => match column {
          Some(col) => out.push_str(&t.replace('#', col)),
          None => out.push_str(t),
        },
        Part::Param(v) => out.push_str(&params.push(v.clone())),
        Part::Alias(a) => out.push_str(&a.0),
        Part::Column => out.push_str(column.unwrap_or("#")),
      }
    }
    out
  }
}

/// Collects bound parameters for one statement and hands out placeholders.
#[derive(Debug)]
pub(crate) struct Params {
  dialect: Dialect,
  values:  Vec<Value>,
}

impl Params {
  pub fn new(dialect: Dialect) -> Self { Self { dialect, values: Vec::new() } }

  pub fn push(&mut self, value: Value) -> String {
    self.values.push(value);
    self.dialect.placeholder(self.values.len())
  }

  pub fn into_values(self) -> Vec<Value> { self.values }
}

// ─── Filters ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
  /// Equality; `Value::Null` compiles to `IS NULL`.
  Eq(Value),
  And(Vec<Filter>),
  Or(Vec<Filter>),
  Sql(Sql),
}

impl Filter {
  pub fn eq(value: impl Into<Value>) -> Self { Self::Eq(value.into()) }

  pub fn sql(sql: Sql) -> Self { Self::Sql(sql) }

  pub(crate) fn validate(&self, prop: &str, column: &Column) -> Result<()> {
    match self {
      Self::Eq(Value::Null) => Ok(()),
      Self::Eq(v) => {
        let rejected = |reason: String| Error::InvalidPredicate {
          property: prop.to_owned(),
          reason,
        };
        match conform(v.clone(), column) {
          Conformed::Accepted { dropped: 0, .. } => Ok(()),
          Conformed::Accepted { dropped, .. } => Err(rejected(format!(
            "{dropped} array element(s) are not of type {}",
            column.ty
          ))),
          Conformed::Rejected => Err(rejected(format!(
            "{} is not comparable with {}{}",
            v.type_name(),
            column.ty,
            if column.array { "[]" } else { "" }
          ))),
        }
      }
      Self::And(items) | Self::Or(items) => {
        items.iter().try_for_each(|f| f.validate(prop, column))
      }
      Self::Sql(_) => Ok(()),
    }
  }

  pub(crate) fn render(&self, column: &str, params: &mut Params) -> String {
    match self {
      Self::Eq(Value::Null) => format!("{column} IS NULL"),
      Self::Eq(v) => format!("{column} = {}", params.push(v.clone())),
      Self::And(items) => join(items, " AND ", column, params),
      Self::Or(items) => join(items, " OR ", column, params),
      Self::Sql(sql) => sql.render(Some(column), params),
    }
  }
}

fn join(items: &[Filter], sep: &str, column: &str, params: &mut Params) -> String {
  if items.is_empty() {
    return if sep.contains("AND") { "TRUE".into() } else { "FALSE".into() };
  }
  let rendered: Vec<String> = items.iter().map(|f| f.render(column, params)).collect();
  format!("({})", rendered.join(sep))
}

// ─── Request trees ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WhereEntry {
  Column(Filter),
  Relation(Where),
}

/// Per-property filters. Nested relation filters decide which root rows
/// match; they never prune eager-loaded relation contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Where {
  pub(crate) entries: Vec<(String, WhereEntry)>,
}

impl Where {
  pub fn new() -> Self { Self::default() }

  pub fn eq(self, prop: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filter(prop, Filter::eq(value))
  }

  pub fn filter(mut self, prop: impl Into<String>, filter: Filter) -> Self {
    self.entries.push((prop.into(), WhereEntry::Column(filter)));
    self
  }

  pub fn relation(mut self, prop: impl Into<String>, nested: Where) -> Self {
    self.entries.push((prop.into(), WhereEntry::Relation(nested)));
    self
  }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// Which relations to eager-load, as a tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relations(pub(crate) BTreeMap<String, Relations>);

impl Relations {
  pub fn new() -> Self { Self::default() }

  pub fn with(self, prop: impl Into<String>) -> Self { self.nested(prop, Relations::new()) }

  pub fn nested(mut self, prop: impl Into<String>, inner: Relations) -> Self {
    self.0.insert(prop.into(), inner);
    self
  }

  /// Adds a dotted path such as `tenants.mother`, merging with the
  /// relations already selected.
  pub fn path(mut self, path: &str) -> Self {
    let mut node = &mut self.0;
    for prop in path.split('.').filter(|p| !p.is_empty()) {
      node = &mut node.entry(prop.to_owned()).or_default().0;
    }
    self
  }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

pub type RawPredicate = Arc<dyn Fn(&mut AliasScope<'_>) -> Result<Sql> + Send + Sync>;

/// A read request: eager relations, property filters and raw predicates.
#[derive(Clone, Default)]
pub struct Find {
  pub(crate) relations: Relations,
  pub(crate) filter:    Where,
  pub(crate) raw:       Vec<RawPredicate>,
}

impl Find {
  pub fn new() -> Self { Self::default() }

  pub fn relation(mut self, prop: impl Into<String>) -> Self {
    self.relations = self.relations.with(prop);
    self
  }

  pub fn relation_path(mut self, path: &str) -> Self {
    self.relations = self.relations.path(path);
    self
  }

  pub fn relations(mut self, relations: Relations) -> Self {
    self.relations = relations;
    self
  }

  pub fn filter(mut self, filter: Where) -> Self {
    self.filter = filter;
    self
  }

  pub fn where_eq(mut self, prop: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filter = self.filter.eq(prop, value);
    self
  }

  pub fn raw<F>(mut self, builder: F) -> Self
  where
    F: Fn(&mut AliasScope<'_>) -> Result<Sql> + Send + Sync + 'static,
  {
    self.raw.push(Arc::new(builder));
    self
  }
}

impl fmt::Debug for Find {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Find")
      .field("relations", &self.relations)
      .field("filter", &self.filter)
      .field("raw", &self.raw.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::schema::ScalarType;

  #[test]
  fn dotted_paths_merge() {
    let relations = Relations::new().path("tenants.mother").path("tenants").path("owner");
    let expected = Relations::new()
      .nested("tenants", Relations::new().with("mother"))
      .with("owner");
    assert_eq!(relations, expected);
  }

  #[test]
  fn null_equality_is_null_check() {
    let mut params = Params::new(Dialect::Postgres);
    assert_eq!(Filter::Eq(Value::Null).render("a1.x", &mut params), "a1.x IS NULL");
    assert!(params.into_values().is_empty());
  }

  #[test]
  fn combinators_number_params_in_order() {
    let mut params = Params::new(Dialect::Postgres);
    let f = Filter::Or(vec![Filter::eq("a"), Filter::And(vec![Filter::eq("b"), Filter::eq("c")])]);
    assert_eq!(f.render("a1.n", &mut params), "(a1.n = $1 OR (a1.n = $2 AND a1.n = $3))");
    assert_eq!(params.into_values().len(), 3);
  }

  #[test]
  fn fragment_without_placeholder_is_prefixed_with_column() {
    let mut params = Params::new(Dialect::Sqlite);
    let sql = Sql::raw("> ").bind(18);
    assert_eq!(sql.render(Some("a2.age"), &mut params), "a2.age > ?");
    let sql = Sql::raw("lower(#) = lower(").bind("X").text(")");
    assert_eq!(sql.render(Some("a1.name"), &mut params), "lower(a1.name) = lower(?)");
  }

  #[test]
  fn validation_rejects_wrong_types() {
    let text = Column::new(ScalarType::Text);
    assert!(Filter::eq(1).validate("name", &text).is_err());
    assert!(Filter::eq("x").validate("name", &text).is_ok());
    assert!(Filter::Eq(Value::Null).validate("name", &text).is_ok());
    let tags = Column::new(ScalarType::Text).array();
    assert!(Filter::eq("x").validate("tags", &tags).is_err());
    assert!(Filter::eq(vec!["x"]).validate("tags", &tags).is_ok());
  }
}
