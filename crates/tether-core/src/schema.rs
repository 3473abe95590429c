//! Static class metadata ("class wiki").
//!
//! A [`Schema`] is built once at boot from an explicit [`SchemaDef`] (either
//! deserialized from a file or assembled with the builder methods) and is
//! immutable afterwards. Besides the declared columns and relations it holds
//! the reverse indices used by delete and introspection.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
  error::{Error, Result},
  value::PrimaryKeyKind,
};

pub const ID: &str = "id";
pub const UPDATED_AT: &str = "updatedAt";
pub const UPDATED_AT_COLUMN: &str = "updated_at";

// ─── Declarations ────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScalarType {
  Text,
  Integer,
  BigInt,
  Float,
  Boolean,
  Timestamp,
  Uuid,
  Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
  #[serde(rename = "type")]
  pub ty:       ScalarType,
  #[serde(default)]
  pub array:    bool,
  #[serde(default)]
  pub nullable: bool,
  #[serde(default)]
  pub unique:   bool,
}

impl Column {
  pub fn new(ty: ScalarType) -> Self {
    Self { ty, array: false, nullable: false, unique: false }
  }

  pub fn array(mut self) -> Self {
    self.array = true;
    self
  }

  pub fn nullable(mut self) -> Self {
    self.nullable = true;
    self
  }

  pub fn unique(mut self) -> Self {
    self.unique = true;
    self
  }

  pub(crate) fn updated_at() -> Self { Self::new(ScalarType::Timestamp) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
  pub target:   String,
  #[serde(default)]
  pub many:     bool,
  #[serde(default)]
  pub nullable: bool,
}

impl Relation {
  pub fn one(target: impl Into<String>) -> Self {
    Self { target: target.into(), many: false, nullable: false }
  }

  pub fn many(target: impl Into<String>) -> Self {
    Self { target: target.into(), many: true, nullable: false }
  }

  pub fn nullable(mut self) -> Self {
    self.nullable = true;
    self
  }

  /// A non-nullable singular relation must be severed before its target can
  /// be deleted.
  pub fn is_dependency(&self) -> bool { !self.many && !self.nullable }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassDef {
  pub name:        String,
  #[serde(default)]
  pub parent:      Option<String>,
  #[serde(default, rename = "abstract")]
  pub is_abstract: bool,
  /// Only meaningful on inheritance roots.
  #[serde(default)]
  pub id_type:     Option<PrimaryKeyKind>,
  #[serde(default)]
  pub columns:     BTreeMap<String, Column>,
  #[serde(default)]
  pub relations:   BTreeMap<String, Relation>,
}

impl ClassDef {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into(), ..Self::default() }
  }

  pub fn parent(mut self, parent: impl Into<String>) -> Self {
    self.parent = Some(parent.into());
    self
  }

  pub fn abstract_class(mut self) -> Self {
    self.is_abstract = true;
    self
  }

  pub fn id_type(mut self, kind: PrimaryKeyKind) -> Self {
    self.id_type = Some(kind);
    self
  }

  pub fn column(mut self, name: impl Into<String>, column: Column) -> Self {
    self.columns.insert(name.into(), column);
    self
  }

  pub fn relation(mut self, name: impl Into<String>, relation: Relation) -> Self {
    self.relations.insert(name.into(), relation);
    self
  }
}

/// The explicit, serializable description of every entity class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDef {
  #[serde(default)]
  pub classes: Vec<ClassDef>,
}

impl SchemaDef {
  pub fn new() -> Self { Self::default() }

  pub fn class(mut self, class: ClassDef) -> Self {
    self.classes.push(class);
    self
  }
}

// ─── Class wiki ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClassWiki {
  pub name:         String,
  pub table:        String,
  pub parent:       Option<String>,
  pub is_abstract:  bool,
  pub columns:      BTreeMap<String, Column>,
  pub relations:    BTreeMap<String, Relation>,
  /// referencing class → non-nullable singular relations pointing here.
  pub dependencies: BTreeMap<String, Vec<String>>,
  /// referencing class → every other relation pointing here.
  pub references:   BTreeMap<String, Vec<String>>,
  /// Name of the class owning the root table of this chain.
  pub root:         String,
  pub id_type:      PrimaryKeyKind,
  /// Distance from the root; the root itself is 0.
  pub depth:        usize,
}

impl ClassWiki {
  pub fn is_root(&self) -> bool { self.parent.is_none() }

  pub fn id_column(&self) -> Column { Column::new(self.id_type.scalar()) }

  pub fn junction_table(&self, relation: &str) -> String {
    format!("{}___{}_jt", self.table, to_snake_case(relation))
  }
}

/// Where a property lives once the inheritance chain is taken into account.
#[derive(Debug, Clone, Copy)]
pub enum Property<'a> {
  Id,
  UpdatedAt,
  Column {
    owner:  &'a ClassWiki,
    column: &'a Column,
  },
  Relation {
    owner:    &'a ClassWiki,
    relation: &'a Relation,
  },
}

#[derive(Debug, Clone)]
pub struct Schema {
  classes: BTreeMap<String, ClassWiki>,
}

impl Schema {
  pub fn build(def: SchemaDef, default_id: PrimaryKeyKind) -> Result<Self> {
    let mut decls: BTreeMap<String, ClassDef> = BTreeMap::new();
    for class in def.classes {
      if class.name.is_empty() {
        return Err(Error::Schema("class with an empty name".into()));
      }
      for prop in class.columns.keys().chain(class.relations.keys()) {
        if prop == ID || prop == UPDATED_AT {
          return Err(Error::Schema(format!(
            "{}.{prop} uses a reserved property name",
            class.name
          )));
        }
      }
      if let Some(dup) = class.columns.keys().find(|c| class.relations.contains_key(*c)) {
        return Err(Error::Schema(format!(
          "{}.{dup} is declared both as a column and a relation",
          class.name
        )));
      }
      if decls.contains_key(&class.name) {
        return Err(Error::Schema(format!("class {} declared twice", class.name)));
      }
      decls.insert(class.name.clone(), class);
    }

    let mut classes = BTreeMap::new();
    for (name, decl) in &decls {
      let chain = ancestry(&decls, name)?;
      let root = chain.last().unwrap_or(name);
      let root_decl = &decls[root];

      if decl.parent.is_some() && decl.id_type.is_some() {
        return Err(Error::Schema(format!(
          "{name} declares an id_type but only inheritance roots may"
        )));
      }

      let mut seen = BTreeSet::new();
      for ancestor in std::iter::once(name).chain(chain.iter()) {
        let d = &decls[ancestor];
        for prop in d.columns.keys().chain(d.relations.keys()) {
          if !seen.insert(prop.as_str()) {
            return Err(Error::Schema(format!(
              "{name}.{prop} is declared more than once along its inheritance chain"
            )));
          }
        }
      }

      for (prop, relation) in &decl.relations {
        if !decls.contains_key(&relation.target) {
          return Err(Error::Schema(format!(
            "{name}.{prop} targets unknown class {}",
            relation.target
          )));
        }
      }

      classes.insert(name.clone(), ClassWiki {
        name:         name.clone(),
        table:        to_snake_case(name),
        parent:       decl.parent.clone(),
        is_abstract:  decl.is_abstract,
        columns:      decl.columns.clone(),
        relations:    decl.relations.clone(),
        dependencies: BTreeMap::new(),
        references:   BTreeMap::new(),
        root:         root.clone(),
        id_type:      root_decl.id_type.unwrap_or(default_id),
        depth:        chain.len(),
      });
    }

    let mut links = Vec::new();
    for wiki in classes.values() {
      for (prop, relation) in &wiki.relations {
        links.push((relation.target.clone(), wiki.name.clone(), prop.clone(), relation.is_dependency()));
      }
    }
    for (target, source, prop, dependency) in links {
      if let Some(wiki) = classes.get_mut(&target) {
        let index = if dependency { &mut wiki.dependencies } else { &mut wiki.references };
        index.entry(source).or_default().push(prop);
      }
    }

    let tables: BTreeSet<_> = classes.values().map(|w| w.table.as_str()).collect();
    if tables.len() != classes.len() {
      return Err(Error::Schema("two classes map to the same table name".into()));
    }

    Ok(Self { classes })
  }

  pub fn class(&self, name: &str) -> Result<&ClassWiki> {
    self.classes.get(name).ok_or_else(|| Error::UnknownClass(name.to_owned()))
  }

  pub fn classes(&self) -> impl Iterator<Item = &ClassWiki> { self.classes.values() }

  /// The class followed by its ancestors, nearest first.
  pub fn chain(&self, name: &str) -> Result<Vec<&ClassWiki>> {
    let mut chain = vec![self.class(name)?];
    while let Some(parent) = chain.last().and_then(|w| w.parent.as_deref()) {
      chain.push(self.class(parent)?);
    }
    Ok(chain)
  }

  pub fn root(&self, name: &str) -> Result<&ClassWiki> {
    let wiki = self.class(name)?;
    self.class(&wiki.root)
  }

  /// True when `class` is `ancestor` or inherits from it.
  pub fn is_a(&self, class: &str, ancestor: &str) -> bool {
    self
      .chain(class)
      .map(|chain| chain.iter().any(|w| w.name == ancestor))
      .unwrap_or(false)
  }

  /// `class` itself when concrete, plus every concrete class inheriting from
  /// it.
  pub fn concrete_descendants(&self, class: &str) -> Vec<&ClassWiki> {
    self
      .classes
      .values()
      .filter(|w| !w.is_abstract && self.is_a(&w.name, class))
      .collect()
  }

  /// The concrete classes whose tables together cover every stored instance
  /// of `class`: the class itself when concrete, otherwise the topmost
  /// concrete descendants.
  pub fn query_classes(&self, class: &str) -> Vec<&ClassWiki> {
    self
      .concrete_descendants(class)
      .into_iter()
      .filter(|w| {
        self.chain(&w.name).is_ok_and(|chain| {
          chain
            .iter()
            .skip(1)
            .take_while(|a| self.is_a(&a.name, class))
            .all(|a| a.is_abstract)
        })
      })
      .collect()
  }

  pub fn classify<'a>(&'a self, class: &str, prop: &str) -> Result<Property<'a>> {
    if prop == ID {
      self.class(class)?;
      return Ok(Property::Id);
    }
    if prop == UPDATED_AT {
      self.class(class)?;
      return Ok(Property::UpdatedAt);
    }
    for owner in self.chain(class)? {
      if let Some(column) = owner.columns.get(prop) {
        return Ok(Property::Column { owner, column });
      }
      if let Some(relation) = owner.relations.get(prop) {
        return Ok(Property::Relation { owner, relation });
      }
    }
    Err(Error::UnknownProperty {
      class:    class.to_owned(),
      property: prop.to_owned(),
      valid:    self.properties(class),
    })
  }

  /// Resolves `prop` as a relation, rejecting columns.
  pub fn relation<'a>(&'a self, class: &str, prop: &str) -> Result<(&'a ClassWiki, &'a Relation)> {
    match self.classify(class, prop)? {
      Property::Relation { owner, relation } => Ok((owner, relation)),
      _ => Err(Error::WrongPropertyKind {
        class:    class.to_owned(),
        property: prop.to_owned(),
        expected: "relation",
      }),
    }
  }

  /// Every property a class exposes, inherited ones included.
  pub fn properties(&self, class: &str) -> Vec<String> {
    let mut props = vec![ID.to_owned(), UPDATED_AT.to_owned()];
    if let Ok(chain) = self.chain(class) {
      for wiki in chain {
        props.extend(wiki.columns.keys().cloned());
        props.extend(wiki.relations.keys().cloned());
      }
    }
    props
  }

  /// Relations, inherited ones included, keyed by property name.
  pub fn all_relations<'a>(&'a self, class: &str) -> Result<Vec<(&'a str, &'a ClassWiki, &'a Relation)>> {
    let mut out = Vec::new();
    for owner in self.chain(class)? {
      for (prop, relation) in &owner.relations {
        out.push((prop.as_str(), owner, relation));
      }
    }
    Ok(out)
  }

  /// `dependencies` (or `references`) of the class and its ancestors, merged
  /// by referencing class.
  pub fn referencing(&self, class: &str, include_references: bool) -> Result<BTreeMap<String, Vec<String>>> {
    let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for wiki in self.chain(class)? {
      let mut indices = vec![&wiki.dependencies];
      if include_references {
        indices.push(&wiki.references);
      }
      for index in indices {
        for (source, props) in index {
          let entry = merged.entry(source.clone()).or_default();
          for prop in props {
            if !entry.contains(prop) {
              entry.push(prop.clone());
            }
          }
        }
      }
    }
    Ok(merged)
  }
}

fn ancestry(decls: &BTreeMap<String, ClassDef>, name: &str) -> Result<Vec<String>> {
  let mut chain: Vec<String> = Vec::new();
  let mut current = decls[name].parent.clone();
  while let Some(parent) = current {
    if parent == name || chain.contains(&parent) {
      return Err(Error::Schema(format!("inheritance cycle through {name}")));
    }
    let decl = decls
      .get(&parent)
      .ok_or_else(|| Error::Schema(format!("{name} extends unknown class {parent}")))?;
    chain.push(parent);
    current = decl.parent.clone();
  }
  Ok(chain)
}

/// `fullName` → `full_name`, `HTTPServer` → `http_server`.
pub fn to_snake_case(name: &str) -> String {
  let chars: Vec<char> = name.chars().collect();
  let mut out = String::with_capacity(name.len() + 4);
  for (i, &c) in chars.iter().enumerate() {
    if c.is_uppercase() {
      let prev = i.checked_sub(1).map(|p| chars[p]);
      let next = chars.get(i + 1);
      let boundary = match prev {
        Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
        Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
        _ => false,
      };
      if boundary {
        out.push('_');
      }
      out.extend(c.to_lowercase());
    } else {
      out.push(c);
    }
  }
  out
}
