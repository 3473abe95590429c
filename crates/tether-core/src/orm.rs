//! The `Orm` context: schema, connection, identity map, pending changes and
//! the flush scheduler of one independent session.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
  changeset::Changeset,
  compile::{CompiledQuery, compile, compile_find},
  connection::{Connection, Dialect, Statement},
  ddl::create_statements,
  entity::Entity,
  error::{Error, Result},
  flush::{FlushReport, translate},
  identity::{Record, RelationState, Registry, SlotId},
  materialize::{Materialized, fold_all, parse_row},
  model::Model,
  predicate::{Find, Sql},
  scheduler::FlushScheduler,
  schema::{ID, Schema, SchemaDef},
  scope::ScopeTree,
  value::{EntityId, PrimaryKeyKind},
};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrmConfig {
  /// Primary key kind of inheritance roots that do not declare one.
  #[serde(default)]
  pub id_type_default:     PrimaryKeyKind,
  #[serde(default)]
  pub skip_table_creation: bool,
}

// ─── Session state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum IdCounter {
  Uuid,
  Int(i32),
  BigInt(i64),
}

impl IdCounter {
  fn next(&mut self) -> Result<EntityId> {
    let overflow = || Error::Config("primary key counter overflowed".into());
    match self {
      Self::Uuid => Ok(EntityId::Uuid(Uuid::now_v7())),
      Self::Int(last) => {
        *last = last.checked_add(1).ok_or_else(overflow)?;
        Ok(EntityId::Int(*last))
      }
      Self::BigInt(last) => {
        *last = last.checked_add(1).ok_or_else(overflow)?;
        Ok(EntityId::BigInt(*last))
      }
    }
  }
}

/// A changeset whose flush failed, kept for inspection and manual retry.
#[derive(Debug, Clone)]
pub struct FailedFlush {
  pub changes: Changeset,
  pub error:   String,
  pub at:      DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct Session {
  pub registry:  Registry,
  pub changes:   Changeset,
  pub scheduler: FlushScheduler,
  counters:      HashMap<String, IdCounter>,
  failed:        Vec<FailedFlush>,
}

pub(crate) struct OrmInner {
  pub schema:  Schema,
  pub conn:    Arc<dyn Connection>,
  pub dialect: Dialect,
  session:     Mutex<Session>,
  flushed:     Notify,
}

/// Referencing instances of one class, grouped by the relations through
/// which they point at an entity.
#[derive(Debug)]
pub struct Referencers {
  pub class:      String,
  pub properties: Vec<String>,
  pub entities:   Vec<Entity>,
}

#[derive(Clone)]
pub struct Orm {
  pub(crate) inner: Arc<OrmInner>,
}

impl std::fmt::Debug for Orm {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Orm").field("dialect", &self.inner.dialect).finish_non_exhaustive()
  }
}

impl Orm {
  // ── Boot ──────────────────────────────────────────────────────────────────

  /// Builds the schema, creates missing tables and initialises the id
  /// counters.
  pub async fn boot(config: OrmConfig, schema: SchemaDef, conn: Arc<dyn Connection>) -> Result<Self> {
    let schema = Schema::build(schema, config.id_type_default)?;
    Self::boot_with_schema(config, schema, conn).await
  }

  pub async fn boot_with_schema(config: OrmConfig, schema: Schema, conn: Arc<dyn Connection>) -> Result<Self> {
    let dialect = conn.dialect();
    if !config.skip_table_creation {
      let statements = create_statements(&schema, dialect);
      let count = statements.len();
      conn.transaction(statements).await?;
      info!(tables = count, %dialect, "schema tables ready");
    }

    let mut counters = HashMap::new();
    for root in schema.classes().filter(|w| w.is_root()) {
      let counter = match root.id_type {
        PrimaryKeyKind::Uuid => IdCounter::Uuid,
        kind => {
          let query = Statement::new(format!("SELECT id FROM {} ORDER BY id DESC LIMIT 1", root.table));
          let last = match conn.query(query).await {
            Ok(rows) => rows
              .first()
              .and_then(|row| row.values.first())
              .and_then(|v| kind.id_from_value(v).ok()),
            Err(err) => {
              warn!(table = %root.table, error = %err, "could not read the last id; starting from 0");
              None
            }
          };
          match (kind, last) {
            (PrimaryKeyKind::Int, Some(EntityId::Int(i))) => IdCounter::Int(i),
            (PrimaryKeyKind::Int, _) => IdCounter::Int(0),
            (_, Some(EntityId::BigInt(i))) => IdCounter::BigInt(i),
            _ => IdCounter::BigInt(0),
          }
        }
      };
      counters.insert(root.name.clone(), counter);
    }

    let session = Session { counters, ..Session::default() };
    Ok(Self {
      inner: Arc::new(OrmInner {
        schema,
        conn,
        dialect,
        session: Mutex::new(session),
        flushed: Notify::new(),
      }),
    })
  }

  // ── Accessors ─────────────────────────────────────────────────────────────

  pub fn schema(&self) -> &Schema { &self.inner.schema }

  pub fn dialect(&self) -> Dialect { self.inner.dialect }

  pub(crate) fn session(&self) -> MutexGuard<'_, Session> {
    self.inner.session.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn same_context(&self, other: &Orm) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

  /// Snapshot of the changes waiting for the next flush.
  pub fn pending_changes(&self) -> Changeset { self.session().changes.clone() }

  pub fn failed_flushes(&self) -> Vec<FailedFlush> { self.session().failed.clone() }

  /// Number of instances currently held in the identity map's arena.
  pub fn live_instances(&self) -> usize { self.session().registry.live() }

  /// The live instance for `(class, id)`, if one is held.
  pub fn get(&self, class: &str, id: EntityId) -> Option<Entity> {
    let (slot, class) = {
      let mut session = self.session();
      let slot = session.registry.lookup(class, id)?;
      let class = session.registry.get(slot).ok()?.class.clone();
      session.registry.retain(slot);
      (slot, class)
    };
    Some(Entity::from_counted(self.clone(), slot, class, id))
  }

  // ── Create ────────────────────────────────────────────────────────────────

  /// A new instance with the next unused id, flagged new in the changeset.
  pub fn create(&self, class: &str) -> Result<Entity> {
    let schema = &self.inner.schema;
    let wiki = schema.class(class)?;
    if wiki.is_abstract {
      return Err(Error::AbstractClass(class.to_owned()));
    }
    let relations = schema.all_relations(class)?;

    let (slot, id, spawn) = {
      let mut session = self.session();
      let counter = session
        .counters
        .entry(wiki.root.clone())
        .or_insert(match wiki.id_type {
          PrimaryKeyKind::Uuid => IdCounter::Uuid,
          PrimaryKeyKind::Int => IdCounter::Int(0),
          PrimaryKeyKind::BigInt => IdCounter::BigInt(0),
        });
      let id = counter.next()?;
      let now = Utc::now();

      let mut record = Record::new(class, id, now);
      for (prop, _, relation) in relations {
        let state = if relation.many { RelationState::Many(Vec::new()) } else { RelationState::One(None) };
        record.relations.insert(prop.to_owned(), state);
      }
      let slot = session.registry.insert(record);
      session.changes.mark_new(class, id, now);
      debug!(class, %id, "created instance");
      (slot, id, session.scheduler.request())
    };
    if spawn {
      self.spawn_flush();
    }
    Ok(Entity::from_counted(self.clone(), slot, class.to_owned(), id))
  }

  pub fn create_as<M: Model>(&self) -> Result<M> { self.create(M::CLASS).map(M::from_entity) }

  // ── Read ──────────────────────────────────────────────────────────────────

  /// Compiles a find request without running it.
  pub fn compile(&self, class: &str, find: &Find) -> Result<CompiledQuery> {
    compile_find(&self.inner.schema, self.inner.dialect, class, find)
  }

  /// Runs a find request after flushing pending changes. Every returned
  /// entity is the unique live instance for its id.
  #[instrument(skip(self, find))]
  pub async fn find(&self, class: &str, find: Find) -> Result<Vec<Entity>> {
    self.settle().await;
    self.query_entities(class, &find).await
  }

  pub async fn find_as<M: Model>(&self, find: Find) -> Result<Vec<M>> {
    let entities = self.find(M::CLASS, find).await?;
    Ok(entities.into_iter().map(M::from_entity).collect())
  }

  async fn query(&self, class: &str, find: &Find) -> Result<Vec<Materialized>> {
    let tree = ScopeTree::build(&self.inner.schema, class, find)?;
    let query = compile(&tree, self.inner.dialect);
    debug!(sql = %query.sql, params = query.params.len(), "compiled find");
    let rows = self.inner.conn.query(query.statement()).await?;
    rows.iter().map(|row| parse_row(&tree.root, query.shape, row)).collect()
  }

  async fn query_entities(&self, class: &str, find: &Find) -> Result<Vec<Entity>> {
    let parsed = self.query(class, find).await?;
    let counted = {
      let mut session = self.session();
      let registry = &mut session.registry;
      let slots = fold_all(registry, &self.inner.schema, parsed)?;
      let mut counted = Vec::with_capacity(slots.len());
      for slot in slots {
        let record = registry.get(slot)?;
        counted.push((slot, record.class.clone(), record.id));
      }
      counted
    };
    Ok(
      counted
        .into_iter()
        .map(|(slot, class, id)| Entity::from_counted(self.clone(), slot, class, id))
        .collect(),
    )
  }

  /// Loads one relation of a live record through its junction table.
  pub(crate) async fn load_relation(&self, slot: SlotId, prop: &str) -> Result<()> {
    self.settle().await;
    let schema = &self.inner.schema;
    let (id, target, junction, many) = {
      let session = self.session();
      let record = session.registry.get(slot)?;
      let (owner, relation) = schema.relation(&record.class, prop)?;
      (record.id, relation.target.clone(), owner.junction_table(prop), relation.many)
    };

    let mut parsed = Vec::new();
    for class in schema.query_classes(&target) {
      let junction = junction.clone();
      let find = Find::new().raw(move |s| {
        Ok(
          Sql::new()
            .alias(&s.col(ID)?)
            .text(format!(" IN (SELECT joined_id FROM {junction} WHERE joining_id = "))
            .bind(id)
            .text(")"),
        )
      });
      parsed.extend(self.query(&class.name, &find).await?);
    }

    let mut session = self.session();
    let registry = &mut session.registry;
    let mut slots = fold_all(registry, schema, parsed)?;
    if !matches!(registry.get(slot)?.relation(prop), RelationState::Unloaded) {
      // Written while the load was in flight; the write wins.
      slots.into_iter().for_each(|s| registry.release(s));
      return Ok(());
    }
    let state = if many {
      RelationState::Many(slots)
    } else {
      let first = if slots.is_empty() { None } else { Some(slots.remove(0)) };
      slots.into_iter().for_each(|s| registry.release(s));
      RelationState::One(first)
    };
    debug!(prop, targets = state.targets().len(), "loaded relation");
    registry.attach(slot, prop, state)
  }

  // ── Delete & introspection ────────────────────────────────────────────────

  /// Hard-deletes an entity. Fails while any stored instance still depends
  /// on it through a non-nullable singular relation.
  #[instrument(skip(self, entity), fields(entity = ?entity))]
  pub async fn delete(&self, entity: &Entity) -> Result<()> {
    if !self.same_context(entity.orm()) {
      return Err(Error::ForeignEntity);
    }
    self.settle().await;
    let (class, id) = {
      let session = self.session();
      let record = session.registry.get(entity.slot())?;
      (record.class.clone(), record.id)
    };

    let blocking: Vec<String> = self
      .referencers_of(&class, id, false)
      .await?
      .into_iter()
      .filter(|r| !r.entities.is_empty())
      .map(|r| format!("{} x{} via {}", r.class, r.entities.len(), r.properties.join("/")))
      .collect();
    if !blocking.is_empty() {
      return Err(Error::DeletionPrecondition { class, id, dependents: blocking });
    }

    let schema = &self.inner.schema;
    let root_table = schema.root(&class)?.table.clone();
    let spawn = {
      let mut session = self.session();
      let Session { registry, changes, scheduler, .. } = &mut *session;

      changes.hard_delete(root_table, id);
      changes.forget(&class, id);
      for (source, instances) in changes.classes.iter_mut() {
        for inst in instances.values_mut() {
          for (prop, delta) in inst.relations.iter_mut() {
            if let Ok((_, relation)) = schema.relation(source, prop) {
              if schema.is_a(&class, &relation.target) {
                delta.added.retain(|added| *added != id);
              }
            }
          }
        }
      }

      let target = entity.slot();
      registry.get_mut(target)?.deleted = true;
      registry.detach(&class, id);
      for (source, prop) in registry.take_backrefs(&class, id) {
        let Ok(record) = registry.get_mut(source) else {
          continue;
        };
        let dropped = match record.relations.get_mut(&prop) {
          Some(RelationState::One(current)) if *current == Some(target) => {
            *current = None;
            1
          }
          Some(RelationState::Many(slots)) => {
            let before = slots.len();
            slots.retain(|s| *s != target);
            before - slots.len()
          }
          _ => 0,
        };
        for _ in 0..dropped {
          registry.release(target);
        }
      }
      info!(class, %id, "instance deleted");
      scheduler.request()
    };
    if spawn {
      self.spawn_flush();
    }
    Ok(())
  }

  /// Instances that must be detached before `entity` can be deleted.
  pub async fn list_dependents(&self, entity: &Entity) -> Result<Vec<Referencers>> {
    self.referencers_for(entity, false).await
  }

  /// Every instance referencing `entity`, dependents included.
  pub async fn list_referencers(&self, entity: &Entity) -> Result<Vec<Referencers>> {
    self.referencers_for(entity, true).await
  }

  async fn referencers_for(&self, entity: &Entity, include_references: bool) -> Result<Vec<Referencers>> {
    if !self.same_context(entity.orm()) {
      return Err(Error::ForeignEntity);
    }
    self.settle().await;
    let (class, id) = {
      let session = self.session();
      let record = session.registry.get(entity.slot())?;
      (record.class.clone(), record.id)
    };
    self.referencers_of(&class, id, include_references).await
  }

  async fn referencers_of(&self, class: &str, id: EntityId, include_references: bool) -> Result<Vec<Referencers>> {
    let schema = &self.inner.schema;
    let mut out = Vec::new();
    for (source, properties) in schema.referencing(class, include_references)? {
      let junctions = properties
        .iter()
        .map(|prop| schema.relation(&source, prop).map(|(owner, _)| owner.junction_table(prop)))
        .collect::<Result<Vec<_>>>()?;

      let mut entities = Vec::new();
      for concrete in schema.query_classes(&source) {
        let junctions = junctions.clone();
        let find = Find::new().raw(move |s| {
          let col = s.col(ID)?;
          let mut sql = Sql::raw("(");
          for (i, junction) in junctions.iter().enumerate() {
            if i > 0 {
              sql = sql.text(" OR ");
            }
            sql = sql
              .alias(&col)
              .text(format!(" IN (SELECT joining_id FROM {junction} WHERE joined_id = "))
              .bind(id)
              .text(")");
          }
          Ok(sql.text(")"))
        });
        entities.extend(self.query_entities(&concrete.name, &find).await?);
      }
      out.push(Referencers { class: source, properties, entities });
    }
    Ok(out)
  }

  // ── Flush ─────────────────────────────────────────────────────────────────

  /// Persists every pending change in one transaction. Returns a skipped
  /// report when another flush is already running.
  #[instrument(skip(self))]
  pub async fn flush(&self) -> Result<FlushReport> {
    let changes = {
      let mut session = self.session();
      if !session.scheduler.begin() {
        debug!("flush already in flight; dropped");
        return Ok(FlushReport::skipped());
      }
      std::mem::take(&mut session.changes)
    };

    let result = if changes.is_empty() { Ok(0) } else { self.execute(&changes).await };

    let respawn = {
      let mut session = self.session();
      let rerun = session.scheduler.finish();
      if let Err(err) = &result {
        error!(error = %err, instances = changes.instance_count(), "flush failed; changes kept for retry_failed");
        session.failed.push(FailedFlush { changes, error: err.to_string(), at: Utc::now() });
      }
      rerun
    };
    self.inner.flushed.notify_waiters();
    if respawn {
      self.spawn_flush();
    }

    let statements = result?;
    if statements > 0 {
      info!(statements, "flushed");
    }
    Ok(FlushReport { statements, skipped: false })
  }

  async fn execute(&self, changes: &Changeset) -> Result<usize> {
    let statements = translate(&self.inner.schema, self.inner.dialect, changes)?;
    let count = statements.len();
    for statement in &statements {
      debug!(%statement, "flush statement");
    }
    if count > 0 {
      self.inner.conn.transaction(statements).await?;
    }
    Ok(count)
  }

  /// Folds every failed changeset back into the pending one (newer writes
  /// win) and schedules a flush. Returns how many failed flushes were
  /// requeued.
  pub fn retry_failed(&self) -> usize {
    let (count, spawn) = {
      let mut session = self.session();
      let failed = std::mem::take(&mut session.failed);
      let count = failed.len();
      for flush in failed.into_iter().rev() {
        session.changes.merge_older(flush.changes);
      }
      let spawn = count > 0 && session.scheduler.request();
      (count, spawn)
    };
    if spawn {
      self.spawn_flush();
    }
    count
  }

  /// Waits for an in-flight flush, then flushes whatever is pending. Flush
  /// failures are logged and recorded by `flush` itself.
  pub(crate) async fn settle(&self) {
    loop {
      let notified = self.inner.flushed.notified();
      let (flushing, pending) = {
        let session = self.session();
        (session.scheduler.is_flushing(), !session.changes.is_empty())
      };
      if flushing {
        notified.await;
        continue;
      }
      if !pending {
        return;
      }
      match self.flush().await {
        Ok(report) if report.skipped => continue,
        _ => return,
      }
    }
  }

  /// Schedules a deferred flush on the current runtime. Without a runtime
  /// the flush stays scheduled until the next find, flush, load or delete.
  pub(crate) fn spawn_flush(&self) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      return;
    };
    let orm = self.clone();
    handle.spawn(async move {
      tokio::task::yield_now().await;
      if let Err(err) = orm.flush().await {
        debug!(error = %err, "deferred flush failed");
      }
    });
  }
}
