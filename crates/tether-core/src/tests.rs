//! Runtime tests against a recording connection that never touches a
//! database.

use std::{
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
  ClassDef, Column, Connection, Dialect, DriverError, EntityId, Error, Orm, OrmConfig, PrimaryKeyKind,
  Relation, Row, ScalarType, SchemaDef, Statement, Value,
};

#[derive(Default)]
struct Recorder {
  transactions: Mutex<Vec<Vec<Statement>>>,
  fail_next:    AtomicBool,
  /// Parks the next transaction until `release` is notified.
  hold_next:    AtomicBool,
  entered:      Notify,
  release:      Notify,
}

impl Recorder {
  fn transactions(&self) -> Vec<Vec<Statement>> { self.transactions.lock().unwrap().clone() }
}

#[async_trait]
impl Connection for Recorder {
  fn dialect(&self) -> Dialect { Dialect::Postgres }

  async fn query(&self, _statement: Statement) -> Result<Vec<Row>, DriverError> { Ok(Vec::new()) }

  async fn transaction(&self, statements: Vec<Statement>) -> Result<u64, DriverError> {
    if self.fail_next.swap(false, Ordering::SeqCst) {
      return Err(DriverError::new(std::io::Error::other("connection reset")));
    }
    if self.hold_next.swap(false, Ordering::SeqCst) {
      self.entered.notify_one();
      self.release.notified().await;
    }
    let count = statements.len() as u64;
    self.transactions.lock().unwrap().push(statements);
    Ok(count)
  }
}

fn family() -> SchemaDef {
  SchemaDef::new()
    .class(ClassDef::new("Being").abstract_class().column("age", Column::new(ScalarType::Integer).nullable()))
    .class(
      ClassDef::new("Person")
        .parent("Being")
        .column("fullName", Column::new(ScalarType::Text).nullable())
        .column("tags", Column::new(ScalarType::Text).array().nullable())
        .column("profile", Column::new(ScalarType::Json).nullable())
        .relation("mother", Relation::one("Person").nullable())
        .relation("children", Relation::many("Person")),
    )
}

async fn boot() -> (Orm, Arc<Recorder>) {
  let recorder = Arc::new(Recorder::default());
  let config = OrmConfig { id_type_default: PrimaryKeyKind::Int, skip_table_creation: true };
  let orm = Orm::boot(config, family(), recorder.clone()).await.unwrap();
  (orm, recorder)
}

#[tokio::test]
async fn two_writes_to_a_new_instance_flush_as_one_insert() {
  let (orm, recorder) = boot().await;
  let p = orm.create("Person").unwrap();
  assert!(p.set("fullName", "A").unwrap());
  assert!(p.set("fullName", "B").unwrap());

  let report = orm.flush().await.unwrap();
  assert_eq!(report.statements, 2);

  let transactions = recorder.transactions();
  assert_eq!(transactions.len(), 1);
  let inserts: Vec<&Statement> = transactions[0].iter().filter(|s| s.sql.starts_with("INSERT INTO person")).collect();
  assert_eq!(inserts.len(), 1);
  assert!(inserts[0].params.contains(&Value::from("B")));
  assert!(!inserts[0].params.contains(&Value::from("A")));
}

#[tokio::test]
async fn flushing_twice_issues_nothing_the_second_time() {
  let (orm, recorder) = boot().await;
  let p = orm.create("Person").unwrap();
  p.set("fullName", "A").unwrap();

  orm.flush().await.unwrap();
  let second = orm.flush().await.unwrap();
  assert_eq!(second.statements, 0);
  assert!(!second.skipped);
  assert_eq!(recorder.transactions().len(), 1);
}

#[tokio::test]
async fn ids_are_assigned_in_sequence_per_root() {
  let (orm, _) = boot().await;
  let a = orm.create("Person").unwrap();
  let b = orm.create("Person").unwrap();
  assert_eq!(a.id(), EntityId::Int(1));
  assert_eq!(b.id(), EntityId::Int(2));
}

#[tokio::test]
async fn abstract_and_unknown_classes_cannot_be_created() {
  let (orm, _) = boot().await;
  assert!(matches!(orm.create("Being"), Err(Error::AbstractClass(_))));
  assert!(matches!(orm.create("Robot"), Err(Error::UnknownClass(_))));
}

#[tokio::test]
async fn one_live_instance_per_id() {
  let (orm, _) = boot().await;
  let p = orm.create("Person").unwrap();
  let again = orm.get("Person", p.id()).unwrap();
  assert_eq!(p, again);

  again.set("fullName", "shared").unwrap();
  assert_eq!(p.get("fullName").unwrap(), Value::from("shared"));
}

#[tokio::test]
async fn dropping_every_handle_evicts_the_instance() {
  let (orm, _) = boot().await;
  let p = orm.create("Person").unwrap();
  let id = p.id();
  let clone = p.clone();
  drop(p);
  assert_eq!(orm.live_instances(), 1);
  drop(clone);
  assert_eq!(orm.live_instances(), 0);
  assert!(orm.get("Person", id).is_none());
}

#[tokio::test]
async fn mistyped_writes_are_rejected_without_error() {
  let (orm, _) = boot().await;
  let p = orm.create("Person").unwrap();
  p.set("fullName", "kept").unwrap();

  assert!(!p.set("fullName", 42).unwrap());
  assert_eq!(p.get("fullName").unwrap(), Value::from("kept"));
  assert!(!p.set("id", 99).unwrap());
  assert!(!p.set("updatedAt", "yesterday").unwrap());
  assert_eq!(p.get("id").unwrap(), Value::from(p.id()));
}

#[tokio::test]
async fn unknown_property_lists_alternatives() {
  let (orm, _) = boot().await;
  let p = orm.create("Person").unwrap();
  let Err(Error::UnknownProperty { valid, .. }) = p.set("nickname", "x") else {
    panic!("expected UnknownProperty");
  };
  assert!(valid.contains(&"fullName".to_owned()));
  assert!(valid.contains(&"age".to_owned()));
}

#[tokio::test]
async fn in_place_edits_are_revalidated() {
  let (orm, _) = boot().await;
  let p = orm.create("Person").unwrap();
  assert!(p.update_array("tags", |tags| tags.push(Value::from("a"))).unwrap());
  assert!(
    p.update_array("tags", |tags| {
      tags.push(Value::from("b"));
      tags.push(Value::Int(3));
    })
    .unwrap()
  );
  assert_eq!(p.get("tags").unwrap(), Value::Array(vec![Value::from("a"), Value::from("b")]));

  p.update_json("profile", |json| *json = serde_json::json!({ "likes": ["tea"] })).unwrap();
  p.update_json("profile", |json| json["likes"][0] = "coffee".into()).unwrap();
  assert_eq!(p.get("profile").unwrap(), Value::Json(serde_json::json!({ "likes": ["coffee"] })));

  let pending = orm.pending_changes();
  let changes = pending.get("Person", p.id()).unwrap();
  assert_eq!(changes.fields["tags"], Value::Array(vec![Value::from("a"), Value::from("b")]));
}

#[tokio::test]
async fn relation_writes_record_deltas_and_keep_targets_alive() {
  let (orm, _) = boot().await;
  let child = orm.create("Person").unwrap();
  let mother = orm.create("Person").unwrap();
  let mother_id = mother.id();

  assert!(child.set_relation("mother", Some(&mother)).unwrap());
  let pending = orm.pending_changes();
  assert_eq!(pending.get("Person", child.id()).unwrap().relations["mother"].added, vec![mother_id]);

  drop(mother);
  assert_eq!(orm.live_instances(), 2);
  let loaded = child.relation("mother").await.unwrap().unwrap();
  assert_eq!(loaded.id(), mother_id);

  // Clearing the reference releases the last holder.
  drop(loaded);
  assert!(child.set_relation("mother", None).unwrap());
  assert_eq!(orm.live_instances(), 1);
  assert!(orm.pending_changes().get("Person", child.id()).unwrap().relations["mother"].is_empty());
}

#[tokio::test]
async fn plural_relations_push_and_remove() {
  let (orm, _) = boot().await;
  let parent = orm.create("Person").unwrap();
  let a = orm.create("Person").unwrap();
  let b = orm.create("Person").unwrap();

  assert!(parent.push_relation("children", &a).unwrap());
  assert!(!parent.push_relation("children", &a).unwrap());
  assert!(parent.push_relation("children", &b).unwrap());
  assert!(parent.remove_relation("children", &a).unwrap());

  let children = parent.relations("children").await.unwrap();
  assert_eq!(children, vec![b.clone()]);
  let pending = orm.pending_changes();
  let delta = &pending.get("Person", parent.id()).unwrap().relations["children"];
  assert_eq!(delta.added, vec![b.id()]);
  assert!(delta.removed.is_empty());

  assert!(matches!(
    parent.set_relation("children", Some(&a)),
    Err(Error::WrongPropertyKind { .. })
  ));
}

#[tokio::test]
async fn entities_from_another_context_are_refused() {
  let (first, _) = boot().await;
  let (second, _) = boot().await;
  let a = first.create("Person").unwrap();
  let b = second.create("Person").unwrap();
  assert!(matches!(a.set_relation("mother", Some(&b)), Err(Error::ForeignEntity)));
}

#[tokio::test]
async fn failed_flush_is_kept_and_can_be_retried() {
  let (orm, recorder) = boot().await;
  let p = orm.create("Person").unwrap();
  p.set("fullName", "A").unwrap();

  recorder.fail_next.store(true, Ordering::SeqCst);
  assert!(matches!(orm.flush().await, Err(Error::Driver(_))));
  let failed = orm.failed_flushes();
  assert_eq!(failed.len(), 1);
  assert!(failed[0].error.contains("connection reset"));
  assert!(orm.pending_changes().is_empty());

  // A write made after the failure wins over the failed value.
  p.set("fullName", "B").unwrap();
  assert_eq!(orm.retry_failed(), 1);
  let pending = orm.pending_changes();
  let changes = pending.get("Person", p.id()).unwrap();
  assert!(changes.is_new);
  assert_eq!(changes.fields["fullName"], Value::from("B"));

  orm.flush().await.unwrap();
  assert!(orm.failed_flushes().is_empty());
  assert_eq!(recorder.transactions().len(), 1);
}

#[tokio::test]
async fn delete_clears_live_references() {
  let (orm, recorder) = boot().await;
  let child = orm.create("Person").unwrap();
  let mother = orm.create("Person").unwrap();
  child.set_relation("mother", Some(&mother)).unwrap();
  orm.flush().await.unwrap();

  orm.delete(&mother).await.unwrap();
  assert!(mother.is_deleted());
  assert!(child.relation("mother").await.unwrap().is_none());
  assert!(orm.get("Person", mother.id()).is_none());
  assert!(!mother.set("fullName", "ghost").unwrap());

  orm.flush().await.unwrap();
  let last = recorder.transactions().pop().unwrap();
  assert_eq!(last[0].sql, "DELETE FROM being WHERE id IN ($1) RETURNING 1");
}

#[tokio::test]
async fn writes_during_a_flush_go_to_the_next_one() {
  let (orm, recorder) = boot().await;
  let p = orm.create("Person").unwrap();
  p.set("fullName", "A").unwrap();

  recorder.hold_next.store(true, Ordering::SeqCst);
  let first = tokio::spawn({
    let orm = orm.clone();
    async move { orm.flush().await }
  });
  recorder.entered.notified().await;

  assert!(orm.pending_changes().is_empty());
  assert!(p.set("fullName", "B").unwrap());
  assert!(!orm.pending_changes().is_empty());
  recorder.release.notify_one();
  first.await.unwrap().unwrap();

  // The rerun is scheduled by the finishing flush, not by the caller.
  tokio::time::timeout(Duration::from_secs(5), async {
    while recorder.transactions().len() < 2 {
      tokio::task::yield_now().await;
    }
  })
  .await
  .unwrap();

  let transactions = recorder.transactions();
  let params = |t: &[Statement]| t.iter().flat_map(|s| s.params.clone()).collect::<Vec<_>>();
  assert!(params(&transactions[0]).contains(&Value::from("A")));
  assert!(!params(&transactions[0]).contains(&Value::from("B")));
  assert!(transactions[1].iter().all(|s| s.sql.starts_with("UPDATE")));
  assert!(params(&transactions[1]).contains(&Value::from("B")));
  assert!(orm.pending_changes().is_empty());
}
