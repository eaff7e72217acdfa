//! Integration tests for `SqliteStore` against in-memory and on-disk
//! databases.

use chrono::{NaiveDate, Utc};
use futures::TryStreamExt as _;
use roster_core::{
  ActiveQuery, CourseId, DeletedSlotPolicy, EnrollmentId, EnrollmentRecord, EnrollmentStatus,
  InstitutionId, NewEnrollment, PersonId, Roster, RosterConfig, TenantId, WriteOutcome,
  engine::{ScanFilter, StorageEngine},
  partition::{Month, PartitionSpec, PartitionStats},
  references::AllowAll,
};

use crate::{Error, Settings, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
  NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn december() -> PartitionSpec {
  PartitionSpec::new(Month::containing(date(2025, 12, 1)).range().unwrap())
}

fn enrollment(person: i64, day: NaiveDate) -> NewEnrollment {
  NewEnrollment::new(TenantId(1), PersonId(person), CourseId(1), day)
}

fn record(person: i64, day: NaiveDate) -> EnrollmentRecord {
  EnrollmentRecord::from_new(enrollment(person, day), Utc::now())
}

// ─── Partitions ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn partition_table_carries_cloned_indexes() {
  let s = store().await;
  s.create_partition(&december()).await.unwrap();

  let objects: Vec<(String, String, Option<String>)> = s
    .conn
    .call(|conn| {
      let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master
         WHERE tbl_name = 'enrollments_p2025_12' AND sql IS NOT NULL
         ORDER BY type DESC, name",
      )?;
      let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })
    .await
    .unwrap();

  let names: Vec<&str> = objects.iter().map(|(_, name, _)| name.as_str()).collect();
  assert_eq!(names, vec![
    "enrollments_p2025_12",
    "enrollments_p2025_12_active_idx",
    "enrollments_p2025_12_person_idx",
    "enrollments_p2025_12_tenant_inst_date_status_idx",
  ]);

  let active_sql = objects[1].2.as_deref().unwrap();
  assert!(active_sql.contains("WHERE deleted_at IS NULL"));
}

#[tokio::test]
async fn create_partition_is_idempotent() {
  let s = store().await;
  s.create_partition(&december()).await.unwrap();
  s.create_partition(&december()).await.unwrap();

  let partitions = s.list_partitions().await.unwrap();
  assert_eq!(partitions, vec![december().range]);
}

#[tokio::test]
async fn insert_outside_range_is_rejected() {
  let s = store().await;
  let spec = december();
  s.create_partition(&spec).await.unwrap();

  let err = s.insert(&spec.range.id, &record(7, date(2026, 1, 1))).await.unwrap_err();
  assert!(matches!(err, Error::Database(_)));

  let stats = s.partition_stats(&spec.range.id).await.unwrap();
  assert_eq!(stats, PartitionStats { total: 0, live: 0 });
}

#[tokio::test]
async fn insert_into_unknown_partition_is_not_found() {
  let s = store().await;
  let err = s.insert(&december().range.id, &record(7, date(2025, 12, 3))).await.unwrap_err();
  assert!(matches!(err, Error::PartitionNotFound(_)));
  assert!(matches!(roster_core::Error::from(err), roster_core::Error::NotFound(_)));
}

// ─── Records ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn locate_and_soft_delete() {
  let s = store().await;
  let spec = december();
  s.create_partition(&spec).await.unwrap();
  let rec = record(7, date(2025, 12, 15));
  s.insert(&spec.range.id, &rec).await.unwrap();

  let located = s.locate(rec.id).await.unwrap().unwrap();
  assert_eq!(located.partition, spec.range.id);
  assert_eq!(located.record, rec);

  let first = Utc::now();
  s.mark_deleted(&spec.range.id, rec.id, first).await.unwrap();
  s.mark_deleted(&spec.range.id, rec.id, first + chrono::Duration::hours(1))
    .await
    .unwrap();

  let located = s.locate(rec.id).await.unwrap().unwrap();
  assert_eq!(located.record.deleted_at, Some(first));

  let stats = s.partition_stats(&spec.range.id).await.unwrap();
  assert_eq!(stats, PartitionStats { total: 1, live: 0 });
}

#[tokio::test]
async fn update_unknown_record_is_not_found() {
  let s = store().await;
  let spec = december();
  s.create_partition(&spec).await.unwrap();

  let err = s
    .set_status(&spec.range.id, EnrollmentId::new_v4(), EnrollmentStatus::Active)
    .await
    .unwrap_err();
  assert!(matches!(err, Error::EnrollmentNotFound(_)));
}

#[tokio::test]
async fn scan_filters_and_orders() {
  let s = store().await;
  let spec = december();
  s.create_partition(&spec).await.unwrap();

  let late = record(1, date(2025, 12, 20));
  let early = record(2, date(2025, 12, 2));
  let mut other_tenant = record(3, date(2025, 12, 10));
  other_tenant.tenant_id = TenantId(2);
  let deleted = record(4, date(2025, 12, 11));
  for r in [&late, &early, &other_tenant, &deleted] {
    s.insert(&spec.range.id, r).await.unwrap();
  }
  s.mark_deleted(&spec.range.id, deleted.id, Utc::now()).await.unwrap();

  let filter = ScanFilter { tenant: Some(TenantId(1)), ..ScanFilter::default() };
  let ids: Vec<_> = s
    .scan(&spec.range.id, &filter)
    .await
    .unwrap()
    .into_iter()
    .map(|r| r.id)
    .collect();
  assert_eq!(ids, vec![early.id, late.id]);

  let audit = ScanFilter { include_deleted: true, ..filter };
  let ids: Vec<_> = s
    .scan(&spec.range.id, &audit)
    .await
    .unwrap()
    .into_iter()
    .map(|r| r.id)
    .collect();
  assert_eq!(ids, vec![early.id, deleted.id, late.id]);
}

#[tokio::test]
async fn drop_refuses_live_rows() {
  let s = store().await;
  let spec = december();
  s.create_partition(&spec).await.unwrap();
  let rec = record(7, date(2025, 12, 15));
  s.insert(&spec.range.id, &rec).await.unwrap();

  let err = s.drop_partition(&spec.range.id).await.unwrap_err();
  assert!(matches!(
    roster_core::Error::from(err),
    roster_core::Error::NotEmpty { live: 1, .. }
  ));
  assert!(s.locate(rec.id).await.unwrap().is_some());

  s.mark_deleted(&spec.range.id, rec.id, Utc::now()).await.unwrap();
  assert_eq!(s.drop_partition(&spec.range.id).await.unwrap(), vec![rec.id]);
  assert!(s.locate(rec.id).await.unwrap().is_none());
  assert!(s.list_partitions().await.unwrap().is_empty());
}

#[tokio::test]
async fn write_lock_contention_maps_to_busy() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("roster.db");
  let s = SqliteStore::open(&path).await.unwrap();
  let spec = december();
  s.create_partition(&spec).await.unwrap();

  let blocker = rusqlite::Connection::open(&path).unwrap();
  blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

  let rec = record(7, date(2025, 12, 15));
  let err = s.insert(&spec.range.id, &rec).await.unwrap_err();
  assert!(err.is_busy());
  assert!(matches!(roster_core::Error::from(err), roster_core::Error::Busy(_)));

  blocker.execute_batch("ROLLBACK").unwrap();
  s.insert(&spec.range.id, &rec).await.unwrap();
  assert!(s.locate(rec.id).await.unwrap().is_some());
}

// ─── Roster over SQLite ──────────────────────────────────────────────────────

#[tokio::test]
async fn worked_example_over_sqlite() {
  let roster = Roster::open(store().await, AllowAll, RosterConfig::default())
    .await
    .unwrap();

  let first = roster.try_insert(enrollment(7, date(2025, 12, 15))).await.unwrap();
  let err = roster.try_insert(enrollment(7, date(2025, 12, 20))).await.unwrap_err();
  assert!(matches!(err, roster_core::Error::Conflict { existing, .. } if existing == first));
  roster
    .try_insert(enrollment(7, date(2025, 12, 20)).with_institution(InstitutionId(3)))
    .await
    .unwrap();

  roster.soft_delete(first).await.unwrap();
  let outcome = roster
    .try_reactivate_or_insert(enrollment(7, date(2025, 12, 21)))
    .await
    .unwrap();
  assert!(matches!(outcome, WriteOutcome::Reactivated { previous, .. } if previous == first));

  let active: Vec<EnrollmentRecord> = roster
    .query_active(ActiveQuery::tenant(TenantId(1)))
    .try_collect()
    .await
    .unwrap();
  assert_eq!(active.len(), 2);
  assert!(active.iter().all(|r| r.id != first));
}

#[tokio::test]
async fn reopen_restores_catalog_and_uniqueness() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("roster.db");
  let config = RosterConfig {
    deleted_slot_policy: DeletedSlotPolicy::Retain,
    ..RosterConfig::default()
  };

  let (kept, deleted) = {
    let roster = Roster::open(SqliteStore::open(&path).await.unwrap(), AllowAll, config.clone())
      .await
      .unwrap();
    roster.ensure_future_partitions(date(2025, 11, 1), 3).await.unwrap();
    let kept = roster.try_insert(enrollment(1, date(2025, 11, 5))).await.unwrap();
    let deleted = roster.try_insert(enrollment(2, date(2025, 12, 5))).await.unwrap();
    roster.soft_delete(deleted).await.unwrap();
    (kept, deleted)
  };

  let roster = Roster::open(SqliteStore::open(&path).await.unwrap(), AllowAll, config)
    .await
    .unwrap();
  assert_eq!(roster.partitions().len(), 3);
  assert!(roster.get(deleted).await.unwrap().unwrap().deleted_at.is_some());

  let err = roster.try_insert(enrollment(1, date(2026, 1, 5))).await.unwrap_err();
  assert!(matches!(err, roster_core::Error::Conflict { existing, .. } if existing == kept));

  // Retained slot survives the reopen too.
  let err = roster.try_insert(enrollment(2, date(2026, 1, 5))).await.unwrap_err();
  assert!(matches!(err, roster_core::Error::Conflict { existing, .. } if existing == deleted));
}

#[tokio::test]
async fn retire_over_sqlite() {
  let roster = Roster::open(store().await, AllowAll, RosterConfig::default())
    .await
    .unwrap();
  let old = roster.try_insert(enrollment(7, date(2025, 1, 15))).await.unwrap();
  roster.try_insert(enrollment(8, date(2025, 3, 15))).await.unwrap();

  let err = roster.retire_partitions_older_than(date(2025, 2, 1)).await.unwrap_err();
  assert!(matches!(err, roster_core::Error::NotEmpty { .. }));

  roster.soft_delete(old).await.unwrap();
  let retired = roster.retire_partitions_older_than(date(2025, 2, 1)).await.unwrap();
  assert_eq!(retired.len(), 1);
  assert_eq!(retired[0].as_str(), "enrollments_p2025_01");
  assert_eq!(roster.get(old).await.unwrap(), None);
  assert_eq!(roster.engine().list_partitions().await.unwrap().len(), 1);
}

// ─── Settings ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn settings_load_from_file() {
  let dir = tempfile::tempdir().unwrap();
  let file = dir.path().join("roster.toml");
  let db = dir.path().join("roster.db");
  std::fs::write(
    &file,
    format!(
      "store_path = {db:?}\n\n[roster]\ndeleted_slot_policy = \"retain\"\nlock_stripes = 16\n"
    ),
  )
  .unwrap();

  let settings = Settings::load(Some(file.as_path())).unwrap();
  assert_eq!(settings.store_path, db);
  assert_eq!(settings.roster.deleted_slot_policy, DeletedSlotPolicy::Retain);
  assert_eq!(settings.roster.lock_stripes, 16);
  assert_eq!(settings.roster.retry.max_attempts, 3);

  let roster = settings.open_roster(AllowAll).await.unwrap();
  roster.try_insert(enrollment(7, date(2025, 12, 15))).await.unwrap();
  assert!(db.exists());
}

#[test]
fn environment_overrides_file_settings() {
  let dir = tempfile::tempdir().unwrap();
  let file = dir.path().join("roster.toml");
  std::fs::write(&file, "store_path = \"from-file.db\"\n\n[roster]\nlock_stripes = 16\n").unwrap();

  let env = [
    ("ROSTER_ROSTER__LOCK_STRIPES", "128"),
    ("ROSTER_STORE_PATH", "from-env.db"),
  ]
  .into_iter()
  .map(|(k, v)| (k.to_owned(), v.to_owned()))
  .collect();

  let settings = Settings::layered(Some(file.as_path()), Some(env)).unwrap();
  assert_eq!(settings.roster.lock_stripes, 128);
  assert_eq!(settings.store_path, std::path::PathBuf::from("from-env.db"));
  assert_eq!(settings.roster.retry.max_attempts, 3);
}
