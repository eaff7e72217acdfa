//! An in-process [`StorageEngine`] built on per-partition arenas.
//!
//! Records are appended to a partition's arena and never moved; soft delete
//! and status changes rewrite the slot in place. Records only disappear when
//! their whole partition is dropped.

use std::{
  collections::{BTreeMap, HashMap},
  sync::atomic::{AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
  Error, Result,
  engine::{Located, ScanFilter, StorageEngine},
  partition::{IndexSpec, PartitionId, PartitionRange, PartitionSpec, PartitionStats},
  record::{EnrollmentId, EnrollmentRecord, EnrollmentStatus},
};

struct Arena {
  spec:    PartitionSpec,
  records: Vec<EnrollmentRecord>,
  slots:   HashMap<EnrollmentId, usize>,
}

impl Arena {
  fn slot_mut(&mut self, id: EnrollmentId) -> Result<&mut EnrollmentRecord> {
    let idx = *self
      .slots
      .get(&id)
      .ok_or_else(|| Error::NotFound(id.to_string()))?;
    Ok(&mut self.records[idx])
  }
}

#[derive(Default)]
struct State {
  partitions: BTreeMap<PartitionId, Arena>,
  locator:    HashMap<EnrollmentId, PartitionId>,
}

impl State {
  fn arena_mut(&mut self, partition: &PartitionId) -> Result<&mut Arena> {
    self
      .partitions
      .get_mut(partition)
      .ok_or_else(|| Error::NotFound(format!("partition {partition}")))
  }
}

/// A [`StorageEngine`] that keeps everything in memory.
#[derive(Default)]
pub struct MemoryEngine {
  state:       Mutex<State>,
  provisioned: AtomicUsize,
}

impl MemoryEngine {
  pub fn new() -> Self { Self::default() }

  /// How many partition objects have been materialised (not counting
  /// idempotent repeats).
  pub fn provision_count(&self) -> usize {
    self.provisioned.load(Ordering::SeqCst)
  }

  /// The index set provisioned for `partition`, if it exists.
  pub fn indexes(&self, partition: &PartitionId) -> Option<Vec<IndexSpec>> {
    self
      .state
      .lock()
      .partitions
      .get(partition)
      .map(|arena| arena.spec.indexes.clone())
  }
}

impl StorageEngine for MemoryEngine {
  type Error = Error;

  async fn list_partitions(&self) -> Result<Vec<PartitionRange>> {
    let state = self.state.lock();
    Ok(state.partitions.values().map(|a| a.spec.range.clone()).collect())
  }

  async fn create_partition(&self, spec: &PartitionSpec) -> Result<()> {
    let mut state = self.state.lock();
    if let Some(existing) = state.partitions.get(&spec.range.id) {
      if existing.spec.range.same_bounds(&spec.range) {
        return Ok(());
      }
      return Err(Error::RangeConflict {
        partition: spec.range.id.clone(),
        start:     spec.range.start,
        end:       spec.range.end,
        existing:  existing.spec.range.id.clone(),
      });
    }
    state.partitions.insert(spec.range.id.clone(), Arena {
      spec:    spec.clone(),
      records: Vec::new(),
      slots:   HashMap::new(),
    });
    self.provisioned.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn drop_partition(&self, partition: &PartitionId) -> Result<Vec<EnrollmentId>> {
    let mut state = self.state.lock();
    if let Some(arena) = state.partitions.get(partition) {
      let live = arena.records.iter().filter(|r| r.is_live()).count();
      if live > 0 {
        return Err(Error::NotEmpty {
          partition: partition.clone(),
          live:      live as u64,
        });
      }
    }
    let Some(arena) = state.partitions.remove(partition) else {
      return Ok(Vec::new());
    };
    let removed: Vec<EnrollmentId> = arena.records.iter().map(|r| r.id).collect();
    for id in &removed {
      state.locator.remove(id);
    }
    Ok(removed)
  }

  async fn partition_stats(&self, partition: &PartitionId) -> Result<PartitionStats> {
    let mut state = self.state.lock();
    let arena = state.arena_mut(partition)?;
    let live = arena.records.iter().filter(|r| r.is_live()).count();
    Ok(PartitionStats {
      total: arena.records.len() as u64,
      live:  live as u64,
    })
  }

  async fn insert(&self, partition: &PartitionId, record: &EnrollmentRecord) -> Result<()> {
    let mut state = self.state.lock();
    if state.locator.contains_key(&record.id) {
      return Err(Error::Storage(
        format!("duplicate {}", record.id).into(),
      ));
    }
    let arena = state.arena_mut(partition)?;
    if !arena.spec.range.contains(record.enrollment_date) {
      return Err(Error::Storage(
        format!(
          "{} is outside partition {partition}",
          record.enrollment_date
        )
        .into(),
      ));
    }
    arena.slots.insert(record.id, arena.records.len());
    arena.records.push(record.clone());
    state.locator.insert(record.id, partition.clone());
    Ok(())
  }

  async fn locate(&self, id: EnrollmentId) -> Result<Option<Located>> {
    let state = self.state.lock();
    let Some(partition) = state.locator.get(&id) else {
      return Ok(None);
    };
    let record = state
      .partitions
      .get(partition)
      .and_then(|arena| arena.slots.get(&id).map(|&idx| &arena.records[idx]));
    Ok(record.map(|record| Located {
      partition: partition.clone(),
      record:    record.clone(),
    }))
  }

  async fn mark_deleted(
    &self,
    partition: &PartitionId,
    id: EnrollmentId,
    at: DateTime<Utc>,
  ) -> Result<()> {
    let mut state = self.state.lock();
    let record = state.arena_mut(partition)?.slot_mut(id)?;
    if record.deleted_at.is_none() {
      record.deleted_at = Some(at);
    }
    Ok(())
  }

  async fn set_status(
    &self,
    partition: &PartitionId,
    id: EnrollmentId,
    status: EnrollmentStatus,
  ) -> Result<()> {
    let mut state = self.state.lock();
    state.arena_mut(partition)?.slot_mut(id)?.status = status;
    Ok(())
  }

  async fn scan(
    &self,
    partition: &PartitionId,
    filter: &ScanFilter,
  ) -> Result<Vec<EnrollmentRecord>> {
    let mut state = self.state.lock();
    let arena = state.arena_mut(partition)?;
    let mut rows: Vec<EnrollmentRecord> = arena
      .records
      .iter()
      .filter(|r| filter.matches(r))
      .cloned()
      .collect();
    rows.sort_by_key(|r| (r.enrollment_date, r.created_at));
    Ok(rows)
  }
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::*;
  use crate::{
    partition::Month,
    record::{CourseId, NewEnrollment, PersonId, TenantId},
  };

  fn december() -> PartitionSpec {
    let date = NaiveDate::from_ymd_opt(2025, 12, 1).unwrap();
    PartitionSpec::new(Month::containing(date).range().unwrap())
  }

  fn record(day: u32) -> EnrollmentRecord {
    let date = NaiveDate::from_ymd_opt(2025, 12, day).unwrap();
    EnrollmentRecord::from_new(
      NewEnrollment::new(TenantId(1), PersonId(7), CourseId(1), date),
      Utc::now(),
    )
  }

  #[tokio::test]
  async fn create_partition_is_idempotent() {
    let engine = MemoryEngine::new();
    engine.create_partition(&december()).await.unwrap();
    engine.create_partition(&december()).await.unwrap();
    assert_eq!(engine.provision_count(), 1);
    assert_eq!(engine.list_partitions().await.unwrap().len(), 1);
    assert_eq!(engine.indexes(&december().range.id).unwrap().len(), 3);
  }

  #[tokio::test]
  async fn insert_rejects_dates_outside_range() {
    let engine = MemoryEngine::new();
    let spec = december();
    engine.create_partition(&spec).await.unwrap();

    let mut stray = record(1);
    stray.enrollment_date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    assert!(engine.insert(&spec.range.id, &stray).await.is_err());
  }

  #[tokio::test]
  async fn soft_delete_keeps_first_timestamp() {
    let engine = MemoryEngine::new();
    let spec = december();
    engine.create_partition(&spec).await.unwrap();
    let rec = record(15);
    engine.insert(&spec.range.id, &rec).await.unwrap();

    let first = Utc::now();
    engine.mark_deleted(&spec.range.id, rec.id, first).await.unwrap();
    engine
      .mark_deleted(&spec.range.id, rec.id, first + chrono::Duration::hours(1))
      .await
      .unwrap();

    let located = engine.locate(rec.id).await.unwrap().unwrap();
    assert_eq!(located.record.deleted_at, Some(first));

    let stats = engine.partition_stats(&spec.range.id).await.unwrap();
    assert_eq!(stats, PartitionStats { total: 1, live: 0 });
  }

  #[tokio::test]
  async fn drop_partition_forgets_records() {
    let engine = MemoryEngine::new();
    let spec = december();
    engine.create_partition(&spec).await.unwrap();
    let rec = record(3);
    engine.insert(&spec.range.id, &rec).await.unwrap();

    let err = engine.drop_partition(&spec.range.id).await.unwrap_err();
    assert!(matches!(err, Error::NotEmpty { live: 1, .. }));
    assert!(engine.locate(rec.id).await.unwrap().is_some());

    engine.mark_deleted(&spec.range.id, rec.id, Utc::now()).await.unwrap();
    let removed = engine.drop_partition(&spec.range.id).await.unwrap();
    assert_eq!(removed, vec![rec.id]);
    assert!(engine.locate(rec.id).await.unwrap().is_none());
  }
}
