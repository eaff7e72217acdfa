//! Partition lifecycle: creation ahead of need and retirement of old ranges.
//!
//! Partitions are monthly and named after their start month, so asking for
//! the same month twice always means the same partition. Creation is staged:
//! the engine provisions the object (table and cloned indexes) first, and
//! only then is the range published into the catalog. Concurrent requests
//! for one month share a single in-flight creation; other months proceed
//! independently.
//!
//! Nothing here schedules itself. [`LifecycleManager::ensure_future_partitions`]
//! and [`LifecycleManager::retire_partitions_older_than`] are meant to be
//! called periodically by an outside job and are safe to repeat.

use std::{
  collections::HashMap,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::{
  Error, Result,
  catalog::{PartitionCatalog, RetireConfirmation},
  engine::{IntoCore as _, StorageEngine},
  partition::{Month, PartitionId, PartitionRange, PartitionSpec, PartitionStats},
  record::EnrollmentId,
};

// ─── Retention ───────────────────────────────────────────────────────────────

/// Decides whether an otherwise-retirable partition must be kept.
///
/// Partitions with live records are never retired regardless of policy;
/// this only governs partitions holding nothing but soft-deleted rows (or
/// nothing at all).
pub trait RetentionPolicy: Send + Sync {
  fn must_retain(&self, partition: &PartitionRange, stats: &PartitionStats) -> bool;
}

/// Retire every drained partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetainNothing;

impl RetentionPolicy for RetainNothing {
  fn must_retain(&self, _partition: &PartitionRange, _stats: &PartitionStats) -> bool {
    false
  }
}

/// Keep partitions that still hold soft-deleted (audit) rows; only retire
/// empty ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetainDeletedRecords;

impl RetentionPolicy for RetainDeletedRecords {
  fn must_retain(&self, _partition: &PartitionRange, stats: &PartitionStats) -> bool {
    stats.total > 0
  }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// Result of asking for a month's partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
  pub id:      PartitionId,
  /// Whether this call created it.
  pub created: bool,
}

/// A partition that has been unpublished and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetiredPartition {
  pub range:   PartitionRange,
  /// Ids of the (soft-deleted) records physically removed with it.
  pub removed: Vec<EnrollmentId>,
}

/// What a retirement pass did.
#[derive(Debug, Default)]
pub struct RetireReport {
  /// Partitions dropped by this pass, in range order.
  pub retired: Vec<RetiredPartition>,
  /// Why the pass stopped before the end of its plan. Partitions already
  /// in `retired` stay dropped.
  pub blocked: Option<Error>,
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Creates and retires partitions against an engine and a catalog.
pub struct LifecycleManager<E> {
  engine:    Arc<E>,
  catalog:   Arc<PartitionCatalog>,
  retention: Box<dyn RetentionPolicy>,
  in_flight: Mutex<HashMap<Month, Arc<OnceCell<PartitionId>>>>,
}

impl<E: StorageEngine> LifecycleManager<E> {
  pub fn new(engine: Arc<E>, catalog: Arc<PartitionCatalog>) -> Self {
    Self {
      engine,
      catalog,
      retention: Box::new(RetainNothing),
      in_flight: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_retention(mut self, policy: impl RetentionPolicy + 'static) -> Self {
    self.retention = Box::new(policy);
    self
  }

  /// Make sure the partition for `month` exists.
  pub async fn ensure_month(&self, month: Month) -> Result<Ensured> {
    let range = month.range()?;
    if self.catalog.get(&range.id).is_some() {
      return Ok(Ensured { id: range.id, created: false });
    }
    // A partition under another name may already own exactly this month.
    if let Some(existing) = self
      .catalog
      .resolve(range.start)
      .and_then(|id| self.catalog.get(&id))
      .filter(|existing| existing.same_bounds(&range))
    {
      return Ok(Ensured { id: existing.id, created: false });
    }

    let cell = self.in_flight.lock().entry(month).or_default().clone();
    let created = AtomicBool::new(false);
    let created_ref = &created;
    let id = cell
      .get_or_try_init(|| async move {
        let id = range.id.clone();
        let created = self.provision(range).await?;
        created_ref.store(created, Ordering::SeqCst);
        Ok::<_, Error>(id)
      })
      .await?
      .clone();

    Ok(Ensured { id, created: created.load(Ordering::SeqCst) })
  }

  /// Stage the partition object, then publish it. Returns whether this call
  /// published it.
  async fn provision(&self, range: PartitionRange) -> Result<bool> {
    match self.catalog.get(&range.id) {
      Some(existing) if existing.same_bounds(&range) => return Ok(false),
      Some(existing) => {
        return Err(Error::RangeConflict {
          partition: range.id,
          start:     range.start,
          end:       range.end,
          existing:  existing.id,
        });
      }
      None => {}
    }

    let spec = PartitionSpec::new(range.clone());
    self.engine.create_partition(&spec).await.into_core()?;

    match self.catalog.register(range.id.clone(), range.start, range.end) {
      Ok(()) => {
        tracing::info!(
          partition = %range.id,
          start = %range.start,
          end = %range.end,
          indexes = spec.indexes.len(),
          "partition created"
        );
        Ok(true)
      }
      Err(Error::AlreadyExists(_)) => Ok(false),
      Err(err) => {
        // Unstage the object; nothing routes to it.
        if let Err(drop_err) = self.engine.drop_partition(&range.id).await.into_core() {
          tracing::warn!(partition = %range.id, error = %drop_err, "failed to unstage partition");
        }
        Err(err)
      }
    }
  }

  /// Create one partition per calendar month for the `horizon_months`
  /// months starting with the month of `reference`, skipping months that
  /// already exist. Returns the partitions this call created.
  pub async fn ensure_future_partitions(
    &self,
    reference: NaiveDate,
    horizon_months: u32,
  ) -> Result<Vec<PartitionId>> {
    let first = Month::containing(reference);
    let mut created = Vec::new();
    for offset in 0..horizon_months {
      let month = first.plus(offset).ok_or(Error::InvalidRange {
        start: reference,
        end:   reference,
      })?;
      let ensured = self.ensure_month(month).await?;
      if ensured.created {
        created.push(ensured.id);
      }
    }
    tracing::debug!(
      %reference,
      horizon_months,
      created = created.len(),
      "future partitions ensured"
    );
    Ok(created)
  }

  /// Retire every partition whose range ends on or before `cutoff`.
  ///
  /// All candidates are checked before any is touched: if one still holds
  /// live records the call fails with [`Error::NotEmpty`] and nothing is
  /// retired. Partitions the retention policy wants kept are skipped.
  ///
  /// A write can still land in a planned partition after the check. The
  /// pass then stops there and reports it in [`RetireReport::blocked`],
  /// alongside the partitions it had already dropped.
  pub async fn retire_partitions_older_than(&self, cutoff: NaiveDate) -> Result<RetireReport> {
    let candidates: Vec<PartitionRange> = self
      .catalog
      .list()
      .into_iter()
      .take_while(|range| range.end <= cutoff)
      .collect();

    let mut plan = Vec::with_capacity(candidates.len());
    for range in candidates {
      let stats = self.engine.partition_stats(&range.id).await.into_core()?;
      if stats.live > 0 {
        return Err(Error::NotEmpty { partition: range.id, live: stats.live });
      }
      if self.retention.must_retain(&range, &stats) {
        tracing::debug!(partition = %range.id, deleted = stats.deleted(), "retained by policy");
        continue;
      }
      plan.push(range);
    }

    let mut report = RetireReport { retired: Vec::with_capacity(plan.len()), blocked: None };
    for range in plan {
      match self.retire_one(range).await {
        Ok(retired) => report.retired.push(retired),
        Err(err) => {
          tracing::warn!(
            retired = report.retired.len(),
            error = %err,
            "retirement stopped early"
          );
          report.blocked = Some(err);
          break;
        }
      }
    }
    Ok(report)
  }

  async fn retire_one(&self, range: PartitionRange) -> Result<RetiredPartition> {
    let stats = self.engine.partition_stats(&range.id).await.into_core()?;
    self.catalog.retire(&range.id, RetireConfirmation { live_records: stats.live })?;

    let removed = match self.engine.drop_partition(&range.id).await.into_core() {
      Ok(removed) => removed,
      Err(err) => {
        // A write slipped in after the check; put the partition back.
        if let Err(restore) = self.catalog.register(range.id.clone(), range.start, range.end) {
          tracing::error!(partition = %range.id, error = %restore, "failed to restore partition");
        }
        return Err(err);
      }
    };

    self.in_flight.lock().remove(&Month::containing(range.start));
    tracing::info!(
      partition = %range.id,
      removed = removed.len(),
      "partition retired"
    );
    Ok(RetiredPartition { range, removed })
  }
}
