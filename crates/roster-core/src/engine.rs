//! The `StorageEngine` trait and supporting query types.
//!
//! The trait is implemented by storage backends (the in-process
//! [`MemoryEngine`](crate::memory::MemoryEngine), `roster-store-sqlite`).
//! Everything above it (routing, uniqueness, lifecycle) is engine-agnostic.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  partition::{DateRange, PartitionId, PartitionRange, PartitionSpec, PartitionStats},
  record::{EnrollmentId, EnrollmentRecord, EnrollmentStatus, InstitutionId, TenantId},
};

// ─── Query types ─────────────────────────────────────────────────────────────

/// Row filter applied inside a single partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
  /// `None` scans every tenant; only maintenance paths do this.
  pub tenant:          Option<TenantId>,
  pub institution:     Option<InstitutionId>,
  pub dates:           Option<DateRange>,
  /// Include soft-deleted rows.
  #[serde(default)]
  pub include_deleted: bool,
}

impl ScanFilter {
  /// Every row, live or not. Used for index rebuilds.
  pub fn everything() -> Self {
    Self { include_deleted: true, ..Self::default() }
  }

  pub fn matches(&self, record: &EnrollmentRecord) -> bool {
    self.tenant.is_none_or(|t| record.tenant_id == t)
      && self
        .institution
        .is_none_or(|i| record.institution_id == Some(i))
      && self.dates.is_none_or(|d| d.contains(record.enrollment_date))
      && (self.include_deleted || record.is_live())
  }
}

/// A record together with the partition that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
  pub partition: PartitionId,
  pub record:    EnrollmentRecord,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the physical store.
///
/// An engine stores records keyed by partition and creates/drops named
/// partition objects with their own index sets. Engines never decide
/// routing or uniqueness; they persist what they are told.
///
/// All methods return `Send` futures so the trait can be used from
/// multi-threaded runtimes.
pub trait StorageEngine: Send + Sync {
  type Error: Into<Error> + std::error::Error + Send + Sync + 'static;

  // ── Partitions ────────────────────────────────────────────────────────

  /// Every partition object the engine currently holds, in any order.
  fn list_partitions(
    &self,
  ) -> impl Future<Output = Result<Vec<PartitionRange>, Self::Error>> + Send + '_;

  /// Materialise a partition and its indexes. Must be idempotent: creating
  /// an existing partition with the same range is a no-op.
  fn create_partition<'a>(
    &'a self,
    spec: &'a PartitionSpec,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Physically drop a partition and every record in it, returning the ids
  /// that were removed.
  ///
  /// The live-row check and the drop happen atomically: a partition that
  /// holds any live record is left untouched and the call fails with an
  /// error that converts to [`Error::NotEmpty`]. Dropping an unknown
  /// partition removes nothing.
  fn drop_partition<'a>(
    &'a self,
    partition: &'a PartitionId,
  ) -> impl Future<Output = Result<Vec<EnrollmentId>, Self::Error>> + Send + 'a;

  fn partition_stats<'a>(
    &'a self,
    partition: &'a PartitionId,
  ) -> impl Future<Output = Result<PartitionStats, Self::Error>> + Send + 'a;

  // ── Records ───────────────────────────────────────────────────────────

  /// Append a record to `partition`.
  fn insert<'a>(
    &'a self,
    partition: &'a PartitionId,
    record: &'a EnrollmentRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Find a record by id across all partitions.
  fn locate(
    &self,
    id: EnrollmentId,
  ) -> impl Future<Output = Result<Option<Located>, Self::Error>> + Send + '_;

  /// Set `deleted_at` on a live record. Leaves an already-deleted record
  /// untouched.
  fn mark_deleted<'a>(
    &'a self,
    partition: &'a PartitionId,
    id: EnrollmentId,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn set_status<'a>(
    &'a self,
    partition: &'a PartitionId,
    id: EnrollmentId,
    status: EnrollmentStatus,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Records in `partition` matching `filter`, ordered by enrollment date.
  fn scan<'a>(
    &'a self,
    partition: &'a PartitionId,
    filter: &'a ScanFilter,
  ) -> impl Future<Output = Result<Vec<EnrollmentRecord>, Self::Error>> + Send + 'a;
}

/// Lift an engine result into the core error type.
pub(crate) trait IntoCore<T> {
  fn into_core(self) -> Result<T>;
}

impl<T, E: Into<Error>> IntoCore<T> for std::result::Result<T, E> {
  fn into_core(self) -> Result<T> { self.map_err(Into::into) }
}
