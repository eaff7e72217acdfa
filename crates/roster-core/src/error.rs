//! Error types for `roster-core`.

use chrono::NaiveDate;
use thiserror::Error;

use crate::{
  partition::PartitionId,
  record::{EnrollmentId, UniqueKey},
  references::Reference,
};

#[derive(Debug, Error)]
pub enum Error {
  /// The uniqueness slot for `key` is held by another record.
  #[error("enrollment {key} already held by {existing}")]
  Conflict {
    key:      UniqueKey,
    existing: EnrollmentId,
  },

  #[error("dangling reference: {0}")]
  DanglingReference(Reference),

  #[error("no partition covers {0} and auto-creation is disabled")]
  NoPartitionForDate(NaiveDate),

  #[error("partition {partition} [{start}, {end}) overlaps {existing}")]
  RangeConflict {
    partition: PartitionId,
    start:     NaiveDate,
    end:       NaiveDate,
    existing:  PartitionId,
  },

  /// Registering a partition that is already present with the same range.
  /// Lifecycle operations absorb this; it only reaches callers of the
  /// catalog directly.
  #[error("partition {0} already exists")]
  AlreadyExists(PartitionId),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("partition {partition} still holds {live} live records")]
  NotEmpty {
    partition: PartitionId,
    live:      u64,
  },

  /// A retirement pass dropped the partitions in `retired`, then stopped.
  /// Those partitions are gone; the rest were left in place.
  #[error("retirement stopped after dropping {} partitions: {source}", .retired.len())]
  RetirementInterrupted {
    retired: Vec<PartitionId>,
    #[source]
    source:  Box<Error>,
  },

  /// Transient contention. The only error the store retries on its own.
  #[error("busy: {0}")]
  Busy(String),

  #[error("invalid date range [{start}, {end})")]
  InvalidRange { start: NaiveDate, end: NaiveDate },

  #[error("invalid partition name: {0:?}")]
  InvalidPartitionName(String),

  #[error("unknown enrollment status: {0:?}")]
  UnknownStatus(String),

  #[error("enrollment {0} is soft-deleted")]
  Deleted(EnrollmentId),

  #[error("storage error: {0}")]
  Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  /// Whether retrying the same call may succeed without caller changes.
  pub fn is_retryable(&self) -> bool { matches!(self, Self::Busy(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
