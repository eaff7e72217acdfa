//! Error type for `roster-store-sqlite`.

use roster_core::{EnrollmentId, partition::PartitionId};
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] roster_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("configuration error: {0}")]
  Config(#[from] config::ConfigError),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("partition not found: {0}")]
  PartitionNotFound(PartitionId),

  #[error("{0} not found")]
  EnrollmentNotFound(EnrollmentId),

  /// The partition still holds live rows; it was left untouched.
  #[error("partition {partition} still holds {live} live records")]
  PartitionNotEmpty { partition: PartitionId, live: u64 },
}

impl Error {
  /// SQLite reported lock contention (`SQLITE_BUSY` / `SQLITE_LOCKED`).
  pub fn is_busy(&self) -> bool {
    let Self::Database(tokio_rusqlite::Error::Rusqlite(err)) = self else {
      return false;
    };
    matches!(
      err.sqlite_error_code(),
      Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
  }
}

impl From<rusqlite::Error> for Error {
  fn from(err: rusqlite::Error) -> Self { Self::Database(err.into()) }
}

impl From<Error> for roster_core::Error {
  fn from(err: Error) -> Self {
    match err {
      Error::Core(err) => err,
      Error::PartitionNotFound(partition) => Self::NotFound(format!("partition {partition}")),
      Error::EnrollmentNotFound(id) => Self::NotFound(id.to_string()),
      Error::PartitionNotEmpty { partition, live } => Self::NotEmpty { partition, live },
      err if err.is_busy() => Self::Busy(err.to_string()),
      err => Self::Storage(Box::new(err)),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
