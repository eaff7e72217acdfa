//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Dates are stored as `YYYY-MM-DD` and timestamps as fixed-width RFC 3339
//! UTC strings, so both sort correctly as text. UUIDs are stored as
//! hyphenated lowercase strings; integer ids as `INTEGER`.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use roster_core::{
  CourseId, EnrollmentId, EnrollmentRecord, EnrollmentStatus, InstitutionId, PersonId, TenantId,
  partition::{PartitionId, PartitionRange},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_id(id: EnrollmentId) -> String { id.0.hyphenated().to_string() }

pub fn decode_id(s: &str) -> Result<EnrollmentId> { Ok(EnrollmentId(Uuid::parse_str(s)?)) }

// ─── Dates ───────────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Nanos, true) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_date(date: NaiveDate) -> String { date.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read directly from a partition table row, in
/// [`COLUMNS`](crate::schema::COLUMNS) order.
pub struct RawEnrollment {
  pub enrollment_id:   String,
  pub tenant_id:       i64,
  pub person_id:       i64,
  pub course_id:       i64,
  pub institution_id:  Option<i64>,
  pub enrollment_date: String,
  pub status:          String,
  pub deleted_at:      Option<String>,
  pub created_at:      String,
}

impl RawEnrollment {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      enrollment_id:   row.get(0)?,
      tenant_id:       row.get(1)?,
      person_id:       row.get(2)?,
      course_id:       row.get(3)?,
      institution_id:  row.get(4)?,
      enrollment_date: row.get(5)?,
      status:          row.get(6)?,
      deleted_at:      row.get(7)?,
      created_at:      row.get(8)?,
    })
  }

  pub fn into_record(self) -> Result<EnrollmentRecord> {
    Ok(EnrollmentRecord {
      id:              decode_id(&self.enrollment_id)?,
      tenant_id:       TenantId(self.tenant_id),
      person_id:       PersonId(self.person_id),
      course_id:       CourseId(self.course_id),
      institution_id:  self.institution_id.map(InstitutionId),
      enrollment_date: decode_date(&self.enrollment_date)?,
      status:          EnrollmentStatus::parse(&self.status)?,
      deleted_at:      self.deleted_at.as_deref().map(decode_dt).transpose()?,
      created_at:      decode_dt(&self.created_at)?,
    })
  }
}

/// Raw strings read directly from a `partitions` row.
pub struct RawPartition {
  pub partition_id: String,
  pub range_start:  String,
  pub range_end:    String,
}

impl RawPartition {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      partition_id: row.get(0)?,
      range_start:  row.get(1)?,
      range_end:    row.get(2)?,
    })
  }

  pub fn into_range(self) -> Result<PartitionRange> {
    Ok(PartitionRange::new(
      PartitionId::new(self.partition_id)?,
      decode_date(&self.range_start)?,
      decode_date(&self.range_end)?,
    )?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn timestamps_sort_as_text() {
    let early = DateTime::parse_from_rfc3339("2025-12-15T09:00:00.5Z").unwrap().with_timezone(&Utc);
    let late = DateTime::parse_from_rfc3339("2025-12-15T09:00:00.123456789Z")
      .unwrap()
      .with_timezone(&Utc);
    assert!(early > late);
    assert!(encode_dt(early) > encode_dt(late));
    assert_eq!(decode_dt(&encode_dt(late)).unwrap(), late);
  }

  #[test]
  fn bad_dates_are_reported() {
    assert!(matches!(decode_date("2025-13-01"), Err(Error::DateParse(_))));
  }
}
