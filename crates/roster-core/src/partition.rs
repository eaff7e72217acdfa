//! Partition identity, calendar months, and date ranges.
//!
//! All ranges are half-open: `[start, end)`.

use std::fmt;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name of the logical parent table; partition ids are derived from it.
pub const PARENT_TABLE: &str = "enrollments";

// ─── PartitionId ─────────────────────────────────────────────────────────────

/// Name of a physical partition object.
///
/// Engines use this verbatim as an object name, so only lowercase ASCII
/// letters, digits and `_` are accepted, starting with a letter.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionId(String);

impl PartitionId {
  pub fn new(name: impl Into<String>) -> Result<Self> {
    let name = name.into();
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
      && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
      && name.len() <= 63;
    if valid {
      Ok(Self(name))
    } else {
      Err(Error::InvalidPartitionName(name))
    }
  }

  /// Deterministic id for the partition that starts at `month`.
  pub fn for_month(month: Month) -> Result<Self> {
    Self::new(format!(
      "{PARENT_TABLE}_p{:04}_{:02}",
      month.year(),
      month.month()
    ))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for PartitionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl TryFrom<String> for PartitionId {
  type Error = Error;

  fn try_from(value: String) -> Result<Self> { Self::new(value) }
}

impl From<PartitionId> for String {
  fn from(id: PartitionId) -> Self { id.0 }
}

// ─── Month ───────────────────────────────────────────────────────────────────

/// A calendar month, represented by its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month(NaiveDate);

impl Month {
  /// The month containing `date`.
  pub fn containing(date: NaiveDate) -> Self {
    // Day 1 exists in every month chrono can represent.
    Self(date - chrono::Days::new(u64::from(date.day0())))
  }

  pub fn year(&self) -> i32 { self.0.year() }

  pub fn month(&self) -> u32 { self.0.month() }

  pub fn first_day(&self) -> NaiveDate { self.0 }

  /// The month `n` months later, or `None` past chrono's supported range.
  pub fn plus(&self, n: u32) -> Option<Self> {
    self.0.checked_add_months(Months::new(n)).map(Self)
  }

  /// The range this month covers as a partition. Only four-digit years
  /// have a partition.
  pub fn range(&self) -> Result<PartitionRange> {
    let invalid = Error::InvalidRange { start: self.0, end: self.0 };
    if !(0..=9999).contains(&self.year()) {
      return Err(invalid);
    }
    let end = self.plus(1).ok_or(invalid)?;
    PartitionRange::new(PartitionId::for_month(*self)?, self.0, end.0)
  }
}

impl fmt::Display for Month {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:04}-{:02}", self.year(), self.month())
  }
}

// ─── Ranges ──────────────────────────────────────────────────────────────────

/// A query window over enrollment dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
  pub start: NaiveDate,
  pub end:   NaiveDate,
}

impl DateRange {
  pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
    if start >= end {
      return Err(Error::InvalidRange { start, end });
    }
    Ok(Self { start, end })
  }

  pub fn contains(&self, date: NaiveDate) -> bool {
    self.start <= date && date < self.end
  }
}

/// The date range owned by one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
  pub id:    PartitionId,
  pub start: NaiveDate,
  pub end:   NaiveDate,
}

impl PartitionRange {
  pub fn new(id: PartitionId, start: NaiveDate, end: NaiveDate) -> Result<Self> {
    if start >= end {
      return Err(Error::InvalidRange { start, end });
    }
    Ok(Self { id, start, end })
  }

  pub fn contains(&self, date: NaiveDate) -> bool {
    self.start <= date && date < self.end
  }

  pub fn overlaps(&self, window: &DateRange) -> bool {
    self.start < window.end && window.start < self.end
  }

  pub fn same_bounds(&self, other: &Self) -> bool {
    self.start == other.start && self.end == other.end
  }
}

// ─── Provisioning ────────────────────────────────────────────────────────────

/// An index every partition carries. Engines do not propagate indexes from
/// the parent, so each partition gets its own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
  pub name:      String,
  pub columns:   Vec<&'static str>,
  /// Restrict the index to rows with no `deleted_at`.
  pub live_only: bool,
}

impl IndexSpec {
  /// The parent table's index set, cloned for `partition`.
  pub fn parent_set(partition: &PartitionId) -> Vec<Self> {
    vec![
      Self {
        name:      format!("{partition}_tenant_inst_date_status_idx"),
        columns:   vec![
          "tenant_id",
          "institution_id",
          "enrollment_date",
          "status",
        ],
        live_only: false,
      },
      Self {
        name:      format!("{partition}_person_idx"),
        columns:   vec!["person_id"],
        live_only: false,
      },
      Self {
        name:      format!("{partition}_active_idx"),
        columns:   vec!["tenant_id", "enrollment_date"],
        live_only: true,
      },
    ]
  }
}

/// Everything an engine needs to materialise a partition object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
  pub range:   PartitionRange,
  pub indexes: Vec<IndexSpec>,
}

impl PartitionSpec {
  pub fn new(range: PartitionRange) -> Self {
    let indexes = IndexSpec::parent_set(&range.id);
    Self { range, indexes }
  }
}

/// Record counts for one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
  pub total: u64,
  pub live:  u64,
}

impl PartitionStats {
  pub fn deleted(&self) -> u64 { self.total - self.live }
}
