//! The partition catalog: the single source of truth for routing.
//!
//! Ranges are kept in an ordered map keyed by range start. Because ranges
//! never overlap, their ends are ordered the same way as their starts, which
//! lets both point lookups and window scans start from a single `O(log n)`
//! lookup.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use parking_lot::RwLock;

use crate::{
  Error, Result,
  partition::{DateRange, PartitionId, PartitionRange},
};

/// Caller's assertion about a partition's contents at retirement time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireConfirmation {
  pub live_records: u64,
}

impl RetireConfirmation {
  pub fn drained() -> Self { Self { live_records: 0 } }
}

#[derive(Default)]
struct Ranges {
  by_start: BTreeMap<NaiveDate, PartitionRange>,
  by_id:    HashMap<PartitionId, NaiveDate>,
}

impl Ranges {
  /// The partition whose range contains `date`.
  fn covering(&self, date: NaiveDate) -> Option<&PartitionRange> {
    self
      .by_start
      .range(..=date)
      .next_back()
      .map(|(_, range)| range)
      .filter(|range| range.contains(date))
  }

  /// Any partition overlapping `[start, end)`.
  fn first_overlap(&self, start: NaiveDate, end: NaiveDate) -> Option<&PartitionRange> {
    let window = DateRange { start, end };
    self.covering(start).or_else(|| {
      self
        .by_start
        .range(start..end)
        .next()
        .map(|(_, range)| range)
        .filter(|range| range.overlaps(&window))
    })
  }
}

/// Tracks every registered range partition.
#[derive(Default)]
pub struct PartitionCatalog {
  ranges: RwLock<Ranges>,
}

impl PartitionCatalog {
  pub fn new() -> Self { Self::default() }

  /// The partition that owns `date`, if any.
  pub fn resolve(&self, date: NaiveDate) -> Option<PartitionId> {
    self.ranges.read().covering(date).map(|range| range.id.clone())
  }

  pub fn get(&self, id: &PartitionId) -> Option<PartitionRange> {
    let ranges = self.ranges.read();
    let start = ranges.by_id.get(id)?;
    ranges.by_start.get(start).cloned()
  }

  /// Publish a partition.
  ///
  /// Fails with [`Error::AlreadyExists`] when exactly this partition is
  /// already present, and with [`Error::RangeConflict`] when the id or any
  /// part of the range is taken by a different definition.
  pub fn register(&self, id: PartitionId, start: NaiveDate, end: NaiveDate) -> Result<()> {
    let range = PartitionRange::new(id, start, end)?;
    let mut ranges = self.ranges.write();

    if let Some(existing_start) = ranges.by_id.get(&range.id) {
      let existing = &ranges.by_start[existing_start];
      if existing.same_bounds(&range) {
        return Err(Error::AlreadyExists(range.id));
      }
      return Err(Error::RangeConflict {
        partition: range.id.clone(),
        start,
        end,
        existing: existing.id.clone(),
      });
    }
    if let Some(existing) = ranges.first_overlap(start, end) {
      return Err(Error::RangeConflict {
        partition: range.id,
        start,
        end,
        existing: existing.id.clone(),
      });
    }

    ranges.by_id.insert(range.id.clone(), start);
    ranges.by_start.insert(start, range);
    Ok(())
  }

  /// All partitions, ascending by start date.
  pub fn list(&self) -> Vec<PartitionRange> {
    self.ranges.read().by_start.values().cloned().collect()
  }

  /// Partitions overlapping `window`, ascending.
  pub fn overlapping(&self, window: &DateRange) -> Vec<PartitionRange> {
    let ranges = self.ranges.read();
    let mut hits: Vec<PartitionRange> = ranges
      .by_start
      .range(..window.end)
      .rev()
      .map(|(_, range)| range)
      .take_while(|range| range.end > window.start)
      .cloned()
      .collect();
    hits.reverse();
    hits
  }

  /// Unpublish a partition. The caller must have drained it first.
  pub fn retire(
    &self,
    id: &PartitionId,
    confirmation: RetireConfirmation,
  ) -> Result<PartitionRange> {
    if confirmation.live_records > 0 {
      return Err(Error::NotEmpty {
        partition: id.clone(),
        live:      confirmation.live_records,
      });
    }
    let mut ranges = self.ranges.write();
    let start = ranges
      .by_id
      .remove(id)
      .ok_or_else(|| Error::NotFound(format!("partition {id}")))?;
    ranges
      .by_start
      .remove(&start)
      .ok_or_else(|| Error::NotFound(format!("partition {id}")))
  }

  pub fn len(&self) -> usize { self.ranges.read().by_start.len() }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  fn id(name: &str) -> PartitionId { PartitionId::new(name).unwrap() }

  fn catalog_with_quarters() -> PartitionCatalog {
    let catalog = PartitionCatalog::new();
    catalog.register(id("q1"), date(2025, 1, 1), date(2025, 4, 1)).unwrap();
    catalog.register(id("q2"), date(2025, 4, 1), date(2025, 7, 1)).unwrap();
    // Gap for Q3.
    catalog.register(id("q4"), date(2025, 10, 1), date(2026, 1, 1)).unwrap();
    catalog
  }

  #[test]
  fn resolve_respects_half_open_bounds() {
    let catalog = catalog_with_quarters();
    assert_eq!(catalog.resolve(date(2025, 1, 1)), Some(id("q1")));
    assert_eq!(catalog.resolve(date(2025, 3, 31)), Some(id("q1")));
    assert_eq!(catalog.resolve(date(2025, 4, 1)), Some(id("q2")));
    assert_eq!(catalog.resolve(date(2025, 8, 15)), None);
    assert_eq!(catalog.resolve(date(2024, 12, 31)), None);
    assert_eq!(catalog.resolve(date(2026, 1, 1)), None);
  }

  #[test]
  fn register_rejects_overlaps() {
    let catalog = catalog_with_quarters();
    // Straddles the end of q2.
    let err = catalog
      .register(id("mid"), date(2025, 6, 1), date(2025, 8, 1))
      .unwrap_err();
    assert!(matches!(err, Error::RangeConflict { existing, .. } if existing == id("q2")));

    // Swallows q4 entirely.
    let err = catalog
      .register(id("wide"), date(2025, 9, 1), date(2026, 2, 1))
      .unwrap_err();
    assert!(matches!(err, Error::RangeConflict { existing, .. } if existing == id("q4")));

    // Fits the gap exactly.
    catalog.register(id("q3"), date(2025, 7, 1), date(2025, 10, 1)).unwrap();
    assert_eq!(catalog.len(), 4);
  }

  #[test]
  fn register_distinguishes_repeat_from_conflict() {
    let catalog = catalog_with_quarters();
    let err = catalog
      .register(id("q1"), date(2025, 1, 1), date(2025, 4, 1))
      .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(p) if p == id("q1")));

    let err = catalog
      .register(id("q1"), date(2027, 1, 1), date(2027, 4, 1))
      .unwrap_err();
    assert!(matches!(err, Error::RangeConflict { .. }));
  }

  #[test]
  fn list_is_ascending() {
    let catalog = PartitionCatalog::new();
    catalog.register(id("late"), date(2026, 1, 1), date(2026, 2, 1)).unwrap();
    catalog.register(id("early"), date(2025, 1, 1), date(2025, 2, 1)).unwrap();
    let names: Vec<_> = catalog.list().into_iter().map(|r| r.id).collect();
    assert_eq!(names, vec![id("early"), id("late")]);
  }

  #[test]
  fn overlapping_prunes_outside_partitions() {
    let catalog = catalog_with_quarters();
    let window = DateRange::new(date(2025, 3, 15), date(2025, 4, 2)).unwrap();
    let hits: Vec<_> = catalog.overlapping(&window).into_iter().map(|r| r.id).collect();
    assert_eq!(hits, vec![id("q1"), id("q2")]);

    let gap = DateRange::new(date(2025, 7, 1), date(2025, 10, 1)).unwrap();
    assert!(catalog.overlapping(&gap).is_empty());

    let edge = DateRange::new(date(2025, 7, 1), date(2025, 10, 2)).unwrap();
    let hits: Vec<_> = catalog.overlapping(&edge).into_iter().map(|r| r.id).collect();
    assert_eq!(hits, vec![id("q4")]);
  }

  #[test]
  fn retire_requires_drained_partition() {
    let catalog = catalog_with_quarters();
    let err = catalog
      .retire(&id("q1"), RetireConfirmation { live_records: 2 })
      .unwrap_err();
    assert!(matches!(err, Error::NotEmpty { live: 2, .. }));
    assert_eq!(catalog.resolve(date(2025, 2, 1)), Some(id("q1")));

    let retired = catalog.retire(&id("q1"), RetireConfirmation::drained()).unwrap();
    assert_eq!(retired.start, date(2025, 1, 1));
    assert_eq!(catalog.resolve(date(2025, 2, 1)), None);
    assert!(matches!(
      catalog.retire(&id("q1"), RetireConfirmation::drained()),
      Err(Error::NotFound(_))
    ));
  }
}
