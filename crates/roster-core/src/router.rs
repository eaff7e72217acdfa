//! Maps enrollment dates to partitions.

use std::sync::Arc;

use chrono::NaiveDate;

use crate::{
  Error, Result,
  catalog::PartitionCatalog,
  engine::StorageEngine,
  lifecycle::LifecycleManager,
  partition::{DateRange, Month, PartitionId, PartitionRange},
};

/// Resolves write targets (creating partitions on demand) and prunes reads.
pub struct PartitionRouter<E> {
  catalog:     Arc<PartitionCatalog>,
  lifecycle:   Arc<LifecycleManager<E>>,
  auto_create: bool,
}

impl<E> Clone for PartitionRouter<E> {
  fn clone(&self) -> Self {
    Self {
      catalog:     self.catalog.clone(),
      lifecycle:   self.lifecycle.clone(),
      auto_create: self.auto_create,
    }
  }
}

impl<E: StorageEngine> PartitionRouter<E> {
  pub fn new(
    catalog: Arc<PartitionCatalog>,
    lifecycle: Arc<LifecycleManager<E>>,
    auto_create: bool,
  ) -> Self {
    Self { catalog, lifecycle, auto_create }
  }

  /// The partition a record dated `date` must be written to.
  ///
  /// With auto-creation enabled, a missing month is created (once, however
  /// many callers race for it); otherwise the call fails with
  /// [`Error::NoPartitionForDate`].
  pub async fn route_for_write(&self, date: NaiveDate) -> Result<PartitionId> {
    if let Some(id) = self.catalog.resolve(date) {
      return Ok(id);
    }
    if !self.auto_create {
      return Err(Error::NoPartitionForDate(date));
    }
    let ensured = self.lifecycle.ensure_month(Month::containing(date)).await?;
    Ok(ensured.id)
  }

  /// Partitions that may hold records in `window`, ascending by date. With
  /// no window, every partition.
  pub fn route_for_read(
    &self,
    window: Option<DateRange>,
  ) -> impl Iterator<Item = PartitionRange> + use<E> {
    let ranges = match window {
      Some(window) => self.catalog.overlapping(&window),
      None => self.catalog.list(),
    };
    ranges.into_iter()
  }
}
