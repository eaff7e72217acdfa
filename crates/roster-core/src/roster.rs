//! The `Roster` facade: one handle over catalog, router, uniqueness,
//! soft-delete view and lifecycle for a single storage engine.

use std::{collections::HashSet, future::Future, sync::Arc};

use chrono::NaiveDate;
use futures::Stream;

use crate::{
  Error, Result,
  catalog::PartitionCatalog,
  config::RosterConfig,
  engine::{IntoCore as _, StorageEngine},
  lifecycle::{LifecycleManager, RetainNothing, RetentionPolicy},
  partition::{DateRange, PartitionId, PartitionRange},
  record::{EnrollmentId, EnrollmentRecord, EnrollmentStatus, NewEnrollment},
  references::{Reference, ReferenceResolver},
  router::PartitionRouter,
  uniqueness::{KeyStripes, UniquenessEnforcer, WriteOutcome},
  view::{ActiveQuery, SoftDeleteView},
};

/// A partitioned, soft-deleting enrollment store with global uniqueness.
pub struct Roster<E, R> {
  engine:     Arc<E>,
  references: R,
  catalog:    Arc<PartitionCatalog>,
  lifecycle:  Arc<LifecycleManager<E>>,
  router:     PartitionRouter<E>,
  enforcer:   Arc<UniquenessEnforcer<E>>,
  view:       SoftDeleteView<E>,
  config:     RosterConfig,
}

impl<E: StorageEngine, R: ReferenceResolver> Roster<E, R> {
  /// Open a roster over `engine` with the [`RetainNothing`] retention
  /// policy.
  pub async fn open(engine: E, references: R, config: RosterConfig) -> Result<Self> {
    Self::open_with_retention(engine, references, config, RetainNothing).await
  }

  /// Open a roster over `engine`.
  ///
  /// The catalog is restored from the partitions the engine already holds
  /// and the uniqueness index is rebuilt from their records.
  pub async fn open_with_retention(
    engine: E,
    references: R,
    config: RosterConfig,
    retention: impl RetentionPolicy + 'static,
  ) -> Result<Self> {
    let engine = Arc::new(engine);
    let catalog = Arc::new(PartitionCatalog::new());

    let mut existing = engine.list_partitions().await.into_core()?;
    existing.sort_by_key(|range| range.start);
    for range in existing {
      catalog.register(range.id, range.start, range.end)?;
    }

    let lifecycle = Arc::new(
      LifecycleManager::new(engine.clone(), catalog.clone()).with_retention(retention),
    );
    let router = PartitionRouter::new(
      catalog.clone(),
      lifecycle.clone(),
      config.auto_create_partitions,
    );
    let enforcer = Arc::new(UniquenessEnforcer::new(
      engine.clone(),
      router.clone(),
      KeyStripes::new(config.lock_stripes, config.lock_timeout()),
      config.deleted_slot_policy,
    ));
    enforcer.rebuild().await?;
    let view = SoftDeleteView::new(engine.clone(), router.clone(), enforcer.clone());

    tracing::info!(
      partitions = catalog.len(),
      policy = ?config.deleted_slot_policy,
      "roster opened"
    );

    Ok(Self {
      engine,
      references,
      catalog,
      lifecycle,
      router,
      enforcer,
      view,
      config,
    })
  }

  pub fn engine(&self) -> &E { &self.engine }

  pub fn config(&self) -> &RosterConfig { &self.config }

  /// Run `op`, retrying only on [`Error::Busy`] with exponential backoff.
  async fn retry_busy<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let retry = &self.config.retry;
    let mut attempt = 1;
    loop {
      match f().await {
        Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
          let delay = retry.delay_for(attempt);
          tracing::warn!(op, attempt, ?delay, error = %err, "busy; retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        result => return result,
      }
    }
  }

  async fn check_references(&self, input: &NewEnrollment) -> Result<()> {
    for reference in Reference::all_of(input) {
      if !self.references.exists(reference).await? {
        return Err(Error::DanglingReference(reference));
      }
    }
    Ok(())
  }

  // ── Writes ────────────────────────────────────────────────────────────

  /// Insert a new enrollment. Fails with [`Error::Conflict`] if a record
  /// already holds its `(tenant, person, institution)` key.
  pub async fn try_insert(&self, input: NewEnrollment) -> Result<EnrollmentId> {
    self.check_references(&input).await?;
    self
      .retry_busy("try_insert", || self.enforcer.try_insert(input.clone()))
      .await
  }

  /// Insert unless the key is held; reports what happened instead of
  /// failing on a held key.
  pub async fn try_reactivate_or_insert(&self, input: NewEnrollment) -> Result<WriteOutcome> {
    self.check_references(&input).await?;
    self
      .retry_busy("try_reactivate_or_insert", || {
        self.enforcer.try_reactivate_or_insert(input.clone())
      })
      .await
  }

  pub async fn soft_delete(&self, id: EnrollmentId) -> Result<EnrollmentRecord> {
    self.retry_busy("soft_delete", || self.view.soft_delete(id)).await
  }

  /// Change the status of a live enrollment.
  pub async fn set_status(
    &self,
    id: EnrollmentId,
    status: EnrollmentStatus,
  ) -> Result<EnrollmentRecord> {
    self
      .retry_busy("set_status", || self.enforcer.set_status(id, status))
      .await
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Look a record up by id, live or deleted.
  pub async fn get(&self, id: EnrollmentId) -> Result<Option<EnrollmentRecord>> {
    let located = self.engine.locate(id).await.into_core()?;
    Ok(located.map(|l| l.record))
  }

  pub fn query_active(
    &self,
    query: ActiveQuery,
  ) -> impl Stream<Item = Result<EnrollmentRecord>> + Send + '_ {
    self.view.query_active(query)
  }

  pub fn query_all(
    &self,
    query: ActiveQuery,
  ) -> impl Stream<Item = Result<EnrollmentRecord>> + Send + '_ {
    self.view.query_all(query)
  }

  pub fn route_for_read(
    &self,
    window: Option<DateRange>,
  ) -> impl Iterator<Item = PartitionRange> + use<E, R> {
    self.router.route_for_read(window)
  }

  pub fn partitions(&self) -> Vec<PartitionRange> { self.catalog.list() }

  // ── Maintenance ───────────────────────────────────────────────────────

  pub async fn ensure_future_partitions(
    &self,
    reference: NaiveDate,
    horizon_months: u32,
  ) -> Result<Vec<PartitionId>> {
    self
      .lifecycle
      .ensure_future_partitions(reference, horizon_months)
      .await
  }

  /// [`ensure_future_partitions`](Self::ensure_future_partitions) with the
  /// configured horizon.
  pub async fn ensure_horizon(&self, reference: NaiveDate) -> Result<Vec<PartitionId>> {
    self
      .ensure_future_partitions(reference, self.config.future_horizon_months)
      .await
  }

  /// Retire drained partitions ending on or before `cutoff` and forget their
  /// records in the uniqueness index.
  ///
  /// If a write lands in a planned partition after the preflight, the pass
  /// stops there. Partitions dropped before that point are still purged from
  /// the index and are named in [`Error::RetirementInterrupted`].
  pub async fn retire_partitions_older_than(&self, cutoff: NaiveDate) -> Result<Vec<PartitionId>> {
    let report = self.lifecycle.retire_partitions_older_than(cutoff).await?;

    let removed: HashSet<EnrollmentId> = report
      .retired
      .iter()
      .flat_map(|r| r.removed.iter().copied())
      .collect();
    let freed = self.enforcer.index().purge(&removed);
    if freed > 0 {
      tracing::debug!(freed, "retained slots freed by retirement");
    }

    let retired: Vec<PartitionId> = report.retired.into_iter().map(|r| r.range.id).collect();
    match report.blocked {
      None => Ok(retired),
      Some(err) if retired.is_empty() => Err(err),
      Some(err) => Err(Error::RetirementInterrupted { retired, source: Box::new(err) }),
    }
  }
}
