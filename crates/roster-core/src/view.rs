//! Reads that hide soft-deleted records, and the soft delete itself.

use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt as _, TryStreamExt as _, stream};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  engine::{IntoCore as _, ScanFilter, StorageEngine},
  partition::DateRange,
  record::{EnrollmentId, EnrollmentRecord, InstitutionId, TenantId},
  router::PartitionRouter,
  uniqueness::UniquenessEnforcer,
};

/// A tenant-scoped read. Without `dates`, every partition is scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveQuery {
  pub tenant:      TenantId,
  #[serde(default)]
  pub institution: Option<InstitutionId>,
  #[serde(default)]
  pub dates:       Option<DateRange>,
}

impl ActiveQuery {
  pub fn tenant(tenant: TenantId) -> Self {
    Self { tenant, institution: None, dates: None }
  }

  pub fn institution(mut self, institution: InstitutionId) -> Self {
    self.institution = Some(institution);
    self
  }

  pub fn between(mut self, dates: DateRange) -> Self {
    self.dates = Some(dates);
    self
  }

  fn filter(&self, include_deleted: bool) -> ScanFilter {
    ScanFilter {
      tenant: Some(self.tenant),
      institution: self.institution,
      dates: self.dates,
      include_deleted,
    }
  }
}

pub struct SoftDeleteView<E> {
  engine:   Arc<E>,
  router:   PartitionRouter<E>,
  enforcer: Arc<UniquenessEnforcer<E>>,
}

impl<E: StorageEngine> SoftDeleteView<E> {
  pub fn new(
    engine: Arc<E>,
    router: PartitionRouter<E>,
    enforcer: Arc<UniquenessEnforcer<E>>,
  ) -> Self {
    Self { engine, router, enforcer }
  }

  /// Live records matching `query`, in partition order. Partitions are
  /// pruned by the query's date window and scanned one at a time as the
  /// stream is polled.
  pub fn query_active(
    &self,
    query: ActiveQuery,
  ) -> impl Stream<Item = Result<EnrollmentRecord>> + Send + '_ {
    self.scan(query, false)
  }

  /// Like [`query_active`](Self::query_active) but including soft-deleted
  /// records. For audit.
  pub fn query_all(
    &self,
    query: ActiveQuery,
  ) -> impl Stream<Item = Result<EnrollmentRecord>> + Send + '_ {
    self.scan(query, true)
  }

  fn scan(
    &self,
    query: ActiveQuery,
    include_deleted: bool,
  ) -> impl Stream<Item = Result<EnrollmentRecord>> + Send + '_ {
    let filter = query.filter(include_deleted);
    let engine = &self.engine;
    stream::iter(self.router.route_for_read(query.dates))
      .then(move |range| {
        let filter = filter.clone();
        async move { engine.scan(&range.id, &filter).await.into_core() }
      })
      .map_ok(|rows| stream::iter(rows.into_iter().map(Ok::<_, Error>)))
      .try_flatten()
  }

  /// Mark `id` deleted now and release its uniqueness slot per policy.
  ///
  /// Repeating the call returns the record with its original `deleted_at`.
  pub async fn soft_delete(&self, id: EnrollmentId) -> Result<EnrollmentRecord> {
    let at = Utc::now();
    let record = self.enforcer.delete(id, at).await?;
    if record.deleted_at == Some(at) {
      tracing::debug!(%id, key = %record.key(), "enrollment soft-deleted");
    }
    Ok(record)
  }
}
