//! Global uniqueness across date partitions.
//!
//! Records are partitioned by enrollment date, but uniqueness is keyed by
//! `(tenant, person, institution)`. A per-partition constraint cannot see
//! across partitions, so the slot index lives here, outside physical
//! partitioning, and every write that touches a key goes through it.
//!
//! Same-key writers are serialised by a striped async lock (stripe chosen by
//! hashing the key), so the engine write and the index update for one key
//! never interleave with another writer of that key, while unrelated keys
//! proceed in parallel. The index's own `claim` is an atomic
//! insert-if-absent.

use std::{
  collections::{HashMap, HashSet, hash_map::Entry},
  sync::Arc,
  time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::MutexGuard;
use xxhash_rust::xxh3::xxh3_64;

use crate::{
  Error, Result,
  engine::{IntoCore as _, Located, ScanFilter, StorageEngine},
  partition::PartitionId,
  record::{EnrollmentId, EnrollmentRecord, EnrollmentStatus, NewEnrollment, UniqueKey},
  router::PartitionRouter,
};

// ─── Policy & outcomes ───────────────────────────────────────────────────────

/// What a soft delete does to the record's uniqueness slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedSlotPolicy {
  /// The slot is freed; the same key may be enrolled again.
  #[default]
  Release,
  /// The deleted record keeps the slot until its partition is retired.
  Retain,
}

/// Result of [`UniquenessEnforcer::try_reactivate_or_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
  /// No record had held the key before.
  Inserted { id: EnrollmentId },
  /// The key's previous holder was soft-deleted; a new record replaces it.
  Reactivated {
    id:       EnrollmentId,
    previous: EnrollmentId,
  },
  /// The key is still held; nothing was written.
  Existing { id: EnrollmentId },
}

impl WriteOutcome {
  pub fn id(&self) -> EnrollmentId {
    match *self {
      Self::Inserted { id } | Self::Reactivated { id, .. } | Self::Existing { id } => id,
    }
  }
}

// ─── Index ───────────────────────────────────────────────────────────────────

/// The record currently occupying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
  pub id:   EnrollmentId,
  /// `false` only under [`DeletedSlotPolicy::Retain`].
  pub live: bool,
}

#[derive(Default)]
struct Slots {
  held:     HashMap<UniqueKey, Holder>,
  /// Most recent holder that gave its slot up by being deleted.
  released: HashMap<UniqueKey, EnrollmentId>,
}

/// Non-partitioned map from unique key to slot holder.
#[derive(Default)]
pub struct UniqueIndex {
  slots: Mutex<Slots>,
}

impl UniqueIndex {
  pub fn new() -> Self { Self::default() }

  /// Take the slot for `key` if it is free.
  ///
  /// On success returns the key's previously released holder, if any; on
  /// failure returns the current holder. Never overwrites.
  pub fn claim(&self, key: UniqueKey, id: EnrollmentId) -> Result<Option<EnrollmentId>, Holder> {
    let mut guard = self.slots.lock();
    let slots = &mut *guard;
    match slots.held.entry(key) {
      Entry::Occupied(holder) => Err(*holder.get()),
      Entry::Vacant(slot) => {
        slot.insert(Holder { id, live: true });
        Ok(slots.released.remove(&key))
      }
    }
  }

  /// Undo a [`claim`](Self::claim) whose write failed.
  pub fn unclaim(&self, key: UniqueKey, id: EnrollmentId, previous: Option<EnrollmentId>) {
    let mut guard = self.slots.lock();
    let slots = &mut *guard;
    if slots.held.get(&key).is_some_and(|h| h.id == id) {
      slots.held.remove(&key);
    }
    if let Some(previous) = previous {
      slots.released.insert(key, previous);
    }
  }

  /// Free the slot held by `id` after its record was soft-deleted.
  pub fn release(&self, key: UniqueKey, id: EnrollmentId) {
    let mut guard = self.slots.lock();
    let slots = &mut *guard;
    if slots.held.get(&key).is_some_and(|h| h.id == id) {
      slots.held.remove(&key);
      slots.released.insert(key, id);
    }
  }

  /// Keep the slot but record that its holder is no longer live.
  pub fn mark_dead(&self, key: UniqueKey, id: EnrollmentId) {
    if let Some(holder) = self.slots.lock().held.get_mut(&key)
      && holder.id == id
    {
      holder.live = false;
    }
  }

  pub fn holder(&self, key: &UniqueKey) -> Option<Holder> {
    self.slots.lock().held.get(key).copied()
  }

  pub fn released(&self, key: &UniqueKey) -> Option<EnrollmentId> {
    self.slots.lock().released.get(key).copied()
  }

  /// Forget records that were physically removed. Returns how many slots
  /// were freed.
  pub fn purge(&self, ids: &HashSet<EnrollmentId>) -> usize {
    let mut guard = self.slots.lock();
    let slots = &mut *guard;
    let before = slots.held.len();
    slots.held.retain(|_, holder| !ids.contains(&holder.id));
    slots.released.retain(|_, id| !ids.contains(id));
    before - slots.held.len()
  }

  pub fn live_count(&self) -> usize {
    self.slots.lock().held.values().filter(|h| h.live).count()
  }

  /// Replace the index contents with what `records` implies under `policy`.
  ///
  /// Two live records sharing a key means the store is already
  /// inconsistent; that is reported as [`Error::Conflict`] and the index is
  /// left empty.
  pub fn rebuild(
    &self,
    records: impl IntoIterator<Item = EnrollmentRecord>,
    policy: DeletedSlotPolicy,
  ) -> Result<()> {
    let (live, mut dead): (Vec<_>, Vec<_>) =
      records.into_iter().partition(EnrollmentRecord::is_live);
    dead.sort_by_key(|r| r.deleted_at);

    let mut fresh = Slots::default();
    for record in live {
      let key = record.key();
      match fresh.held.entry(key) {
        Entry::Occupied(holder) => {
          *self.slots.lock() = Slots::default();
          return Err(Error::Conflict { key, existing: holder.get().id });
        }
        Entry::Vacant(slot) => {
          slot.insert(Holder { id: record.id, live: true });
        }
      }
    }
    for record in dead {
      let key = record.key();
      match policy {
        DeletedSlotPolicy::Release => {
          fresh.released.insert(key, record.id);
        }
        DeletedSlotPolicy::Retain => {
          fresh.held.entry(key).or_insert(Holder { id: record.id, live: false });
        }
      }
    }
    *self.slots.lock() = fresh;
    Ok(())
  }
}

// ─── Lock stripes ────────────────────────────────────────────────────────────

/// Fixed set of async mutexes; a key always maps to the same stripe.
pub struct KeyStripes {
  stripes: Vec<tokio::sync::Mutex<()>>,
  timeout: Duration,
}

impl KeyStripes {
  pub fn new(count: usize, timeout: Duration) -> Self {
    let stripes = (0..count.max(1)).map(|_| tokio::sync::Mutex::new(())).collect();
    Self { stripes, timeout }
  }

  fn stripe_index(&self, key: &UniqueKey) -> usize {
    (xxh3_64(&key.to_bytes()) % self.stripes.len() as u64) as usize
  }

  /// Serialise against every other holder of `key`'s stripe. Gives up with
  /// [`Error::Busy`] after the configured timeout.
  pub async fn lock(&self, key: &UniqueKey) -> Result<MutexGuard<'_, ()>> {
    let stripe = &self.stripes[self.stripe_index(key)];
    tokio::time::timeout(self.timeout, stripe.lock())
      .await
      .map_err(|_| Error::Busy(format!("timed out waiting for key {key}")))
  }
}

// ─── Enforcer ────────────────────────────────────────────────────────────────

/// Guards every write that can change which record holds a key.
pub struct UniquenessEnforcer<E> {
  engine:  Arc<E>,
  router:  PartitionRouter<E>,
  index:   UniqueIndex,
  stripes: KeyStripes,
  policy:  DeletedSlotPolicy,
}

impl<E: StorageEngine> UniquenessEnforcer<E> {
  pub fn new(
    engine: Arc<E>,
    router: PartitionRouter<E>,
    stripes: KeyStripes,
    policy: DeletedSlotPolicy,
  ) -> Self {
    Self { engine, router, index: UniqueIndex::new(), stripes, policy }
  }

  pub fn index(&self) -> &UniqueIndex { &self.index }

  pub fn policy(&self) -> DeletedSlotPolicy { self.policy }

  /// Insert a new record, or fail with [`Error::Conflict`] naming the
  /// record that holds the key.
  pub async fn try_insert(&self, input: NewEnrollment) -> Result<EnrollmentId> {
    let record = EnrollmentRecord::from_new(input, Utc::now());
    let key = record.key();
    let partition = self.router.route_for_write(record.enrollment_date).await?;

    let _guard = self.stripes.lock(&key).await?;
    let previous = self.claim(key, record.id).await?.map_err(|holder| {
      tracing::debug!(%key, existing = %holder.id, live = holder.live, "uniqueness conflict");
      Error::Conflict { key, existing: holder.id }
    })?;
    self.write(&partition, &record, previous).await?;
    Ok(record.id)
  }

  /// Insert unless the key is already held. Never reports a conflict.
  pub async fn try_reactivate_or_insert(&self, input: NewEnrollment) -> Result<WriteOutcome> {
    let record = EnrollmentRecord::from_new(input, Utc::now());
    let key = record.key();
    let partition = self.router.route_for_write(record.enrollment_date).await?;

    let _guard = self.stripes.lock(&key).await?;
    let previous = match self.claim(key, record.id).await? {
      Ok(previous) => previous,
      Err(holder) => return Ok(WriteOutcome::Existing { id: holder.id }),
    };
    self.write(&partition, &record, previous).await?;

    Ok(match previous {
      Some(previous) => {
        tracing::debug!(%key, id = %record.id, %previous, "enrollment reactivated");
        WriteOutcome::Reactivated { id: record.id, previous }
      }
      None => WriteOutcome::Inserted { id: record.id },
    })
  }

  /// Claim `key` for `id`. A dead holder whose record has since been
  /// physically removed is evicted first. Caller holds the key's stripe.
  async fn claim(
    &self,
    key: UniqueKey,
    id: EnrollmentId,
  ) -> Result<Result<Option<EnrollmentId>, Holder>> {
    let holder = match self.index.claim(key, id) {
      Err(holder) if !holder.live => holder,
      claimed => return Ok(claimed),
    };
    if self.engine.locate(holder.id).await.into_core()?.is_some() {
      return Ok(Err(holder));
    }
    tracing::debug!(%key, stale = %holder.id, "evicting removed slot holder");
    self.index.unclaim(key, holder.id, None);
    Ok(self.index.claim(key, id))
  }

  async fn write(
    &self,
    partition: &PartitionId,
    record: &EnrollmentRecord,
    previous: Option<EnrollmentId>,
  ) -> Result<()> {
    if let Err(err) = self.engine.insert(partition, record).await.into_core() {
      self.index.unclaim(record.key(), record.id, previous);
      return Err(err);
    }
    Ok(())
  }

  async fn locate(&self, id: EnrollmentId) -> Result<Located> {
    self
      .engine
      .locate(id)
      .await
      .into_core()?
      .ok_or_else(|| Error::NotFound(id.to_string()))
  }

  /// Soft-delete `id` and update its slot in one step with respect to other
  /// writers of the same key. Deleting an already-deleted record returns it
  /// unchanged.
  pub(crate) async fn delete(&self, id: EnrollmentId, at: DateTime<Utc>) -> Result<EnrollmentRecord> {
    let key = self.locate(id).await?.record.key();
    let _guard = self.stripes.lock(&key).await?;

    // Re-read under the lock; a concurrent delete may have landed.
    let Located { partition, mut record } = self.locate(id).await?;
    if record.deleted_at.is_some() {
      return Ok(record);
    }

    self.engine.mark_deleted(&partition, id, at).await.into_core()?;
    match self.policy {
      DeletedSlotPolicy::Release => self.index.release(key, id),
      DeletedSlotPolicy::Retain => self.index.mark_dead(key, id),
    }
    record.deleted_at = Some(at);
    Ok(record)
  }

  /// Change the status of a live record.
  pub(crate) async fn set_status(
    &self,
    id: EnrollmentId,
    status: EnrollmentStatus,
  ) -> Result<EnrollmentRecord> {
    let key = self.locate(id).await?.record.key();
    let _guard = self.stripes.lock(&key).await?;

    let Located { partition, mut record } = self.locate(id).await?;
    if !record.is_live() {
      return Err(Error::Deleted(id));
    }
    self.engine.set_status(&partition, id, status).await.into_core()?;
    record.status = status;
    Ok(record)
  }

  /// Reload the index from every partition the router knows about.
  pub async fn rebuild(&self) -> Result<usize> {
    let filter = ScanFilter::everything();
    let mut records = Vec::new();
    for range in self.router.route_for_read(None) {
      records.extend(self.engine.scan(&range.id, &filter).await.into_core()?);
    }
    let total = records.len();
    self.index.rebuild(records, self.policy)?;
    tracing::info!(records = total, live = self.index.live_count(), "uniqueness index rebuilt");
    Ok(total)
  }
}
