//! [`SqliteStore`], the SQLite implementation of [`StorageEngine`].
//!
//! Each partition is its own table. A `partitions` registry records their
//! ranges and an `enrollment_locator` maps ids to partitions. Every
//! multi-statement change runs in one transaction.

use std::{path::Path, time::Duration};

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;

use roster_core::{
  EnrollmentId, EnrollmentRecord, EnrollmentStatus,
  engine::{Located, ScanFilter, StorageEngine},
  partition::{PartitionId, PartitionRange, PartitionSpec, PartitionStats},
};

use crate::{
  Error, Result,
  encode::{RawEnrollment, RawPartition, decode_id, encode_date, encode_dt, encode_id},
  schema::{COLUMNS, SCHEMA, partition_ddl},
};

/// How long SQLite itself waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

fn partition_known(conn: &rusqlite::Connection, partition: &str) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM partitions WHERE partition_id = ?1",
        rusqlite::params![partition],
        |_| Ok(()),
      )
      .optional()?
      .is_some(),
  )
}

enum Dropped {
  Unknown,
  Live(u64),
  Removed(Vec<String>),
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// An enrollment store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store. Useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── StorageEngine impl ──────────────────────────────────────────────────────

impl StorageEngine for SqliteStore {
  type Error = Error;

  // ── Partitions ────────────────────────────────────────────────────────────

  async fn list_partitions(&self) -> Result<Vec<PartitionRange>> {
    let raws: Vec<RawPartition> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT partition_id, range_start, range_end FROM partitions ORDER BY range_start",
        )?;
        let rows = stmt
          .query_map([], RawPartition::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawPartition::into_range).collect()
  }

  async fn create_partition(&self, spec: &PartitionSpec) -> Result<()> {
    let ddl = partition_ddl(spec);
    let name = spec.range.id.to_string();
    let start = encode_date(spec.range.start);
    let end = encode_date(spec.range.end);
    let now = encode_dt(Utc::now());

    let existing: Option<RawPartition> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let existing = tx
          .query_row(
            "SELECT partition_id, range_start, range_end FROM partitions WHERE partition_id = ?1",
            rusqlite::params![name],
            RawPartition::from_row,
          )
          .optional()?;
        if existing.is_none() {
          tx.execute_batch(&ddl)?;
          tx.execute(
            "INSERT INTO partitions (partition_id, range_start, range_end, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![name, start, end, now],
          )?;
        }
        tx.commit()?;
        Ok(existing)
      })
      .await?;

    match existing.map(RawPartition::into_range).transpose()? {
      None => {
        tracing::debug!(partition = %spec.range.id, "partition table created");
        Ok(())
      }
      Some(range) if range.same_bounds(&spec.range) => Ok(()),
      Some(range) => Err(
        roster_core::Error::RangeConflict {
          partition: spec.range.id.clone(),
          start:     spec.range.start,
          end:       spec.range.end,
          existing:  range.id,
        }
        .into(),
      ),
    }
  }

  async fn drop_partition(&self, partition: &PartitionId) -> Result<Vec<EnrollmentId>> {
    let name = partition.to_string();

    let dropped = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if !partition_known(&tx, &name)? {
          return Ok(Dropped::Unknown);
        }

        let live: i64 = tx.query_row(
          &format!("SELECT COUNT(*) FROM \"{name}\" WHERE deleted_at IS NULL"),
          [],
          |row| row.get(0),
        )?;
        if live > 0 {
          // Rolled back on drop.
          return Ok(Dropped::Live(live as u64));
        }

        let ids = {
          let mut stmt = tx.prepare(&format!("SELECT enrollment_id FROM \"{name}\""))?;
          stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?
        };
        tx.execute(
          "DELETE FROM enrollment_locator WHERE partition_id = ?1",
          rusqlite::params![name],
        )?;
        tx.execute(
          "DELETE FROM partitions WHERE partition_id = ?1",
          rusqlite::params![name],
        )?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{name}\";"))?;
        tx.commit()?;
        Ok(Dropped::Removed(ids))
      })
      .await?;

    match dropped {
      Dropped::Unknown => Ok(Vec::new()),
      Dropped::Live(live) => Err(Error::PartitionNotEmpty { partition: partition.clone(), live }),
      Dropped::Removed(ids) => {
        tracing::debug!(%partition, removed = ids.len(), "partition table dropped");
        ids.iter().map(|id| decode_id(id)).collect()
      }
    }
  }

  async fn partition_stats(&self, partition: &PartitionId) -> Result<PartitionStats> {
    let name = partition.to_string();

    let counts: Option<(i64, i64)> = self
      .conn
      .call(move |conn| {
        if !partition_known(conn, &name)? {
          return Ok(None);
        }
        let counts = conn.query_row(
          &format!(
            "SELECT COUNT(*), COALESCE(SUM(deleted_at IS NULL), 0) FROM \"{name}\""
          ),
          [],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(Some(counts))
      })
      .await?;

    let (total, live) = counts.ok_or_else(|| Error::PartitionNotFound(partition.clone()))?;
    Ok(PartitionStats { total: total as u64, live: live as u64 })
  }

  // ── Records ───────────────────────────────────────────────────────────────

  async fn insert(&self, partition: &PartitionId, record: &EnrollmentRecord) -> Result<()> {
    let name = partition.to_string();
    let id_str = encode_id(record.id);
    let tenant = record.tenant_id.0;
    let person = record.person_id.0;
    let course = record.course_id.0;
    let institution = record.institution_id.map(|i| i.0);
    let date_str = encode_date(record.enrollment_date);
    let status = record.status.as_str();
    let deleted_str = record.deleted_at.map(encode_dt);
    let created_str = encode_dt(record.created_at);

    let inserted = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if !partition_known(&tx, &name)? {
          return Ok(false);
        }
        tx.execute(
          &format!("INSERT INTO \"{name}\" ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
          rusqlite::params![
            id_str,
            tenant,
            person,
            course,
            institution,
            date_str,
            status,
            deleted_str,
            created_str,
          ],
        )?;
        tx.execute(
          "INSERT INTO enrollment_locator (enrollment_id, partition_id) VALUES (?1, ?2)",
          rusqlite::params![id_str, name],
        )?;
        tx.commit()?;
        Ok(true)
      })
      .await?;

    if !inserted {
      return Err(Error::PartitionNotFound(partition.clone()));
    }
    Ok(())
  }

  async fn locate(&self, id: EnrollmentId) -> Result<Option<Located>> {
    let id_str = encode_id(id);

    let found: Option<(String, RawEnrollment)> = self
      .conn
      .call(move |conn| {
        let partition: Option<String> = conn
          .query_row(
            "SELECT partition_id FROM enrollment_locator WHERE enrollment_id = ?1",
            rusqlite::params![id_str],
            |row| row.get(0),
          )
          .optional()?;
        let Some(partition) = partition else {
          return Ok(None);
        };
        let raw = conn
          .query_row(
            &format!("SELECT {COLUMNS} FROM \"{partition}\" WHERE enrollment_id = ?1"),
            rusqlite::params![id_str],
            RawEnrollment::from_row,
          )
          .optional()?;
        Ok(raw.map(|raw| (partition, raw)))
      })
      .await?;

    found
      .map(|(partition, raw)| {
        Ok::<_, Error>(Located {
          partition: PartitionId::new(partition)?,
          record:    raw.into_record()?,
        })
      })
      .transpose()
  }

  async fn mark_deleted(
    &self,
    partition: &PartitionId,
    id: EnrollmentId,
    at: DateTime<Utc>,
  ) -> Result<()> {
    let name = partition.to_string();
    let id_str = encode_id(id);
    let at_str = encode_dt(at);

    // Only the first delete sets the timestamp.
    let sql = format!(
      "UPDATE \"{name}\" SET deleted_at = COALESCE(deleted_at, ?2) WHERE enrollment_id = ?1"
    );
    self.update(partition, id, sql, rusqlite::params_from_iter([id_str, at_str])).await
  }

  async fn set_status(
    &self,
    partition: &PartitionId,
    id: EnrollmentId,
    status: EnrollmentStatus,
  ) -> Result<()> {
    let name = partition.to_string();
    let id_str = encode_id(id);

    let sql = format!("UPDATE \"{name}\" SET status = ?2 WHERE enrollment_id = ?1");
    let params = [id_str, status.as_str().to_owned()];
    self.update(partition, id, sql, rusqlite::params_from_iter(params)).await
  }

  async fn scan(
    &self,
    partition: &PartitionId,
    filter: &ScanFilter,
  ) -> Result<Vec<EnrollmentRecord>> {
    let name = partition.to_string();
    let tenant = filter.tenant.map(|t| t.0);
    let institution = filter.institution.map(|i| i.0);
    let from = filter.dates.map(|d| encode_date(d.start));
    let until = filter.dates.map(|d| encode_date(d.end));
    let include_deleted = filter.include_deleted;

    let raws: Option<Vec<RawEnrollment>> = self
      .conn
      .call(move |conn| {
        if !partition_known(conn, &name)? {
          return Ok(None);
        }
        let mut stmt = conn.prepare(&format!(
          "SELECT {COLUMNS} FROM \"{name}\"
           WHERE (?1 IS NULL OR tenant_id = ?1)
             AND (?2 IS NULL OR institution_id = ?2)
             AND (?3 IS NULL OR enrollment_date >= ?3)
             AND (?4 IS NULL OR enrollment_date < ?4)
             AND (?5 OR deleted_at IS NULL)
           ORDER BY enrollment_date, created_at"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![tenant, institution, from, until, include_deleted],
            RawEnrollment::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(rows))
      })
      .await?;

    raws
      .ok_or_else(|| Error::PartitionNotFound(partition.clone()))?
      .into_iter()
      .map(RawEnrollment::into_record)
      .collect()
  }
}

impl SqliteStore {
  /// Run a single-row `UPDATE` against `partition`, distinguishing an
  /// unknown partition from an unknown record.
  async fn update<P>(
    &self,
    partition: &PartitionId,
    id: EnrollmentId,
    sql: String,
    params: P,
  ) -> Result<()>
  where
    P: rusqlite::Params + Send + 'static,
  {
    let name = partition.to_string();

    let changed: Option<usize> = self
      .conn
      .call(move |conn| {
        if !partition_known(conn, &name)? {
          return Ok(None);
        }
        Ok(Some(conn.execute(&sql, params)?))
      })
      .await?;

    match changed {
      None => Err(Error::PartitionNotFound(partition.clone())),
      Some(0) => Err(Error::EnrollmentNotFound(id)),
      Some(_) => Ok(()),
    }
  }
}
