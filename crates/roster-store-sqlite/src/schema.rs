//! SQL schema for the Roster SQLite store.
//!
//! The fixed tables are created once at connection startup. Each date
//! partition is its own table, created on demand from [`partition_ddl`].

use roster_core::{EnrollmentStatus, partition::PartitionSpec};
use strum::IntoEnumIterator as _;

use crate::encode::encode_date;

/// Registry and locator DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per partition table. Source of truth for the catalog on open.
CREATE TABLE IF NOT EXISTS partitions (
    partition_id TEXT PRIMARY KEY,
    range_start  TEXT NOT NULL UNIQUE,   -- inclusive, YYYY-MM-DD
    range_end    TEXT NOT NULL,          -- exclusive
    created_at   TEXT NOT NULL,
    CHECK (range_start < range_end)
);

-- Which partition holds each enrollment; lets lookups by id skip a scan.
CREATE TABLE IF NOT EXISTS enrollment_locator (
    enrollment_id TEXT PRIMARY KEY,
    partition_id  TEXT NOT NULL REFERENCES partitions(partition_id)
);

CREATE INDEX IF NOT EXISTS enrollment_locator_partition_idx
    ON enrollment_locator(partition_id);

PRAGMA user_version = 1;
";

/// Columns of every partition table, in row-decoding order.
pub const COLUMNS: &str = "enrollment_id, tenant_id, person_id, course_id, institution_id, \
                           enrollment_date, status, deleted_at, created_at";

/// DDL for one partition table and its cloned index set.
///
/// Partition and index names are validated identifiers, so interpolating
/// them is safe.
pub fn partition_ddl(spec: &PartitionSpec) -> String {
  let table = spec.range.id.as_str();
  let statuses = EnrollmentStatus::iter()
    .map(|s| format!("'{}'", s.as_str()))
    .collect::<Vec<_>>()
    .join(", ");

  let mut ddl = format!(
    "CREATE TABLE IF NOT EXISTS \"{table}\" (
    enrollment_id   TEXT PRIMARY KEY,
    tenant_id       INTEGER NOT NULL,
    person_id       INTEGER NOT NULL,
    course_id       INTEGER NOT NULL,
    institution_id  INTEGER,
    enrollment_date TEXT NOT NULL,
    status          TEXT NOT NULL,
    deleted_at      TEXT,
    created_at      TEXT NOT NULL,
    CHECK (enrollment_date >= '{start}' AND enrollment_date < '{end}'),
    CHECK (status IN ({statuses}))
);
",
    start = encode_date(spec.range.start),
    end = encode_date(spec.range.end),
  );

  for index in &spec.indexes {
    let filter = if index.live_only { " WHERE deleted_at IS NULL" } else { "" };
    ddl.push_str(&format!(
      "CREATE INDEX IF NOT EXISTS \"{name}\" ON \"{table}\" ({columns}){filter};\n",
      name = index.name,
      columns = index.columns.join(", "),
    ));
  }
  ddl
}
