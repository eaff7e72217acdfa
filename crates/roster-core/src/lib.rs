//! Core of the Roster enrollment store.
//!
//! Enrollment records are range-partitioned by enrollment date into monthly
//! partitions, soft-deleted rather than removed, and kept globally unique on
//! `(tenant, person, institution)` across every partition. Storage backends
//! plug in through [`engine::StorageEngine`]; this crate carries no database
//! dependency of its own.

// We intentionally use native `async fn` in trait impls (stabilised in Rust
// 1.75). Suppress the advisory lint about `Send` bounds on the returned
// futures.
#![allow(async_fn_in_trait)]

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod partition;
pub mod record;
pub mod references;
pub mod roster;
pub mod router;
pub mod uniqueness;
pub mod view;

pub use config::{RetryConfig, RosterConfig};
pub use error::{Error, Result};
pub use record::{
  CourseId, EnrollmentId, EnrollmentRecord, EnrollmentStatus, InstitutionId, NewEnrollment,
  PersonId, TenantId, UniqueKey,
};
pub use roster::Roster;
pub use uniqueness::{DeletedSlotPolicy, WriteOutcome};
pub use view::ActiveQuery;
