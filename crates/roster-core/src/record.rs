//! Enrollment records, the unit of storage.
//!
//! A record is written once. Only two fields ever change afterwards:
//! `status` (caller-driven) and `deleted_at` (set once, never cleared).
//! Re-enrolling after a soft delete writes a new record so the old one stays
//! intact for audit.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Identifiers ─────────────────────────────────────────────────────────────

macro_rules! integer_id {
  ($(#[$meta:meta])* $name:ident, $label:literal) => {
    $(#[$meta])*
    #[derive(
      Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
      Deserialize,
    )]
    #[serde(transparent)]
    pub struct $name(pub i64);

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, concat!($label, " {}"), self.0)
      }
    }
  };
}

integer_id!(
  /// Isolation boundary. Every other entity belongs to exactly one tenant.
  TenantId,
  "tenant"
);
integer_id!(PersonId, "person");
integer_id!(InstitutionId, "institution");
integer_id!(CourseId, "course");

/// Store-assigned identity of an enrollment record.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
  Deserialize,
)]
#[serde(transparent)]
pub struct EnrollmentId(pub Uuid);

impl EnrollmentId {
  pub fn new_v4() -> Self { Self(Uuid::new_v4()) }
}

impl fmt::Display for EnrollmentId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "enrollment {}", self.0)
  }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// The four accepted enrollment states. Transitions between them are up to
/// the caller.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Default,
  Serialize,
  Deserialize,
  strum::AsRefStr,
  strum::Display,
  strum::EnumIter,
  strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EnrollmentStatus {
  #[default]
  Pending,
  Active,
  Completed,
  Cancelled,
}

impl EnrollmentStatus {
  /// Parse the stored lowercase form, rejecting anything outside the four
  /// known states.
  pub fn parse(s: &str) -> Result<Self> {
    s.parse().map_err(|_| Error::UnknownStatus(s.to_owned()))
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Active => "active",
      Self::Completed => "completed",
      Self::Cancelled => "cancelled",
    }
  }
}

// ─── Uniqueness key ──────────────────────────────────────────────────────────

/// An institution id with absence collapsed to a single comparable value.
///
/// Two records without an institution compare equal here, unlike SQL `NULL`.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
  Deserialize,
)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CanonicalInstitution {
  Absent,
  Id(InstitutionId),
}

impl From<Option<InstitutionId>> for CanonicalInstitution {
  fn from(id: Option<InstitutionId>) -> Self {
    id.map_or(Self::Absent, Self::Id)
  }
}

/// The composite key on which at most one record may hold the slot.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
  Deserialize,
)]
pub struct UniqueKey {
  pub tenant:      TenantId,
  pub person:      PersonId,
  pub institution: CanonicalInstitution,
}

impl UniqueKey {
  pub fn new(
    tenant: TenantId,
    person: PersonId,
    institution: Option<InstitutionId>,
  ) -> Self {
    Self { tenant, person, institution: institution.into() }
  }

  /// Fixed-width encoding used for lock striping.
  pub fn to_bytes(&self) -> [u8; 25] {
    let mut buf = [0u8; 25];
    buf[..8].copy_from_slice(&self.tenant.0.to_be_bytes());
    buf[8..16].copy_from_slice(&self.person.0.to_be_bytes());
    if let CanonicalInstitution::Id(id) = self.institution {
      buf[16] = 1;
      buf[17..].copy_from_slice(&id.0.to_be_bytes());
    }
    buf
  }
}

impl fmt::Display for UniqueKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.institution {
      CanonicalInstitution::Absent => {
        write!(f, "({} / {} / no institution)", self.tenant, self.person)
      }
      CanonicalInstitution::Id(id) => {
        write!(f, "({} / {} / {id})", self.tenant, self.person)
      }
    }
  }
}

// ─── Record ──────────────────────────────────────────────────────────────────

/// A stored enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
  pub id:              EnrollmentId,
  pub tenant_id:       TenantId,
  pub person_id:       PersonId,
  pub course_id:       CourseId,
  pub institution_id:  Option<InstitutionId>,
  /// Partitioning key; fixed for the life of the record.
  pub enrollment_date: NaiveDate,
  pub status:          EnrollmentStatus,
  pub deleted_at:      Option<DateTime<Utc>>,
  pub created_at:      DateTime<Utc>,
}

impl EnrollmentRecord {
  /// Build a fresh live record from writer input, assigning identity and
  /// creation time.
  pub fn from_new(input: NewEnrollment, now: DateTime<Utc>) -> Self {
    Self {
      id:              EnrollmentId::new_v4(),
      tenant_id:       input.tenant_id,
      person_id:       input.person_id,
      course_id:       input.course_id,
      institution_id:  input.institution_id,
      enrollment_date: input.enrollment_date,
      status:          input.status,
      deleted_at:      None,
      created_at:      now,
    }
  }

  pub fn key(&self) -> UniqueKey {
    UniqueKey::new(self.tenant_id, self.person_id, self.institution_id)
  }

  pub fn is_live(&self) -> bool { self.deleted_at.is_none() }
}

// ─── NewEnrollment ───────────────────────────────────────────────────────────

/// Writer input. Identity, `created_at` and `deleted_at` are always set by
/// the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEnrollment {
  pub tenant_id:       TenantId,
  pub person_id:       PersonId,
  pub course_id:       CourseId,
  #[serde(default)]
  pub institution_id:  Option<InstitutionId>,
  pub enrollment_date: NaiveDate,
  #[serde(default)]
  pub status:          EnrollmentStatus,
}

impl NewEnrollment {
  /// Convenience constructor: no institution, `pending` status.
  pub fn new(
    tenant_id: TenantId,
    person_id: PersonId,
    course_id: CourseId,
    enrollment_date: NaiveDate,
  ) -> Self {
    Self {
      tenant_id,
      person_id,
      course_id,
      institution_id: None,
      enrollment_date,
      status: EnrollmentStatus::default(),
    }
  }

  pub fn with_institution(mut self, institution: InstitutionId) -> Self {
    self.institution_id = Some(institution);
    self
  }

  pub fn with_status(mut self, status: EnrollmentStatus) -> Self {
    self.status = status;
    self
  }

  pub fn key(&self) -> UniqueKey {
    UniqueKey::new(self.tenant_id, self.person_id, self.institution_id)
  }
}
