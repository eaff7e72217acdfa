//! Foreign-key existence checks against entities this crate does not own.

use std::{collections::HashSet, fmt, future::Future};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
  Result,
  record::{CourseId, InstitutionId, NewEnrollment, PersonId, TenantId},
};

/// A reference from an enrollment to an external entity. Everything except
/// the tenant itself is tenant-scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reference {
  Tenant { tenant: TenantId },
  Person { tenant: TenantId, person: PersonId },
  Institution { tenant: TenantId, institution: InstitutionId },
  Course { tenant: TenantId, course: CourseId },
}

impl Reference {
  /// Every reference an enrollment carries, tenant first.
  pub fn all_of(input: &NewEnrollment) -> Vec<Self> {
    let tenant = input.tenant_id;
    let mut refs = vec![
      Self::Tenant { tenant },
      Self::Person { tenant, person: input.person_id },
      Self::Course { tenant, course: input.course_id },
    ];
    if let Some(institution) = input.institution_id {
      refs.push(Self::Institution { tenant, institution });
    }
    refs
  }
}

impl fmt::Display for Reference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Tenant { tenant } => write!(f, "{tenant}"),
      Self::Person { tenant, person } => write!(f, "{person} in {tenant}"),
      Self::Institution { tenant, institution } => {
        write!(f, "{institution} in {tenant}")
      }
      Self::Course { tenant, course } => write!(f, "{course} in {tenant}"),
    }
  }
}

/// Resolves whether a referenced entity exists.
pub trait ReferenceResolver: Send + Sync {
  fn exists(
    &self,
    reference: Reference,
  ) -> impl Future<Output = Result<bool>> + Send + '_;
}

/// Accepts every reference. For deployments where integrity is enforced
/// elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ReferenceResolver for AllowAll {
  async fn exists(&self, _reference: Reference) -> Result<bool> { Ok(true) }
}

/// An in-process registry of known entities.
#[derive(Debug, Default)]
pub struct MemoryReferences {
  known: RwLock<HashSet<Reference>>,
}

impl MemoryReferences {
  pub fn new() -> Self { Self::default() }

  pub fn insert(&self, reference: Reference) {
    self.known.write().insert(reference);
  }

  pub fn remove(&self, reference: &Reference) -> bool {
    self.known.write().remove(reference)
  }

  /// Register a tenant along with the given people, institutions and
  /// courses inside it.
  pub fn register_tenant(
    &self,
    tenant: TenantId,
    people: impl IntoIterator<Item = PersonId>,
    institutions: impl IntoIterator<Item = InstitutionId>,
    courses: impl IntoIterator<Item = CourseId>,
  ) {
    let mut known = self.known.write();
    known.insert(Reference::Tenant { tenant });
    known.extend(people.into_iter().map(|person| Reference::Person { tenant, person }));
    known.extend(
      institutions
        .into_iter()
        .map(|institution| Reference::Institution { tenant, institution }),
    );
    known.extend(courses.into_iter().map(|course| Reference::Course { tenant, course }));
  }
}

impl ReferenceResolver for MemoryReferences {
  async fn exists(&self, reference: Reference) -> Result<bool> {
    Ok(self.known.read().contains(&reference))
  }
}

impl<R: ReferenceResolver> ReferenceResolver for std::sync::Arc<R> {
  fn exists(
    &self,
    reference: Reference,
  ) -> impl Future<Output = Result<bool>> + Send + '_ {
    (**self).exists(reference)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn institution_reference_only_when_present() {
    let date = chrono::NaiveDate::from_ymd_opt(2025, 12, 15).unwrap();
    let input = NewEnrollment::new(TenantId(1), PersonId(7), CourseId(2), date);
    assert_eq!(Reference::all_of(&input).len(), 3);
    let input = input.with_institution(InstitutionId(3));
    assert!(Reference::all_of(&input).contains(&Reference::Institution {
      tenant:      TenantId(1),
      institution: InstitutionId(3),
    }));
  }

  #[tokio::test]
  async fn references_are_tenant_scoped() {
    let refs = MemoryReferences::new();
    refs.register_tenant(TenantId(1), [PersonId(7)], [], [CourseId(2)]);

    let same = Reference::Person { tenant: TenantId(1), person: PersonId(7) };
    let other = Reference::Person { tenant: TenantId(2), person: PersonId(7) };
    assert!(refs.exists(same).await.unwrap());
    assert!(!refs.exists(other).await.unwrap());
  }
}
