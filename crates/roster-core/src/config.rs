//! Runtime knobs for a [`Roster`](crate::roster::Roster).
//!
//! Every field has a default, so an empty config file (or none at all)
//! yields a working store.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::uniqueness::DeletedSlotPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
  /// Create the covering monthly partition when a write finds none.
  pub auto_create_partitions: bool,
  pub deleted_slot_policy:    DeletedSlotPolicy,
  /// Number of per-key lock stripes.
  pub lock_stripes:           usize,
  /// How long a writer waits for its key's stripe before giving up as busy.
  pub lock_timeout_ms:        u64,
  pub retry:                  RetryConfig,
  /// Months covered by [`Roster::ensure_horizon`](crate::roster::Roster::ensure_horizon).
  pub future_horizon_months:  u32,
}

impl Default for RosterConfig {
  fn default() -> Self {
    Self {
      auto_create_partitions: true,
      deleted_slot_policy:    DeletedSlotPolicy::default(),
      lock_stripes:           64,
      lock_timeout_ms:        5_000,
      retry:                  RetryConfig::default(),
      future_horizon_months:  3,
    }
  }
}

impl RosterConfig {
  pub fn lock_timeout(&self) -> Duration { Duration::from_millis(self.lock_timeout_ms) }
}

/// Bounded exponential backoff for [`Error::Busy`](crate::Error::Busy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Total attempts including the first; `1` disables retrying.
  pub max_attempts:  u32,
  pub base_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self { Self { max_attempts: 3, base_delay_ms: 10 } }
}

impl RetryConfig {
  /// Delay before retry number `attempt` (1-based): the base delay doubled
  /// per earlier retry.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_fields_take_defaults() {
    let config: RosterConfig = serde_json::from_str(
      r#"{ "deleted_slot_policy": "retain", "retry": { "max_attempts": 5 } }"#,
    )
    .unwrap();
    assert_eq!(config.deleted_slot_policy, DeletedSlotPolicy::Retain);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay_ms, 10);
    assert_eq!(config.lock_stripes, 64);
    assert!(config.auto_create_partitions);
  }

  #[test]
  fn backoff_doubles() {
    let retry = RetryConfig { max_attempts: 4, base_delay_ms: 10 };
    let delays: Vec<_> = (1..=3).map(|n| retry.delay_for(n).as_millis()).collect();
    assert_eq!(delays, vec![10, 20, 40]);
  }
}
