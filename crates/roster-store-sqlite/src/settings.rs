//! Deployment settings: where the database lives and how the roster behaves.

use std::path::{Path, PathBuf};

use roster_core::{Roster, RosterConfig, references::ReferenceResolver};
use serde::Deserialize;

use crate::{Result, SqliteStore};

/// Settings deserialised from an optional TOML file layered with `ROSTER_*`
/// environment variables (nested keys separated by `__`, e.g.
/// `ROSTER_ROSTER__LOCK_STRIPES=128`).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  pub store_path: PathBuf,
  #[serde(default)]
  pub roster:     RosterConfig,
}

impl Settings {
  pub fn load(file: Option<&Path>) -> Result<Self> { Self::layered(file, None) }

  /// [`load`](Self::load) with the environment read from `env` instead of
  /// the process when given.
  pub(crate) fn layered(
    file: Option<&Path>,
    env: Option<config::Map<String, String>>,
  ) -> Result<Self> {
    let mut builder = config::Config::builder();
    if let Some(file) = file {
      builder = builder.add_source(config::File::from(file).required(false));
    }
    let settings = builder
      .add_source(
        config::Environment::with_prefix("ROSTER")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true)
          .source(env),
      )
      .build()?;
    Ok(settings.try_deserialize()?)
  }

  /// Open the store at `store_path` and a roster over it.
  pub async fn open_roster<R: ReferenceResolver>(
    &self,
    references: R,
  ) -> Result<Roster<SqliteStore, R>> {
    let store = SqliteStore::open(&self.store_path).await?;
    let roster = Roster::open(store, references, self.roster.clone()).await?;
    tracing::info!(path = ?self.store_path, "sqlite roster ready");
    Ok(roster)
  }
}
