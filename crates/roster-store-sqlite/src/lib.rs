//! SQLite backend for the Roster enrollment store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Each date partition is a table of its
//! own, carrying its own copy of the parent index set.

mod encode;
mod schema;
mod settings;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use settings::Settings;
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
