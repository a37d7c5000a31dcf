//! recycleindex-storage: persistent store backends for RecycleIndex.
//!
//! Backends:
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)
//!
//! The in-memory store lives in `recycleindex-core` as
//! `recycleindex_core::MemoryStore`.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStore, TableCounts};
