//! Relational source access for catalogsync.
//!
//! This crate defines the [`SourceStore`] trait the sync engine reads
//! through, along with two implementations:
//! - [`SqliteSource`]: SQLite database with trigger-maintained history tables
//! - [`MemorySource`]: deterministic in-memory store for tests

pub mod memory;
pub mod provider;
pub mod sqlite;

pub use memory::MemorySource;
pub use provider::{values_equal, Filter, Join, Row, RowQuery, SourceStore};
pub use sqlite::SqliteSource;
