//! Versioned request/response cache backing the offline worker.
//!
//! This module provides the store the worker reads and writes:
//! - entries are (request descriptor, response snapshot) pairs keyed by
//!   method + URL
//! - stores are versioned by name; bumping the version string is the
//!   invalidation mechanism, old versions are swept on activate
//! - storage backends are pluggable: SQLite for persistence across runs,
//!   in-memory for tests and ephemeral use

mod entry;
mod storage;

pub use entry::{CachedEntry, CachedResponse, Request, Served, ServedFrom};
pub use storage::{CacheStore, MemoryStore, SqliteStore};
