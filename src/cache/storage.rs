//! Cache store trait and its SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::entry::{CachedEntry, CachedResponse, Request};

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores. The worker only ever writes
/// to the store matching its current version string; older stores linger
/// until activation deletes them.
pub trait CacheStore: Send + Sync {
  /// Look up a cached response by request identity (method + URL).
  fn lookup(&self, cache: &str, request: &Request) -> Result<Option<CachedEntry>>;

  /// Store a response under the request key, replacing any previous entry.
  fn put(&self, cache: &str, request: &Request, response: &CachedResponse) -> Result<()>;

  /// Store a batch of entries. Either every entry lands or none do.
  fn put_all(&self, cache: &str, entries: &[(Request, CachedResponse)]) -> Result<()>;

  /// Names of every store currently present, including stale versions.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Drop a named store and all of its entries.
  fn delete_cache(&self, cache: &str) -> Result<()>;

  /// Number of entries in a named store.
  fn entry_count(&self, cache: &str) -> Result<usize>;
}

impl<S: CacheStore + ?Sized> CacheStore for std::sync::Arc<S> {
  fn lookup(&self, cache: &str, request: &Request) -> Result<Option<CachedEntry>> {
    (**self).lookup(cache, request)
  }

  fn put(&self, cache: &str, request: &Request, response: &CachedResponse) -> Result<()> {
    (**self).put(cache, request, response)
  }

  fn put_all(&self, cache: &str, entries: &[(Request, CachedResponse)]) -> Result<()> {
    (**self).put_all(cache, entries)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    (**self).cache_names()
  }

  fn delete_cache(&self, cache: &str) -> Result<()> {
    (**self).delete_cache(cache)
  }

  fn entry_count(&self, cache: &str) -> Result<usize> {
    (**self).entry_count(cache)
  }
}

/// In-memory store. Used by tests and ephemeral runs; entries do not
/// survive the process.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<(String, String), CachedEntry>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryStore {
  fn lookup(&self, cache: &str, request: &Request) -> Result<Option<CachedEntry>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      entries
        .get(&(cache.to_string(), request.cache_key()))
        .cloned(),
    )
  }

  fn put(&self, cache: &str, request: &Request, response: &CachedResponse) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(
      (cache.to_string(), request.cache_key()),
      CachedEntry {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn put_all(&self, cache: &str, batch: &[(Request, CachedResponse)]) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let cached_at = Utc::now();
    for (request, response) in batch {
      entries.insert(
        (cache.to_string(), request.cache_key()),
        CachedEntry {
          response: response.clone(),
          cached_at,
        },
      );
    }
    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut names: Vec<String> = entries.keys().map(|(name, _)| name.clone()).collect();
    names.sort();
    names.dedup();
    Ok(names)
  }

  fn delete_cache(&self, cache: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.retain(|(name, _), _| name != cache);
    Ok(())
  }

  fn entry_count(&self, cache: &str) -> Result<usize> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.keys().filter(|(name, _)| name == cache).count())
  }
}

/// SQLite-backed store. Stands in for the browser-managed cache storage:
/// entries outlive the worker process.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    Self::open_at(&path)
  }

  /// Open the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("careworker").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the entry table. The method and URL columns are informational;
/// lookups go through the hashed request key.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_name ON cache_entries(cache_name);
"#;

impl CacheStore for SqliteStore {
  fn lookup(&self, cache: &str, request: &Request) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare lookup: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![cache, request.cache_key()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers_json, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers_json)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          response: CachedResponse {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, cache: &str, request: &Request, response: &CachedResponse) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    insert_entry(&conn, cache, request, response)
  }

  fn put_all(&self, cache: &str, entries: &[(Request, CachedResponse)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (request, response) in entries {
      insert_entry(&tx, cache, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_cache(&self, cache: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache, e))?;

    Ok(())
  }

  fn entry_count(&self, cache: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![cache],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;

    Ok(count as usize)
  }
}

fn insert_entry(
  conn: &Connection,
  cache: &str,
  request: &Request,
  response: &CachedResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_key, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache,
        request.cache_key(),
        request.method.as_str(),
        request.url.as_str(),
        response.status,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store entry for {}: {}", request.url, e))?;

  Ok(())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
