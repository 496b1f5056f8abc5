//! Entry model for the cache: request descriptors and response snapshots.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// A request descriptor. Cache identity is method + URL, so a POST to a
/// cached GET URL is still a miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  /// Convenience for the common case; precaching and fallback lookups are
  /// always GETs.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Stable, fixed-length storage key for this request.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response snapshot as persisted in the cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub status: u16,
  /// Header name/value pairs in arrival order.
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  /// Whether the status is in the 2xx range (the `Response.ok` test the
  /// original worker applied before caching).
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A stored entry together with the time it was written.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: CachedResponse,
  pub cached_at: DateTime<Utc>,
}

/// A response handed back to the client, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: CachedResponse,
  pub source: ServedFrom,
  /// When the response was cached, if it came from the store.
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: CachedResponse) -> Self {
    Self {
      response,
      source: ServedFrom::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ServedFrom::Cache,
      cached_at: Some(entry.cached_at),
    }
  }

  pub fn fallback(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ServedFrom::Fallback,
      cached_at: Some(entry.cached_at),
    }
  }
}

/// Indicates how a fetch was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Fresh response from the network
  Network,
  /// Cache hit, no network involved
  Cache,
  /// Network failed; the cached offline page was substituted
  Fallback,
}
