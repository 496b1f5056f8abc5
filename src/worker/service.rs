//! The cache manager: install, activate, and fetch handling.

use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::{Origin, Url};

use crate::cache::{CacheStore, Request, Served};
use crate::config::Config;

use super::fetcher::NetworkFetch;

/// Control surface over pages already open under the worker's scope.
pub trait Clients: Send + Sync {
  /// Take control of every open client immediately, instead of waiting
  /// for each one to navigate again.
  fn claim(&self) -> Result<()>;
}

impl<C: Clients + ?Sized> Clients for Arc<C> {
  fn claim(&self) -> Result<()> {
    (**self).claim()
  }
}

/// Client registry for a single local host process.
#[derive(Default)]
pub struct LocalClients {
  claimed: AtomicBool,
}

impl LocalClients {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn claimed(&self) -> bool {
    self.claimed.load(Ordering::SeqCst)
  }
}

impl Clients for LocalClients {
  fn claim(&self) -> Result<()> {
    self.claimed.store(true, Ordering::SeqCst);
    Ok(())
  }
}

/// Cache-first worker for Careapp.
///
/// Holds the named, versioned cache store plus the offline URL set, and
/// answers the three lifecycle calls a host dispatches: `on_install`,
/// `on_activate`, `on_fetch`.
pub struct CacheWorker<S: CacheStore, N: NetworkFetch, C: Clients> {
  storage: Arc<S>,
  network: N,
  clients: C,
  cache_name: String,
  base: Url,
  origin: Origin,
  offline_urls: Vec<Url>,
  fallback: Url,
}

impl<S: CacheStore, N: NetworkFetch, C: Clients> CacheWorker<S, N, C> {
  /// Build a worker from configuration and injected dependencies.
  pub fn new(config: &Config, storage: S, network: N, clients: C) -> Result<Self> {
    let base = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid base URL {}: {}", config.base_url, e))?;

    let offline_urls = config
      .offline_urls
      .iter()
      .map(|raw| resolve(&base, raw))
      .collect::<Result<Vec<_>>>()?;

    let fallback = resolve(&base, &config.fallback_url)?;

    Ok(Self {
      storage: Arc::new(storage),
      network,
      clients,
      cache_name: config.cache_name.clone(),
      origin: base.origin(),
      base,
      offline_urls,
      fallback,
    })
  }

  /// Resolve an absolute URL or app-relative path against the base URL.
  pub fn resolve(&self, raw: &str) -> Result<Url> {
    resolve(&self.base, raw)
  }

  /// Install: precache the whole offline URL list.
  ///
  /// Every URL is fetched up front and the batch is written in one
  /// transaction; a single failed or non-2xx fetch abandons the install
  /// and leaves the store untouched. No retry here, the host decides
  /// when to try installing again.
  pub async fn on_install(&self) -> Result<()> {
    let fetches = self.offline_urls.iter().map(|url| {
      let request = Request::get(url.clone());
      async move {
        let response = self
          .network
          .fetch(&request)
          .await
          .wrap_err_with(|| format!("Precache fetch for {} failed", request.url))?;

        if !response.is_success() {
          return Err(eyre!(
            "Precache fetch for {} returned status {}",
            request.url,
            response.status
          ));
        }

        Ok((request, response))
      }
    });

    let entries = futures::future::try_join_all(fetches).await?;

    self.storage.put_all(&self.cache_name, &entries)?;
    info!(
      cache = %self.cache_name,
      entries = entries.len(),
      "offline cache installed"
    );

    Ok(())
  }

  /// Activate: sweep stores left behind by earlier cache versions, then
  /// take over all open clients.
  pub async fn on_activate(&self) -> Result<()> {
    for name in self.storage.cache_names()? {
      if name != self.cache_name {
        self.storage.delete_cache(&name)?;
        debug!(cache = %name, "deleted stale cache version");
      }
    }

    self.clients.claim()?;
    info!(cache = %self.cache_name, "worker activated");

    Ok(())
  }

  /// Fetch: cache-first, network fallback, offline page as last resort.
  ///
  /// The cache lookup always completes before any network request is
  /// issued; there is no cache-vs-network racing. Successful same-origin
  /// GET responses are written through for future hits.
  pub async fn on_fetch(&self, request: &Request) -> Result<Served> {
    if let Some(entry) = self.storage.lookup(&self.cache_name, request)? {
      debug!(url = %request.url, "cache hit");
      return Ok(Served::from_cache(entry));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if request.is_get() && response.is_success() && request.url.origin() == self.origin {
          // Fire-and-forget like the browser's cache.put: a storage
          // failure must not fail the response already in hand.
          if let Err(err) = self.storage.put(&self.cache_name, request, &response) {
            warn!(url = %request.url, "write-through cache update failed: {err}");
          }
        }
        Ok(Served::from_network(response))
      }
      Err(err) => match self
        .storage
        .lookup(&self.cache_name, &Request::get(self.fallback.clone()))?
      {
        Some(entry) => {
          info!(url = %request.url, "network unreachable, serving offline fallback");
          Ok(Served::fallback(entry))
        }
        None => {
          Err(err).wrap_err("Network fetch failed and the offline fallback page is not cached")
        }
      },
    }
  }
}

fn resolve(base: &Url, raw: &str) -> Result<Url> {
  match Url::parse(raw) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => base
      .join(raw)
      .map_err(|e| eyre!("Cannot resolve {} against {}: {}", raw, base, e)),
    Err(e) => Err(eyre!("Invalid URL {}: {}", raw, e)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedResponse, MemoryStore, ServedFrom};
  use async_trait::async_trait;
  use reqwest::Method;
  use std::collections::HashMap;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex;

  /// Canned network: URL -> response, with an offline switch and a call
  /// counter. Unknown URLs behave like a connection failure.
  #[derive(Default)]
  struct FakeNetwork {
    routes: Mutex<HashMap<String, CachedResponse>>,
    online: AtomicBool,
    calls: AtomicUsize,
  }

  impl FakeNetwork {
    fn new() -> Self {
      let network = Self::default();
      network.online.store(true, Ordering::SeqCst);
      network
    }

    fn route(&self, url: &str, status: u16, body: &[u8]) {
      self.routes.lock().unwrap().insert(
        url.to_string(),
        CachedResponse {
          status,
          headers: vec![("content-type".to_string(), "text/html".to_string())],
          body: body.to_vec(),
        },
      );
    }

    fn go_offline(&self) {
      self.online.store(false, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl NetworkFetch for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<CachedResponse> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if !self.online.load(Ordering::SeqCst) {
        return Err(eyre!("network unreachable"));
      }
      self
        .routes
        .lock()
        .unwrap()
        .get(request.url.as_str())
        .cloned()
        .ok_or_else(|| eyre!("connection refused: {}", request.url))
    }
  }

  struct Fixture {
    storage: Arc<MemoryStore>,
    network: Arc<FakeNetwork>,
    clients: Arc<LocalClients>,
    worker: CacheWorker<Arc<MemoryStore>, Arc<FakeNetwork>, Arc<LocalClients>>,
  }

  fn fixture_with(config: Config) -> Fixture {
    let storage = Arc::new(MemoryStore::new());
    let network = Arc::new(FakeNetwork::new());
    let clients = Arc::new(LocalClients::new());
    let worker = CacheWorker::new(
      &config,
      Arc::clone(&storage),
      Arc::clone(&network),
      Arc::clone(&clients),
    )
    .expect("worker construction");
    Fixture {
      storage,
      network,
      clients,
      worker,
    }
  }

  fn fixture(offline_urls: &[&str]) -> Fixture {
    fixture_with(Config {
      offline_urls: offline_urls.iter().map(|s| s.to_string()).collect(),
      ..Config::default()
    })
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).expect("valid url"))
  }

  #[tokio::test]
  async fn test_install_precaches_offline_urls() {
    let f = fixture(&["/", "/family"]);
    f.network.route("http://127.0.0.1:5000/", 200, b"home");
    f.network
      .route("http://127.0.0.1:5000/family", 200, b"family");

    f.worker.on_install().await.unwrap();

    assert_eq!(f.storage.entry_count("dcn-family-v1").unwrap(), 2);
    for url in ["http://127.0.0.1:5000/", "http://127.0.0.1:5000/family"] {
      assert!(
        f.storage
          .lookup("dcn-family-v1", &get(url))
          .unwrap()
          .is_some(),
        "missing precached entry for {url}"
      );
    }
  }

  #[tokio::test]
  async fn test_install_failure_leaves_no_partial_entries() {
    let f = fixture(&["/", "/family"]);
    f.network.route("http://127.0.0.1:5000/", 200, b"home");
    // /family deliberately unrouted: the fetch fails

    assert!(f.worker.on_install().await.is_err());
    assert_eq!(f.storage.entry_count("dcn-family-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_install_rejects_non_success_response() {
    let f = fixture(&["/", "/family"]);
    f.network.route("http://127.0.0.1:5000/", 200, b"home");
    f.network.route("http://127.0.0.1:5000/family", 500, b"boom");

    assert!(f.worker.on_install().await.is_err());
    assert_eq!(f.storage.entry_count("dcn-family-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activate_sweeps_stale_versions_and_claims_clients() {
    let f = fixture(&[]);
    let response = CachedResponse {
      status: 200,
      headers: Vec::new(),
      body: b"old".to_vec(),
    };
    f.storage
      .put("dcn-family-v0", &get("http://127.0.0.1:5000/family"), &response)
      .unwrap();
    f.storage
      .put("dcn-family-v1", &get("http://127.0.0.1:5000/family"), &response)
      .unwrap();

    f.worker.on_activate().await.unwrap();

    assert_eq!(
      f.storage.cache_names().unwrap(),
      vec!["dcn-family-v1".to_string()]
    );
    assert!(f.clients.claimed());
  }

  #[tokio::test]
  async fn test_fetch_hit_skips_network() {
    let f = fixture(&[]);
    let request = get("http://127.0.0.1:5000/family");
    let cached = CachedResponse {
      status: 200,
      headers: Vec::new(),
      body: b"cached family".to_vec(),
    };
    f.storage.put("dcn-family-v1", &request, &cached).unwrap();

    let served = f.worker.on_fetch(&request).await.unwrap();

    assert_eq!(served.source, ServedFrom::Cache);
    assert_eq!(served.response.body, b"cached family");
    assert!(served.cached_at.is_some());
    assert_eq!(f.network.calls(), 0);
  }

  #[tokio::test]
  async fn test_miss_populates_cache_for_next_identical_request() {
    let f = fixture(&[]);
    f.network
      .route("http://127.0.0.1:5000/family_login", 200, b"login page");
    let request = get("http://127.0.0.1:5000/family_login");

    let first = f.worker.on_fetch(&request).await.unwrap();
    assert_eq!(first.source, ServedFrom::Network);

    let second = f.worker.on_fetch(&request).await.unwrap();
    assert_eq!(second.source, ServedFrom::Cache);
    assert_eq!(second.response.body, first.response.body);
    assert_eq!(f.network.calls(), 1);
  }

  #[tokio::test]
  async fn test_cross_origin_responses_are_not_cached() {
    let f = fixture(&[]);
    let url = "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css";
    f.network.route(url, 200, b"css");
    let request = get(url);

    let served = f.worker.on_fetch(&request).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(f.storage.entry_count("dcn-family-v1").unwrap(), 0);

    // Still goes to the network the second time
    f.worker.on_fetch(&request).await.unwrap();
    assert_eq!(f.network.calls(), 2);
  }

  #[tokio::test]
  async fn test_non_get_responses_are_not_cached() {
    let f = fixture(&[]);
    f.network
      .route("http://127.0.0.1:5000/family_login", 200, b"logged in");
    let request = Request::new(
      Method::POST,
      Url::parse("http://127.0.0.1:5000/family_login").unwrap(),
    );

    let served = f.worker.on_fetch(&request).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(f.storage.entry_count("dcn-family-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_non_success_responses_are_not_cached() {
    let f = fixture(&[]);
    f.network
      .route("http://127.0.0.1:5000/missing", 404, b"not found");
    let request = get("http://127.0.0.1:5000/missing");

    let served = f.worker.on_fetch(&request).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(served.response.status, 404);
    assert_eq!(f.storage.entry_count("dcn-family-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_offline_miss_serves_fallback_page() {
    let f = fixture(&[]);
    let fallback = CachedResponse {
      status: 200,
      headers: Vec::new(),
      body: b"offline family page".to_vec(),
    };
    f.storage
      .put(
        "dcn-family-v1",
        &get("http://127.0.0.1:5000/family"),
        &fallback,
      )
      .unwrap();
    f.network.go_offline();

    let served = f
      .worker
      .on_fetch(&get("http://127.0.0.1:5000/records"))
      .await
      .unwrap();

    assert_eq!(served.source, ServedFrom::Fallback);
    assert_eq!(served.response.body, b"offline family page");
  }

  #[tokio::test]
  async fn test_offline_miss_without_fallback_propagates_error() {
    let f = fixture(&[]);
    f.network.go_offline();

    let result = f
      .worker
      .on_fetch(&get("http://127.0.0.1:5000/records"))
      .await;

    assert!(result.is_err());
  }

  #[test]
  fn test_resolve_joins_relative_paths_against_base() {
    let f = fixture(&[]);
    assert_eq!(
      f.worker.resolve("/family").unwrap().as_str(),
      "http://127.0.0.1:5000/family"
    );
    assert_eq!(
      f.worker.resolve("https://cdn.jsdelivr.net/x.css").unwrap().as_str(),
      "https://cdn.jsdelivr.net/x.css"
    );
  }
}
