//! Network fetching seam between the worker and the real HTTP stack.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};

use crate::cache::{CachedResponse, Request};

/// Trait for performing the real network fetch on a cache miss.
#[async_trait]
pub trait NetworkFetch: Send + Sync {
  /// Perform the request and snapshot the response. An `Err` means the
  /// network itself failed (unreachable, DNS, reset); HTTP error statuses
  /// come back as `Ok` with a non-2xx status.
  async fn fetch(&self, request: &Request) -> Result<CachedResponse>;
}

#[async_trait]
impl<N: NetworkFetch + ?Sized> NetworkFetch for std::sync::Arc<N> {
  async fn fetch(&self, request: &Request) -> Result<CachedResponse> {
    (**self).fetch(request).await
  }
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl NetworkFetch for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<CachedResponse> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Network fetch for {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body from {}: {}", request.url, e))?
      .to_vec();

    Ok(CachedResponse {
      status,
      headers,
      body,
    })
  }
}
