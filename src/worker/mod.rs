//! Service-worker style cache manager for Careapp.
//!
//! The worker answers the three lifecycle calls a browser would dispatch
//! (install, activate, fetch) against an injected cache store, network
//! fetcher, and client registry, so the logic is unit-testable without a
//! browser runtime.

mod fetcher;
mod service;

pub use fetcher::{HttpFetcher, NetworkFetch};
pub use service::{CacheWorker, Clients, LocalClients};
