mod cache;
mod config;
mod worker;

use clap::Parser;
use color_eyre::Result;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cache::{Request, SqliteStore};
use worker::{CacheWorker, HttpFetcher, LocalClients};

#[derive(Parser, Debug)]
#[command(name = "careworker")]
#[command(about = "Offline-first caching worker for Careapp")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/careworker/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// URL or app-relative path to serve through the cache, body printed
  /// to stdout. With no URL the worker just installs and activates,
  /// warming the offline cache.
  url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let storage = SqliteStore::open()?;
  let network = HttpFetcher::new()?;
  let worker = CacheWorker::new(&config, storage, network, LocalClients::new())?;

  // The browser's lifecycle ordering: install, then activate, then fetches.
  worker.on_install().await?;
  worker.on_activate().await?;

  if let Some(raw) = args.url {
    let request = Request::get(worker.resolve(&raw)?);
    let served = worker.on_fetch(&request).await?;
    info!(
      source = ?served.source,
      status = served.response.status,
      "request served"
    );
    std::io::stdout().write_all(&served.response.body)?;
  }

  Ok(())
}
