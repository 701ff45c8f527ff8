//! The cache lifecycle manager: precache on setup, rotate buckets on cleanup,
//! and answer intercepted requests cache-first with a background refresh.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{bucket_name, is_owned_by, Bucket, CacheStorage};
use crate::config::Config;
use crate::net::{Fetcher, Method, Request, Response};

/// Hooks a host runtime calls on its worker.
///
/// `on_setup` runs once per version activation. `Ok` means the worker is
/// ready and wants to take control without waiting for open sessions.
/// `on_cleanup` runs once after setup, before the worker takes control.
/// `on_request` runs for every outgoing request from controlled sessions.
/// `None` means "not handled" and the host sends the request to the network.
pub trait Lifecycle: Send + Sync {
  fn on_setup(&self) -> impl Future<Output = Result<()>> + Send;

  fn on_cleanup(&self) -> impl Future<Output = Result<()>> + Send;

  fn on_request(&self, request: Request) -> impl Future<Output = Option<Response>> + Send;
}

/// Deployment-time settings of the worker, with every path resolved.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  /// Prefix shared by every bucket this application owns
  pub prefix: String,
  pub version: u32,
  /// Absolute URLs to precache, in manifest order
  pub manifest: Vec<Url>,
  /// Shell page served to navigations when the network is gone
  pub navigation_fallback: Url,
}

impl WorkerSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    let origin = config.origin_url()?;
    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid path '{}' for origin {}: {}", path, origin, e))
    };

    let manifest = config
      .precache
      .iter()
      .map(|path| resolve(path.as_str()))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      prefix: config.cache.prefix.clone(),
      version: config.cache.version,
      manifest,
      navigation_fallback: resolve(config.cache.navigation_fallback.as_str())?,
    })
  }

  pub fn bucket_name(&self) -> String {
    bucket_name(&self.prefix, self.version)
  }
}

/// Cache-first worker over one versioned bucket.
pub struct CacheLifecycleManager<S: CacheStorage, F: Fetcher> {
  settings: WorkerSettings,
  bucket: Bucket<S>,
  storage: Arc<S>,
  fetcher: Arc<F>,
}

impl<S, F> CacheLifecycleManager<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  pub fn new(settings: WorkerSettings, storage: Arc<S>, fetcher: Arc<F>) -> Self {
    let bucket = Bucket::new(settings.bucket_name(), Arc::clone(&storage));

    Self {
      settings,
      bucket,
      storage,
      fetcher,
    }
  }

  /// The bucket for the current version.
  pub fn bucket(&self) -> &Bucket<S> {
    &self.bucket
  }

  /// Refresh a cached entry in a detached task. Failures go nowhere.
  fn revalidate(&self, request: Request) {
    let bucket = self.bucket.clone();
    let fetcher = Arc::clone(&self.fetcher);

    tokio::spawn(async move {
      match fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => {
          if let Err(e) = bucket.put(&request, &response) {
            trace!("Background refresh of {} not stored: {}", request, e);
          }
        }
        Ok(response) => {
          trace!(status = response.status, "Background refresh of {} skipped", request);
        }
        Err(e) => {
          trace!("Background refresh of {} failed: {}", request, e);
        }
      }
    });
  }

  /// Network first for a cache miss, falling back to the shell or an offline page.
  async fn fetch_and_store(&self, request: &Request) -> Response {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          if let Err(e) = self.bucket.put(request, &response) {
            warn!("Failed to cache {}: {}", request, e);
          }
        }
        response
      }
      Err(e) => {
        debug!("Network unavailable for {}: {}", request, e);
        self.offline_fallback(request)
      }
    }
  }

  fn offline_fallback(&self, request: &Request) -> Response {
    if request.is_navigation() {
      let shell = Request::get(self.settings.navigation_fallback.clone());
      match self.bucket.match_request(&shell) {
        Ok(Some(cached)) => return cached.response,
        Ok(None) => debug!("Shell page {} is not cached", shell.url),
        Err(e) => warn!("Failed to read shell page {}: {}", shell.url, e),
      }
    }

    Response::offline()
  }
}

impl<S, F> Lifecycle for CacheLifecycleManager<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  async fn on_setup(&self) -> Result<()> {
    info!(
      bucket = self.bucket.name(),
      entries = self.settings.manifest.len(),
      "Precaching manifest"
    );
    if self.bucket.open()? {
      debug!(bucket = self.bucket.name(), "Created bucket");
    }

    let fetches = self.settings.manifest.iter().map(|url| {
      let request = Request::get(url.clone());
      async move {
        let response = self.fetcher.fetch(&request).await?;
        if !response.is_success() {
          return Err(eyre!(
            "Precache of {} failed with status {}",
            request.url,
            response.status
          ));
        }
        Ok::<_, color_eyre::Report>((request, response))
      }
    });

    // Nothing is written unless every entry arrived
    let entries = try_join_all(fetches).await?;
    self.bucket.put_all(entries)?;

    info!(bucket = self.bucket.name(), "Precache complete");
    Ok(())
  }

  async fn on_cleanup(&self) -> Result<()> {
    let current = self.bucket.name();
    let stale: Vec<String> = self
      .storage
      .bucket_names()?
      .into_iter()
      .filter(|name| is_owned_by(&self.settings.prefix, name) && name != current)
      .collect();

    for name in &stale {
      self.storage.delete_bucket(name)?;
      info!(bucket = %name, "Deleted stale bucket");
    }

    Ok(())
  }

  async fn on_request(&self, request: Request) -> Option<Response> {
    if request.method != Method::Get {
      return None;
    }

    match self.bucket.match_request(&request) {
      Ok(Some(cached)) => {
        debug!("Cache hit for {}", request);
        let response = cached.response;
        self.revalidate(request);
        return Some(response);
      }
      Ok(None) => debug!("Cache miss for {}", request),
      Err(e) => warn!("Cache lookup failed for {}: {}", request, e),
    }

    Some(self.fetch_and_store(&request).await)
  }
}
