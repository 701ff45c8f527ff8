//! Handle to one named bucket inside a storage backend.

use color_eyre::Result;
use std::sync::Arc;

use super::traits::{CacheStorage, CachedResponse, RequestKey};
use crate::net::{Request, Response};

/// Bucket name for an application prefix and version, e.g. `rapunzel-v3`.
pub fn bucket_name(prefix: &str, version: u32) -> String {
  format!("{}-v{}", prefix, version)
}

/// Whether a bucket name belongs to the application with this prefix.
pub fn is_owned_by(prefix: &str, name: &str) -> bool {
  name
    .strip_prefix(prefix)
    .is_some_and(|rest| rest.starts_with('-'))
}

/// A named bucket bound to its storage backend.
pub struct Bucket<S: CacheStorage> {
  name: String,
  storage: Arc<S>,
}

impl<S: CacheStorage> Bucket<S> {
  pub fn new(name: impl Into<String>, storage: Arc<S>) -> Self {
    Self {
      name: name.into(),
      storage,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Create the bucket in storage if it is absent. Returns true if it was created.
  pub fn open(&self) -> Result<bool> {
    self.storage.open_bucket(&self.name)
  }

  pub fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>> {
    self.storage.lookup(&self.name, &RequestKey::from(request))
  }

  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    self
      .storage
      .store(&self.name, &RequestKey::from(request), response)
  }

  /// Store every pair or none of them.
  pub fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<()> {
    let entries: Vec<(RequestKey, Response)> = entries
      .into_iter()
      .map(|(request, response)| (RequestKey::from(&request), response))
      .collect();

    self.storage.store_all(&self.name, &entries)
  }

  pub fn keys(&self) -> Result<Vec<RequestKey>> {
    self.storage.keys(&self.name)
  }
}

impl<S: CacheStorage> Clone for Bucket<S> {
  fn clone(&self) -> Self {
    Self {
      name: self.name.clone(),
      storage: Arc::clone(&self.storage),
    }
  }
}
