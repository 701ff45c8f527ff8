//! Core traits and types for bucket storage.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};

use crate::net::{Method, Request, Response};

/// Identity of a stored request: method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: Method,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
    }
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<&Request> for RequestKey {
  /// Fragments never reach the server, so they are not part of the identity.
  fn from(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);
    Self::new(request.method, url.as_str())
  }
}

/// A response read back from a bucket.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was written
  pub stored_at: DateTime<Utc>,
}

/// Trait for bucket storage backends.
///
/// A backend holds any number of named buckets, each mapping request keys to
/// responses. Writes are per-key overwrites, so concurrent stores of different
/// keys never conflict.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist yet. Returns true if it was created.
  fn open_bucket(&self, bucket: &str) -> Result<bool>;

  /// All bucket names, sorted.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Delete a bucket and its entries. Returns false if it did not exist.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  fn lookup(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a single response, overwriting any previous entry for the key.
  fn store(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store several responses in one atomic write.
  fn store_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Request keys held in a bucket, ordered by URL.
  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_hash_is_stable_and_fixed_length() {
    let key = RequestKey::new(Method::Get, "http://localhost/index.html");
    assert_eq!(key.cache_hash(), key.clone().cache_hash());
    assert_eq!(key.cache_hash().len(), 64);
  }

  #[test]
  fn test_key_ignores_fragment() {
    let plain = Request::get(url::Url::parse("http://localhost/app.js").unwrap());
    let tagged = Request::get(url::Url::parse("http://localhost/app.js#v2").unwrap());

    let key = RequestKey::from(&tagged);
    assert_eq!(key.url, "http://localhost/app.js");
    assert_eq!(key, RequestKey::from(&plain));
    assert_eq!(key.cache_hash(), RequestKey::from(&plain).cache_hash());
  }

  #[test]
  fn test_key_keeps_query() {
    let a = Request::get(url::Url::parse("http://localhost/data?page=1").unwrap());
    let b = Request::get(url::Url::parse("http://localhost/data?page=2").unwrap());
    assert_ne!(RequestKey::from(&a), RequestKey::from(&b));
  }

  #[test]
  fn test_cache_hash_includes_method() {
    let get = RequestKey::new(Method::Get, "http://localhost/");
    let head = RequestKey::new(Method::Head, "http://localhost/");
    assert_ne!(get.cache_hash(), head.cache_hash());
  }
}
