//! Bucket storage backends: SQLite for persistence, memory for ephemeral runs.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheStorage, CachedResponse, RequestKey};
use crate::net::{Method, Response};

/// SQLite-based bucket storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Storage that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per stored request; headers are a JSON array of [name, value] pairs
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_bucket ON entries(bucket);
"#;

fn insert_entry(
  conn: &Connection,
  bucket: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to create bucket {}: {}", bucket, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries
         (bucket, request_hash, method, url, status, status_text, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket,
        key.cache_hash(),
        key.method.as_str(),
        key.url,
        response.status,
        response.status_text,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store {} {}: {}", key.method, key.url, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_bucket(&self, bucket: &str) -> Result<bool> {
    let inserted = self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to create bucket {}: {}", bucket, e))?;

    Ok(inserted > 0)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn lookup(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, stored_at FROM entries
         WHERE bucket = ? AND request_hash = ?",
        params![bucket, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} {}: {}", key.method, key.url, e))?;

    match row {
      Some((status, status_text, headers, body, stored_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

        Ok(Some(CachedResponse {
          response: Response {
            status,
            status_text,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn store(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    insert_entry(&conn, bucket, key, response)
  }

  fn store_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      insert_entry(&tx, bucket, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE bucket = ? ORDER BY url, method")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![bucket], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url)| Ok(RequestKey::new(method.parse::<Method>()?, url)))
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

type MemoryBucket = BTreeMap<String, (RequestKey, CachedResponse)>;

/// Storage that keeps every bucket in process memory.
#[derive(Default)]
pub struct MemoryStorage {
  buckets: Mutex<BTreeMap<String, MemoryBucket>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, MemoryBucket>>> {
    self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open_bucket(&self, bucket: &str) -> Result<bool> {
    let mut buckets = self.lock()?;
    if buckets.contains_key(bucket) {
      return Ok(false);
    }
    buckets.insert(bucket.to_string(), MemoryBucket::new());
    Ok(true)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    Ok(self.lock()?.remove(bucket).is_some())
  }

  fn lookup(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(
      self
        .lock()?
        .get(bucket)
        .and_then(|entries| entries.get(&key.cache_hash()))
        .map(|(_, cached)| cached.clone()),
    )
  }

  fn store(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.store_all(bucket, &[(key.clone(), response.clone())])
  }

  fn store_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut buckets = self.lock()?;
    let target = buckets.entry(bucket.to_string()).or_default();
    let stored_at = Utc::now();

    for (key, response) in entries {
      target.insert(
        key.cache_hash(),
        (
          key.clone(),
          CachedResponse {
            response: response.clone(),
            stored_at,
          },
        ),
      );
    }

    Ok(())
  }

  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    let mut keys: Vec<RequestKey> = self
      .lock()?
      .get(bucket)
      .map(|entries| entries.values().map(|(key, _)| key.clone()).collect())
      .unwrap_or_default();

    keys.sort_by(|a, b| {
      a.url
        .cmp(&b.url)
        .then_with(|| a.method.as_str().cmp(b.method.as_str()))
    });
    Ok(keys)
  }
}

/// Memory storage whose reads or writes can be made to fail.
#[cfg(test)]
#[derive(Default)]
pub struct FailingStorage {
  inner: MemoryStorage,
  fail_lookup: std::sync::atomic::AtomicBool,
  fail_store: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_fail_lookup(&self, fail: bool) {
    self
      .fail_lookup
      .store(fail, std::sync::atomic::Ordering::SeqCst);
  }

  pub fn set_fail_store(&self, fail: bool) {
    self
      .fail_store
      .store(fail, std::sync::atomic::Ordering::SeqCst);
  }

  fn check(flag: &std::sync::atomic::AtomicBool, what: &str) -> Result<()> {
    if flag.load(std::sync::atomic::Ordering::SeqCst) {
      return Err(eyre!("Storage unavailable: {}", what));
    }
    Ok(())
  }
}

#[cfg(test)]
impl CacheStorage for FailingStorage {
  fn open_bucket(&self, bucket: &str) -> Result<bool> {
    self.inner.open_bucket(bucket)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    self.inner.bucket_names()
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    self.inner.delete_bucket(bucket)
  }

  fn lookup(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    Self::check(&self.fail_lookup, "lookup")?;
    self.inner.lookup(bucket, key)
  }

  fn store(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    Self::check(&self.fail_store, "store")?;
    self.inner.store(bucket, key, response)
  }

  fn store_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    Self::check(&self.fail_store, "store")?;
    self.inner.store_all(bucket, entries)
  }

  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    self.inner.keys(bucket)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn key(path: &str) -> RequestKey {
    RequestKey::new(Method::Get, format!("http://localhost{}", path))
  }

  fn page(body: &str) -> Response {
    Response::new(200, body).with_header("Content-Type", "text/html")
  }

  /// Behaviour every backend must share.
  fn check_backend<S: CacheStorage>(storage: &S) {
    assert!(storage.bucket_names().unwrap().is_empty());
    assert!(storage.open_bucket("app-v1").unwrap());
    assert!(!storage.open_bucket("app-v1").unwrap());
    assert_eq!(storage.bucket_names().unwrap(), vec!["app-v1"]);

    assert!(storage.lookup("app-v1", &key("/")).unwrap().is_none());

    storage.store("app-v1", &key("/"), &page("first")).unwrap();
    storage.store("app-v1", &key("/"), &page("second")).unwrap();
    let cached = storage.lookup("app-v1", &key("/")).unwrap().unwrap();
    assert_eq!(cached.response.body, b"second");
    assert_eq!(cached.response.header("content-type"), Some("text/html"));

    storage
      .store_all(
        "app-v2",
        &[(key("/b.png"), page("b")), (key("/a.html"), page("a"))],
      )
      .unwrap();
    assert_eq!(storage.bucket_names().unwrap(), vec!["app-v1", "app-v2"]);
    let urls: Vec<String> = storage
      .keys("app-v2")
      .unwrap()
      .into_iter()
      .map(|k| k.url)
      .collect();
    assert_eq!(
      urls,
      vec!["http://localhost/a.html", "http://localhost/b.png"]
    );

    // Same URL in another bucket is a separate entry
    assert!(storage.lookup("app-v2", &key("/")).unwrap().is_none());

    assert!(storage.delete_bucket("app-v1").unwrap());
    assert!(!storage.delete_bucket("app-v1").unwrap());
    assert!(storage.lookup("app-v1", &key("/")).unwrap().is_none());
    assert_eq!(storage.bucket_names().unwrap(), vec!["app-v2"]);
  }

  #[test]
  fn test_sqlite_backend() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    check_backend(&storage);
  }

  #[test]
  fn test_memory_backend() {
    check_backend(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.store("app-v3", &key("/index.html"), &page("shell")).unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    let cached = storage
      .lookup("app-v3", &key("/index.html"))
      .unwrap()
      .expect("entry should survive reopen");
    assert_eq!(cached.response.body, b"shell");
    assert_eq!(cached.response.status_text, "OK");
  }

  #[test]
  fn test_sqlite_stored_at_is_recent() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let before = Utc::now() - chrono::Duration::seconds(2);
    storage.store("app-v1", &key("/"), &page("x")).unwrap();

    let cached = storage.lookup("app-v1", &key("/")).unwrap().unwrap();
    assert!(cached.stored_at >= before);
  }

  #[test]
  fn test_parse_datetime() {
    let dt = parse_datetime("2024-03-01 12:30:45").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-03-01T12:30:45+00:00");
    assert!(parse_datetime("not a date").is_err());
  }
}
