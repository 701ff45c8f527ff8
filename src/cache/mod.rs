//! Versioned bucket storage for cached responses.
//!
//! A storage backend holds named buckets. Each bucket maps a request identity
//! (method + URL) to a stored response. The worker owns one [`Bucket`] handle
//! for the current version and uses the backend directly to find and drop
//! buckets left behind by older versions.

mod bucket;
mod storage;
mod traits;

pub use bucket::{bucket_name, is_owned_by, Bucket};
pub use storage::{MemoryStorage, SqliteStorage};

#[cfg(test)]
pub use storage::FailingStorage;
pub use traits::CacheStorage;
