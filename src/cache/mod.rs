//! Persistent key → result caches shared by the geocoders and the
//! geography resolver.
//!
//! Clients receive a cache as `Arc<dyn CacheStore<V>>`; the on-disk
//! implementation is [`FileCache`], a CSV table rewritten atomically on flush.

mod file;

pub use file::FileCache;

use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PipelineError;

/// A row that can live in a cache table.
pub trait CacheEntry: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Key this entry is stored under
    fn cache_key(&self) -> String;
}

/// Key → result mapping with explicit durability.
pub trait CacheStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;

    fn put(&self, key: String, value: V);

    /// Persist every entry inserted so far.
    fn flush(&self) -> Result<(), PipelineError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// Run [`CacheStore::flush`] on the blocking pool so a large table rewrite
/// does not stall the runtime's worker threads.
pub async fn flush_blocking<V: 'static>(
    cache: &Arc<dyn CacheStore<V>>,
) -> anyhow::Result<()> {
    let cache = Arc::clone(cache);
    tokio::task::spawn_blocking(move || cache.flush())
        .await
        .context("Cache flush task panicked")??;
    Ok(())
}
