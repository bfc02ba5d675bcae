use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::render::compile::CompiledSkeleton;
use crate::Result;

/// Cache key of a compiled template skeleton. Schema revision is part of
/// the key so a vocabulary upgrade never serves stale markup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub version_id: Uuid,
    pub content_hash: String,
    pub schema_revision: String,
}

struct CachedEntry {
    skeleton: Arc<CompiledSkeleton>,
    inserted: Instant,
}

/// LRU + TTL cache of compiled template skeletons with singleflight
/// compute: at most one concurrent compilation per key; latecomers wait
/// and then read the fresh entry.
pub struct CompiledTemplateCache {
    entries: Mutex<LruCache<CacheKey, CachedEntry>>,
    inflight: tokio::sync::Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    ttl: Duration,
}

impl CompiledTemplateCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<CompiledSkeleton>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                Some(Arc::clone(&entry.skeleton))
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Returns the cached skeleton or computes it exactly once, even
    /// under concurrent callers for the same key.
    pub async fn get_or_compute<F>(&self, key: CacheKey, compute: F) -> Result<Arc<CompiledSkeleton>>
    where
        F: AsyncFnOnce() -> Result<CompiledSkeleton>,
    {
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }
        let gate = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(inflight.entry(key.clone()).or_default())
        };
        let _guard = gate.lock().await;
        // A winner may have filled the entry while this caller waited.
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }
        let result = compute().await;
        if let Ok(skeleton) = &result {
            let skeleton = Arc::new(skeleton.clone());
            self.entries.lock().put(
                key.clone(),
                CachedEntry {
                    skeleton: Arc::clone(&skeleton),
                    inserted: Instant::now(),
                },
            );
            self.inflight.lock().await.remove(&key);
            return Ok(skeleton);
        }
        self.inflight.lock().await.remove(&key);
        result.map(Arc::new)
    }

    /// Drops every entry belonging to a version, called when the version
    /// is republished.
    pub fn invalidate_version(&self, version_id: Uuid) {
        let mut entries = self.entries.lock();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(k, _)| k.version_id == version_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
