use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::model::Document;

/// Assumed average document footprint used to derive an entry capacity from a
/// megabyte budget.
const ASSUMED_ENTRY_KILOBYTES: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    lru: LruCache<String, Document>,
    hits: u64,
    misses: u64,
}

/// Bounded LRU cache in front of the store's read path. All operations are
/// mutually exclusive; a write-through `set` promotes to most-recently-used
/// and eviction drops the least-recently-used entry.
pub struct DocumentCache {
    inner: Mutex<CacheInner>,
}

impl DocumentCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Capacity derived from a megabyte budget at ~10 KB per entry.
    pub fn with_budget_mb(megabytes: usize) -> Self {
        Self::new(megabytes.max(1) * 1024 / ASSUMED_ENTRY_KILOBYTES)
    }

    pub fn get(&self, collection: &str, key: &str) -> Option<Document> {
        let mut inner = self.inner.lock().unwrap();
        let cache_key = format!("{collection}:{key}");
        match inner.lru.get(&cache_key).cloned() {
            Some(doc) => {
                inner.hits += 1;
                Some(doc)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, document: Document) {
        let mut inner = self.inner.lock().unwrap();
        inner.lru.put(document.cache_key(), document);
    }

    pub fn remove(&self, collection: &str, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.lru.pop(&format!("{collection}:{key}"));
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.lru.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.lru.len(),
            capacity: inner.lru.cap().get(),
        }
    }
}
