//! Rendered page cache
//!
//! Byte-cost bounded LRU keyed by page index. Evicted entries are released
//! inside the call that evicts them, so the sum of live entry costs never
//! exceeds the capacity.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::render::RenderedPage;

/// Cache generation; advanced by every clear
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheEpoch(u64);

/// Result of an insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored, after evicting this many entries
    Inserted { evicted: usize },
    /// Larger than the whole cache; released immediately
    Rejected,
    /// Rendered before the last clear; released immediately
    Stale,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejections: u64,
}

struct CacheEntry {
    page: Arc<RenderedPage>,
    cost: u64,
}

struct CacheInner {
    entries: LruCache<usize, CacheEntry>,
    used_bytes: u64,
    epoch: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejections: u64,
}

impl CacheInner {
    fn evict_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((index, entry)) => {
                self.used_bytes -= entry.cost;
                self.evictions += 1;
                tracing::debug!("Evicted page {} ({} bytes)", index, entry.cost);
                true
            }
            None => false,
        }
    }
}

/// LRU cache of rendered pages for one document
pub struct PageCache {
    capacity: u64,
    inner: Mutex<CacheInner>,
}

impl PageCache {
    /// Cache holding at most `capacity` bytes of bitmaps
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                used_bytes: 0,
                epoch: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                rejections: 0,
            }),
        }
    }

    /// Cache sized as a fraction of a memory budget
    pub fn with_budget(budget_bytes: u64, fraction: f64) -> Self {
        let capacity = (budget_bytes as f64 * fraction.clamp(0.0, 1.0)) as u64;
        tracing::debug!("Page cache capacity {} bytes", capacity);
        Self::with_capacity(capacity)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Look up a page, promoting it to most recently used
    pub fn get(&self, index: usize) -> Option<Arc<RenderedPage>> {
        let mut inner = self.inner.lock();
        match inner.entries.get(&index).map(|entry| Arc::clone(&entry.page)) {
            Some(page) => {
                inner.hits += 1;
                Some(page)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Look up a page without touching recency or statistics
    pub fn peek(&self, index: usize) -> Option<Arc<RenderedPage>> {
        self.inner
            .lock()
            .entries
            .peek(&index)
            .map(|entry| Arc::clone(&entry.page))
    }

    /// Whether a page is cached, without touching recency
    pub fn contains(&self, index: usize) -> bool {
        self.inner.lock().entries.contains(&index)
    }

    /// Current generation, captured before a render starts
    pub fn epoch(&self) -> CacheEpoch {
        CacheEpoch(self.inner.lock().epoch)
    }

    /// Insert a page, evicting least recently used entries until it fits
    pub fn put(&self, index: usize, page: Arc<RenderedPage>) -> PutOutcome {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, index, page)
    }

    /// Insert only if no clear happened since `epoch` was captured
    pub fn put_in_epoch(&self, epoch: CacheEpoch, index: usize, page: Arc<RenderedPage>) -> PutOutcome {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch.0 {
            tracing::debug!("Discarding page {} rendered before cache clear", index);
            return PutOutcome::Stale;
        }
        self.insert_locked(&mut inner, index, page)
    }

    fn insert_locked(&self, inner: &mut CacheInner, index: usize, page: Arc<RenderedPage>) -> PutOutcome {
        let cost = page.byte_cost();
        if cost > self.capacity {
            inner.rejections += 1;
            tracing::debug!(
                "Page {} ({} bytes) exceeds cache capacity {}",
                index,
                cost,
                self.capacity
            );
            return PutOutcome::Rejected;
        }

        if let Some(previous) = inner.entries.pop(&index) {
            inner.used_bytes -= previous.cost;
        }

        let mut evicted = 0;
        while inner.used_bytes + cost > self.capacity && inner.evict_lru() {
            evicted += 1;
        }

        inner.entries.push(index, CacheEntry { page, cost });
        inner.used_bytes += cost;
        PutOutcome::Inserted { evicted }
    }

    /// Evict least recently used entries until at most `bytes` remain
    pub fn trim_to(&self, bytes: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut evicted = 0;
        while inner.used_bytes > bytes && inner.evict_lru() {
            evicted += 1;
        }
        evicted
    }

    /// Release every entry and start a new epoch
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let released = inner.entries.len();
        inner.entries.clear();
        inner.used_bytes = 0;
        inner.epoch += 1;
        if released > 0 {
            tracing::debug!("Cleared {} cached pages", released);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            used_bytes: inner.used_bytes,
            capacity_bytes: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            rejections: inner.rejections,
        }
    }
}
