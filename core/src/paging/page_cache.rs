//! Bounded cache of loaded pages
//!
//! Closed pages are loaded on demand and kept in an LRU of fixed page
//! capacity. Eviction is explicit and deterministic; a cursor asking for an
//! evicted page triggers a synchronous reload from disk.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::page::PagedMessage;
use crate::Result;

/// Messages of one closed page, in message-number order
#[derive(Debug)]
pub struct PageCache {
    pub page_nr: u64,
    pub messages: Vec<Arc<PagedMessage>>,
}

impl PageCache {
    pub fn new(page_nr: u64, messages: Vec<PagedMessage>) -> Self {
        Self {
            page_nr,
            messages: messages.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCacheStats {
    pub cached_pages: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheEntries {
    pages: HashMap<u64, Arc<PageCache>>,
    lru_order: VecDeque<u64>,
}

#[derive(Debug)]
pub struct PageCacheManager {
    capacity: usize,
    entries: Mutex<CacheEntries>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl PageCacheManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(CacheEntries::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cached page, or the result of `load` inserted as most recent
    pub fn get_or_load<F>(&self, page_nr: u64, load: F) -> Result<Arc<PageCache>>
    where
        F: FnOnce() -> Result<Vec<PagedMessage>>,
    {
        {
            let mut entries = self.entries.lock();
            if let Some(cache) = entries.pages.get(&page_nr).cloned() {
                Self::touch(&mut entries.lru_order, page_nr);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cache);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let cache = Arc::new(PageCache::new(page_nr, load()?));
        trace!(page_nr, messages = cache.len(), "Page loaded into cache");

        self.put(page_nr, Arc::clone(&cache));
        Ok(cache)
    }

    /// Seed the cache with a page that was just closed
    pub fn insert(&self, page_nr: u64, messages: Vec<Arc<PagedMessage>>) {
        self.put(page_nr, Arc::new(PageCache { page_nr, messages }));
    }

    fn put(&self, page_nr: u64, cache: Arc<PageCache>) {
        let mut entries = self.entries.lock();
        entries.pages.insert(page_nr, cache);
        Self::touch(&mut entries.lru_order, page_nr);
        while entries.pages.len() > self.capacity {
            let Some(oldest) = entries.lru_order.pop_front() else {
                break;
            };
            entries.pages.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(page_nr = oldest, "Page evicted from cache");
        }
    }

    pub fn invalidate(&self, page_nr: u64) {
        let mut entries = self.entries.lock();
        if entries.pages.remove(&page_nr).is_some() {
            entries.lru_order.retain(|nr| *nr != page_nr);
        }
    }

    pub fn contains(&self, page_nr: u64) -> bool {
        self.entries.lock().pages.contains_key(&page_nr)
    }

    pub fn stats(&self) -> PageCacheStats {
        PageCacheStats {
            cached_pages: self.entries.lock().pages.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn touch(order: &mut VecDeque<u64>, page_nr: u64) {
        order.retain(|nr| *nr != page_nr);
        order.push_back(page_nr);
    }
}
