//! Per-address paging store
//!
//! Tracks the in-memory size of an address and decides, per routed
//! message, whether it stays in memory, goes to a page or is dropped,
//! according to the address full policy. While paging, every new message
//! for the address is appended to the live page; queues pull messages back
//! through their cursors as they drain ("depaging"). Paging stops once the
//! address is below its limit again and every cursor has read the whole
//! paged sequence, so memory and pages never interleave out of order.
//!
//! Producer credits flow through here too: under BLOCK they are withheld
//! while the address is full, under PAGE while the page files exceed
//! `max_page_store_bytes`. Withheld grants are released as memory drains
//! or completed pages are deleted.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::cursor::PageCursor;
use super::page::{delete_page, list_pages, page_file_size, read_page, Page, PagedMessage};
use super::page_cache::PageCacheManager;
use super::position::PagePosition;
use crate::config::{AddressFullPolicy, AddressSettings};
use crate::protocol::Message;
use crate::storage::{RecordId, StorageManager};
use crate::Result;

/// Callback granting producer credits
pub type CreditGrant = Box<dyn FnOnce(i32) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Enqueue in memory
    Memory,
    /// Written to a page; queues will depage it
    Paged,
    /// Discarded under the DROP policy
    Dropped,
}

struct LivePage {
    page: Page,
    messages: Vec<Arc<PagedMessage>>,
}

struct PagingInner {
    paging: bool,
    closed_pages: BTreeSet<u64>,
    live: Option<LivePage>,
    next_page_nr: u64,
    page_store_bytes: u64,
    cursors: HashMap<u64, Arc<PageCursor>>,
    deferred_credits: VecDeque<(i32, CreditGrant)>,
}

pub struct PagingStore {
    address: String,
    directory: PathBuf,
    settings: AddressSettings,
    storage: Arc<dyn StorageManager>,
    cache: PageCacheManager,
    address_size: AtomicI64,
    inner: Mutex<PagingInner>,
}

impl std::fmt::Debug for PagingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagingStore")
            .field("address", &self.address)
            .field("directory", &self.directory)
            .field("address_size", &self.address_size())
            .finish()
    }
}

impl PagingStore {
    /// Open the store for `address`, resuming paging if page files exist
    pub fn open(
        address: impl Into<String>,
        directory: PathBuf,
        settings: AddressSettings,
        storage: Arc<dyn StorageManager>,
    ) -> Result<Self> {
        let address = address.into();
        let existing = list_pages(&directory)?;
        let page_store_bytes = existing
            .iter()
            .map(|nr| page_file_size(&directory, *nr))
            .sum();
        let next_page_nr = existing.last().map_or(1, |last| last + 1);
        let paging = !existing.is_empty();
        if paging {
            info!(
                address = %address,
                pages = existing.len(),
                "Resuming paging from existing page files"
            );
        }

        Ok(Self {
            cache: PageCacheManager::new(settings.page_cache_max_pages),
            address,
            directory,
            settings,
            storage,
            address_size: AtomicI64::new(0),
            inner: Mutex::new(PagingInner {
                paging,
                closed_pages: existing.into_iter().collect(),
                live: None,
                next_page_nr,
                page_store_bytes,
                cursors: HashMap::new(),
                deferred_credits: VecDeque::new(),
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn settings(&self) -> &AddressSettings {
        &self.settings
    }

    pub fn is_paging(&self) -> bool {
        self.inner.lock().paging
    }

    pub fn address_size(&self) -> i64 {
        self.address_size.load(Ordering::Acquire)
    }

    pub fn page_store_bytes(&self) -> u64 {
        self.inner.lock().page_store_bytes
    }

    /// Pages on disk, the live page included
    pub fn page_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.closed_pages.len() + usize::from(inner.live.is_some())
    }

    pub fn deferred_credit_requests(&self) -> usize {
        self.inner.lock().deferred_credits.len()
    }

    pub fn cache_stats(&self) -> super::page_cache::PageCacheStats {
        self.cache.stats()
    }

    /// Cursor of `queue_id`, created at the first paged position if absent
    pub fn cursor(&self, queue_id: u64) -> Arc<PageCursor> {
        let mut inner = self.inner.lock();
        if let Some(cursor) = inner.cursors.get(&queue_id) {
            return Arc::clone(cursor);
        }
        let first_page = inner
            .closed_pages
            .iter()
            .next()
            .copied()
            .or_else(|| inner.live.as_ref().map(|l| l.page.page_nr()))
            .unwrap_or(inner.next_page_nr);
        let cursor = Arc::new(PageCursor::new(
            queue_id,
            Arc::clone(&self.storage),
            PagePosition::new(first_page, 0),
        ));
        inner.cursors.insert(queue_id, Arc::clone(&cursor));
        cursor
    }

    /// Drop a deleted queue's cursor; pages only it was holding are removed
    pub fn remove_cursor(&self, queue_id: u64) -> Result<()> {
        let released = {
            let mut inner = self.inner.lock();
            let Some(cursor) = inner.cursors.remove(&queue_id) else {
                return Ok(());
            };
            let mut stale = Vec::new();
            for page_nr in inner.closed_pages.clone() {
                stale.extend(cursor.take_page_acks(page_nr));
            }
            for id in stale {
                self.storage.delete(id, None)?;
            }
            for page_nr in inner.closed_pages.clone() {
                self.try_delete_page_locked(&mut inner, page_nr)?;
            }
            self.releasable_credits_locked(&mut inner)
        };
        release(released);
        Ok(())
    }

    /// Decide where a message routed to `queue_ids` goes
    pub fn admit(&self, message: &Message, queue_ids: &[u64]) -> Result<Admission> {
        let mut inner = self.inner.lock();
        let max = self.settings.max_size_bytes;
        if max < 0 && !inner.paging {
            return Ok(Admission::Memory);
        }

        let incoming = message.encoded_size() as i64 * queue_ids.len() as i64;
        let full = max >= 0 && self.address_size() + incoming > max;

        if inner.paging {
            if !full && Self::cursors_caught_up(&inner) {
                self.stop_paging_locked(&mut inner);
                return Ok(Admission::Memory);
            }
            self.write_locked(&mut inner, message, queue_ids)?;
            return Ok(Admission::Paged);
        }

        if !full {
            return Ok(Admission::Memory);
        }

        match self.settings.address_full_policy {
            AddressFullPolicy::Page => {
                inner.paging = true;
                info!(
                    address = %self.address,
                    address_size = self.address_size(),
                    max_size_bytes = max,
                    "Address is full, starting to page"
                );
                self.write_locked(&mut inner, message, queue_ids)?;
                Ok(Admission::Paged)
            }
            AddressFullPolicy::Drop => {
                debug!(address = %self.address, "Address is full, dropping message");
                Ok(Admission::Dropped)
            }
            AddressFullPolicy::Block => Ok(Admission::Memory),
        }
    }

    /// Account bytes entering (positive) or leaving (negative) memory
    pub fn add_size(&self, delta: i64) {
        let size = self.address_size.fetch_add(delta, Ordering::AcqRel) + delta;
        if size < 0 {
            warn!(address = %self.address, size, "Address size went negative");
        }
        if delta < 0 {
            let released = {
                let mut inner = self.inner.lock();
                self.releasable_credits_locked(&mut inner)
            };
            release(released);
        }
    }

    /// Grant producer credits now, or defer them while the policy says so
    pub fn request_credits(&self, credits: i32, grant: CreditGrant) {
        let mut inner = self.inner.lock();
        if self.should_defer_credits(&inner) {
            trace!(address = %self.address, credits, "Deferring producer credits");
            inner.deferred_credits.push_back((credits, grant));
            return;
        }
        drop(inner);
        grant(credits);
    }

    /// Next unacknowledged message for `cursor`, reading pages in order
    pub fn read_next(
        &self,
        cursor: &PageCursor,
    ) -> Result<Option<(PagePosition, Arc<PagedMessage>)>> {
        let mut inner = self.inner.lock();
        let result = loop {
            let position = cursor.next_position();
            let live_nr = inner.live.as_ref().map(|l| l.page.page_nr());

            let present =
                inner.closed_pages.contains(&position.page_nr) || live_nr == Some(position.page_nr);
            if !present {
                let following = inner
                    .closed_pages
                    .range(position.page_nr..)
                    .next()
                    .copied()
                    .or_else(|| live_nr.filter(|nr| *nr >= position.page_nr));
                match following {
                    Some(page_nr) => {
                        cursor.set_next(PagePosition::new(page_nr, 0));
                        continue;
                    }
                    None => break None,
                }
            }

            let candidate = if live_nr == Some(position.page_nr) {
                let live = inner.live.as_ref().and_then(|l| {
                    l.messages.get(position.message_nr as usize).cloned()
                });
                match live {
                    Some(paged) => paged,
                    None => break None,
                }
            } else {
                let page_nr = position.page_nr;
                let directory = &self.directory;
                let cache = self
                    .cache
                    .get_or_load(page_nr, || read_page(directory, page_nr))?;
                match cache.messages.get(position.message_nr as usize) {
                    Some(paged) => Arc::clone(paged),
                    None => {
                        cursor.mark_fully_read(page_nr);
                        self.try_delete_page_locked(&mut inner, page_nr)?;
                        continue;
                    }
                }
            };

            let for_queue = candidate.is_for(cursor.queue_id());
            let acked = cursor.is_acked(&position);
            cursor.record_read(position, for_queue);
            if for_queue && !acked {
                break Some((position, candidate));
            }
        };

        let released = self.releasable_credits_locked(&mut inner);
        drop(inner);
        release(released);
        Ok(result)
    }

    /// A paged message was acknowledged; its page may now be deletable
    pub fn page_acked(&self, page_nr: u64) -> Result<()> {
        let released = {
            let mut inner = self.inner.lock();
            self.try_delete_page_locked(&mut inner, page_nr)?;
            self.releasable_credits_locked(&mut inner)
        };
        release(released);
        Ok(())
    }

    /// Replay an ack record. Acks for pages that no longer exist are stale
    /// and their records are deleted.
    pub fn recover_ack(&self, queue_id: u64, position: PagePosition, record_id: RecordId) -> Result<()> {
        let exists = self.inner.lock().closed_pages.contains(&position.page_nr);
        if exists {
            self.cursor(queue_id).recover_ack(&position, record_id);
        } else {
            debug!(
                address = %self.address,
                position = %position,
                "Removing ack record for deleted page"
            );
            self.storage.delete(record_id, None)?;
        }
        Ok(())
    }

    /// Flush the live page to disk
    pub fn sync(&self) -> Result<()> {
        if let Some(live) = self.inner.lock().live.as_mut() {
            live.page.sync()?;
        }
        Ok(())
    }

    fn cursors_caught_up(inner: &PagingInner) -> bool {
        inner.cursors.values().all(|cursor| {
            let next = cursor.next_position();
            match &inner.live {
                Some(live) => {
                    next >= PagePosition::new(live.page.page_nr(), live.page.message_count())
                }
                None => inner
                    .closed_pages
                    .iter()
                    .next_back()
                    .map_or(true, |last| next.page_nr > *last),
            }
        })
    }

    fn stop_paging_locked(&self, inner: &mut PagingInner) {
        self.close_live_locked(inner);
        inner.paging = false;
        info!(address = %self.address, "Address stopped paging");
    }

    fn close_live_locked(&self, inner: &mut PagingInner) {
        if let Some(mut live) = inner.live.take() {
            if let Err(e) = live.page.sync() {
                warn!(page_nr = live.page.page_nr(), error = %e, "Failed to sync page on close");
            }
            let page_nr = live.page.page_nr();
            self.cache.insert(page_nr, live.messages);
            inner.closed_pages.insert(page_nr);
            debug!(address = %self.address, page_nr, "Page closed");
        }
    }

    fn write_locked(
        &self,
        inner: &mut PagingInner,
        message: &Message,
        queue_ids: &[u64],
    ) -> Result<()> {
        if inner.live.is_none() {
            let page = Page::create(&self.directory, inner.next_page_nr)?;
            inner.next_page_nr += 1;
            inner.live = Some(LivePage {
                page,
                messages: Vec::new(),
            });
        }

        let paged = PagedMessage {
            message: message.clone(),
            queue_ids: queue_ids.to_vec(),
        };
        let mut rollover = false;
        if let Some(live) = inner.live.as_mut() {
            let before = live.page.size();
            let message_nr = live.page.write(&paged)?;
            live.messages.push(Arc::new(paged));
            inner.page_store_bytes += live.page.size() - before;
            rollover = live.page.size() >= self.settings.page_size_bytes;
            trace!(
                address = %self.address,
                page_nr = live.page.page_nr(),
                message_nr,
                "Message paged"
            );
        }
        if rollover {
            self.close_live_locked(inner);
        }
        Ok(())
    }

    fn try_delete_page_locked(&self, inner: &mut PagingInner, page_nr: u64) -> Result<()> {
        if !inner.closed_pages.contains(&page_nr) {
            return Ok(());
        }
        if !inner.cursors.values().all(|c| c.is_page_complete(page_nr)) {
            return Ok(());
        }

        let mut ack_records = Vec::new();
        for cursor in inner.cursors.values() {
            ack_records.extend(cursor.take_page_acks(page_nr));
        }

        let size = page_file_size(&self.directory, page_nr);
        delete_page(&self.directory, page_nr)?;
        inner.closed_pages.remove(&page_nr);
        inner.page_store_bytes = inner.page_store_bytes.saturating_sub(size);
        self.cache.invalidate(page_nr);

        for id in ack_records {
            self.storage.delete(id, None)?;
        }

        debug!(
            address = %self.address,
            page_nr,
            remaining = inner.closed_pages.len(),
            "Completed page deleted"
        );
        Ok(())
    }

    fn should_defer_credits(&self, inner: &PagingInner) -> bool {
        match self.settings.address_full_policy {
            AddressFullPolicy::Block => {
                self.settings.max_size_bytes >= 0
                    && self.address_size() >= self.settings.max_size_bytes
            }
            AddressFullPolicy::Page => {
                self.settings.max_page_store_bytes > 0
                    && inner.page_store_bytes >= self.settings.max_page_store_bytes
            }
            AddressFullPolicy::Drop => false,
        }
    }

    fn releasable_credits_locked(&self, inner: &mut PagingInner) -> Vec<(i32, CreditGrant)> {
        if inner.deferred_credits.is_empty() || self.should_defer_credits(inner) {
            return Vec::new();
        }
        inner.deferred_credits.drain(..).collect()
    }
}

fn release(grants: Vec<(i32, CreditGrant)>) {
    for (credits, grant) in grants {
        grant(credits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorageManager;
    use bytes::Bytes;
    use std::sync::atomic::AtomicI32;
    use tempfile::tempdir;

    fn settings(policy: AddressFullPolicy, max: i64) -> AddressSettings {
        AddressSettings {
            max_size_bytes: max,
            page_size_bytes: 1024,
            address_full_policy: policy,
            max_page_store_bytes: 0,
            page_cache_max_pages: 2,
            ..AddressSettings::default()
        }
    }

    fn message(i: usize) -> Message {
        Message::new("orders", Bytes::from(vec![b'x'; 100])).with_property("seq", i as i64)
    }

    fn seq(paged: &PagedMessage) -> i64 {
        match paged.message.property("seq") {
            Some(crate::protocol::PropertyValue::Long(v)) => *v,
            other => panic!("unexpected seq {other:?}"),
        }
    }

    fn open(dir: &Path, settings: AddressSettings) -> (PagingStore, Arc<InMemoryStorageManager>) {
        let storage = Arc::new(InMemoryStorageManager::new());
        let store = PagingStore::open("orders", dir.to_path_buf(), settings, storage.clone()).unwrap();
        (store, storage)
    }

    #[test]
    fn test_memory_until_full_then_page() {
        let dir = tempdir().unwrap();
        let (store, _) = open(dir.path(), settings(AddressFullPolicy::Page, 500));
        let cursor = store.cursor(1);

        let size = message(0).encoded_size() as i64;
        let mut paged = 0;
        for i in 0..10 {
            match store.admit(&message(i), &[1]).unwrap() {
                Admission::Memory => store.add_size(size),
                Admission::Paged => paged += 1,
                Admission::Dropped => panic!("page policy never drops"),
            }
        }
        assert!(store.is_paging());
        assert!(paged > 0);
        assert!(store.page_count() >= 1);

        let mut read = Vec::new();
        while let Some((_, msg)) = store.read_next(&cursor).unwrap() {
            read.push(seq(&msg));
        }
        assert_eq!(read.len(), paged);
        assert!(read.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_drop_policy() {
        let dir = tempdir().unwrap();
        let (store, _) = open(dir.path(), settings(AddressFullPolicy::Drop, 200));
        assert_eq!(store.admit(&message(0), &[1]).unwrap(), Admission::Memory);
        store.add_size(message(0).encoded_size() as i64);
        assert_eq!(store.admit(&message(1), &[1]).unwrap(), Admission::Dropped);
        assert!(!store.is_paging());
    }

    #[test]
    fn test_block_policy_defers_credits_until_drained() {
        let dir = tempdir().unwrap();
        let (store, _) = open(dir.path(), settings(AddressFullPolicy::Block, 100));
        let granted = Arc::new(AtomicI32::new(0));

        store.add_size(150);
        let g = granted.clone();
        store.request_credits(
            64,
            Box::new(move |c| {
                g.fetch_add(c, Ordering::SeqCst);
            }),
        );
        assert_eq!(granted.load(Ordering::SeqCst), 0);
        assert_eq!(store.deferred_credit_requests(), 1);

        store.add_size(-100);
        assert_eq!(granted.load(Ordering::SeqCst), 64);
        assert_eq!(store.deferred_credit_requests(), 0);
    }

    #[test]
    fn test_pages_deleted_after_acks_and_paging_stops() {
        let dir = tempdir().unwrap();
        let (store, storage) = open(dir.path(), settings(AddressFullPolicy::Page, 0));
        let cursor = store.cursor(1);

        for i in 0..25 {
            assert_eq!(store.admit(&message(i), &[1]).unwrap(), Admission::Paged);
        }
        assert!(store.page_count() > 1);

        while let Some((position, _)) = store.read_next(&cursor).unwrap() {
            let id = cursor.persist_ack(&position, None).unwrap();
            if cursor.complete_ack(&position, id) {
                store.page_acked(position.page_nr).unwrap();
            }
        }

        // Only the live page remains; its acks stay until it is closed.
        assert_eq!(store.page_count(), 1);
        assert!(storage.record_count() > 0);

        let big = AddressSettings {
            max_size_bytes: 1_000_000,
            ..settings(AddressFullPolicy::Page, 0)
        };
        drop(store);
        let store = PagingStore::open("orders", dir.path().to_path_buf(), big, storage.clone()).unwrap();
        assert!(store.is_paging());
        let cursor = store.cursor(1);
        for record in storage.load_committed().unwrap() {
            let ack: crate::paging::PageAckRecord = serde_json::from_slice(&record.payload).unwrap();
            store
                .recover_ack(ack.queue_id, PagePosition::new(ack.page_nr, ack.message_nr), record.id)
                .unwrap();
        }
        assert!(store.read_next(&cursor).unwrap().is_none());
        assert_eq!(store.page_count(), 0);
        assert_eq!(storage.record_count(), 0);
        assert_eq!(store.admit(&message(99), &[1]).unwrap(), Admission::Memory);
        assert!(!store.is_paging());
    }

    #[test]
    fn test_cursor_only_sees_its_queue() {
        let dir = tempdir().unwrap();
        let (store, _) = open(dir.path(), settings(AddressFullPolicy::Page, 0));
        let first = store.cursor(1);
        let second = store.cursor(2);

        store.admit(&message(0), &[1]).unwrap();
        store.admit(&message(1), &[1, 2]).unwrap();
        store.admit(&message(2), &[2]).unwrap();

        let mut seen_first = Vec::new();
        while let Some((_, m)) = store.read_next(&first).unwrap() {
            seen_first.push(seq(&m));
        }
        let mut seen_second = Vec::new();
        while let Some((_, m)) = store.read_next(&second).unwrap() {
            seen_second.push(seq(&m));
        }
        assert_eq!(seen_first, vec![0, 1]);
        assert_eq!(seen_second, vec![1, 2]);
    }

    #[test]
    fn test_evicted_page_reloads_in_order() {
        let dir = tempdir().unwrap();
        let mut s = settings(AddressFullPolicy::Page, 0);
        s.page_size_bytes = 200;
        s.page_cache_max_pages = 1;
        let (store, _) = open(dir.path(), s);
        let cursor = store.cursor(1);
        let other = store.cursor(2);

        for i in 0..12 {
            store.admit(&message(i), &[1, 2]).unwrap();
        }
        // Reading with another cursor churns the single-page cache.
        while store.read_next(&other).unwrap().is_some() {}

        let mut seen = Vec::new();
        while let Some((_, m)) = store.read_next(&cursor).unwrap() {
            seen.push(seq(&m));
        }
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        assert!(store.cache_stats().evictions > 0);
    }

    #[test]
    fn test_remove_cursor_releases_pages() {
        let dir = tempdir().unwrap();
        let mut s = settings(AddressFullPolicy::Page, 0);
        s.page_size_bytes = 200;
        let (store, _) = open(dir.path(), s);
        store.cursor(1);
        for i in 0..6 {
            store.admit(&message(i), &[1]).unwrap();
        }
        let before = store.page_count();
        assert!(before > 1);
        store.remove_cursor(1).unwrap();
        assert_eq!(store.page_count(), 0);
        assert_eq!(store.page_store_bytes(), 0);
    }
}
