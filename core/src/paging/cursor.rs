//! Per-queue page cursors
//!
//! A cursor is the bookmark of one queue into its address's paged
//! sequence. It remembers the next position to read and, per page, how many
//! messages addressed to its queue were read and which of them have been
//! acknowledged. A page is complete for the cursor once it has been read to
//! the end and every message for the queue is acknowledged.
//!
//! Acks are durable: each one appends a [`PageAckRecord`] to storage. On
//! restart the records are replayed through [`PageCursor::recover_ack`] and
//! the cursor re-reads its pages from the start, skipping acked positions.
//! Messages delivered but unacknowledged before a crash are delivered again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::position::PagePosition;
use crate::storage::{RecordId, RecordKind, StorageManager, TxId};
use crate::Result;

/// Durable acknowledgement of a paged message by one queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAckRecord {
    pub queue_id: u64,
    pub page_nr: u64,
    pub message_nr: u32,
}

#[derive(Debug, Default)]
struct PageProgress {
    /// Messages for this queue read from the page so far
    for_queue: u32,
    acked: HashMap<u32, RecordId>,
    fully_read: bool,
}

impl PageProgress {
    fn is_complete(&self) -> bool {
        self.fully_read && self.acked.len() as u32 >= self.for_queue
    }
}

#[derive(Debug)]
struct CursorState {
    next: PagePosition,
    pages: BTreeMap<u64, PageProgress>,
}

pub struct PageCursor {
    queue_id: u64,
    storage: Arc<dyn StorageManager>,
    state: Mutex<CursorState>,
}

impl std::fmt::Debug for PageCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCursor")
            .field("queue_id", &self.queue_id)
            .field("next", &self.state.lock().next)
            .finish()
    }
}

impl PageCursor {
    pub fn new(queue_id: u64, storage: Arc<dyn StorageManager>, start: PagePosition) -> Self {
        Self {
            queue_id,
            storage,
            state: Mutex::new(CursorState {
                next: start,
                pages: BTreeMap::new(),
            }),
        }
    }

    pub fn queue_id(&self) -> u64 {
        self.queue_id
    }

    pub fn next_position(&self) -> PagePosition {
        self.state.lock().next
    }

    pub(crate) fn set_next(&self, position: PagePosition) {
        self.state.lock().next = position;
    }

    pub(crate) fn is_acked(&self, position: &PagePosition) -> bool {
        self.state
            .lock()
            .pages
            .get(&position.page_nr)
            .is_some_and(|p| p.acked.contains_key(&position.message_nr))
    }

    /// Advance past `position`, counting it when it is addressed to this queue
    pub(crate) fn record_read(&self, position: PagePosition, for_queue: bool) {
        let mut state = self.state.lock();
        state.next = position.next_message();
        if for_queue {
            state.pages.entry(position.page_nr).or_default().for_queue += 1;
        }
    }

    /// The cursor reached the end of a closed page
    pub(crate) fn mark_fully_read(&self, page_nr: u64) {
        let mut state = self.state.lock();
        state.pages.entry(page_nr).or_default().fully_read = true;
        let next_page = PagePosition::new(page_nr, 0).next_page();
        if state.next < next_page {
            state.next = next_page;
        }
    }

    /// Write the ack record, inside `tx` when given
    pub fn persist_ack(&self, position: &PagePosition, tx: Option<TxId>) -> Result<RecordId> {
        let record = PageAckRecord {
            queue_id: self.queue_id,
            page_nr: position.page_nr,
            message_nr: position.message_nr,
        };
        let payload = Bytes::from(serde_json::to_vec(&record)?);
        self.storage.append(RecordKind::PageAck, payload, tx)
    }

    /// Apply a persisted ack; true when it completed the page
    pub fn complete_ack(&self, position: &PagePosition, record_id: RecordId) -> bool {
        let mut state = self.state.lock();
        let progress = state.pages.entry(position.page_nr).or_default();
        progress.acked.insert(position.message_nr, record_id);
        trace!(
            queue_id = self.queue_id,
            position = %position,
            "Paged message acknowledged"
        );
        progress.is_complete()
    }

    /// Replay an ack record found in storage at startup
    pub fn recover_ack(&self, position: &PagePosition, record_id: RecordId) {
        self.state
            .lock()
            .pages
            .entry(position.page_nr)
            .or_default()
            .acked
            .insert(position.message_nr, record_id);
    }

    pub fn is_page_complete(&self, page_nr: u64) -> bool {
        let state = self.state.lock();
        match state.pages.get(&page_nr) {
            Some(progress) => progress.is_complete(),
            None => page_nr < state.next.page_nr,
        }
    }

    /// Forget a deleted page, returning its ack record ids for cleanup
    pub(crate) fn take_page_acks(&self, page_nr: u64) -> Vec<RecordId> {
        self.state
            .lock()
            .pages
            .remove(&page_nr)
            .map(|p| p.acked.into_values().collect())
            .unwrap_or_default()
    }

    pub fn acked_count(&self) -> usize {
        self.state.lock().pages.values().map(|p| p.acked.len()).sum()
    }
}
