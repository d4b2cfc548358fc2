//! Queues and message references
//!
//! A queue holds [`MessageReference`]s in a [`PriorityLinkedList`] and
//! pushes them to its consumers round-robin. A consumer answers each offer
//! with a [`HandleStatus`]: busy consumers (out of credit) are skipped for
//! the rest of the pass, consumers whose filter rejects a message leave it
//! for the others. Messages nobody matches stay queued in place.
//!
//! References leave the list when delivered and are tracked by the
//! consumer until acknowledged or cancelled. A cancelled reference returns
//! to the head of its priority level so redelivery keeps the original
//! order.
//!
//! Paged messages are pulled back through the queue's [`PageCursor`] as
//! consumers drain it: never without a consumer, never past the address
//! limit unless the queue holds nothing, and never more than
//! `max_depaged_messages` at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::filter::Filter;
use super::priority::PriorityLinkedList;
use crate::metrics::MetricsRegistry;
use crate::paging::{PageCursor, PagePosition, PagingStore};
use crate::protocol::Message;
use crate::storage::{RecordId, StorageManager, TxId};
use crate::Result;

const PRIORITY_LEVELS: usize = 10;

/// A message as seen by one queue
#[derive(Debug, Clone)]
pub struct MessageReference {
    pub message: Arc<Message>,
    /// Deliveries so far, including the one in progress
    pub delivery_count: u32,
    /// Per-queue durable message record
    pub record_id: Option<RecordId>,
    /// Set for references depaged from disk
    pub page_position: Option<PagePosition>,
}

impl MessageReference {
    pub fn new(message: Arc<Message>) -> Self {
        Self {
            message,
            delivery_count: 0,
            record_id: None,
            page_position: None,
        }
    }

    /// Bytes this reference accounts against its address
    pub fn size(&self) -> i64 {
        self.message.encoded_size() as i64
    }

    pub fn message_id(&self) -> u64 {
        self.message.message_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    /// The consumer took the message
    Handled,
    /// No credit or stopped; skip this consumer for the rest of the pass
    Busy,
    /// The consumer's filter rejects the message
    NoMatch,
}

/// Something a queue can deliver to
pub trait Consumer: Send + Sync {
    fn id(&self) -> u64;

    /// Offered under the queue lock; must not call back into the queue
    fn handle(&self, reference: &MessageReference) -> HandleStatus;

    /// Handled references are acknowledged by the queue straight away
    fn pre_acknowledge(&self) -> bool {
        false
    }
}

/// Persistent description of a queue; also the binding record payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub filter: Option<String>,
    pub durable: bool,
    pub temporary: bool,
}

struct QueueInner {
    messages: PriorityLinkedList<MessageReference>,
    consumers: Vec<Arc<dyn Consumer>>,
    position: usize,
    delivering: usize,
    depaged: usize,
}

pub struct Queue {
    definition: QueueDefinition,
    filter: Option<Filter>,
    binding_record: Option<RecordId>,
    storage: Arc<dyn StorageManager>,
    paging_store: Arc<PagingStore>,
    cursor: Arc<PageCursor>,
    metrics: Arc<MetricsRegistry>,
    inner: Mutex<QueueInner>,
    deleted: AtomicBool,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.definition.name)
            .field("address", &self.definition.address)
            .field("message_count", &self.message_count())
            .finish()
    }
}

impl Queue {
    pub fn new(
        definition: QueueDefinition,
        binding_record: Option<RecordId>,
        storage: Arc<dyn StorageManager>,
        paging_store: Arc<PagingStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let filter = Filter::from_option(definition.filter.as_deref())?;
        let cursor = paging_store.cursor(definition.id);
        Ok(Self {
            definition,
            filter,
            binding_record,
            storage,
            paging_store,
            cursor,
            metrics,
            inner: Mutex::new(QueueInner {
                messages: PriorityLinkedList::new(PRIORITY_LEVELS),
                consumers: Vec::new(),
                position: 0,
                delivering: 0,
                depaged: 0,
            }),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn address(&self) -> &str {
        &self.definition.address
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn is_durable(&self) -> bool {
        self.definition.durable
    }

    pub fn is_temporary(&self) -> bool {
        self.definition.temporary
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Queued plus delivered-but-unacknowledged references
    pub fn message_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.messages.len() + inner.delivering
    }

    pub fn delivering_count(&self) -> usize {
        self.inner.lock().delivering
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    pub fn paging_store(&self) -> &Arc<PagingStore> {
        &self.paging_store
    }

    /// Queued references in delivery order, without removing them
    pub fn browse(&self) -> Vec<MessageReference> {
        self.inner.lock().messages.iter().cloned().collect()
    }

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) {
        debug!(queue = %self.name(), consumer_id = consumer.id(), "Consumer added");
        self.inner.lock().consumers.push(consumer);
    }

    pub fn remove_consumer(&self, consumer_id: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.consumers.len();
        inner.consumers.retain(|c| c.id() != consumer_id);
        if inner.position >= inner.consumers.len() {
            inner.position = 0;
        }
        before != inner.consumers.len()
    }

    /// Enqueue a routed or recovered reference and try to deliver it
    pub fn add(&self, reference: MessageReference) {
        if self.is_deleted() {
            debug!(queue = %self.name(), "Queue deleted, discarding reference");
            if let Some(record_id) = reference.record_id {
                if let Err(e) = self.storage.delete(record_id, None) {
                    warn!(queue = %self.name(), error = %e, "Failed to remove message");
                }
            }
            return;
        }
        self.paging_store.add_size(reference.size());
        let priority = reference.message.priority;
        self.inner.lock().messages.add_tail(reference, priority);
        self.deliver();
    }

    /// Enqueue a reference replayed from storage without delivering it
    pub(crate) fn restore(&self, reference: MessageReference) {
        self.paging_store.add_size(reference.size());
        let priority = reference.message.priority;
        self.inner.lock().messages.add_tail(reference, priority);
    }

    /// Put delivered references back at the head of their priority level
    pub fn cancel(&self, references: Vec<MessageReference>) {
        if references.is_empty() {
            return;
        }
        let deleted = self.is_deleted();
        let mut dropped = Vec::new();
        {
            let mut inner = self.inner.lock();
            for reference in references.into_iter().rev() {
                inner.delivering = inner.delivering.saturating_sub(1);
                if deleted {
                    dropped.push(reference);
                } else {
                    let priority = reference.message.priority;
                    inner.messages.add_head(reference, priority);
                }
            }
        }
        for reference in &dropped {
            self.discard(reference);
        }
        self.deliver();
    }

    /// Offer queued references to consumers until nothing more moves
    pub fn deliver(&self) {
        loop {
            let (expired, pre_acked) = self.deliver_pass();
            if expired.is_empty() && pre_acked.is_empty() {
                break;
            }
            for reference in expired {
                debug!(queue = %self.name(), message_id = reference.message_id(), "Message expired");
                self.discard(&reference);
                self.metrics.message_expired();
            }
            for reference in pre_acked {
                match self.persist_acknowledge(&reference, None) {
                    Ok(page_record) => self.finish_acknowledge(&reference, page_record),
                    Err(e) => warn!(queue = %self.name(), error = %e, "Pre-acknowledge failed"),
                }
            }
        }
    }

    fn deliver_pass(&self) -> (Vec<MessageReference>, Vec<MessageReference>) {
        let mut expired = Vec::new();
        let mut pre_acked = Vec::new();
        if self.is_deleted() {
            return (expired, pre_acked);
        }

        let mut inner = self.inner.lock();
        loop {
            self.depage_locked(&mut inner);
            if inner.consumers.is_empty() || inner.messages.is_empty() {
                break;
            }
            let delivered = self.offer_locked(&mut inner, &mut expired, &mut pre_acked);
            if delivered == 0 {
                break;
            }
        }
        (expired, pre_acked)
    }

    /// One round-robin sweep over the queued references, highest priority
    /// first. Returns how many were handed to a consumer.
    fn offer_locked(
        &self,
        inner: &mut QueueInner,
        expired: &mut Vec<MessageReference>,
        pre_acked: &mut Vec<MessageReference>,
    ) -> usize {
        let consumer_count = inner.consumers.len();
        let mut delivered = 0;
        let mut busy = vec![false; consumer_count];
        let mut busy_count = 0;
        let mut level = inner.messages.level_count();
        'levels: while level > 0 {
            level -= 1;
            let mut index = 0;
            loop {
                if busy_count == consumer_count {
                    break 'levels;
                }
                let Some(reference) = inner.messages.get(level, index) else {
                    break;
                };
                if reference.message.is_expired() {
                    if let Some(reference) = inner.messages.remove_at(level, index) {
                        expired.push(reference);
                    }
                    continue;
                }

                let mut candidate = reference.clone();
                candidate.delivery_count += 1;
                let mut taken_by = None;
                for offset in 0..consumer_count {
                    let slot = (inner.position + offset) % consumer_count;
                    if busy[slot] {
                        continue;
                    }
                    match inner.consumers[slot].handle(&candidate) {
                        HandleStatus::Handled => {
                            taken_by = Some(slot);
                            break;
                        }
                        HandleStatus::Busy => {
                            busy[slot] = true;
                            busy_count += 1;
                        }
                        HandleStatus::NoMatch => {}
                    }
                }

                match taken_by {
                    Some(slot) => {
                        inner.position = (slot + 1) % consumer_count;
                        inner.messages.remove_at(level, index);
                        inner.delivering += 1;
                        delivered += 1;
                        self.metrics.message_delivered();
                        trace!(
                            queue = %self.name(),
                            message_id = candidate.message_id(),
                            consumer_id = inner.consumers[slot].id(),
                            "Message delivered"
                        );
                        if inner.consumers[slot].pre_acknowledge() {
                            pre_acked.push(candidate);
                        }
                    }
                    None => index += 1,
                }
            }
        }
        delivered
    }

    /// Paged messages come back only for a queue with consumers, and only
    /// while the address has room or the queue holds nothing at all.
    fn may_depage_locked(&self, inner: &QueueInner) -> bool {
        if inner.consumers.is_empty()
            || inner.depaged >= self.paging_store.settings().max_depaged_messages
        {
            return false;
        }
        let max = self.paging_store.settings().max_size_bytes;
        max < 0
            || self.paging_store.address_size() < max
            || (inner.messages.is_empty() && inner.delivering == 0)
    }

    fn depage_locked(&self, inner: &mut QueueInner) {
        if !self.paging_store.is_paging() && self.paging_store.page_count() == 0 {
            return;
        }
        while self.may_depage_locked(inner) {
            match self.paging_store.read_next(&self.cursor) {
                Ok(Some((position, paged))) => {
                    let reference = MessageReference {
                        message: Arc::new(paged.message.clone()),
                        delivery_count: 0,
                        record_id: None,
                        page_position: Some(position),
                    };
                    self.paging_store.add_size(reference.size());
                    let priority = reference.message.priority;
                    inner.messages.add_tail(reference, priority);
                    inner.depaged += 1;
                    self.metrics.message_depaged();
                    trace!(queue = %self.name(), position = %position, "Message depaged");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(queue = %self.name(), error = %e, "Failed to depage");
                    break;
                }
            }
        }
    }

    /// Write the durable side of an acknowledgement, inside `tx` if given.
    /// Returns the page ack record for depaged references.
    pub fn persist_acknowledge(
        &self,
        reference: &MessageReference,
        tx: Option<TxId>,
    ) -> Result<Option<RecordId>> {
        if let Some(record_id) = reference.record_id {
            self.storage.delete(record_id, tx)?;
        }
        match reference.page_position {
            Some(position) if !self.is_deleted() => {
                self.cursor.persist_ack(&position, tx).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Apply an acknowledgement whose durable side is committed
    pub fn complete_acknowledge(&self, reference: &MessageReference, page_record: Option<RecordId>) {
        self.finish_acknowledge(reference, page_record);
        self.deliver();
    }

    /// Non-transactional acknowledgement of a delivered reference
    pub fn acknowledge(&self, reference: &MessageReference) -> Result<()> {
        let page_record = self.persist_acknowledge(reference, None)?;
        self.complete_acknowledge(reference, page_record);
        Ok(())
    }

    fn finish_acknowledge(&self, reference: &MessageReference, page_record: Option<RecordId>) {
        {
            let mut inner = self.inner.lock();
            inner.delivering = inner.delivering.saturating_sub(1);
        }
        self.release(reference, page_record);
        self.metrics.message_acknowledged();
    }

    /// Drop a reference that no consumer acknowledged
    fn discard(&self, reference: &MessageReference) {
        match self.persist_acknowledge(reference, None) {
            Ok(page_record) => self.release(reference, page_record),
            Err(e) => warn!(
                queue = %self.name(),
                message_id = reference.message_id(),
                error = %e,
                "Failed to remove message"
            ),
        }
    }

    fn release(&self, reference: &MessageReference, page_record: Option<RecordId>) {
        self.paging_store.add_size(-reference.size());
        let Some(position) = reference.page_position else {
            return;
        };
        {
            let mut inner = self.inner.lock();
            inner.depaged = inner.depaged.saturating_sub(1);
        }
        if let Some(record_id) = page_record {
            if self.cursor.complete_ack(&position, record_id) {
                if let Err(e) = self.paging_store.page_acked(position.page_nr) {
                    warn!(
                        queue = %self.name(),
                        page_nr = position.page_nr,
                        error = %e,
                        "Failed to delete page"
                    );
                }
            }
        }
    }

    /// Remove every queued message, the page cursor and the binding record.
    /// Delivered references are settled by their consumers later.
    pub fn delete(&self) -> Result<()> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let references = {
            let mut inner = self.inner.lock();
            inner.consumers.clear();
            inner.messages.drain()
        };
        for reference in &references {
            if let Some(record_id) = reference.record_id {
                self.storage.delete(record_id, None)?;
            }
            self.paging_store.add_size(-reference.size());
        }
        self.paging_store.remove_cursor(self.id())?;
        if let Some(record_id) = self.binding_record {
            self.storage.delete(record_id, None)?;
        }
        debug!(queue = %self.name(), removed = references.len(), "Queue deleted");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AddressSettings;
    use crate::paging::Admission;
    use crate::storage::{InMemoryStorageManager, RecordKind};
    use bytes::Bytes;
    use tempfile::{tempdir, TempDir};

    /// Takes up to `capacity` messages and records them
    pub(crate) struct RecordingConsumer {
        pub id: u64,
        pub capacity: Mutex<usize>,
        pub received: Mutex<Vec<MessageReference>>,
        pub filter: Option<Filter>,
        pub pre_ack: bool,
    }

    impl RecordingConsumer {
        pub fn new(id: u64, capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                id,
                capacity: Mutex::new(capacity),
                received: Mutex::new(Vec::new()),
                filter: None,
                pre_ack: false,
            })
        }

        pub fn bodies(&self) -> Vec<String> {
            self.received
                .lock()
                .iter()
                .map(|r| String::from_utf8_lossy(&r.message.body).to_string())
                .collect()
        }
    }

    impl Consumer for RecordingConsumer {
        fn id(&self) -> u64 {
            self.id
        }

        fn handle(&self, reference: &MessageReference) -> HandleStatus {
            if let Some(filter) = &self.filter {
                if !filter.matches(&reference.message) {
                    return HandleStatus::NoMatch;
                }
            }
            let mut capacity = self.capacity.lock();
            if *capacity == 0 {
                return HandleStatus::Busy;
            }
            *capacity -= 1;
            self.received.lock().push(reference.clone());
            HandleStatus::Handled
        }

        fn pre_acknowledge(&self) -> bool {
            self.pre_ack
        }
    }

    fn setup(settings: AddressSettings) -> (TempDir, Arc<InMemoryStorageManager>, Queue) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(InMemoryStorageManager::new());
        let store = Arc::new(
            PagingStore::open("orders", dir.path().join("orders"), settings, storage.clone())
                .unwrap(),
        );
        let queue = Queue::new(
            QueueDefinition {
                id: 1,
                name: "orders.q".into(),
                address: "orders".into(),
                filter: None,
                durable: false,
                temporary: false,
            },
            None,
            storage.clone(),
            store,
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        (dir, storage, queue)
    }

    fn reference(body: &str, priority: u8) -> MessageReference {
        MessageReference::new(Arc::new(
            Message::new("orders", Bytes::from(body.to_string())).with_priority(priority),
        ))
    }

    #[test]
    fn test_priority_delivery_order() {
        let (_dir, _storage, queue) = setup(AddressSettings::default());
        let sends = [
            ("a", 0),
            ("b", 0),
            ("c", 0),
            ("d", 7),
            ("e", 7),
            ("f", 7),
            ("g", 3),
            ("h", 3),
            ("i", 3),
            ("j", 9),
        ];
        for (body, priority) in sends {
            queue.add(reference(body, priority));
        }
        let browsed: Vec<String> = queue
            .browse()
            .iter()
            .map(|r| String::from_utf8_lossy(&r.message.body).to_string())
            .collect();

        let consumer = RecordingConsumer::new(1, usize::MAX);
        queue.add_consumer(consumer.clone());
        queue.deliver();

        let expected = vec!["j", "d", "e", "f", "g", "h", "i", "a", "b", "c"];
        assert_eq!(consumer.bodies(), expected);
        assert_eq!(browsed, expected);
        assert_eq!(queue.delivering_count(), 10);
        assert_eq!(queue.message_count(), 10);
    }

    #[test]
    fn test_round_robin_skips_busy_consumers() {
        let (_dir, _storage, queue) = setup(AddressSettings::default());
        let first = RecordingConsumer::new(1, 1);
        let second = RecordingConsumer::new(2, 10);
        queue.add_consumer(first.clone());
        queue.add_consumer(second.clone());

        for body in ["1", "2", "3", "4"] {
            queue.add(reference(body, 4));
        }
        assert_eq!(first.bodies(), vec!["1"]);
        assert_eq!(second.bodies(), vec!["2", "3", "4"]);
    }

    #[test]
    fn test_filtered_consumer_leaves_other_messages() {
        let (_dir, _storage, queue) = setup(AddressSettings::default());
        let consumer = Arc::new(RecordingConsumer {
            id: 1,
            capacity: Mutex::new(10),
            received: Mutex::new(Vec::new()),
            filter: Some(Filter::parse("color = 'red'").unwrap()),
            pre_ack: false,
        });
        queue.add_consumer(consumer.clone());
        queue.add(MessageReference::new(Arc::new(
            Message::new("orders", Bytes::from_static(b"blue")).with_property("color", "blue"),
        )));
        queue.add(MessageReference::new(Arc::new(
            Message::new("orders", Bytes::from_static(b"red")).with_property("color", "red"),
        )));

        assert_eq!(consumer.bodies(), vec!["red"]);
        assert_eq!(queue.browse().len(), 1);
    }

    #[test]
    fn test_cancel_restores_order_and_counts_redelivery() {
        let (_dir, _storage, queue) = setup(AddressSettings::default());
        let consumer = RecordingConsumer::new(1, 2);
        queue.add_consumer(consumer.clone());
        for body in ["1", "2", "3"] {
            queue.add(reference(body, 4));
        }
        let delivered = std::mem::take(&mut *consumer.received.lock());
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|r| r.delivery_count == 1));

        queue.remove_consumer(1);
        queue.cancel(delivered);
        assert_eq!(queue.delivering_count(), 0);

        let queued: Vec<_> = queue
            .browse()
            .iter()
            .map(|r| (String::from_utf8_lossy(&r.message.body).to_string(), r.delivery_count))
            .collect();
        assert_eq!(
            queued,
            vec![("1".to_string(), 1), ("2".to_string(), 1), ("3".to_string(), 0)]
        );
    }

    #[test]
    fn test_acknowledge_deletes_durable_record() {
        let (_dir, storage, queue) = setup(AddressSettings::default());
        let record_id = storage
            .append(RecordKind::Message, Bytes::from_static(b"m"), None)
            .unwrap();
        let mut durable = reference("durable", 4);
        durable.record_id = Some(record_id);

        let consumer = RecordingConsumer::new(1, 1);
        queue.add_consumer(consumer.clone());
        queue.add(durable);
        let delivered = consumer.received.lock().pop().unwrap();
        queue.acknowledge(&delivered).unwrap();

        assert!(storage.retrieve(record_id).unwrap().is_none());
        assert_eq!(queue.message_count(), 0);
        assert_eq!(queue.paging_store().address_size(), 0);
    }

    #[test]
    fn test_expired_messages_are_not_delivered() {
        let (_dir, _storage, queue) = setup(AddressSettings::default());
        queue.add(MessageReference::new(Arc::new(
            Message::new("orders", Bytes::from_static(b"old")).with_expiration(1),
        )));
        queue.add(reference("fresh", 4));

        let consumer = RecordingConsumer::new(1, 10);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        assert_eq!(consumer.bodies(), vec!["fresh"]);
        assert_eq!(queue.message_count(), 1);
    }

    #[test]
    fn test_pre_acknowledge_settles_on_delivery() {
        let (_dir, _storage, queue) = setup(AddressSettings::default());
        let consumer = Arc::new(RecordingConsumer {
            id: 1,
            capacity: Mutex::new(10),
            received: Mutex::new(Vec::new()),
            filter: None,
            pre_ack: true,
        });
        queue.add_consumer(consumer.clone());
        queue.add(reference("x", 4));
        assert_eq!(consumer.bodies(), vec!["x"]);
        assert_eq!(queue.message_count(), 0);
    }

    #[test]
    fn test_depaging_respects_resident_limit() {
        let size = Message::new("orders", Bytes::from("1")).encoded_size() as i64;
        let settings = AddressSettings {
            max_size_bytes: size * 4,
            max_depaged_messages: 2,
            ..AddressSettings::default()
        };
        let (_dir, _storage, queue) = setup(settings);
        let store = Arc::clone(queue.paging_store());
        store.add_size(size * 4);
        for body in ["1", "2", "3", "4"] {
            let message = Message::new("orders", Bytes::from(body.to_string()));
            let admission = store.admit(&message, &[queue.id()]).unwrap();
            assert_eq!(admission, Admission::Paged);
        }
        store.add_size(-size * 4);

        queue.deliver();
        assert!(queue.browse().is_empty());
        assert_eq!(store.address_size(), 0);

        let consumer = RecordingConsumer::new(1, 10);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        assert_eq!(consumer.bodies(), vec!["1", "2"]);

        let delivered = std::mem::take(&mut *consumer.received.lock());
        for reference in delivered {
            queue.acknowledge(&reference).unwrap();
        }
        assert_eq!(consumer.bodies(), vec!["3", "4"]);
    }

    #[test]
    fn test_depaging_stops_at_address_limit() {
        let size = Message::new("orders", Bytes::from("x")).encoded_size() as i64;
        let settings = AddressSettings {
            max_size_bytes: size * 2,
            ..AddressSettings::default()
        };
        let (_dir, _storage, queue) = setup(settings);
        let store = Arc::clone(queue.paging_store());
        for _ in 0..2 {
            let message = Message::new("orders", Bytes::from("x"));
            assert_eq!(store.admit(&message, &[queue.id()]).unwrap(), Admission::Memory);
            queue.add(MessageReference::new(Arc::new(message)));
        }
        for body in ["a", "b", "c"] {
            let message = Message::new("orders", Bytes::from(body));
            assert_eq!(store.admit(&message, &[queue.id()]).unwrap(), Admission::Paged);
        }
        queue.deliver();
        assert_eq!(queue.browse().len(), 2);

        // a busy consumer leaves the resident messages queued
        let consumer = RecordingConsumer::new(1, 0);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        assert_eq!(queue.browse().len(), 2);
        assert_eq!(store.address_size(), size * 2);

        // delivered but unacknowledged bytes still count against the limit
        *consumer.capacity.lock() = 10;
        queue.deliver();
        assert_eq!(consumer.bodies(), vec!["x", "x"]);
        assert!(queue.browse().is_empty());

        for reference in std::mem::take(&mut *consumer.received.lock()) {
            queue.acknowledge(&reference).unwrap();
        }
        assert_eq!(consumer.bodies(), vec!["a", "b"]);
        assert_eq!(store.address_size(), size * 2);

        for reference in std::mem::take(&mut *consumer.received.lock()) {
            queue.acknowledge(&reference).unwrap();
        }
        assert_eq!(consumer.bodies(), vec!["c"]);
    }

    #[test]
    fn test_delete_discards_messages() {
        let (_dir, _storage, queue) = setup(AddressSettings::default());
        queue.add(reference("1", 4));
        queue.delete().unwrap();
        assert!(queue.is_deleted());
        assert_eq!(queue.message_count(), 0);
        queue.add(reference("2", 4));
        assert_eq!(queue.message_count(), 0);
        assert_eq!(queue.paging_store().address_size(), 0);
    }
}
