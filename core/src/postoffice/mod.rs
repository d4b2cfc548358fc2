//! Post office: bindings, routing and recovery
//!
//! The post office maps addresses to bindings. Routing a message finds
//! every local queue whose filter accepts it and every eligible remote
//! binding, asks the address's [`PagingStore`] whether the message stays in
//! memory, and writes a durable record per durable queue. Routing is split
//! into [`PostOffice::route`], which performs the storage work (inside a
//! transaction when one is given), and [`PostOffice::apply`], which makes
//! the result visible to consumers once that work is committed.

pub mod binding;
pub mod filter;
pub mod priority;
pub mod queue;

pub use binding::{Binding, ChannelForwarder, Forwarder, RemoteQueueBinding};
pub use filter::{accepts, Filter};
pub use priority::PriorityLinkedList;
pub use queue::{Consumer, HandleStatus, MessageReference, Queue, QueueDefinition};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::metrics::MetricsRegistry;
use crate::paging::{address_directory, Admission, PageAckRecord, PagePosition, PagingStore};
use crate::protocol::Message;
use crate::storage::{RecordId, RecordKind, StorageManager, TxId};
use crate::{CorvidError, Result};

pub(crate) fn encode_message_record(queue_id: u64, message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + message.encoded_size());
    buf.put_u64(queue_id);
    message.encode(&mut buf);
    buf.freeze()
}

pub(crate) fn decode_message_record(mut payload: Bytes) -> Result<(u64, Message)> {
    if payload.remaining() < 8 {
        return Err(CorvidError::Storage("truncated message record".to_string()));
    }
    let queue_id = payload.get_u64();
    let message = Message::decode(&mut payload)?;
    Ok((queue_id, message))
}

/// Bounded, insertion-ordered set of seen duplicate ids
#[derive(Debug)]
struct DuplicateIdCache {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DuplicateIdCache {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// False when `id` was already seen
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    fn remove(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|existing| existing != id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to this many bindings
    Routed(usize),
    NoBindings,
    Dropped,
    Duplicate,
}

/// Storage work done for a routed message, pending [`PostOffice::apply`]
#[derive(Debug)]
pub struct RoutePlan {
    outcome: RouteOutcome,
    message: Option<Arc<Message>>,
    references: Vec<(Arc<Queue>, MessageReference)>,
    paged: Vec<Arc<Queue>>,
    remote: Vec<Arc<RemoteQueueBinding>>,
    duplicate_id: Option<String>,
}

impl RoutePlan {
    fn empty(outcome: RouteOutcome) -> Self {
        Self {
            outcome,
            message: None,
            references: Vec::new(),
            paged: Vec::new(),
            remote: Vec::new(),
            duplicate_id: None,
        }
    }

    pub fn outcome(&self) -> RouteOutcome {
        self.outcome
    }
}

#[derive(Debug, Default)]
struct Bindings {
    by_name: HashMap<String, Binding>,
    by_address: HashMap<String, Vec<Binding>>,
}

impl Bindings {
    fn insert(&mut self, binding: Binding) {
        self.by_address
            .entry(binding.address().to_string())
            .or_default()
            .push(binding.clone());
        self.by_name.insert(binding.name().to_string(), binding);
    }

    fn remove(&mut self, name: &str) -> Option<Binding> {
        let binding = self.by_name.remove(name)?;
        if let Some(list) = self.by_address.get_mut(binding.address()) {
            list.retain(|b| b.name() != name);
            if list.is_empty() {
                self.by_address.remove(binding.address());
            }
        }
        Some(binding)
    }
}

/// Counts of what [`PostOffice::recover`] replayed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub queues: usize,
    pub messages: usize,
    pub page_acks: usize,
}

pub struct PostOffice {
    config: Arc<BrokerConfig>,
    storage: Arc<dyn StorageManager>,
    metrics: Arc<MetricsRegistry>,
    bindings: RwLock<Bindings>,
    paging_stores: DashMap<String, Arc<PagingStore>>,
    duplicates: Mutex<DuplicateIdCache>,
}

impl std::fmt::Debug for PostOffice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostOffice")
            .field("bindings", &self.bindings.read().by_name.len())
            .field("paging_stores", &self.paging_stores.len())
            .finish()
    }
}

impl PostOffice {
    pub fn new(
        config: Arc<BrokerConfig>,
        storage: Arc<dyn StorageManager>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            duplicates: Mutex::new(DuplicateIdCache::new(config.duplicate_id_cache_size)),
            config,
            storage,
            metrics,
            bindings: RwLock::new(Bindings::default()),
            paging_stores: DashMap::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageManager> {
        &self.storage
    }

    /// Paging store of `address`, opened on first use
    pub fn paging_store(&self, address: &str) -> Result<Arc<PagingStore>> {
        if let Some(store) = self.paging_stores.get(address) {
            return Ok(Arc::clone(store.value()));
        }
        let store = Arc::new(PagingStore::open(
            address,
            address_directory(&self.config.paging_dir(), address),
            self.config.address_settings_for(address),
            Arc::clone(&self.storage),
        )?);
        Ok(Arc::clone(
            self.paging_stores
                .entry(address.to_string())
                .or_insert(store)
                .value(),
        ))
    }

    pub fn create_queue(
        &self,
        address: &str,
        name: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<Arc<Queue>> {
        if temporary && durable {
            return Err(CorvidError::IllegalState(
                "temporary queues cannot be durable".to_string(),
            ));
        }
        let mut bindings = self.bindings.write();
        if bindings.by_name.contains_key(name) {
            return Err(CorvidError::QueueExists(name.to_string()));
        }
        Filter::from_option(filter)?;

        let definition = QueueDefinition {
            id: self.storage.generate_id() as u64,
            name: name.to_string(),
            address: address.to_string(),
            filter: filter.map(str::to_string),
            durable,
            temporary,
        };
        let binding_record = if durable {
            let payload = Bytes::from(serde_json::to_vec(&definition)?);
            Some(self.storage.append(RecordKind::QueueBinding, payload, None)?)
        } else {
            None
        };

        let queue = Arc::new(Queue::new(
            definition,
            binding_record,
            Arc::clone(&self.storage),
            self.paging_store(address)?,
            Arc::clone(&self.metrics),
        )?);
        bindings.insert(Binding::Local(Arc::clone(&queue)));
        info!(queue = %name, address = %address, durable, temporary, "Queue created");
        Ok(queue)
    }

    pub fn delete_queue(&self, name: &str) -> Result<Arc<Queue>> {
        let queue = {
            let mut bindings = self.bindings.write();
            match bindings.by_name.get(name) {
                Some(Binding::Local(_)) => {}
                _ => return Err(CorvidError::InvalidDestination(name.to_string())),
            }
            match bindings.remove(name) {
                Some(Binding::Local(queue)) => queue,
                _ => return Err(CorvidError::InvalidDestination(name.to_string())),
            }
        };
        queue.delete()?;
        info!(queue = %name, "Queue deleted");
        Ok(queue)
    }

    pub fn add_remote_binding(&self, binding: Arc<RemoteQueueBinding>) -> Result<()> {
        let mut bindings = self.bindings.write();
        if bindings.by_name.contains_key(binding.name()) {
            return Err(CorvidError::QueueExists(binding.name().to_string()));
        }
        debug!(binding = %binding.name(), address = %binding.address(), "Remote binding added");
        bindings.insert(Binding::Remote(binding));
        Ok(())
    }

    pub fn remove_binding(&self, name: &str) -> Option<Binding> {
        let binding = self.bindings.write().remove(name)?;
        binding.close();
        Some(binding)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.bindings
            .read()
            .by_name
            .get(name)
            .and_then(|b| b.as_queue().cloned())
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.bindings
            .read()
            .by_name
            .values()
            .filter_map(|b| b.as_queue().cloned())
            .collect()
    }

    /// Names of the bindings on `address`
    pub fn binding_names(&self, address: &str) -> Vec<String> {
        self.bindings
            .read()
            .by_address
            .get(address)
            .map(|list| list.iter().map(|b| b.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Resolve bindings and write durable records for `message`
    pub fn route(&self, mut message: Message, tx: Option<TxId>) -> Result<RoutePlan> {
        let duplicate_id = message.duplicate_id();
        if let Some(id) = &duplicate_id {
            if !self.duplicates.lock().insert(id) {
                self.metrics.duplicate_rejected();
                debug!(address = %message.address, duplicate_id = %id, "Duplicate message rejected");
                return Ok(RoutePlan::empty(RouteOutcome::Duplicate));
            }
        }

        let result = self.plan(&mut message, tx);
        match result {
            Ok(mut plan) => {
                plan.duplicate_id = duplicate_id;
                Ok(plan)
            }
            Err(e) => {
                if let Some(id) = &duplicate_id {
                    self.duplicates.lock().remove(id);
                }
                Err(e)
            }
        }
    }

    fn plan(&self, message: &mut Message, tx: Option<TxId>) -> Result<RoutePlan> {
        let (queues, remote) = {
            let bindings = self.bindings.read();
            let mut queues = Vec::new();
            let mut remote = Vec::new();
            for binding in bindings.by_address.get(&message.address).into_iter().flatten() {
                match binding {
                    Binding::Local(queue) => {
                        if filter::accepts(queue.filter(), message) {
                            queues.push(Arc::clone(queue));
                        }
                    }
                    Binding::Remote(binding) => {
                        if binding.is_eligible(message) {
                            remote.push(Arc::clone(binding));
                        }
                    }
                }
            }
            (queues, remote)
        };

        if queues.is_empty() && remote.is_empty() {
            debug!(address = %message.address, "No bindings for address");
            return Ok(RoutePlan::empty(RouteOutcome::NoBindings));
        }

        message.message_id = self.storage.generate_id() as u64;
        let message = Arc::new(message.clone());
        let mut plan = RoutePlan::empty(RouteOutcome::Routed(queues.len() + remote.len()));
        plan.remote = remote;

        if !queues.is_empty() {
            let store = self.paging_store(&message.address)?;
            let queue_ids: Vec<u64> = queues.iter().map(|q| q.id()).collect();
            match store.admit(&message, &queue_ids)? {
                Admission::Dropped => {
                    self.metrics.message_dropped();
                    if plan.remote.is_empty() {
                        plan.outcome = RouteOutcome::Dropped;
                    }
                }
                Admission::Paged => {
                    self.metrics.message_paged();
                    plan.paged = queues;
                }
                Admission::Memory => {
                    for queue in queues {
                        let mut reference = MessageReference::new(Arc::clone(&message));
                        if message.durable && queue.is_durable() {
                            let payload = encode_message_record(queue.id(), &message);
                            reference.record_id =
                                Some(self.storage.append(RecordKind::Message, payload, tx)?);
                        }
                        plan.references.push((queue, reference));
                    }
                }
            }
        }
        plan.message = Some(message);
        Ok(plan)
    }

    /// Make a routed message visible once its storage work is committed
    pub fn apply(&self, plan: RoutePlan) {
        let Some(message) = plan.message else {
            return;
        };
        for (queue, reference) in plan.references {
            queue.add(reference);
        }
        for queue in plan.paged {
            queue.deliver();
        }
        for remote in plan.remote {
            if let Err(e) = remote.forward(&message) {
                warn!(binding = %remote.name(), error = %e, "Failed to forward message");
            }
        }
        if matches!(plan.outcome, RouteOutcome::Routed(_)) {
            self.metrics.message_routed();
        }
    }

    /// Undo the in-memory side of a plan whose transaction rolled back
    pub fn discard(&self, plan: RoutePlan) {
        if let Some(id) = &plan.duplicate_id {
            self.duplicates.lock().remove(id);
        }
    }

    /// Route and apply outside any transaction
    pub fn route_and_apply(&self, message: Message) -> Result<RouteOutcome> {
        let plan = self.route(message, None)?;
        let outcome = plan.outcome();
        self.apply(plan);
        Ok(outcome)
    }

    /// Rebuild queues, messages and page cursors from committed records
    pub fn recover(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        let mut bindings = Vec::new();
        let mut messages = Vec::new();
        let mut acks = Vec::new();
        for record in self.storage.load_committed()? {
            match record.kind {
                RecordKind::QueueBinding => bindings.push(record),
                RecordKind::Message => messages.push(record),
                RecordKind::PageAck => acks.push(record),
            }
        }

        let mut by_id: HashMap<u64, Arc<Queue>> = HashMap::new();
        for record in bindings {
            let definition: QueueDefinition = serde_json::from_slice(&record.payload)?;
            let queue = Arc::new(Queue::new(
                definition.clone(),
                Some(record.id),
                Arc::clone(&self.storage),
                self.paging_store(&definition.address)?,
                Arc::clone(&self.metrics),
            )?);
            self.bindings.write().insert(Binding::Local(Arc::clone(&queue)));
            by_id.insert(definition.id, queue);
            stats.queues += 1;
        }

        for record in messages {
            let (queue_id, message) = decode_message_record(record.payload)?;
            match by_id.get(&queue_id) {
                Some(queue) => {
                    let mut reference = MessageReference::new(Arc::new(message));
                    reference.record_id = Some(record.id);
                    queue.restore(reference);
                    stats.messages += 1;
                }
                None => {
                    warn!(record_id = record.id, queue_id, "Removing message for unknown queue");
                    self.storage.delete(record.id, None)?;
                }
            }
        }

        for record in acks {
            let ack: PageAckRecord = serde_json::from_slice(&record.payload)?;
            self.recover_page_ack(&by_id, ack, record.id)?;
            stats.page_acks += 1;
        }

        for queue in by_id.values() {
            queue.deliver();
        }
        info!(
            queues = stats.queues,
            messages = stats.messages,
            page_acks = stats.page_acks,
            "Post office recovered"
        );
        Ok(stats)
    }

    fn recover_page_ack(
        &self,
        queues: &HashMap<u64, Arc<Queue>>,
        ack: PageAckRecord,
        record_id: RecordId,
    ) -> Result<()> {
        match queues.get(&ack.queue_id) {
            Some(queue) => {
                let position =
                    PagePosition::new(ack.page_nr, ack.message_nr).with_record_id(record_id);
                queue
                    .paging_store()
                    .recover_ack(ack.queue_id, position, record_id)
            }
            None => self.storage.delete(record_id, None),
        }
    }

    /// Flush every live page
    pub fn sync(&self) -> Result<()> {
        for store in self.paging_stores.iter() {
            store.value().sync()?;
        }
        Ok(())
    }
}
