//! Bindings: local queues and remote (cluster-forwarding) queues

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::filter::{accepts, Filter};
use super::queue::Queue;
use crate::protocol::{Message, PropertyValue, DUPLICATE_ID_PROPERTY};
use crate::{CorvidError, Result};

/// Carries a message to another node's queue
pub trait Forwarder: Send + Sync {
    fn forward(&self, remote_queue: &str, message: Message) -> Result<()>;
}

/// Forwarder feeding an in-process channel, e.g. a bridge task
#[derive(Debug, Clone)]
pub struct ChannelForwarder {
    sender: mpsc::UnboundedSender<(String, Message)>,
}

impl ChannelForwarder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Message)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Forwarder for ChannelForwarder {
    fn forward(&self, remote_queue: &str, message: Message) -> Result<()> {
        self.sender
            .send((remote_queue.to_string(), message))
            .map_err(|_| CorvidError::ConnectionFailed("forwarding channel closed".to_string()))
    }
}

/// Binding to a queue living on another node
pub struct RemoteQueueBinding {
    name: String,
    address: String,
    remote_queue_name: String,
    filter: Option<Filter>,
    duplicate_detection: bool,
    forward_when_no_consumers: bool,
    /// Remote consumers keyed by their filter expression ("" = none)
    consumer_counts: Mutex<HashMap<String, (Option<Filter>, usize)>>,
    forwarder: Arc<dyn Forwarder>,
}

impl std::fmt::Debug for RemoteQueueBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteQueueBinding")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("remote_queue_name", &self.remote_queue_name)
            .finish()
    }
}

impl RemoteQueueBinding {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        remote_queue_name: impl Into<String>,
        filter: Option<&str>,
        duplicate_detection: bool,
        forward_when_no_consumers: bool,
        forwarder: Arc<dyn Forwarder>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            address: address.into(),
            remote_queue_name: remote_queue_name.into(),
            filter: Filter::from_option(filter)?,
            duplicate_detection,
            forward_when_no_consumers,
            consumer_counts: Mutex::new(HashMap::new()),
            forwarder,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// A consumer appeared on the remote queue
    pub fn add_consumer(&self, filter: Option<&str>) -> Result<()> {
        let key = filter.unwrap_or_default().to_string();
        let parsed = Filter::from_option(filter)?;
        let mut counts = self.consumer_counts.lock();
        counts.entry(key).or_insert((parsed, 0)).1 += 1;
        Ok(())
    }

    pub fn remove_consumer(&self, filter: Option<&str>) {
        let key = filter.unwrap_or_default();
        let mut counts = self.consumer_counts.lock();
        if let Some(entry) = counts.get_mut(key) {
            entry.1 = entry.1.saturating_sub(1);
            if entry.1 == 0 {
                counts.remove(key);
            }
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumer_counts.lock().values().map(|(_, n)| n).sum()
    }

    /// Whether `message` should cross to the remote node
    pub fn is_eligible(&self, message: &Message) -> bool {
        if !accepts(self.filter.as_ref(), message) {
            return false;
        }
        if self.forward_when_no_consumers {
            return true;
        }
        self.consumer_counts
            .lock()
            .values()
            .any(|(filter, count)| *count > 0 && accepts(filter.as_ref(), message))
    }

    pub fn forward(&self, message: &Message) -> Result<()> {
        let mut forwarded = message.clone();
        if self.duplicate_detection && forwarded.duplicate_id().is_none() {
            let id = format!("{}:{}", self.name, message.message_id);
            forwarded
                .properties
                .insert(DUPLICATE_ID_PROPERTY.to_string(), PropertyValue::String(id));
        }
        trace!(
            binding = %self.name,
            remote_queue = %self.remote_queue_name,
            message_id = message.message_id,
            "Forwarding message"
        );
        self.forwarder.forward(&self.remote_queue_name, forwarded)
    }
}

#[derive(Debug, Clone)]
pub enum Binding {
    Local(Arc<Queue>),
    Remote(Arc<RemoteQueueBinding>),
}

impl Binding {
    pub fn name(&self) -> &str {
        match self {
            Binding::Local(queue) => queue.name(),
            Binding::Remote(remote) => remote.name(),
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Binding::Local(queue) => queue.address(),
            Binding::Remote(remote) => remote.address(),
        }
    }

    pub fn as_queue(&self) -> Option<&Arc<Queue>> {
        match self {
            Binding::Local(queue) => Some(queue),
            Binding::Remote(_) => None,
        }
    }

    pub(crate) fn close(&self) {
        if let Binding::Remote(remote) = self {
            debug!(binding = %remote.name(), "Remote binding removed");
        }
    }
}
