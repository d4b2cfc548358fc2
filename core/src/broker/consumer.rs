//! Server side of a client consumer
//!
//! Sits on a queue (or, for browsers, on a snapshot of it) and pushes
//! SESS_RECEIVE_MSG packets down the session's current connection while the
//! client has granted byte credits.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::session::ConnectionSlot;
use crate::metrics::MetricsRegistry;
use crate::postoffice::{accepts, Consumer, Filter, HandleStatus, MessageReference, Queue};
use crate::protocol::{Packet, PacketBody};
use crate::{CorvidError, Result};

struct ConsumerState {
    /// Byte credits; `None` is unbounded
    credits: Option<i64>,
    started: bool,
    closed: bool,
    /// Delivered and not yet acknowledged, in delivery order
    delivering: VecDeque<MessageReference>,
    /// Remaining snapshot of a browser
    browse: VecDeque<MessageReference>,
}

pub struct ServerConsumer {
    id: u64,
    session_channel_id: u64,
    queue: Arc<Queue>,
    filter: Option<Filter>,
    browse_only: bool,
    pre_acknowledge: bool,
    connection: ConnectionSlot,
    metrics: Arc<MetricsRegistry>,
    state: Mutex<ConsumerState>,
}

impl std::fmt::Debug for ServerConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConsumer")
            .field("id", &self.id)
            .field("queue", &self.queue.name())
            .field("browse_only", &self.browse_only)
            .finish()
    }
}

impl ServerConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        session_channel_id: u64,
        queue: Arc<Queue>,
        filter: Option<Filter>,
        browse_only: bool,
        pre_acknowledge: bool,
        started: bool,
        connection: ConnectionSlot,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let browse = if browse_only {
            queue
                .browse()
                .into_iter()
                .filter(|reference| accepts(filter.as_ref(), &reference.message))
                .collect()
        } else {
            VecDeque::new()
        };
        Arc::new(Self {
            id,
            session_channel_id,
            queue,
            filter,
            browse_only,
            pre_acknowledge: pre_acknowledge && !browse_only,
            connection,
            metrics,
            state: Mutex::new(ConsumerState {
                credits: Some(0),
                started,
                closed: false,
                delivering: VecDeque::new(),
                browse,
            }),
        })
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn is_browse_only(&self) -> bool {
        self.browse_only
    }

    pub fn delivering_count(&self) -> usize {
        self.state.lock().delivering.len()
    }

    /// Attach to the queue; browsers only read their snapshot
    pub fn attach(self: &Arc<Self>) {
        if !self.browse_only {
            self.queue.add_consumer(self.clone());
        }
    }

    /// Client granted `credits` more bytes; -1 lifts the limit
    pub fn receive_credits(&self, credits: i32) {
        {
            let mut state = self.state.lock();
            state.credits = match (credits, state.credits) {
                (c, _) if c < 0 => None,
                (_, None) => None,
                (c, Some(current)) => Some(current + c as i64),
            };
        }
        self.prompt_delivery();
    }

    /// Forget granted credits; the client grants a fresh window
    pub fn reset_credits(&self) {
        self.state.lock().credits = Some(0);
    }

    pub fn set_started(&self, started: bool) {
        self.state.lock().started = started;
        if started {
            self.prompt_delivery();
        }
    }

    fn prompt_delivery(&self) {
        if self.browse_only {
            self.browse_pass();
        } else {
            self.queue.deliver();
        }
    }

    fn browse_pass(&self) {
        let mut state = self.state.lock();
        while state.started && !state.closed && has_credit(state.credits) {
            let Some(mut reference) = state.browse.pop_front() else {
                break;
            };
            reference.delivery_count += 1;
            if !self.send(&reference) {
                state.browse.push_front(reference);
                break;
            }
            spend(&mut state.credits, reference.size());
            self.metrics.message_delivered();
        }
    }

    fn send(&self, reference: &MessageReference) -> bool {
        let packet = Packet::new(
            self.session_channel_id,
            PacketBody::SessReceiveMsg {
                consumer_id: self.id,
                delivery_count: reference.delivery_count as i32,
                message: (*reference.message).clone(),
            },
        );
        let connection = Arc::clone(&*self.connection.read());
        match connection.write(packet) {
            Ok(()) => true,
            Err(e) => {
                trace!(consumer_id = self.id, error = %e, "Delivery not written");
                false
            }
        }
    }

    /// Remove every delivered reference up to and including `message_id`
    pub fn acknowledge(&self, message_id: u64) -> Result<Vec<MessageReference>> {
        let mut state = self.state.lock();
        let Some(index) = state
            .delivering
            .iter()
            .position(|reference| reference.message_id() == message_id)
        else {
            return Err(CorvidError::IllegalState(format!(
                "message {message_id} is not being delivered to consumer {}",
                self.id
            )));
        };
        Ok(state.delivering.drain(..=index).collect())
    }

    /// Remove one delivered reference the client found expired
    pub fn take_expired(&self, message_id: u64) -> Option<MessageReference> {
        let mut state = self.state.lock();
        let index = state
            .delivering
            .iter()
            .position(|reference| reference.message_id() == message_id)?;
        state.delivering.remove(index)
    }

    /// Return unacknowledged deliveries to the queue for redelivery
    pub fn cancel_delivering(&self) {
        let references: Vec<MessageReference> = {
            let mut state = self.state.lock();
            state.delivering.drain(..).collect()
        };
        if !references.is_empty() {
            debug!(consumer_id = self.id, count = references.len(), "Cancelling deliveries");
            self.queue.cancel(references);
        }
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.browse.clear();
        }
        if !self.browse_only {
            self.queue.remove_consumer(self.id);
            self.cancel_delivering();
        }
        debug!(consumer_id = self.id, queue = %self.queue.name(), "Consumer closed");
    }
}

fn has_credit(credits: Option<i64>) -> bool {
    credits.map_or(true, |c| c > 0)
}

fn spend(credits: &mut Option<i64>, size: i64) {
    if let Some(c) = credits {
        *c -= size;
    }
}

impl Consumer for ServerConsumer {
    fn id(&self) -> u64 {
        self.id
    }

    fn handle(&self, reference: &MessageReference) -> HandleStatus {
        let mut state = self.state.lock();
        if state.closed || !state.started || !has_credit(state.credits) {
            return HandleStatus::Busy;
        }
        if !accepts(self.filter.as_ref(), &reference.message) {
            return HandleStatus::NoMatch;
        }
        if !self.send(reference) {
            return HandleStatus::Busy;
        }
        spend(&mut state.credits, reference.size());
        if !self.pre_acknowledge {
            state.delivering.push_back(reference.clone());
        }
        HandleStatus::Handled
    }

    fn pre_acknowledge(&self) -> bool {
        self.pre_acknowledge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::postoffice::PostOffice;
    use crate::protocol::Message;
    use crate::remoting::connection::tests::{test_connection, RecordingTransport};
    use crate::remoting::PacketDispatcher;
    use crate::storage::InMemoryStorageManager;
    use parking_lot::RwLock;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        office: Arc<PostOffice>,
        queue: Arc<Queue>,
        slot: ConnectionSlot,
        transport: Arc<RecordingTransport>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..BrokerConfig::default()
        };
        let office = Arc::new(PostOffice::new(
            Arc::new(config),
            Arc::new(InMemoryStorageManager::new()),
            Arc::new(MetricsRegistry::new()),
        ));
        let queue = office.create_queue("a", "q", None, false, false).unwrap();
        let (connection, transport) =
            test_connection(Arc::new(PacketDispatcher::new()), Duration::from_secs(1));
        Fixture {
            _dir: dir,
            office,
            queue,
            slot: Arc::new(RwLock::new(connection)),
            transport,
        }
    }

    fn consumer(f: &Fixture, browse_only: bool, pre_ack: bool) -> Arc<ServerConsumer> {
        let consumer = ServerConsumer::new(
            1,
            5,
            f.queue.clone(),
            None,
            browse_only,
            pre_ack,
            true,
            f.slot.clone(),
            Arc::new(MetricsRegistry::new()),
        );
        consumer.attach();
        consumer
    }

    fn delivered_bodies(transport: &RecordingTransport) -> Vec<String> {
        transport
            .packets()
            .into_iter()
            .filter_map(|p| match p.body {
                PacketBody::SessReceiveMsg { message, .. } => {
                    Some(String::from_utf8_lossy(&message.body).to_string())
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_no_delivery_without_credits() {
        let f = fixture();
        let consumer = consumer(&f, false, false);
        f.office.route_and_apply(Message::new("a", "m1")).unwrap();
        assert!(delivered_bodies(&f.transport).is_empty());

        consumer.receive_credits(1);
        assert_eq!(delivered_bodies(&f.transport), vec!["m1"]);
        assert_eq!(consumer.delivering_count(), 1);
    }

    #[tokio::test]
    async fn test_credits_limit_bytes_in_flight() {
        let f = fixture();
        let consumer = consumer(&f, false, false);
        for body in ["m1", "m2", "m3"] {
            f.office.route_and_apply(Message::new("a", body)).unwrap();
        }
        let one_message = Message::new("a", "m1").encoded_size() as i32;
        consumer.receive_credits(one_message);
        assert_eq!(delivered_bodies(&f.transport).len(), 1);

        consumer.receive_credits(-1);
        assert_eq!(delivered_bodies(&f.transport).len(), 3);
    }

    #[tokio::test]
    async fn test_cumulative_acknowledge() {
        let f = fixture();
        let consumer = consumer(&f, false, false);
        consumer.receive_credits(-1);
        for body in ["m1", "m2", "m3"] {
            f.office.route_and_apply(Message::new("a", body)).unwrap();
        }
        let ids: Vec<u64> = f
            .transport
            .packets()
            .into_iter()
            .filter_map(|p| match p.body {
                PacketBody::SessReceiveMsg { message, .. } => Some(message.message_id),
                _ => None,
            })
            .collect();

        let acked = consumer.acknowledge(ids[1]).unwrap();
        assert_eq!(acked.len(), 2);
        for reference in &acked {
            f.queue.acknowledge(reference).unwrap();
        }
        assert_eq!(f.queue.message_count(), 1);
        assert!(matches!(
            consumer.acknowledge(ids[0]),
            Err(CorvidError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_close_returns_deliveries_to_queue() {
        let f = fixture();
        let consumer = consumer(&f, false, false);
        consumer.receive_credits(-1);
        f.office.route_and_apply(Message::new("a", "m1")).unwrap();
        assert_eq!(f.queue.delivering_count(), 1);

        consumer.close();
        assert_eq!(f.queue.delivering_count(), 0);
        assert_eq!(f.queue.message_count(), 1);
        assert_eq!(f.queue.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_browser_leaves_queue_untouched() {
        let f = fixture();
        f.office
            .route_and_apply(Message::new("a", "low").with_priority(1))
            .unwrap();
        f.office
            .route_and_apply(Message::new("a", "high").with_priority(8))
            .unwrap();
        let browser = consumer(&f, true, false);
        browser.receive_credits(-1);
        assert_eq!(delivered_bodies(&f.transport), vec!["high", "low"]);
        assert_eq!(f.queue.message_count(), 2);
        assert_eq!(f.queue.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_stopped_consumer_is_busy() {
        let f = fixture();
        let consumer = consumer(&f, false, false);
        consumer.set_started(false);
        consumer.receive_credits(-1);
        f.office.route_and_apply(Message::new("a", "m1")).unwrap();
        assert!(delivered_bodies(&f.transport).is_empty());
        consumer.set_started(true);
        assert_eq!(delivered_bodies(&f.transport), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_pre_acknowledge_keeps_nothing_in_flight() {
        let f = fixture();
        let consumer = consumer(&f, false, true);
        consumer.receive_credits(-1);
        f.office.route_and_apply(Message::new("a", "m1")).unwrap();
        assert_eq!(consumer.delivering_count(), 0);
        assert_eq!(f.queue.message_count(), 0);
    }
}
