//! Client consumer: buffers pushed messages, returns flow credit as they
//! are consumed and batches acknowledgements

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::session::SessionCore;
use crate::protocol::{Message, PacketBody};
use crate::{CorvidError, Result};

/// A message handed to the application
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    message: Message,
    delivery_count: i32,
    consumer_id: u64,
}

impl ReceivedMessage {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn message_id(&self) -> u64 {
        self.message.message_id
    }

    pub fn body(&self) -> &Bytes {
        &self.message.body
    }

    /// Times the server delivered this message, this delivery included
    pub fn delivery_count(&self) -> i32 {
        self.delivery_count
    }
}

struct Delivery {
    message: Message,
    delivery_count: i32,
}

#[derive(Default)]
struct FlowState {
    /// Consumed bytes not yet returned as flow credit
    unreturned: i64,
    pending_ack: Option<u64>,
    pending_ack_bytes: usize,
}

/// Consumer state shared between the session (which routes deliveries)
/// and the application handle
pub(crate) struct ConsumerCore {
    id: u64,
    queue: String,
    filter: Option<String>,
    browse_only: bool,
    buffer: Mutex<VecDeque<Delivery>>,
    notify: Notify,
    flow: Mutex<FlowState>,
    closed: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl ConsumerCore {
    pub(crate) fn new(id: u64, queue: String, filter: Option<String>, browse_only: bool) -> Self {
        Self {
            id,
            queue,
            filter,
            browse_only,
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            flow: Mutex::new(FlowState::default()),
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn create_packet(&self) -> PacketBody {
        PacketBody::SessCreateConsumer {
            consumer_id: self.id,
            queue_name: self.queue.clone(),
            filter: self.filter.clone(),
            browse_only: self.browse_only,
        }
    }

    pub(crate) fn deliver(&self, message: Message, delivery_count: i32) {
        if self.is_closed() {
            trace!(consumer_id = self.id, "Delivery to closed consumer dropped");
            return;
        }
        self.buffer.lock().push_back(Delivery {
            message,
            delivery_count,
        });
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Delivery> {
        self.buffer.lock().pop_front()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The server cancels in-flight deliveries when the session moves to a
    /// new connection; they come back with a fresh window
    pub(crate) fn clear_for_failover(&self) {
        let dropped = {
            let mut buffer = self.buffer.lock();
            let dropped = buffer.len();
            buffer.clear();
            dropped
        };
        *self.flow.lock() = FlowState::default();
        if dropped > 0 {
            debug!(consumer_id = self.id, dropped, "Dropped buffered messages for redelivery");
        }
    }

    /// The acknowledgement batched so far, if any
    pub(crate) fn take_pending_ack(&self) -> Option<PacketBody> {
        let mut flow = self.flow.lock();
        flow.pending_ack_bytes = 0;
        flow.pending_ack.take().map(|message_id| PacketBody::SessAcknowledge {
            consumer_id: self.id,
            message_id,
            requires_response: false,
        })
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.buffer.lock().clear();
            self.notify.notify_waiters();
            self.notify.notify_one();
        }
    }

    pub(crate) fn fail(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_string());
        self.close();
    }

    fn closed_error(&self) -> CorvidError {
        match self.failure.lock().as_deref() {
            Some(reason) => CorvidError::ObjectClosed(format!(
                "consumer {} on {}: {reason}",
                self.id, self.queue
            )),
            None => CorvidError::ObjectClosed(format!("consumer {} on {}", self.id, self.queue)),
        }
    }
}

pub struct ClientConsumer {
    session: Arc<SessionCore>,
    core: Arc<ConsumerCore>,
}

impl std::fmt::Debug for ClientConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConsumer")
            .field("id", &self.core.id)
            .field("queue", &self.core.queue)
            .field("browse_only", &self.core.browse_only)
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

impl ClientConsumer {
    pub(crate) fn new(session: Arc<SessionCore>, core: Arc<ConsumerCore>) -> Self {
        Self { session, core }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn queue_name(&self) -> &str {
        &self.core.queue
    }

    pub fn filter(&self) -> Option<&str> {
        self.core.filter.as_deref()
    }

    pub fn is_browse_only(&self) -> bool {
        self.core.browse_only
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Messages received from the server and not handed out yet
    pub fn buffered(&self) -> usize {
        self.core.buffer.lock().len()
    }

    /// Next message, waiting at most `timeout`. `Ok(None)` on timeout.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.core.is_closed() {
                return Err(self.core.closed_error());
            }
            if let Some(delivery) = self.core.pop() {
                self.flow_control(delivery.message.encoded_size())?;
                if delivery.message.is_expired() {
                    self.expired(&delivery.message)?;
                    continue;
                }
                return Ok(Some(ReceivedMessage {
                    message: delivery.message,
                    delivery_count: delivery.delivery_count,
                    consumer_id: self.core.id,
                }));
            }
            if tokio::time::timeout_at(deadline, self.core.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    /// A buffered message, without waiting for the server
    pub async fn receive_no_wait(&self) -> Result<Option<ReceivedMessage>> {
        self.receive(Duration::ZERO).await
    }

    fn expired(&self, message: &Message) -> Result<()> {
        trace!(consumer_id = self.core.id, message_id = message.message_id, "Message expired before delivery");
        if self.core.browse_only || self.session.pre_acknowledge() {
            return Ok(());
        }
        self.session.send_one_way(PacketBody::SessExpired {
            consumer_id: self.core.id,
            message_id: message.message_id,
        })
    }

    /// Give consumed bytes back to the server once half a window has
    /// accumulated
    fn flow_control(&self, bytes: usize) -> Result<()> {
        let window = self.session.config().consumer_window_size;
        if window < 0 {
            return Ok(());
        }
        let credits = {
            let mut flow = self.core.flow.lock();
            flow.unreturned += bytes as i64;
            if flow.unreturned < (window as i64 / 2).max(1) {
                return Ok(());
            }
            std::mem::take(&mut flow.unreturned)
        };
        self.session.send_one_way(PacketBody::SessConsumerFlowCredit {
            consumer_id: self.core.id,
            credits: i32::try_from(credits).unwrap_or(i32::MAX),
        })
    }

    /// Acknowledge `message` and every message received before it
    pub async fn acknowledge(&self, message: &ReceivedMessage) -> Result<()> {
        if message.consumer_id != self.core.id {
            return Err(CorvidError::IllegalState(format!(
                "message {} was received by consumer {}",
                message.message_id(),
                message.consumer_id
            )));
        }
        if self.core.is_closed() {
            return Err(self.core.closed_error());
        }
        if self.core.browse_only || self.session.pre_acknowledge() {
            return Ok(());
        }

        let config = self.session.config();
        if config.block_on_acknowledge {
            self.core.take_pending_ack();
            self.session
                .request(PacketBody::SessAcknowledge {
                    consumer_id: self.core.id,
                    message_id: message.message_id(),
                    requires_response: true,
                })
                .await?;
            return Ok(());
        }

        let flush = {
            let mut flow = self.core.flow.lock();
            flow.pending_ack = Some(message.message_id());
            flow.pending_ack_bytes += message.message.encoded_size();
            flow.pending_ack_bytes >= config.ack_batch_size
        };
        if flush {
            self.flush_acks()?;
        }
        Ok(())
    }

    /// Send the acknowledgement batched so far
    pub fn flush_acks(&self) -> Result<()> {
        match self.core.take_pending_ack() {
            Some(ack) => self.session.send_one_way(ack),
            None => Ok(()),
        }
    }

    /// Flush acknowledgements and close on the server
    pub async fn close(&self) -> Result<()> {
        if self.core.is_closed() {
            return Ok(());
        }
        if let Err(e) = self.flush_acks() {
            debug!(consumer_id = self.core.id, error = %e, "Pending acknowledgement not sent");
        }
        let result = self
            .session
            .request(PacketBody::SessConsumerClose {
                consumer_id: self.core.id,
            })
            .await;
        self.session.remove_consumer(self.core.id);
        self.core.close();
        info!(consumer_id = self.core.id, queue = %self.core.queue, "Consumer closed");
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> ConsumerCore {
        ConsumerCore::new(4, "jobs".to_string(), Some("color = 'red'".to_string()), false)
    }

    #[test]
    fn test_create_packet_carries_definition() {
        match core().create_packet() {
            PacketBody::SessCreateConsumer {
                consumer_id,
                queue_name,
                filter,
                browse_only,
            } => {
                assert_eq!(consumer_id, 4);
                assert_eq!(queue_name, "jobs");
                assert_eq!(filter.as_deref(), Some("color = 'red'"));
                assert!(!browse_only);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_closed_core_drops_deliveries() {
        let core = core();
        core.deliver(Message::new("jobs", "a"), 1);
        core.fail("connection lost");
        core.deliver(Message::new("jobs", "b"), 1);
        assert!(core.pop().is_none());
        let error = core.closed_error().to_string();
        assert!(error.contains("connection lost"), "{error}");
    }

    #[test]
    fn test_failover_clears_buffer_and_pending_ack() {
        let core = core();
        core.deliver(Message::new("jobs", "a"), 1);
        core.flow.lock().pending_ack = Some(9);
        core.clear_for_failover();
        assert!(core.pop().is_none());
        assert!(core.take_pending_ack().is_none());
    }

    #[test]
    fn test_pending_ack_taken_once() {
        let core = core();
        core.flow.lock().pending_ack = Some(12);
        match core.take_pending_ack() {
            Some(PacketBody::SessAcknowledge {
                consumer_id,
                message_id,
                requires_response,
            }) => {
                assert_eq!((consumer_id, message_id, requires_response), (4, 12, false));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(core.take_pending_ack().is_none());
    }
}
