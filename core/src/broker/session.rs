//! Server side of a client session
//!
//! A session owns its consumers and its transaction. Every packet on the
//! session channel is counted; every `confirmation_batch_size` packets the
//! count is confirmed back so the client can trim its replay buffer. When
//! the connection fails a session that supports reattach is detached
//! instead of closed, and can be rebound to a new connection later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::consumer::ServerConsumer;
use super::handler::BrokerState;
use crate::postoffice::Filter;
use crate::protocol::{Message, Packet, PacketBody, Xid};
use crate::remoting::{PacketHandler, RemotingConnection};
use crate::security::{CheckType, Principal};
use crate::transaction::{
    xa_code_for, SharedTransaction, TransactionError, TransactionState, XA_OK,
};
use crate::{CorvidError, Result};

/// The connection a session currently writes to; swapped on reattach
pub type ConnectionSlot = Arc<RwLock<Arc<RemotingConnection>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub xa: bool,
    pub auto_commit_sends: bool,
    pub auto_commit_acks: bool,
    pub pre_acknowledge: bool,
    /// -1 disables confirmations and with them reattach
    pub confirmation_batch_size: i32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            xa: false,
            auto_commit_sends: true,
            auto_commit_acks: true,
            pre_acknowledge: false,
            confirmation_batch_size: -1,
        }
    }
}

struct SessionInner {
    consumers: HashMap<u64, Arc<ServerConsumer>>,
    /// Local transaction, or the XA branch currently associated
    tx: Option<SharedTransaction>,
    tx_timeout_secs: Option<i32>,
    started: bool,
    last_received_command_id: i64,
    detached_at: Option<Instant>,
    closed: bool,
}

pub struct ServerSession {
    name: String,
    channel_id: u64,
    principal: Principal,
    options: SessionOptions,
    connection: ConnectionSlot,
    state: Arc<BrokerState>,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("name", &self.name)
            .field("channel_id", &self.channel_id)
            .field("options", &self.options)
            .finish()
    }
}

impl ServerSession {
    pub fn new(
        name: String,
        channel_id: u64,
        principal: Principal,
        options: SessionOptions,
        connection: Arc<RemotingConnection>,
        state: Arc<BrokerState>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            channel_id,
            principal,
            options,
            connection: Arc::new(RwLock::new(connection)),
            state,
            inner: Mutex::new(SessionInner {
                consumers: HashMap::new(),
                tx: None,
                tx_timeout_secs: None,
                started: false,
                last_received_command_id: -1,
                detached_at: None,
                closed: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn connection(&self) -> Arc<RemotingConnection> {
        Arc::clone(&*self.connection.read())
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn last_received_command_id(&self) -> i64 {
        self.inner.lock().last_received_command_id
    }

    pub fn supports_reattach(&self) -> bool {
        self.options.confirmation_batch_size > 0 && self.state.config.session_reattach_ttl_ms > 0
    }

    pub fn is_detached(&self) -> bool {
        self.inner.lock().detached_at.is_some()
    }

    /// Detached for longer than `ttl`
    pub fn detach_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.inner
            .lock()
            .detached_at
            .is_some_and(|at| now.duration_since(at) >= ttl)
    }

    fn consumer(&self, consumer_id: u64) -> Result<Arc<ServerConsumer>> {
        self.inner
            .lock()
            .consumers
            .get(&consumer_id)
            .cloned()
            .ok_or_else(|| {
                CorvidError::IllegalState(format!(
                    "no consumer {consumer_id} in session {}",
                    self.name
                ))
            })
    }

    /// Connection failed; keep the session for a reattach
    pub fn detach(&self) {
        let consumers = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.detached_at.is_some() {
                return;
            }
            inner.detached_at = Some(Instant::now());
            inner.consumers.values().cloned().collect::<Vec<_>>()
        };
        for consumer in consumers {
            consumer.set_started(false);
        }
        info!(session = %self.name, "Session detached");
    }

    /// Rebind to `connection`. Returns the last command id received so the
    /// client can replay what the server never saw.
    pub fn reattach(&self, connection: Arc<RemotingConnection>) -> Result<i64> {
        let (consumers, started, last_received) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(CorvidError::ObjectClosed(self.name.clone()));
            }
            inner.detached_at = None;
            (
                inner.consumers.values().cloned().collect::<Vec<_>>(),
                inner.started,
                inner.last_received_command_id,
            )
        };
        *self.connection.write() = connection;
        for consumer in consumers {
            consumer.set_started(false);
            consumer.reset_credits();
            consumer.cancel_delivering();
            consumer.set_started(started);
        }
        info!(session = %self.name, last_received, "Session reattached");
        Ok(last_received)
    }

    /// Roll back open work, close the consumers and unregister
    pub fn close(&self) {
        let (consumers, tx) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let consumers: Vec<_> = inner.consumers.drain().map(|(_, c)| c).collect();
            (consumers, inner.tx.take())
        };
        if let Some(tx) = tx {
            self.abandon_transaction(&tx);
        }
        for consumer in consumers {
            consumer.close();
        }
        self.state.dispatcher.unregister(self.channel_id);
        self.state.remove_session(&self.name, self);
        self.state.metrics.session_closed();
        debug!(session = %self.name, "Session closed");
    }

    fn abandon_transaction(&self, tx: &SharedTransaction) {
        let xid = tx.lock().xid().cloned();
        let result = match xid {
            Some(xid) => {
                let active = tx.lock().state() == TransactionState::Active;
                if active {
                    self.state.coordinator.rollback(&xid)
                } else {
                    Ok(())
                }
            }
            None => self.state.coordinator.rollback_transaction(&mut tx.lock()),
        };
        if let Err(e) = result {
            warn!(session = %self.name, error = %e, "Failed to roll back on close");
        }
    }

    fn count_command(&self, connection: &Arc<RemotingConnection>) {
        let command_id = {
            let mut inner = self.inner.lock();
            inner.last_received_command_id += 1;
            inner.last_received_command_id
        };
        let batch = self.options.confirmation_batch_size;
        if batch > 0 && (command_id + 1) % batch as i64 == 0 {
            let packet = Packet::new(self.channel_id, PacketBody::PacketsConfirmed { command_id });
            if let Err(e) = connection.write(packet) {
                trace!(session = %self.name, error = %e, "Confirmation not written");
            }
        }
    }

    fn process(&self, body: PacketBody) -> Result<Option<PacketBody>> {
        use PacketBody as B;
        match body {
            B::SessCreateConsumer {
                consumer_id,
                queue_name,
                filter,
                browse_only,
            } => {
                self.create_consumer(consumer_id, &queue_name, filter.as_deref(), browse_only)?;
                Ok(Some(B::NullResponse))
            }
            B::SessConsumerFlowCredit {
                consumer_id,
                credits,
            } => {
                self.consumer(consumer_id)?.receive_credits(credits);
                Ok(None)
            }
            B::SessConsumerClose { consumer_id } => {
                let consumer = self.inner.lock().consumers.remove(&consumer_id);
                if let Some(consumer) = consumer {
                    consumer.close();
                }
                Ok(Some(B::NullResponse))
            }
            B::SessAcknowledge {
                consumer_id,
                message_id,
                requires_response,
            } => {
                self.acknowledge(consumer_id, message_id)?;
                Ok(requires_response.then_some(B::NullResponse))
            }
            B::SessExpired {
                consumer_id,
                message_id,
            } => {
                let consumer = self.consumer(consumer_id)?;
                if let Some(reference) = consumer.take_expired(message_id) {
                    consumer.queue().acknowledge(&reference)?;
                    self.state.metrics.message_expired();
                }
                Ok(None)
            }
            B::SessSend {
                message,
                requires_response,
            } => {
                self.send(message)?;
                Ok(requires_response.then_some(B::NullResponse))
            }
            B::SessProducerRequestCredits { address, credits } => {
                self.request_producer_credits(address, credits)?;
                Ok(None)
            }
            B::SessCommit => {
                self.commit()?;
                Ok(Some(B::NullResponse))
            }
            B::SessRollback => {
                self.rollback()?;
                Ok(Some(B::NullResponse))
            }
            B::SessStart => {
                self.set_started(true);
                Ok(None)
            }
            B::SessStop => {
                self.set_started(false);
                Ok(None)
            }
            B::SessClose => {
                self.close();
                Ok(Some(B::NullResponse))
            }
            B::SessQueueQuery { queue_name } => Ok(Some(self.queue_query(&queue_name))),
            B::SessBindingQuery { address } => {
                let queue_names = self.state.post_office.binding_names(&address);
                Ok(Some(B::SessBindingQueryResp {
                    exists: !queue_names.is_empty(),
                    queue_names,
                }))
            }
            B::CreateQueue {
                address,
                queue_name,
                filter,
                durable,
                temporary,
            } => {
                let connection = self.connection();
                self.state.create_queue(
                    &self.principal,
                    connection.id(),
                    &address,
                    &queue_name,
                    filter.as_deref(),
                    durable,
                    temporary,
                )?;
                Ok(Some(B::NullResponse))
            }
            B::DeleteQueue { queue_name } => {
                self.state.delete_queue(&self.principal, &queue_name)?;
                Ok(Some(B::NullResponse))
            }
            B::SessFailoverComplete { name } => {
                info!(session = %self.name, client_session = %name, "Failover complete");
                Ok(None)
            }
            B::SessXaInDoubtXids => Ok(Some(B::SessXaInDoubtXidsResp {
                xids: self.state.coordinator.in_doubt_xids(),
            })),
            B::SessXaSetTimeout { timeout_seconds } => {
                let tx = {
                    let mut inner = self.inner.lock();
                    inner.tx_timeout_secs = Some(timeout_seconds);
                    inner.tx.clone()
                };
                if let Some(tx) = tx {
                    tx.lock().set_timeout(timeout_seconds);
                }
                Ok(Some(B::SessXaSetTimeoutResp { ok: true }))
            }
            B::SessXaGetTimeout => {
                let timeout_seconds = self
                    .inner
                    .lock()
                    .tx_timeout_secs
                    .unwrap_or_else(|| self.state.coordinator.default_timeout_secs());
                Ok(Some(B::SessXaGetTimeoutResp { timeout_seconds }))
            }
            body @ (B::SessXaStart { .. }
            | B::SessXaEnd { .. }
            | B::SessXaJoin { .. }
            | B::SessXaResume { .. }
            | B::SessXaSuspend
            | B::SessXaPrepare { .. }
            | B::SessXaCommit { .. }
            | B::SessXaRollback { .. }
            | B::SessXaForget { .. }) => Ok(Some(xa_response(self.xa_operation(body)))),
            other => Err(CorvidError::Protocol(format!(
                "unexpected {:?} on session channel",
                other.packet_type()
            ))),
        }
    }

    fn create_consumer(
        &self,
        consumer_id: u64,
        queue_name: &str,
        filter: Option<&str>,
        browse_only: bool,
    ) -> Result<()> {
        let queue = self
            .state
            .post_office
            .queue(queue_name)
            .ok_or_else(|| CorvidError::InvalidDestination(queue_name.to_string()))?;
        let check = if browse_only {
            CheckType::Browse
        } else {
            CheckType::Consume
        };
        self.state.security.check(&self.principal, check, queue.address())?;
        let filter = Filter::from_option(filter)?;

        let consumer = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(CorvidError::ObjectClosed(self.name.clone()));
            }
            if inner.consumers.contains_key(&consumer_id) {
                return Err(CorvidError::IllegalState(format!(
                    "consumer {consumer_id} already exists"
                )));
            }
            let consumer = ServerConsumer::new(
                consumer_id,
                self.channel_id,
                queue,
                filter,
                browse_only,
                self.options.pre_acknowledge,
                inner.started,
                Arc::clone(&self.connection),
                Arc::clone(&self.state.metrics),
            );
            inner.consumers.insert(consumer_id, Arc::clone(&consumer));
            consumer
        };
        consumer.attach();
        debug!(
            session = %self.name,
            consumer_id,
            queue = %queue_name,
            browse_only,
            "Consumer created"
        );
        Ok(())
    }

    fn set_started(&self, started: bool) {
        let consumers = {
            let mut inner = self.inner.lock();
            inner.started = started;
            inner.consumers.values().cloned().collect::<Vec<_>>()
        };
        for consumer in consumers {
            consumer.set_started(started);
        }
    }

    /// The transaction a send or ack joins, if any
    fn transaction_for(&self, auto_commit: bool) -> Option<SharedTransaction> {
        let mut inner = self.inner.lock();
        if self.options.xa {
            return inner.tx.clone();
        }
        if auto_commit {
            return None;
        }
        let tx = inner
            .tx
            .get_or_insert_with(|| self.state.coordinator.begin_local());
        Some(Arc::clone(tx))
    }

    fn send(&self, mut message: Message) -> Result<()> {
        self.state
            .security
            .check(&self.principal, CheckType::Send, &message.address)?;
        message.message_id = 0;
        match self.transaction_for(self.options.auto_commit_sends) {
            Some(tx) => tx.lock().add_send(message)?,
            None => {
                let outcome = self.state.post_office.route_and_apply(message)?;
                trace!(session = %self.name, ?outcome, "Message routed");
            }
        }
        Ok(())
    }

    fn acknowledge(&self, consumer_id: u64, message_id: u64) -> Result<()> {
        let consumer = self.consumer(consumer_id)?;
        let references = consumer.acknowledge(message_id)?;
        let queue = Arc::clone(consumer.queue());
        match self.transaction_for(self.options.auto_commit_acks) {
            Some(tx) => {
                let mut tx = tx.lock();
                for reference in references {
                    tx.add_acknowledge(Arc::clone(&queue), reference)?;
                }
            }
            None => {
                for reference in &references {
                    queue.acknowledge(reference)?;
                }
            }
        }
        Ok(())
    }

    fn request_producer_credits(&self, address: String, credits: i32) -> Result<()> {
        let store = self.state.post_office.paging_store(&address)?;
        let slot = Arc::clone(&self.connection);
        let channel_id = self.channel_id;
        store.request_credits(
            credits,
            Box::new(move |granted| {
                let connection = Arc::clone(&*slot.read());
                let packet = Packet::new(
                    channel_id,
                    PacketBody::SessProducerCredits {
                        address,
                        credits: granted,
                    },
                );
                if let Err(e) = connection.write(packet) {
                    trace!(channel_id, error = %e, "Producer credits not written");
                }
            }),
        );
        Ok(())
    }

    fn local_transaction(&self) -> Result<Option<SharedTransaction>> {
        if self.options.xa {
            return Err(CorvidError::IllegalState(
                "XA sessions commit through the transaction manager".to_string(),
            ));
        }
        Ok(self.inner.lock().tx.take())
    }

    fn commit(&self) -> Result<()> {
        match self.local_transaction()? {
            Some(tx) => self
                .state
                .coordinator
                .commit_transaction(&mut tx.lock(), true),
            None => Ok(()),
        }
    }

    fn rollback(&self) -> Result<()> {
        match self.local_transaction()? {
            Some(tx) => self.state.coordinator.rollback_transaction(&mut tx.lock()),
            None => Ok(()),
        }
    }

    fn queue_query(&self, queue_name: &str) -> PacketBody {
        match self.state.post_office.queue(queue_name) {
            Some(queue) => PacketBody::SessQueueQueryResp {
                exists: true,
                address: Some(queue.address().to_string()),
                filter: queue.filter().map(|f| f.expression().to_string()),
                durable: queue.is_durable(),
                temporary: queue.is_temporary(),
                consumer_count: queue.consumer_count() as i32,
                message_count: queue.message_count() as i64,
            },
            None => PacketBody::SessQueueQueryResp {
                exists: false,
                address: None,
                filter: None,
                durable: false,
                temporary: false,
                consumer_count: 0,
                message_count: 0,
            },
        }
    }

    fn associated_xid(&self) -> Option<Xid> {
        let tx = self.inner.lock().tx.clone()?;
        let xid = tx.lock().xid().cloned();
        xid
    }

    fn associate(&self, tx: SharedTransaction) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.tx.is_some() {
            return Err(protocol_error("session already associated with a branch"));
        }
        inner.tx = Some(tx);
        Ok(())
    }

    /// The associated branch, which must be `xid`
    fn take_association(&self, xid: &Xid) -> Result<SharedTransaction> {
        let mut inner = self.inner.lock();
        let matches = inner
            .tx
            .as_ref()
            .is_some_and(|tx| tx.lock().xid() == Some(xid));
        if !matches {
            return Err(protocol_error(&format!("session is not associated with {xid}")));
        }
        inner
            .tx
            .take()
            .ok_or_else(|| protocol_error("session has no branch"))
    }

    fn require_unassociated(&self, xid: &Xid) -> Result<()> {
        if self.associated_xid().as_ref() == Some(xid) {
            return Err(protocol_error(&format!("{xid} is still associated; end it first")));
        }
        Ok(())
    }

    fn xa_operation(&self, body: PacketBody) -> Result<()> {
        use PacketBody as B;
        if !self.options.xa {
            return Err(protocol_error("session is not an XA session"));
        }
        match body {
            B::SessXaStart { xid } => {
                if self.inner.lock().tx.is_some() {
                    return Err(protocol_error("session already associated with a branch"));
                }
                let timeout = self.inner.lock().tx_timeout_secs;
                let tx = self.state.coordinator.start(&xid, timeout)?;
                self.associate(tx)
            }
            B::SessXaJoin { xid } => {
                let tx = self.state.coordinator.lookup(&xid)?;
                if tx.lock().state() != TransactionState::Active {
                    return Err(protocol_error(&format!("{xid} cannot be joined")));
                }
                self.associate(tx)
            }
            B::SessXaResume { xid } => {
                let tx = self.state.coordinator.lookup(&xid)?;
                if self.inner.lock().tx.is_some() {
                    return Err(protocol_error("session already associated with a branch"));
                }
                tx.lock().resume()?;
                self.associate(tx)
            }
            B::SessXaEnd { xid, failed } => {
                let tx = self.take_association(&xid)?;
                if failed {
                    tx.lock().mark_rollback_only();
                }
                Ok(())
            }
            B::SessXaSuspend => {
                let tx = self
                    .inner
                    .lock()
                    .tx
                    .take()
                    .ok_or_else(|| protocol_error("no branch to suspend"))?;
                let result = tx.lock().suspend();
                if let Err(e) = result {
                    self.inner.lock().tx = Some(tx);
                    return Err(e.into());
                }
                Ok(())
            }
            B::SessXaPrepare { xid } => {
                self.require_unassociated(&xid)?;
                self.state.coordinator.prepare(&xid)
            }
            B::SessXaCommit { xid, one_phase } => {
                self.require_unassociated(&xid)?;
                self.state.coordinator.commit(&xid, one_phase)
            }
            B::SessXaRollback { xid } => {
                if self.associated_xid().as_ref() == Some(&xid) {
                    self.inner.lock().tx = None;
                }
                self.state.coordinator.rollback(&xid)
            }
            B::SessXaForget { xid } => self.state.coordinator.forget(&xid),
            other => Err(CorvidError::Protocol(format!(
                "{:?} is not an XA operation",
                other.packet_type()
            ))),
        }
    }
}

fn protocol_error(message: &str) -> CorvidError {
    TransactionError::InvalidState(message.to_string()).into()
}

fn xa_response(result: Result<()>) -> PacketBody {
    match result {
        Ok(()) => PacketBody::SessXaResp {
            error: false,
            response_code: XA_OK,
            message: None,
        },
        Err(e) => PacketBody::SessXaResp {
            error: true,
            response_code: xa_code_for(&e),
            message: Some(e.to_string()),
        },
    }
}

impl PacketHandler for ServerSession {
    fn id(&self) -> u64 {
        self.channel_id
    }

    fn handle(&self, packet: Packet, connection: &Arc<RemotingConnection>) {
        if !Arc::ptr_eq(connection, &self.connection()) {
            let error = CorvidError::IllegalState(format!(
                "session {} belongs to another connection",
                self.name
            ));
            if packet.is_request() {
                connection.send_exception(self.channel_id, &error);
            } else {
                warn!(session = %self.name, connection_id = %connection.id(), "{}", error);
            }
            return;
        }

        let requires_response = packet.is_request();
        let packet_type = packet.packet_type();
        match self.process(packet.body) {
            Ok(Some(response)) => {
                if let Err(e) = connection.write(Packet::new(self.channel_id, response)) {
                    debug!(session = %self.name, error = %e, "Response not written");
                }
            }
            Ok(None) => {}
            Err(e) if requires_response => connection.send_exception(self.channel_id, &e),
            Err(e) => warn!(
                session = %self.name,
                packet_type = ?packet_type,
                error = %e,
                "One-way command failed"
            ),
        }
        self.count_command(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::handler::tests::test_state;
    use crate::remoting::connection::tests::{test_connection, RecordingTransport};
    use crate::transaction::{XAER_NOTA, XAER_PROTO};
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        state: Arc<BrokerState>,
        session: Arc<ServerSession>,
        connection: Arc<RemotingConnection>,
        transport: Arc<RecordingTransport>,
    }

    fn fixture(options: SessionOptions) -> Fixture {
        let (dir, state) = test_state();
        let (connection, transport) =
            test_connection(Arc::clone(&state.dispatcher), Duration::from_secs(1));
        let session = ServerSession::new(
            "s1".to_string(),
            state.dispatcher.generate_id(),
            Principal::anonymous(),
            options,
            Arc::clone(&connection),
            Arc::clone(&state),
        );
        state.add_session(Arc::clone(&session)).unwrap();
        state
            .post_office
            .create_queue("orders", "orders", None, false, false)
            .unwrap();
        Fixture {
            _dir: dir,
            state,
            session,
            connection,
            transport,
        }
    }

    impl Fixture {
        fn handle(&self, body: PacketBody) {
            let packet = Packet::new(self.session.channel_id(), body);
            self.session.handle(packet, &self.connection);
        }

        fn last(&self) -> PacketBody {
            self.transport.packets().pop().unwrap().body
        }

        fn message_count(&self) -> usize {
            self.state.post_office.queue("orders").unwrap().message_count()
        }

        fn received_ids(&self) -> Vec<u64> {
            self.transport
                .packets()
                .into_iter()
                .filter_map(|p| match p.body {
                    PacketBody::SessReceiveMsg { message, .. } => Some(message.message_id),
                    _ => None,
                })
                .collect()
        }

        fn consume(&self, consumer_id: u64) {
            self.handle(PacketBody::SessCreateConsumer {
                consumer_id,
                queue_name: "orders".into(),
                filter: None,
                browse_only: false,
            });
            self.handle(PacketBody::SessConsumerFlowCredit {
                consumer_id,
                credits: -1,
            });
            self.handle(PacketBody::SessStart);
        }
    }

    fn send(body: &'static str) -> PacketBody {
        PacketBody::SessSend {
            message: Message::new("orders", Bytes::from_static(body.as_bytes())),
            requires_response: true,
        }
    }

    fn xid(n: u8) -> Xid {
        Xid::new(1, Bytes::from(vec![n]), Bytes::from_static(b"b"))
    }

    #[tokio::test]
    async fn test_auto_commit_send_routes_immediately() {
        let f = fixture(SessionOptions::default());
        f.handle(send("m1"));
        assert_eq!(f.last(), PacketBody::NullResponse);
        assert_eq!(f.message_count(), 1);
    }

    #[tokio::test]
    async fn test_consumer_on_missing_queue_is_invalid_destination() {
        let f = fixture(SessionOptions::default());
        f.handle(PacketBody::SessCreateConsumer {
            consumer_id: 1,
            queue_name: "missing".into(),
            filter: None,
            browse_only: false,
        });
        match f.last() {
            PacketBody::Exception { code, .. } => {
                assert_eq!(code, crate::ErrorCode::InvalidDestination as i32)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_transaction_commit_and_rollback() {
        let f = fixture(SessionOptions {
            auto_commit_sends: false,
            auto_commit_acks: false,
            ..SessionOptions::default()
        });
        f.handle(send("m1"));
        assert_eq!(f.message_count(), 0);
        f.handle(PacketBody::SessCommit);
        assert_eq!(f.last(), PacketBody::NullResponse);
        assert_eq!(f.message_count(), 1);

        f.consume(7);
        let ids = f.received_ids();
        assert_eq!(ids.len(), 1);
        f.handle(PacketBody::SessAcknowledge {
            consumer_id: 7,
            message_id: ids[0],
            requires_response: true,
        });
        f.handle(PacketBody::SessRollback);
        // rolled back ack goes back to the queue and is redelivered
        assert_eq!(f.message_count(), 1);
        assert_eq!(f.received_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_auto_commit_acknowledge_is_cumulative() {
        let f = fixture(SessionOptions::default());
        f.handle(send("m1"));
        f.handle(send("m2"));
        f.consume(3);
        let ids = f.received_ids();
        f.handle(PacketBody::SessAcknowledge {
            consumer_id: 3,
            message_id: ids[1],
            requires_response: false,
        });
        assert_eq!(f.message_count(), 0);
    }

    #[tokio::test]
    async fn test_packets_confirmed_every_batch() {
        let f = fixture(SessionOptions {
            confirmation_batch_size: 2,
            ..SessionOptions::default()
        });
        for _ in 0..4 {
            f.handle(PacketBody::SessStart);
        }
        let confirmations: Vec<i64> = f
            .transport
            .packets()
            .into_iter()
            .filter_map(|p| match p.body {
                PacketBody::PacketsConfirmed { command_id } => Some(command_id),
                _ => None,
            })
            .collect();
        assert_eq!(confirmations, vec![1, 3]);
        assert_eq!(f.session.last_received_command_id(), 3);
    }

    #[tokio::test]
    async fn test_xa_two_phase_commit() {
        let f = fixture(SessionOptions {
            xa: true,
            auto_commit_sends: false,
            auto_commit_acks: false,
            ..SessionOptions::default()
        });
        let ok = PacketBody::SessXaResp {
            error: false,
            response_code: XA_OK,
            message: None,
        };
        f.handle(PacketBody::SessXaStart { xid: xid(1) });
        assert_eq!(f.last(), ok);
        f.handle(send("m1"));
        f.handle(PacketBody::SessXaEnd {
            xid: xid(1),
            failed: false,
        });
        f.handle(PacketBody::SessXaPrepare { xid: xid(1) });
        assert_eq!(f.last(), ok);
        f.handle(PacketBody::SessXaInDoubtXids);
        assert_eq!(
            f.last(),
            PacketBody::SessXaInDoubtXidsResp { xids: vec![xid(1)] }
        );
        assert_eq!(f.message_count(), 0);
        f.handle(PacketBody::SessXaCommit {
            xid: xid(1),
            one_phase: false,
        });
        assert_eq!(f.last(), ok);
        assert_eq!(f.message_count(), 1);
    }

    #[tokio::test]
    async fn test_xa_protocol_errors() {
        let f = fixture(SessionOptions {
            xa: true,
            ..SessionOptions::default()
        });
        f.handle(PacketBody::SessXaStart { xid: xid(1) });
        f.handle(PacketBody::SessXaStart { xid: xid(2) });
        assert!(matches!(
            f.last(),
            PacketBody::SessXaResp { error: true, response_code, .. } if response_code == XAER_PROTO
        ));
        f.handle(PacketBody::SessXaCommit {
            xid: xid(1),
            one_phase: true,
        });
        assert!(matches!(
            f.last(),
            PacketBody::SessXaResp { error: true, response_code, .. } if response_code == XAER_PROTO
        ));
        f.handle(PacketBody::SessXaCommit {
            xid: xid(9),
            one_phase: true,
        });
        assert!(matches!(
            f.last(),
            PacketBody::SessXaResp { error: true, response_code, .. } if response_code == XAER_NOTA
        ));
    }

    #[tokio::test]
    async fn test_xa_suspend_and_resume() {
        let f = fixture(SessionOptions {
            xa: true,
            ..SessionOptions::default()
        });
        f.handle(PacketBody::SessXaStart { xid: xid(4) });
        f.handle(send("m1"));
        f.handle(PacketBody::SessXaSuspend);
        // not associated any more: this send auto-commits
        f.handle(send("m2"));
        assert_eq!(f.message_count(), 1);
        f.handle(PacketBody::SessXaResume { xid: xid(4) });
        f.handle(PacketBody::SessXaEnd {
            xid: xid(4),
            failed: false,
        });
        f.handle(PacketBody::SessXaCommit {
            xid: xid(4),
            one_phase: true,
        });
        assert_eq!(f.message_count(), 2);
    }

    #[tokio::test]
    async fn test_timeout_round_trip() {
        let f = fixture(SessionOptions {
            xa: true,
            ..SessionOptions::default()
        });
        f.handle(PacketBody::SessXaGetTimeout);
        assert_eq!(
            f.last(),
            PacketBody::SessXaGetTimeoutResp {
                timeout_seconds: f.state.coordinator.default_timeout_secs()
            }
        );
        f.handle(PacketBody::SessXaSetTimeout { timeout_seconds: 42 });
        assert_eq!(f.last(), PacketBody::SessXaSetTimeoutResp { ok: true });
        f.handle(PacketBody::SessXaGetTimeout);
        assert_eq!(
            f.last(),
            PacketBody::SessXaGetTimeoutResp { timeout_seconds: 42 }
        );
    }

    #[tokio::test]
    async fn test_close_returns_deliveries_and_unregisters() {
        let f = fixture(SessionOptions::default());
        f.handle(send("m1"));
        f.consume(1);
        assert_eq!(f.state.post_office.queue("orders").unwrap().delivering_count(), 1);

        f.handle(PacketBody::SessClose);
        assert_eq!(f.last(), PacketBody::NullResponse);
        assert!(f.session.is_closed());
        assert!(f.state.dispatcher.handler(f.session.channel_id()).is_none());
        assert_eq!(f.state.session_count(), 0);
        let queue = f.state.post_office.queue("orders").unwrap();
        assert_eq!(queue.delivering_count(), 0);
        assert_eq!(queue.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_reattach_redelivers_in_flight() {
        let f = fixture(SessionOptions {
            confirmation_batch_size: 10,
            ..SessionOptions::default()
        });
        f.handle(send("m1"));
        f.consume(1);
        assert_eq!(f.received_ids().len(), 1);
        f.session.detach();
        assert!(f.session.is_detached());

        let (replacement, transport) =
            test_connection(Arc::clone(&f.state.dispatcher), Duration::from_secs(1));
        let last = f.session.reattach(Arc::clone(&replacement)).unwrap();
        assert_eq!(last, 3);
        assert!(!f.session.is_detached());

        // the client grants a fresh window after reattach
        let packet = Packet::new(
            f.session.channel_id(),
            PacketBody::SessConsumerFlowCredit {
                consumer_id: 1,
                credits: -1,
            },
        );
        f.session.handle(packet, &replacement);
        let redelivered = transport
            .packets()
            .into_iter()
            .filter(|p| matches!(p.body, PacketBody::SessReceiveMsg { .. }))
            .count();
        assert_eq!(redelivered, 1);
    }

    #[tokio::test]
    async fn test_packet_from_foreign_connection_rejected() {
        let f = fixture(SessionOptions::default());
        let (other, transport) =
            test_connection(Arc::clone(&f.state.dispatcher), Duration::from_secs(1));
        f.session
            .handle(Packet::new(f.session.channel_id(), PacketBody::SessCommit), &other);
        let written = transport.packets();
        assert!(matches!(written[0].body, PacketBody::Exception { .. }));
        assert_eq!(f.session.last_received_command_id(), -1);
    }
}
