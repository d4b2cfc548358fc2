//! Client end of a server session
//!
//! Every packet sent on the session channel gets the next command id, the
//! same count the server keeps. One-way commands stay in a replay log until
//! the server confirms them, so a session that reattaches after a
//! connection failure can resend exactly what the server never saw.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::consumer::{ClientConsumer, ConsumerCore};
use super::credits::{CreditRequester, ProducerCreditManager};
use super::producer::ClientProducer;
use super::session_factory::ClientSessionFactory;
use crate::config::{ClientConfig, PROTOCOL_VERSION};
use crate::protocol::{Packet, PacketBody, Xid, CONTROL_CHANNEL_ID};
use crate::remoting::{PacketDispatcher, PacketHandler, RemotingConnection};
use crate::transaction::TransactionError;
use crate::{CorvidError, Result};

/// Transaction mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFlags {
    pub xa: bool,
    pub auto_commit_sends: bool,
    pub auto_commit_acks: bool,
}

impl SessionFlags {
    pub fn auto_commit() -> Self {
        Self {
            xa: false,
            auto_commit_sends: true,
            auto_commit_acks: true,
        }
    }

    pub fn transacted() -> Self {
        Self {
            xa: false,
            auto_commit_sends: false,
            auto_commit_acks: false,
        }
    }

    pub fn xa() -> Self {
        Self {
            xa: true,
            auto_commit_sends: false,
            auto_commit_acks: false,
        }
    }

    fn is_transacted(&self) -> bool {
        self.xa || !self.auto_commit_sends || !self.auto_commit_acks
    }
}

/// Result of a queue query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueQuery {
    pub exists: bool,
    pub address: Option<String>,
    pub filter: Option<String>,
    pub durable: bool,
    pub temporary: bool,
    pub consumer_count: i32,
    pub message_count: i64,
}

pub(crate) fn create_session_packet(config: &ClientConfig, name: &str, flags: SessionFlags) -> PacketBody {
    PacketBody::CreateSession {
        name: name.to_string(),
        version: PROTOCOL_VERSION,
        username: config.username.clone(),
        password: config.password.clone(),
        xa: flags.xa,
        auto_commit_sends: flags.auto_commit_sends,
        auto_commit_acks: flags.auto_commit_acks,
        pre_acknowledge: config.pre_acknowledge,
        confirmation_batch_size: config.confirmation_batch_size,
    }
}

fn unexpected(body: &PacketBody) -> CorvidError {
    CorvidError::Protocol(format!("unexpected response {:?}", body.packet_type()))
}

#[derive(Default)]
struct CommandLog {
    next_id: i64,
    /// One-way commands the server has not confirmed, oldest first
    unconfirmed: VecDeque<(i64, PacketBody)>,
}

pub(crate) struct SessionCore {
    name: RwLock<String>,
    channel_id: AtomicU64,
    flags: SessionFlags,
    config: Arc<ClientConfig>,
    connection: RwLock<Arc<RemotingConnection>>,
    factory: Weak<ClientSessionFactory>,
    credits: ProducerCreditManager,
    consumers: Mutex<HashMap<u64, Arc<ConsumerCore>>>,
    next_consumer_id: AtomicU64,
    commands: Mutex<CommandLog>,
    /// Keep unconfirmed commands for replay
    replay: bool,
    received: AtomicI64,
    started: AtomicBool,
    closed: AtomicBool,
    /// The transaction did not survive a failover
    rollback_only: AtomicBool,
}

struct CreditRequests(Weak<SessionCore>);

impl CreditRequester for CreditRequests {
    fn request_credits(&self, address: &str, credits: i32) {
        let Some(session) = self.0.upgrade() else {
            return;
        };
        if let Err(e) = session.send_one_way(PacketBody::SessProducerRequestCredits {
            address: address.to_string(),
            credits,
        }) {
            debug!(address, error = %e, "Credit request not sent");
        }
    }
}

/// Routes the packets of one session channel to the session
pub(crate) struct SessionChannel {
    channel_id: u64,
    session: Weak<SessionCore>,
}

impl SessionChannel {
    pub(crate) fn new(channel_id: u64, session: &Arc<SessionCore>) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            session: Arc::downgrade(session),
        })
    }
}

impl PacketHandler for SessionChannel {
    fn id(&self) -> u64 {
        self.channel_id
    }

    fn handle(&self, packet: Packet, _connection: &Arc<RemotingConnection>) {
        if let Some(session) = self.session.upgrade() {
            session.handle_packet(packet.body);
        }
    }
}

impl SessionCore {
    pub(crate) fn new(
        name: String,
        channel_id: u64,
        flags: SessionFlags,
        config: Arc<ClientConfig>,
        connection: Arc<RemotingConnection>,
        factory: Weak<ClientSessionFactory>,
    ) -> Arc<Self> {
        let replay = config.confirmation_batch_size > 0 && config.reconnect_attempts != 0;
        Arc::new_cyclic(|weak| Self {
            name: RwLock::new(name),
            channel_id: AtomicU64::new(channel_id),
            flags,
            credits: ProducerCreditManager::new(
                config.producer_window_size,
                Arc::new(CreditRequests(weak.clone())),
            ),
            config,
            connection: RwLock::new(connection),
            factory,
            consumers: Mutex::new(HashMap::new()),
            next_consumer_id: AtomicU64::new(0),
            commands: Mutex::new(CommandLog::default()),
            replay,
            received: AtomicI64::new(0),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            rollback_only: AtomicBool::new(false),
        })
    }

    pub(crate) fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn channel_id(&self) -> u64 {
        self.channel_id.load(Ordering::Acquire)
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn credits(&self) -> &ProducerCreditManager {
        &self.credits
    }

    pub(crate) fn pre_acknowledge(&self) -> bool {
        self.config.pre_acknowledge
    }

    pub(crate) fn connection(&self) -> Arc<RemotingConnection> {
        Arc::clone(&self.connection.read())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CorvidError::ObjectClosed(format!("session {}", self.name())));
        }
        Ok(())
    }

    fn consumer(&self, consumer_id: u64) -> Option<Arc<ConsumerCore>> {
        self.consumers.lock().get(&consumer_id).cloned()
    }

    fn consumers_snapshot(&self) -> Vec<Arc<ConsumerCore>> {
        self.consumers.lock().values().cloned().collect()
    }

    pub(crate) fn remove_consumer(&self, consumer_id: u64) {
        self.consumers.lock().remove(&consumer_id);
    }

    /// Fire-and-forget command on the session channel
    pub(crate) fn send_one_way(&self, body: PacketBody) -> Result<()> {
        self.check_open()?;
        let connection = self.connection();
        let channel_id = self.channel_id();
        let mut commands = self.commands.lock();
        let command_id = commands.next_id;
        commands.next_id += 1;
        if self.replay {
            commands.unconfirmed.push_back((command_id, body.clone()));
        }
        match connection.write(Packet::new(channel_id, body)) {
            Ok(()) => Ok(()),
            // kept for the replay after reconnecting
            Err(e) if self.replay => {
                trace!(command_id, error = %e, "Command buffered while disconnected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Command that waits for its response
    pub(crate) async fn request(&self, body: PacketBody) -> Result<Packet> {
        self.check_open()?;
        let connection = self.connection();
        let channel_id = self.channel_id();
        self.commands.lock().next_id += 1;
        connection.send_blocking(channel_id, body).await
    }

    fn confirmed(&self, command_id: i64) {
        let mut commands = self.commands.lock();
        while commands
            .unconfirmed
            .front()
            .is_some_and(|(id, _)| *id <= command_id)
        {
            commands.unconfirmed.pop_front();
        }
    }

    pub(crate) fn unconfirmed_len(&self) -> usize {
        self.commands.lock().unconfirmed.len()
    }

    fn handle_packet(&self, body: PacketBody) {
        self.received.fetch_add(1, Ordering::AcqRel);
        match body {
            PacketBody::SessReceiveMsg {
                consumer_id,
                delivery_count,
                message,
            } => match self.consumer(consumer_id) {
                Some(consumer) => consumer.deliver(message, delivery_count),
                None => trace!(consumer_id, "Message for unknown consumer dropped"),
            },
            PacketBody::SessProducerCredits { address, credits } => {
                self.credits.receive_credits(&address, credits)
            }
            PacketBody::PacketsConfirmed { command_id } => self.confirmed(command_id),
            other => warn!(
                session = %self.name(),
                packet_type = ?other.packet_type(),
                "Unexpected packet on session channel"
            ),
        }
    }

    fn flush_acks(&self) -> Result<()> {
        for consumer in self.consumers_snapshot() {
            if let Some(ack) = consumer.take_pending_ack() {
                self.send_one_way(ack)?;
            }
        }
        Ok(())
    }

    /// Move to `connection` after a failure: reattach to the server session
    /// if it still exists, otherwise create a new one and its consumers
    pub(crate) async fn failover(
        self: &Arc<Self>,
        connection: Arc<RemotingConnection>,
        dispatcher: &Arc<PacketDispatcher>,
    ) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        *self.connection.write() = Arc::clone(&connection);
        for consumer in self.consumers_snapshot() {
            consumer.clear_for_failover();
        }

        let name = self.name();
        let response = connection
            .send_blocking(
                CONTROL_CHANNEL_ID,
                PacketBody::ReattachSession {
                    name: name.clone(),
                    last_received_command_id: self.received.load(Ordering::Acquire) - 1,
                },
            )
            .await?;
        match response.body {
            PacketBody::ReattachSessionResp {
                reattached: true,
                session_channel_id,
                last_received_command_id,
            } if session_channel_id == self.channel_id() => {
                let replayed = self.replay_from(last_received_command_id)?;
                info!(session = %name, replayed, "Session reattached");
            }
            _ => self.recreate(&connection, dispatcher).await?,
        }

        let window = self.config.consumer_window_size;
        for consumer in self.consumers_snapshot() {
            self.send_one_way(PacketBody::SessConsumerFlowCredit {
                consumer_id: consumer.id(),
                credits: window,
            })?;
        }
        self.credits.reset();
        self.send_one_way(PacketBody::SessFailoverComplete { name: self.name() })
    }

    /// Drop what the server already has and resend the rest, renumbered
    /// from the server's count
    fn replay_from(&self, server_last: i64) -> Result<usize> {
        let connection = self.connection();
        let channel_id = self.channel_id();
        let mut commands = self.commands.lock();
        while commands
            .unconfirmed
            .front()
            .is_some_and(|(id, _)| *id <= server_last)
        {
            commands.unconfirmed.pop_front();
        }
        let mut next_id = server_last + 1;
        for (command_id, body) in commands.unconfirmed.iter_mut() {
            *command_id = next_id;
            next_id += 1;
            connection.write(Packet::new(channel_id, body.clone()))?;
        }
        commands.next_id = next_id;
        Ok(commands.unconfirmed.len())
    }

    async fn recreate(
        self: &Arc<Self>,
        connection: &Arc<RemotingConnection>,
        dispatcher: &Arc<PacketDispatcher>,
    ) -> Result<()> {
        dispatcher.unregister(self.channel_id());
        let name = Uuid::new_v4().to_string();
        let response = connection
            .send_blocking(
                CONTROL_CHANNEL_ID,
                create_session_packet(&self.config, &name, self.flags),
            )
            .await?;
        let channel_id = match response.body {
            PacketBody::CreateSessionResp {
                session_channel_id, ..
            } => session_channel_id,
            other => return Err(unexpected(&other)),
        };

        let old_name = std::mem::replace(&mut *self.name.write(), name.clone());
        self.channel_id.store(channel_id, Ordering::Release);
        {
            let mut commands = self.commands.lock();
            if !commands.unconfirmed.is_empty() {
                warn!(
                    session = %old_name,
                    lost = commands.unconfirmed.len(),
                    "Unconfirmed commands lost with the old session"
                );
            }
            *commands = CommandLog::default();
        }
        dispatcher.register(SessionChannel::new(channel_id, self));
        if self.flags.is_transacted() {
            self.rollback_only.store(true, Ordering::Release);
        }

        for consumer in self.consumers_snapshot() {
            if let Err(e) = self.request(consumer.create_packet()).await {
                warn!(consumer_id = consumer.id(), error = %e, "Consumer not recreated");
                self.remove_consumer(consumer.id());
                consumer.fail(&e.to_string());
            }
        }
        if self.started.load(Ordering::Acquire) {
            self.send_one_way(PacketBody::SessStart)?;
        }
        info!(old = %old_name, session = %name, "Session recreated");
        Ok(())
    }

    /// The connection is gone for good
    pub(crate) fn fail(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let consumers: Vec<Arc<ConsumerCore>> =
            self.consumers.lock().drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            consumer.fail(reason);
        }
        self.credits.close();
        *self.commands.lock() = CommandLog::default();
        if let Some(factory) = self.factory.upgrade() {
            factory.dispatcher().unregister(self.channel_id());
        }
        warn!(session = %self.name(), reason, "Session failed");
    }

    pub(crate) async fn close(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if let Err(e) = self.flush_acks() {
            debug!(session = %self.name(), error = %e, "Pending acknowledgements not sent");
        }
        if let Err(e) = self.request(PacketBody::SessClose).await {
            debug!(session = %self.name(), error = %e, "Server side close failed");
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let consumers: Vec<Arc<ConsumerCore>> =
            self.consumers.lock().drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            consumer.close();
        }
        self.credits.close();
        if let Some(factory) = self.factory.upgrade() {
            factory.dispatcher().unregister(self.channel_id());
            factory.session_closed(self);
        }
        info!(session = %self.name(), "Session closed");
        Ok(())
    }
}

/// A session created by a [`ClientSessionFactory`]
pub struct ClientSession {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("name", &self.core.name())
            .field("channel_id", &self.core.channel_id())
            .field("flags", &self.core.flags)
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

impl ClientSession {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    pub fn name(&self) -> String {
        self.core.name()
    }

    pub fn channel_id(&self) -> u64 {
        self.core.channel_id()
    }

    pub fn flags(&self) -> SessionFlags {
        self.core.flags
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// One-way commands awaiting confirmation
    pub fn unconfirmed_commands(&self) -> usize {
        self.core.unconfirmed_len()
    }

    pub async fn create_queue(
        &self,
        address: &str,
        queue_name: &str,
        filter: Option<&str>,
        durable: bool,
    ) -> Result<()> {
        self.core
            .request(PacketBody::CreateQueue {
                address: address.to_string(),
                queue_name: queue_name.to_string(),
                filter: filter.map(str::to_string),
                durable,
                temporary: false,
            })
            .await?;
        Ok(())
    }

    /// Queue that lives as long as this session's connection
    pub async fn create_temporary_queue(&self, address: &str, queue_name: &str) -> Result<()> {
        self.core
            .request(PacketBody::CreateQueue {
                address: address.to_string(),
                queue_name: queue_name.to_string(),
                filter: None,
                durable: false,
                temporary: true,
            })
            .await?;
        if let Some(factory) = self.core.factory.upgrade() {
            factory.temporary_queue_created(queue_name);
        }
        Ok(())
    }

    pub async fn delete_queue(&self, queue_name: &str) -> Result<()> {
        self.core
            .request(PacketBody::DeleteQueue {
                queue_name: queue_name.to_string(),
            })
            .await?;
        if let Some(factory) = self.core.factory.upgrade() {
            factory.temporary_queue_deleted(queue_name);
        }
        Ok(())
    }

    pub async fn queue_query(&self, queue_name: &str) -> Result<QueueQuery> {
        let response = self
            .core
            .request(PacketBody::SessQueueQuery {
                queue_name: queue_name.to_string(),
            })
            .await?;
        match response.body {
            PacketBody::SessQueueQueryResp {
                exists,
                address,
                filter,
                durable,
                temporary,
                consumer_count,
                message_count,
            } => Ok(QueueQuery {
                exists,
                address,
                filter,
                durable,
                temporary,
                consumer_count,
                message_count,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Names of the queues bound to `address`
    pub async fn binding_query(&self, address: &str) -> Result<Vec<String>> {
        let response = self
            .core
            .request(PacketBody::SessBindingQuery {
                address: address.to_string(),
            })
            .await?;
        match response.body {
            PacketBody::SessBindingQueryResp { queue_names, .. } => Ok(queue_names),
            other => Err(unexpected(&other)),
        }
    }

    pub fn create_producer(&self, address: &str) -> Result<ClientProducer> {
        self.core.check_open()?;
        let credits = self.core.credits().get_credits(address, false)?;
        Ok(ClientProducer::new(
            Arc::clone(&self.core),
            Some(address.to_string()),
            Some(credits),
        ))
    }

    /// Producer that sends to each message's own address
    pub fn create_anonymous_producer(&self) -> Result<ClientProducer> {
        self.core.check_open()?;
        Ok(ClientProducer::new(Arc::clone(&self.core), None, None))
    }

    pub async fn create_consumer(&self, queue_name: &str) -> Result<ClientConsumer> {
        self.create_consumer_with(queue_name, None, false).await
    }

    /// Consumer that iterates the queue without removing messages
    pub async fn create_browser(
        &self,
        queue_name: &str,
        filter: Option<&str>,
    ) -> Result<ClientConsumer> {
        self.create_consumer_with(queue_name, filter, true).await
    }

    pub async fn create_consumer_with(
        &self,
        queue_name: &str,
        filter: Option<&str>,
        browse_only: bool,
    ) -> Result<ClientConsumer> {
        self.core.check_open()?;
        let consumer_id = self.core.next_consumer_id.fetch_add(1, Ordering::AcqRel);
        let consumer = Arc::new(ConsumerCore::new(
            consumer_id,
            queue_name.to_string(),
            filter.map(str::to_string),
            browse_only,
        ));
        self.core
            .consumers
            .lock()
            .insert(consumer_id, Arc::clone(&consumer));

        if let Err(e) = self.core.request(consumer.create_packet()).await {
            self.core.remove_consumer(consumer_id);
            consumer.close();
            return Err(e);
        }
        self.core.send_one_way(PacketBody::SessConsumerFlowCredit {
            consumer_id,
            credits: self.core.config.consumer_window_size,
        })?;
        debug!(consumer_id, queue = %queue_name, browse_only, "Consumer created");
        Ok(ClientConsumer::new(Arc::clone(&self.core), consumer))
    }

    /// Let the server push messages to this session's consumers
    pub fn start(&self) -> Result<()> {
        self.core.send_one_way(PacketBody::SessStart)?;
        self.core.started.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.core.send_one_way(PacketBody::SessStop)?;
        self.core.started.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.core.started.load(Ordering::Acquire)
    }

    /// Commit the local transaction. Fails with a rolled back transaction
    /// error when a failover lost the work done so far.
    pub async fn commit(&self) -> Result<()> {
        self.core.check_open()?;
        self.core.flush_acks()?;
        if self.core.rollback_only.swap(false, Ordering::AcqRel) {
            self.core.request(PacketBody::SessRollback).await?;
            return Err(TransactionError::RolledBack(
                "the session failed over during the transaction".to_string(),
            )
            .into());
        }
        self.core.request(PacketBody::SessCommit).await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.core.check_open()?;
        self.core.flush_acks()?;
        self.core.rollback_only.store(false, Ordering::Release);
        self.core.request(PacketBody::SessRollback).await?;
        Ok(())
    }

    async fn xa_call(&self, body: PacketBody) -> Result<()> {
        let response = self.core.request(body).await?;
        match response.body {
            PacketBody::SessXaResp { error: false, .. } => Ok(()),
            PacketBody::SessXaResp {
                error: true,
                response_code,
                message,
            } => Err(TransactionError::from_xa_code(response_code, message.unwrap_or_default()).into()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn xa_start(&self, xid: &Xid) -> Result<()> {
        self.xa_call(PacketBody::SessXaStart { xid: xid.clone() }).await
    }

    /// Join a branch another session started
    pub async fn xa_join(&self, xid: &Xid) -> Result<()> {
        self.xa_call(PacketBody::SessXaJoin { xid: xid.clone() }).await
    }

    pub async fn xa_end(&self, xid: &Xid, failed: bool) -> Result<()> {
        self.core.flush_acks()?;
        self.xa_call(PacketBody::SessXaEnd {
            xid: xid.clone(),
            failed,
        })
        .await
    }

    pub async fn xa_suspend(&self) -> Result<()> {
        self.core.flush_acks()?;
        self.xa_call(PacketBody::SessXaSuspend).await
    }

    pub async fn xa_resume(&self, xid: &Xid) -> Result<()> {
        self.xa_call(PacketBody::SessXaResume { xid: xid.clone() }).await
    }

    pub async fn xa_prepare(&self, xid: &Xid) -> Result<()> {
        self.xa_call(PacketBody::SessXaPrepare { xid: xid.clone() }).await
    }

    pub async fn xa_commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.xa_call(PacketBody::SessXaCommit {
            xid: xid.clone(),
            one_phase,
        })
        .await
    }

    pub async fn xa_rollback(&self, xid: &Xid) -> Result<()> {
        self.xa_call(PacketBody::SessXaRollback { xid: xid.clone() }).await
    }

    pub async fn xa_forget(&self, xid: &Xid) -> Result<()> {
        self.xa_call(PacketBody::SessXaForget { xid: xid.clone() }).await
    }

    /// Prepared branches awaiting a decision
    pub async fn xa_recover(&self) -> Result<Vec<Xid>> {
        let response = self.core.request(PacketBody::SessXaInDoubtXids).await?;
        match response.body {
            PacketBody::SessXaInDoubtXidsResp { xids } => Ok(xids),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn set_transaction_timeout(&self, timeout_seconds: i32) -> Result<bool> {
        let response = self
            .core
            .request(PacketBody::SessXaSetTimeout { timeout_seconds })
            .await?;
        match response.body {
            PacketBody::SessXaSetTimeoutResp { ok } => Ok(ok),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn transaction_timeout(&self) -> Result<i32> {
        let response = self.core.request(PacketBody::SessXaGetTimeout).await?;
        match response.body {
            PacketBody::SessXaGetTimeoutResp { timeout_seconds } => Ok(timeout_seconds),
            other => Err(unexpected(&other)),
        }
    }

    /// Close the session and everything created from it
    pub async fn close(&self) -> Result<()> {
        self.core.close().await
    }
}
