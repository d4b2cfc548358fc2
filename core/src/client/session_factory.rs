//! Session factory: owns the client's connection to one server
//!
//! The factory connects through the configured connector, pings the server
//! and watches the connection. When the connection fails it either fails
//! every session (no reconnect configured) or reconnects and moves each
//! session to the new connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::session::{create_session_packet, ClientSession, SessionChannel, SessionCore, SessionFlags};
use crate::config::ClientConfig;
use crate::protocol::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::protocol::{Packet, PacketBody, CONTROL_CHANNEL_ID};
use crate::remoting::transport::{
    create_connector, ConnectionLifeCycleListener, Connector, FrameHandler, TransportConnection,
};
use crate::remoting::{FailureListener, PacketDispatcher, RemotingConnection, TransportContext};
use crate::{CorvidError, Result};

/// Turns transport events for one client connection into packets
struct ClientListener {
    dispatcher: Arc<PacketDispatcher>,
    call_timeout: Duration,
    ttl_ms: i64,
    connection: RwLock<Option<Arc<RemotingConnection>>>,
}

impl ClientListener {
    fn connection(&self) -> Option<Arc<RemotingConnection>> {
        self.connection.read().clone()
    }
}

impl ConnectionLifeCycleListener for ClientListener {
    fn connection_created(&self, transport: Arc<dyn TransportConnection>) {
        let connection = RemotingConnection::new(
            transport,
            Arc::clone(&self.dispatcher),
            self.call_timeout,
            self.ttl_ms,
            None,
        );
        *self.connection.write() = Some(connection);
    }

    fn connection_destroyed(&self, connection_id: &str) {
        if let Some(connection) = self.connection() {
            debug!(connection_id, "Server closed the connection");
            connection.fail(CorvidError::ConnectionFailed(
                "connection closed by server".to_string(),
            ));
        }
    }

    fn connection_exception(&self, connection_id: &str, error: CorvidError) {
        if let Some(connection) = self.connection() {
            debug!(connection_id, error = %error, "Connection exception");
            connection.fail(error);
        }
    }
}

impl FrameHandler for ClientListener {
    fn frame_received(&self, connection_id: &str, frame: Bytes) {
        let Some(connection) = self.connection() else {
            trace!(connection_id, "Frame before connection setup");
            return;
        };
        match connection.decode(frame) {
            Ok(Some(packet)) => connection.packet_received(packet),
            Ok(None) => {}
            Err(e) => {
                connection.fail(e);
            }
        }
    }
}

/// Hands a connection failure to the factory that owns the connection
struct FactoryWatch(Weak<ClientSessionFactory>);

impl FailureListener for FactoryWatch {
    fn connection_failed(&self, error: &CorvidError) {
        if let Some(factory) = self.0.upgrade() {
            factory.connection_failed(error);
        }
    }
}

pub struct ClientSessionFactory {
    config: Arc<ClientConfig>,
    connector: Box<dyn Connector>,
    dispatcher: Arc<PacketDispatcher>,
    connection: RwLock<Option<Arc<RemotingConnection>>>,
    sessions: Mutex<Vec<Arc<SessionCore>>>,
    temp_queues: Mutex<Vec<String>>,
    listeners: Mutex<Vec<Arc<dyn FailureListener>>>,
    pinger: Mutex<Option<JoinHandle<()>>>,
    failover_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    me: Weak<ClientSessionFactory>,
}

impl std::fmt::Debug for ClientSessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSessionFactory")
            .field("connector", &self.connector.describe())
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientSessionFactory {
    /// Connect to the server described by `config.connector`
    pub async fn connect(config: ClientConfig, context: TransportContext) -> Result<Arc<Self>> {
        config.validate().map_err(CorvidError::Config)?;
        let connector = create_connector(&config.connector, &context, DEFAULT_MAX_FRAME_SIZE);
        let factory = Arc::new_cyclic(|me| Self {
            config: Arc::new(config),
            connector,
            dispatcher: Arc::new(PacketDispatcher::new()),
            connection: RwLock::new(None),
            sessions: Mutex::new(Vec::new()),
            temp_queues: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            pinger: Mutex::new(None),
            failover_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            me: me.clone(),
        });
        factory.establish().await?;
        info!(server = %factory.connector.describe(), "Connected to server");
        Ok(factory)
    }

    async fn establish(&self) -> Result<Arc<RemotingConnection>> {
        let listener = Arc::new(ClientListener {
            dispatcher: Arc::clone(&self.dispatcher),
            call_timeout: Duration::from_millis(self.config.call_timeout_ms),
            ttl_ms: self.config.connection_ttl_ms,
            connection: RwLock::new(None),
        });
        let transport = self.connector.connect(listener.clone()).await?;
        let connection = listener.connection().ok_or_else(|| {
            transport.close();
            CorvidError::ConnectionFailed(format!(
                "{} did not report the new connection",
                self.connector.describe()
            ))
        })?;

        connection.add_failure_listener(Arc::new(FactoryWatch(self.me.clone())));
        let pinger = connection.spawn_pinger(Duration::from_millis(
            self.config.client_failure_check_period_ms,
        ));
        if let Some(old) = self.pinger.lock().replace(pinger) {
            old.abort();
        }
        *self.connection.write() = Some(Arc::clone(&connection));
        Ok(connection)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    /// The current connection
    pub fn connection(&self) -> Result<Arc<RemotingConnection>> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| CorvidError::ConnectionFailed("not connected".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Told about every connection failure, before any reconnect attempt
    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        self.listeners.lock().push(listener);
    }

    /// Auto-commit session
    pub async fn create_session(&self) -> Result<ClientSession> {
        self.create_session_with(SessionFlags::auto_commit()).await
    }

    /// Session with a local transaction for sends and acknowledgements
    pub async fn create_transacted_session(&self) -> Result<ClientSession> {
        self.create_session_with(SessionFlags::transacted()).await
    }

    pub async fn create_xa_session(&self) -> Result<ClientSession> {
        self.create_session_with(SessionFlags::xa()).await
    }

    pub async fn create_session_with(&self, flags: SessionFlags) -> Result<ClientSession> {
        if self.is_closed() {
            return Err(CorvidError::ObjectClosed("session factory".to_string()));
        }
        let connection = self.connection()?;
        let name = Uuid::new_v4().to_string();
        let response = connection
            .send_blocking(
                CONTROL_CHANNEL_ID,
                create_session_packet(&self.config, &name, flags),
            )
            .await?;
        let channel_id = match response.body {
            PacketBody::CreateSessionResp {
                session_channel_id, ..
            } => session_channel_id,
            other => {
                return Err(CorvidError::Protocol(format!(
                    "unexpected response {:?}",
                    other.packet_type()
                )))
            }
        };

        let core = SessionCore::new(
            name,
            channel_id,
            flags,
            Arc::clone(&self.config),
            connection,
            self.me.clone(),
        );
        self.dispatcher.register(SessionChannel::new(channel_id, &core));
        self.sessions.lock().push(Arc::clone(&core));
        debug!(session = %core.name(), channel_id, "Session created");
        Ok(ClientSession::new(core))
    }

    pub(crate) fn session_closed(&self, session: &Arc<SessionCore>) {
        self.sessions.lock().retain(|s| !Arc::ptr_eq(s, session));
    }

    pub(crate) fn temporary_queue_created(&self, queue_name: &str) {
        self.temp_queues.lock().push(queue_name.to_string());
    }

    pub(crate) fn temporary_queue_deleted(&self, queue_name: &str) {
        self.temp_queues.lock().retain(|q| q != queue_name);
    }

    fn connection_failed(&self, error: &CorvidError) {
        if self.is_closed() {
            return;
        }
        warn!(error = %error, "Connection to server failed");
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.connection_failed(error);
        }
        let Some(factory) = self.me.upgrade() else {
            return;
        };
        let reason = error.to_string();
        tokio::spawn(async move {
            factory.failover(reason).await;
        });
    }

    async fn failover(self: Arc<Self>, reason: String) {
        let _guard = self.failover_lock.lock().await;
        if self.is_closed() {
            return;
        }
        let attempts = self.config.reconnect_attempts;
        if attempts == 0 {
            self.fail_sessions(&reason);
            return;
        }

        let retry_interval = Duration::from_millis(self.config.retry_interval_ms);
        let mut attempt = 0;
        let connection = loop {
            attempt += 1;
            tokio::time::sleep(retry_interval).await;
            if self.is_closed() {
                return;
            }
            match self.establish().await {
                Ok(connection) => break connection,
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    if attempts > 0 && attempt >= attempts {
                        self.fail_sessions(&format!("{reason}; reconnect failed: {e}"));
                        return;
                    }
                }
            }
        };
        info!(attempt, connection_id = %connection.id(), "Reconnected to server");

        let sessions = self.sessions.lock().clone();
        for session in sessions {
            if let Err(e) = session.failover(Arc::clone(&connection), &self.dispatcher).await {
                warn!(session = %session.name(), error = %e, "Session failover failed");
                session.fail(&e.to_string());
                self.session_closed(&session);
            }
        }
    }

    fn fail_sessions(&self, reason: &str) {
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in sessions {
            session.fail(reason);
        }
    }

    /// Close every session, delete the temporary queues and disconnect
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions = self.sessions.lock().clone();
        for session in sessions {
            if let Err(e) = session.close().await {
                debug!(session = %session.name(), error = %e, "Session close failed");
            }
        }

        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            let temp_queues = std::mem::take(&mut *self.temp_queues.lock());
            for queue_name in temp_queues {
                match connection
                    .send_blocking(
                        CONTROL_CHANNEL_ID,
                        PacketBody::DeleteQueue {
                            queue_name: queue_name.clone(),
                        },
                    )
                    .await
                {
                    Ok(_) | Err(CorvidError::InvalidDestination(_)) => {}
                    Err(e) => debug!(queue = %queue_name, error = %e, "Temporary queue not deleted"),
                }
            }
            connection.clear_failure_listeners();
            if let Err(e) = connection.write(Packet::new(CONTROL_CHANNEL_ID, PacketBody::Disconnect)) {
                trace!(error = %e, "Disconnect not sent");
            }
            connection.close();
        }
        if let Some(pinger) = self.pinger.lock().take() {
            pinger.abort();
        }
        info!("Session factory closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_without_server_fails() {
        let result =
            ClientSessionFactory::connect(ClientConfig::in_vm(404), TransportContext::new()).await;
        assert!(matches!(result, Err(CorvidError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ClientConfig {
            call_timeout_ms: 0,
            ..ClientConfig::in_vm(1)
        };
        let result = ClientSessionFactory::connect(config, TransportContext::new()).await;
        assert!(matches!(result, Err(CorvidError::Config(_))));
    }
}
