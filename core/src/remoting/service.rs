//! Server-side remoting service
//!
//! Starts and stops the configured acceptors together, keeps the registry
//! of live connections, runs inbound packets through the interceptor chain
//! and periodically scans for connections past their TTL. Every way a
//! connection can end (peer close, I/O error, corrupt frame, missed TTL,
//! server stop) goes through [`RemotingService::fail_connection`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::connection::RemotingConnection;
use super::dispatcher::PacketDispatcher;
use super::executor::CallbackExecutor;
use super::transport::{
    create_acceptor, Acceptor, ConnectionLifeCycleListener, FrameHandler, TransportConnection,
    TransportContext,
};
use crate::config::BrokerConfig;
use crate::metrics::MetricsRegistry;
use crate::protocol::{Packet, PacketBody, CONTROL_CHANNEL_ID};
use crate::{CorvidError, Result};

const SERVER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Sees every inbound packet before dispatch; returning false drops it
pub trait Interceptor: Send + Sync {
    fn intercept(&self, packet: &Packet, connection_id: &str) -> bool;
}

/// Told about every accepted connection, before its first packet
pub trait ServerConnectionHandler: Send + Sync {
    fn connection_created(&self, connection: &Arc<RemotingConnection>);
}

pub struct RemotingService {
    config: Arc<BrokerConfig>,
    context: TransportContext,
    dispatcher: Arc<PacketDispatcher>,
    metrics: Arc<MetricsRegistry>,
    acceptors: Mutex<Vec<Box<dyn Acceptor>>>,
    connections: DashMap<String, Arc<RemotingConnection>>,
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
    handler: RwLock<Option<Arc<dyn ServerConnectionHandler>>>,
    callbacks: CallbackExecutor,
    scan_guard: Mutex<()>,
    started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for RemotingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingService")
            .field("connections", &self.connections.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl RemotingService {
    pub fn new(
        config: Arc<BrokerConfig>,
        context: TransportContext,
        dispatcher: Arc<PacketDispatcher>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            callbacks: CallbackExecutor::new(config.failure_callback_workers),
            config,
            context,
            dispatcher,
            metrics,
            acceptors: Mutex::new(Vec::new()),
            connections: DashMap::new(),
            interceptors: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            scan_guard: Mutex::new(()),
            started: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    pub fn set_connection_handler(&self, handler: Arc<dyn ServerConnectionHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.write().push(interceptor);
    }

    pub fn clear_interceptors(&self) {
        self.interceptors.write().clear();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start every configured acceptor and the connection scanner. If one
    /// acceptor fails, the ones already started are stopped again.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut started: Vec<Box<dyn Acceptor>> = Vec::new();
        for transport in &self.config.acceptors {
            let acceptor = create_acceptor(transport, &self.context, self.config.max_frame_size);
            if let Err(e) = acceptor.start(self.clone()).await {
                warn!(acceptor = %acceptor.describe(), error = %e, "Acceptor failed to start");
                for acceptor in &started {
                    acceptor.stop();
                }
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
            info!(acceptor = %acceptor.describe(), "Acceptor started");
            started.push(acceptor);
        }
        *self.acceptors.lock() = started;

        self.spawn_scanner(
            Duration::from_millis(self.config.connection_scan_period_ms),
            self.shutdown_tx.subscribe(),
        );
        Ok(())
    }

    /// Stop accepting, tell every client and fail its connection
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        for connection in self.connections() {
            let _ = connection.write(Packet::new(CONTROL_CHANNEL_ID, PacketBody::Disconnect));
            self.fail_connection(
                connection.id(),
                CorvidError::ConnectionFailed("server stopping".to_string()),
                false,
            );
        }
        for acceptor in self.acceptors.lock().drain(..) {
            acceptor.stop();
        }
        info!("Remoting service stopped");
    }

    /// Ports bound by network acceptors, in configuration order
    pub fn bound_ports(&self) -> Vec<u16> {
        self.acceptors
            .lock()
            .iter()
            .filter_map(|acceptor| acceptor.bound_port())
            .collect()
    }

    pub fn connection(&self, id: &str) -> Option<Arc<RemotingConnection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Snapshot of live connections
    pub fn connections(&self) -> Vec<Arc<RemotingConnection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Remove the connection and fail it on the callback pool. Only the
    /// first call for an id has any effect.
    pub fn fail_connection(&self, connection_id: &str, error: CorvidError, failed: bool) -> bool {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return false;
        };
        self.metrics.connection_closed(failed);
        debug!(connection_id, error = %error, "Removing connection");
        self.callbacks.execute(move || {
            connection.fail(error);
        });
        true
    }

    /// Fail every connection that missed its TTL. Overlapping scans are
    /// skipped; returns how many connections this scan failed.
    pub fn scan_connections(&self) -> usize {
        let Some(_scan) = self.scan_guard.try_lock() else {
            trace!("Connection scan already running");
            return 0;
        };
        let now = Instant::now();
        let expired: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            warn!(connection_id = %id, "Connection missed its TTL");
            self.connection_exception(id, CorvidError::ConnectionTimedOut);
        }
        expired.len()
    }

    fn spawn_scanner(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(service) = service.upgrade() else { break };
                        service.scan_connections();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Connection scanner stopped");
        })
    }
}

impl ConnectionLifeCycleListener for RemotingService {
    fn connection_created(&self, transport: Arc<dyn TransportConnection>) {
        if self.connections.len() >= self.config.max_connections {
            warn!(
                remote = %transport.remote_address(),
                max = self.config.max_connections,
                "Connection limit reached, refusing connection"
            );
            transport.close();
            return;
        }

        let connection = RemotingConnection::new(
            transport,
            Arc::clone(&self.dispatcher),
            SERVER_CALL_TIMEOUT,
            self.config.connection_ttl_ms,
            Some(Arc::clone(&self.metrics)),
        );
        self.connections
            .insert(connection.id().to_string(), Arc::clone(&connection));
        self.metrics.connection_opened();
        info!(
            connection_id = %connection.id(),
            remote = %connection.remote_address(),
            "Connection accepted"
        );

        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.connection_created(&connection);
        }
    }

    fn connection_destroyed(&self, connection_id: &str) {
        if self.fail_connection(
            connection_id,
            CorvidError::ConnectionFailed("connection closed by peer".to_string()),
            false,
        ) {
            info!(connection_id, "Connection closed");
        }
    }

    fn connection_exception(&self, connection_id: &str, error: CorvidError) {
        if self.connections.contains_key(connection_id) {
            warn!(connection_id, error = %error, "Connection failed");
        }
        self.fail_connection(connection_id, error, true);
    }
}

impl FrameHandler for RemotingService {
    fn frame_received(&self, connection_id: &str, frame: Bytes) {
        let Some(connection) = self.connection(connection_id) else {
            trace!(connection_id, "Frame for unknown connection");
            return;
        };

        let packet = match connection.decode(frame) {
            Ok(Some(packet)) => packet,
            Ok(None) => return,
            Err(e) => {
                // framing cannot be trusted past a corrupt frame
                self.connection_exception(connection_id, e);
                return;
            }
        };

        let interceptors = self.interceptors.read().clone();
        if !interceptors
            .iter()
            .all(|interceptor| interceptor.intercept(&packet, connection_id))
        {
            trace!(connection_id, packet_type = ?packet.packet_type(), "Packet dropped by interceptor");
            return;
        }

        connection.packet_received(packet);
    }
}
