use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::handler::{BrokerState, ControlHandler};
use crate::config::BrokerConfig;
use crate::metrics::MetricsRegistry;
use crate::postoffice::PostOffice;
use crate::protocol::CONTROL_CHANNEL_ID;
use crate::remoting::{PacketDispatcher, RemotingService, TransportContext};
use crate::storage::{FileJournal, InMemoryStorageManager, StorageManager};
use crate::transaction::TransactionCoordinator;
use crate::{CorvidError, Result};

pub struct BrokerServer {
    config: Arc<BrokerConfig>,
    context: TransportContext,
    state: Arc<BrokerState>,
    remoting: Arc<RemotingService>,
    control: Arc<ControlHandler>,
    // Stops the reapers
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
}

impl std::fmt::Debug for BrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServer")
            .field("acceptors", &self.config.acceptors)
            .field("started", &self.is_started())
            .finish()
    }
}

impl BrokerServer {
    /// Server with its own in-VM registry
    pub fn new(config: BrokerConfig) -> Result<Self> {
        Self::with_context(config, TransportContext::new())
    }

    /// Server sharing `context` with the clients that connect in-VM
    pub fn with_context(config: BrokerConfig, context: TransportContext) -> Result<Self> {
        config.validate().map_err(CorvidError::Config)?;
        let storage: Arc<dyn StorageManager> = if config.persistence_enabled {
            Arc::new(FileJournal::open(
                config.journal_dir(),
                config.journal_sync_writes,
            )?)
        } else {
            Arc::new(InMemoryStorageManager::new())
        };
        Self::with_storage(config, context, storage)
    }

    /// Server over an existing storage collaborator
    pub fn with_storage(
        config: BrokerConfig,
        context: TransportContext,
        storage: Arc<dyn StorageManager>,
    ) -> Result<Self> {
        config.validate().map_err(CorvidError::Config)?;
        let config = Arc::new(config);
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Arc::new(PacketDispatcher::new());
        let post_office = Arc::new(PostOffice::new(
            Arc::clone(&config),
            storage,
            Arc::clone(&metrics),
        ));
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::clone(&post_office),
            Arc::clone(&metrics),
            config.transaction_timeout_secs,
        ));
        let state = Arc::new(BrokerState::new(
            Arc::clone(&config),
            post_office,
            coordinator,
            Arc::clone(&metrics),
            Arc::clone(&dispatcher),
        ));
        let remoting = Arc::new(RemotingService::new(
            Arc::clone(&config),
            context.clone(),
            dispatcher,
            metrics,
        ));
        let control = ControlHandler::new(Arc::clone(&state));
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            context,
            state,
            remoting,
            control,
            shutdown_tx,
            started: AtomicBool::new(false),
        })
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Recover durable state, then open the acceptors and start the reapers
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let stats = self.state.post_office.recover()?;
        info!(
            queues = stats.queues,
            messages = stats.messages,
            page_acks = stats.page_acks,
            "Recovered durable state"
        );

        self.state.dispatcher.register(self.control.clone());
        self.remoting.set_connection_handler(self.control.clone());
        if let Err(e) = self.remoting.start().await {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }

        self.state.coordinator.spawn_reaper(
            Duration::from_millis(self.config.transaction_scan_period_ms),
            self.shutdown_tx.subscribe(),
        );
        if self.config.session_reattach_ttl_ms > 0 {
            self.spawn_session_reaper(Duration::from_millis(self.config.session_reattach_ttl_ms));
        }

        info!(
            acceptors = ?self.config.acceptors.iter().map(|a| a.describe()).collect::<Vec<_>>(),
            "CorvidMQ broker started"
        );
        Ok(())
    }

    fn spawn_session_reaper(&self, ttl: Duration) {
        let state = Arc::clone(&self.state);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = (ttl / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let reaped = state.reap_detached(ttl);
                        if reaped > 0 {
                            info!(reaped, "Closed expired detached sessions");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Session reaper stopped");
        });
    }

    /// Disconnect every client, close the sessions and flush storage
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(());
        self.remoting.stop();
        self.state.close_all();
        self.state.dispatcher.unregister(CONTROL_CHANNEL_ID);
        if let Err(e) = self.state.post_office.sync() {
            warn!(error = %e, "Failed to sync storage on shutdown");
        }
        self.state.metrics.log_summary();
        info!("Server shutdown complete");
    }

    pub fn config(&self) -> &Arc<BrokerConfig> {
        &self.config
    }

    pub fn context(&self) -> &TransportContext {
        &self.context
    }

    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.state.post_office
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.state.coordinator
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.state.metrics
    }

    pub fn remoting(&self) -> &Arc<RemotingService> {
        &self.remoting
    }

    pub fn state(&self) -> &Arc<BrokerState> {
        &self.state
    }

    pub fn bound_ports(&self) -> Vec<u16> {
        self.remoting.bound_ports()
    }

    pub fn session_count(&self) -> usize {
        self.state.session_count()
    }
}
