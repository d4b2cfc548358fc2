//! XA resource manager
//!
//! Keeps every XA branch by xid from `start` until it is committed, rolled
//! back or forgotten, and runs the reaper that rolls back branches whose
//! timeout elapsed before they were prepared.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state_machine::{Transaction, TransactionState};
use super::TransactionError;
use crate::metrics::MetricsRegistry;
use crate::postoffice::PostOffice;
use crate::protocol::Xid;
use crate::Result;

pub type SharedTransaction = Arc<Mutex<Transaction>>;

pub struct TransactionCoordinator {
    post_office: Arc<PostOffice>,
    metrics: Arc<MetricsRegistry>,
    transactions: DashMap<Xid, SharedTransaction>,
    default_timeout_secs: i32,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("transactions", &self.transactions.len())
            .field("default_timeout_secs", &self.default_timeout_secs)
            .finish()
    }
}

impl TransactionCoordinator {
    pub fn new(
        post_office: Arc<PostOffice>,
        metrics: Arc<MetricsRegistry>,
        default_timeout_secs: i32,
    ) -> Self {
        Self {
            post_office,
            metrics,
            transactions: DashMap::new(),
            default_timeout_secs,
        }
    }

    pub fn default_timeout_secs(&self) -> i32 {
        self.default_timeout_secs
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Unregistered transaction for a non-XA session
    pub fn begin_local(&self) -> SharedTransaction {
        let id = self.post_office.storage().generate_id();
        Arc::new(Mutex::new(Transaction::new(id, None, 0)))
    }

    /// Register a new branch; `timeout_secs` of `None` uses the default
    pub fn start(&self, xid: &Xid, timeout_secs: Option<i32>) -> Result<SharedTransaction> {
        let id = self.post_office.storage().generate_id();
        let timeout = timeout_secs.unwrap_or(self.default_timeout_secs);
        match self.transactions.entry(xid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TransactionError::DuplicateXid(xid.to_string()).into())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let tx = Arc::new(Mutex::new(Transaction::new(id, Some(xid.clone()), timeout)));
                entry.insert(Arc::clone(&tx));
                debug!(xid = %xid, tx_id = id, "XA branch started");
                Ok(tx)
            }
        }
    }

    pub fn lookup(&self, xid: &Xid) -> Result<SharedTransaction> {
        self.transactions
            .get(xid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransactionError::UnknownXid(xid.to_string()).into())
    }

    pub fn prepare(&self, xid: &Xid) -> Result<()> {
        let tx = self.lookup(xid)?;
        let mut tx = tx.lock();
        let result = tx.prepare(&self.post_office);
        if tx.state() == TransactionState::RolledBack {
            drop(tx);
            self.transactions.remove(xid);
            self.metrics.transaction_rolled_back();
        }
        result
    }

    pub fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        let tx = self.lookup(xid)?;
        let result = self.commit_transaction(&mut tx.lock(), one_phase);
        let finished = matches!(
            tx.lock().state(),
            TransactionState::Committed | TransactionState::RolledBack
        );
        if finished {
            self.transactions.remove(xid);
        }
        result
    }

    pub fn rollback(&self, xid: &Xid) -> Result<()> {
        let tx = self.lookup(xid)?;
        let result = self.rollback_transaction(&mut tx.lock());
        self.transactions.remove(xid);
        result
    }

    /// Drop a branch the transaction manager no longer cares about
    pub fn forget(&self, xid: &Xid) -> Result<()> {
        self.transactions
            .remove(xid)
            .map(|_| ())
            .ok_or_else(|| TransactionError::UnknownXid(xid.to_string()).into())
    }

    /// Prepared branches awaiting an outcome
    pub fn in_doubt_xids(&self) -> Vec<Xid> {
        self.transactions
            .iter()
            .filter(|entry| entry.value().lock().state() == TransactionState::Prepared)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn commit_transaction(&self, tx: &mut Transaction, one_phase: bool) -> Result<()> {
        let result = tx.commit(&self.post_office, one_phase);
        match tx.state() {
            TransactionState::Committed => self.metrics.transaction_committed(),
            TransactionState::RolledBack => self.metrics.transaction_rolled_back(),
            _ => {}
        }
        result
    }

    pub fn rollback_transaction(&self, tx: &mut Transaction) -> Result<()> {
        let was_rolled_back = tx.state() == TransactionState::RolledBack;
        let result = tx.rollback(&self.post_office);
        if !was_rolled_back && tx.state() == TransactionState::RolledBack {
            self.metrics.transaction_rolled_back();
        }
        result
    }

    /// Roll back and unregister branches past their timeout
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(Xid, SharedTransaction)> = self
            .transactions
            .iter()
            .filter(|entry| entry.value().lock().is_expired(now))
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (xid, tx) in &expired {
            self.transactions.remove(xid);
            if let Err(e) = tx.lock().expire(&self.post_office) {
                warn!(xid = %xid, error = %e, "Failed to roll back timed out transaction");
            }
            self.metrics.transaction_rolled_back();
        }
        expired.len()
    }

    pub fn spawn_reaper(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let reaped = coordinator.reap_expired();
                        if reaped > 0 {
                            info!(reaped, "Rolled back timed out transactions");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("Transaction reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::protocol::Message;
    use crate::storage::InMemoryStorageManager;
    use crate::CorvidError;
    use bytes::Bytes;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Arc<PostOffice>, TransactionCoordinator) {
        let dir = tempdir().unwrap();
        let config = BrokerConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..BrokerConfig::default()
        };
        let metrics = Arc::new(MetricsRegistry::new());
        let office = Arc::new(PostOffice::new(
            Arc::new(config),
            Arc::new(InMemoryStorageManager::new()),
            metrics.clone(),
        ));
        office.create_queue("orders", "q", None, false, false).unwrap();
        let coordinator = TransactionCoordinator::new(office.clone(), metrics, 300);
        (dir, office, coordinator)
    }

    fn xid(n: u8) -> Xid {
        Xid::new(7, Bytes::from(vec![n]), Bytes::from_static(b"branch"))
    }

    fn xa_code(result: Result<()>) -> i32 {
        match result {
            Err(e) => crate::transaction::xa_code_for(&e),
            Ok(()) => crate::transaction::XA_OK,
        }
    }

    #[test]
    fn test_duplicate_and_unknown_xids() {
        let (_dir, _office, coordinator) = setup();
        coordinator.start(&xid(1), None).unwrap();
        assert!(matches!(
            coordinator.start(&xid(1), None),
            Err(CorvidError::Transaction(TransactionError::DuplicateXid(_)))
        ));
        assert_eq!(xa_code(coordinator.commit(&xid(2), true)), crate::transaction::XAER_NOTA);
        assert_eq!(xa_code(coordinator.forget(&xid(2))), crate::transaction::XAER_NOTA);
        coordinator.forget(&xid(1)).unwrap();
        assert!(coordinator.is_empty());
    }

    #[test]
    fn test_prepare_lists_in_doubt_then_commit() {
        let (_dir, office, coordinator) = setup();
        let tx = coordinator.start(&xid(1), None).unwrap();
        tx.lock().add_send(Message::new("orders", "x")).unwrap();
        coordinator.start(&xid(2), None).unwrap();

        coordinator.prepare(&xid(1)).unwrap();
        assert_eq!(coordinator.in_doubt_xids(), vec![xid(1)]);

        coordinator.commit(&xid(1), false).unwrap();
        assert!(coordinator.in_doubt_xids().is_empty());
        assert_eq!(coordinator.len(), 1);
        assert_eq!(office.queue("q").unwrap().message_count(), 1);
    }

    #[test]
    fn test_rollback_unregisters() {
        let (_dir, office, coordinator) = setup();
        let tx = coordinator.start(&xid(1), None).unwrap();
        tx.lock().add_send(Message::new("orders", "x")).unwrap();
        coordinator.rollback(&xid(1)).unwrap();
        assert!(coordinator.is_empty());
        assert_eq!(office.queue("q").unwrap().message_count(), 0);
    }

    #[test]
    fn test_reaper_rolls_back_expired_branches() {
        let (_dir, _office, coordinator) = setup();
        let tx = coordinator.start(&xid(1), Some(1)).unwrap();
        coordinator.start(&xid(2), Some(0)).unwrap();
        tx.lock().set_timeout(1);
        assert_eq!(coordinator.reap_expired(), 0);

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(coordinator.reap_expired(), 1);
        assert_eq!(tx.lock().state(), TransactionState::RolledBack);
        assert_eq!(coordinator.len(), 1);
    }

    #[tokio::test]
    async fn test_reaper_task_stops_on_shutdown() {
        let (_dir, _office, coordinator) = setup();
        let coordinator = Arc::new(coordinator);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = coordinator.spawn_reaper(Duration::from_millis(10), shutdown_rx);
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
