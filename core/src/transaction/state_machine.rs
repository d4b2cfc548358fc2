//! Transaction state machine
//!
//! ```text
//!   Active <-> Suspended
//!     |  \
//!     |   prepare --> Prepared --commit--> Committed
//!     |                  |
//!     +--commit(1pc)-----+----rollback---> RolledBack
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{TransactionError, TransactionResult};
use crate::postoffice::{MessageReference, PostOffice, Queue, RoutePlan};
use crate::protocol::{Message, Xid};
use crate::storage::{RecordId, TxId};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Suspended,
    Prepared,
    Committed,
    RolledBack,
}

/// Storage work already written under the transaction id
#[derive(Debug, Default)]
struct PreparedWork {
    plans: Vec<RoutePlan>,
    acks: Vec<(Arc<Queue>, MessageReference, Option<RecordId>)>,
}

#[derive(Debug)]
pub struct Transaction {
    id: TxId,
    xid: Option<Xid>,
    state: TransactionState,
    rollback_only: bool,
    timed_out: bool,
    started: Instant,
    timeout: Option<Duration>,
    sends: Vec<Message>,
    acks: Vec<(Arc<Queue>, MessageReference)>,
    work: Option<PreparedWork>,
}

impl Transaction {
    /// `timeout_secs` <= 0 means no timeout
    pub fn new(id: TxId, xid: Option<Xid>, timeout_secs: i32) -> Self {
        Self {
            id,
            xid,
            state: TransactionState::Active,
            rollback_only: false,
            timed_out: false,
            started: Instant::now(),
            timeout: timeout_from_secs(timeout_secs),
            sends: Vec::new(),
            acks: Vec::new(),
            work: None,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Buffered sends and acknowledgements
    pub fn operation_count(&self) -> usize {
        self.sends.len() + self.acks.len()
    }

    fn describe(&self) -> String {
        match &self.xid {
            Some(xid) => xid.to_string(),
            None => format!("tx-{}", self.id),
        }
    }

    fn require_active(&self) -> TransactionResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::RolledBack if self.timed_out => {
                Err(TransactionError::TimedOut(self.describe()))
            }
            state => Err(TransactionError::InvalidState(format!(
                "{} is {:?}",
                self.describe(),
                state
            ))),
        }
    }

    pub fn add_send(&mut self, message: Message) -> TransactionResult<()> {
        self.require_active()?;
        self.sends.push(message);
        Ok(())
    }

    pub fn add_acknowledge(
        &mut self,
        queue: Arc<Queue>,
        reference: MessageReference,
    ) -> TransactionResult<()> {
        self.require_active()?;
        self.acks.push((queue, reference));
        Ok(())
    }

    /// The branch can only be rolled back from now on
    pub fn mark_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn suspend(&mut self) -> TransactionResult<()> {
        self.require_active()?;
        self.state = TransactionState::Suspended;
        Ok(())
    }

    pub fn resume(&mut self) -> TransactionResult<()> {
        if self.state != TransactionState::Suspended {
            return Err(TransactionError::InvalidState(format!(
                "{} is not suspended",
                self.describe()
            )));
        }
        self.state = TransactionState::Active;
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout_secs: i32) {
        self.timeout = timeout_from_secs(timeout_secs);
        self.started = Instant::now();
    }

    /// Unprepared and past its timeout
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(
            self.state,
            TransactionState::Active | TransactionState::Suspended
        ) && self
            .timeout
            .is_some_and(|timeout| now.duration_since(self.started) >= timeout)
    }

    /// Write the durable side of every buffered operation
    fn write_work(&mut self, post_office: &PostOffice) -> Result<()> {
        let mut work = PreparedWork::default();
        let sends = std::mem::take(&mut self.sends);
        let acks = std::mem::take(&mut self.acks);

        let mut result = Ok(());
        for message in sends {
            match post_office.route(message, Some(self.id)) {
                Ok(plan) => work.plans.push(plan),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        let mut pending_acks = acks.into_iter();
        if result.is_ok() {
            for (queue, reference) in pending_acks.by_ref() {
                match queue.persist_acknowledge(&reference, Some(self.id)) {
                    Ok(record) => work.acks.push((queue, reference, record)),
                    Err(e) => {
                        self.acks.push((queue, reference));
                        result = Err(e);
                        break;
                    }
                }
            }
        }
        self.acks.extend(pending_acks);
        self.work = Some(work);
        result
    }

    /// First phase of two-phase commit
    pub fn prepare(&mut self, post_office: &PostOffice) -> Result<()> {
        self.require_active()?;
        if self.rollback_only {
            self.rollback(post_office)?;
            return Err(TransactionError::RolledBack(self.describe()).into());
        }
        if let Err(e) = self
            .write_work(post_office)
            .and_then(|_| post_office.storage().prepare(self.id))
        {
            warn!(tx = %self.describe(), error = %e, "Prepare failed, rolling back");
            self.rollback(post_office)?;
            return Err(e);
        }
        self.state = TransactionState::Prepared;
        debug!(tx = %self.describe(), "Transaction prepared");
        Ok(())
    }

    /// Commit; `one_phase` skips the prepare step
    pub fn commit(&mut self, post_office: &PostOffice, one_phase: bool) -> Result<()> {
        if one_phase {
            self.require_active()?;
            if self.rollback_only {
                self.rollback(post_office)?;
                return Err(TransactionError::RolledBack(self.describe()).into());
            }
            if let Err(e) = self.write_work(post_office) {
                self.rollback(post_office)?;
                return Err(e);
            }
        } else if self.state != TransactionState::Prepared {
            return Err(TransactionError::InvalidState(format!(
                "{} must be prepared before a two-phase commit",
                self.describe()
            ))
            .into());
        }

        if let Err(e) = post_office.storage().commit(self.id) {
            warn!(tx = %self.describe(), error = %e, "Storage commit failed, rolling back");
            self.rollback(post_office)?;
            return Err(e);
        }

        let work = self.work.take().unwrap_or_default();
        let sends = work.plans.len();
        let acks = work.acks.len();
        for plan in work.plans {
            post_office.apply(plan);
        }
        for (queue, reference, record) in work.acks {
            queue.complete_acknowledge(&reference, record);
        }
        self.state = TransactionState::Committed;
        debug!(tx = %self.describe(), sends, acks, "Transaction committed");
        Ok(())
    }

    /// Undo everything; acknowledged references go back to their queues
    pub fn rollback(&mut self, post_office: &PostOffice) -> Result<()> {
        match self.state {
            TransactionState::Committed => {
                return Err(TransactionError::InvalidState(format!(
                    "{} is already committed",
                    self.describe()
                ))
                .into())
            }
            TransactionState::RolledBack => return Ok(()),
            _ => {}
        }

        let mut storage_result = Ok(());
        let mut cancelled: Vec<(Arc<Queue>, Vec<MessageReference>)> = Vec::new();
        if let Some(work) = self.work.take() {
            storage_result = post_office.storage().rollback(self.id);
            for plan in work.plans {
                post_office.discard(plan);
            }
            for (queue, reference, _) in work.acks {
                push_cancelled(&mut cancelled, queue, reference);
            }
        }
        for (queue, reference) in std::mem::take(&mut self.acks) {
            push_cancelled(&mut cancelled, queue, reference);
        }
        self.sends.clear();

        for (queue, references) in cancelled {
            queue.cancel(references);
        }
        self.state = TransactionState::RolledBack;
        debug!(tx = %self.describe(), "Transaction rolled back");
        storage_result
    }

    /// Roll back because the timeout elapsed
    pub(crate) fn expire(&mut self, post_office: &PostOffice) -> Result<()> {
        info!(tx = %self.describe(), "Transaction timed out, rolling back");
        self.timed_out = true;
        self.rollback(post_office)
    }
}

fn timeout_from_secs(timeout_secs: i32) -> Option<Duration> {
    (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs as u64))
}

fn push_cancelled(
    cancelled: &mut Vec<(Arc<Queue>, Vec<MessageReference>)>,
    queue: Arc<Queue>,
    reference: MessageReference,
) {
    match cancelled.iter_mut().find(|(q, _)| Arc::ptr_eq(q, &queue)) {
        Some((_, references)) => references.push(reference),
        None => cancelled.push((queue, vec![reference])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::metrics::MetricsRegistry;
    use crate::postoffice::queue::tests::RecordingConsumer;
    use crate::storage::{InMemoryStorageManager, StorageManager};
    use crate::CorvidError;
    use bytes::Bytes;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Arc<InMemoryStorageManager>, PostOffice, Arc<Queue>) {
        let dir = tempdir().unwrap();
        let config = BrokerConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..BrokerConfig::default()
        };
        let storage = Arc::new(InMemoryStorageManager::new());
        let office = PostOffice::new(
            Arc::new(config),
            storage.clone(),
            Arc::new(MetricsRegistry::new()),
        );
        let queue = office.create_queue("orders", "q", None, true, false).unwrap();
        (dir, storage, office, queue)
    }

    fn durable(body: &'static str) -> Message {
        Message::new("orders", Bytes::from_static(body.as_bytes())).with_durable(true)
    }

    #[test]
    fn test_sends_are_invisible_until_commit() {
        let (_dir, storage, office, queue) = setup();
        let mut tx = Transaction::new(storage.generate_id(), None, 0);
        tx.add_send(durable("a")).unwrap();
        tx.add_send(durable("b")).unwrap();
        assert_eq!(queue.message_count(), 0);

        tx.commit(&office, true).unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(queue.message_count(), 2);
        // binding record plus one record per message
        assert_eq!(storage.record_count(), 3);
    }

    #[test]
    fn test_rollback_discards_sends_and_redelivers_acks() {
        let (_dir, storage, office, queue) = setup();
        office.route_and_apply(durable("m")).unwrap();
        let consumer = RecordingConsumer::new(1, 1);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        let delivered = consumer.received.lock().pop().unwrap();
        queue.remove_consumer(1);

        let mut tx = Transaction::new(storage.generate_id(), None, 0);
        tx.add_send(durable("n")).unwrap();
        tx.add_acknowledge(queue.clone(), delivered).unwrap();
        tx.rollback(&office).unwrap();

        assert_eq!(tx.state(), TransactionState::RolledBack);
        let queued = queue.browse();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message.body.as_ref(), b"m");
        assert_eq!(queued[0].delivery_count, 1);
        assert_eq!(storage.record_count(), 2);
    }

    #[test]
    fn test_two_phase_commit_acknowledges() {
        let (_dir, storage, office, queue) = setup();
        office.route_and_apply(durable("m")).unwrap();
        let consumer = RecordingConsumer::new(1, 1);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        let delivered = consumer.received.lock().pop().unwrap();

        let xid = Xid::new(1, Bytes::from_static(b"g"), Bytes::from_static(b"b"));
        let mut tx = Transaction::new(storage.generate_id(), Some(xid), 0);
        tx.add_acknowledge(queue.clone(), delivered).unwrap();

        assert!(matches!(
            tx.commit(&office, false),
            Err(CorvidError::Transaction(TransactionError::InvalidState(_)))
        ));
        tx.prepare(&office).unwrap();
        assert_eq!(tx.state(), TransactionState::Prepared);
        assert_eq!(queue.message_count(), 1);

        tx.commit(&office, false).unwrap();
        assert_eq!(queue.message_count(), 0);
        assert_eq!(storage.record_count(), 1);
    }

    #[test]
    fn test_rollback_only_fails_commit() {
        let (_dir, storage, office, queue) = setup();
        let mut tx = Transaction::new(storage.generate_id(), None, 0);
        tx.add_send(durable("a")).unwrap();
        tx.mark_rollback_only();
        assert!(matches!(
            tx.commit(&office, true),
            Err(CorvidError::Transaction(TransactionError::RolledBack(_)))
        ));
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(queue.message_count(), 0);
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut tx = Transaction::new(1, None, 0);
        tx.suspend().unwrap();
        assert!(tx.add_send(Message::new("a", Bytes::new())).is_err());
        assert!(tx.suspend().is_err());
        tx.resume().unwrap();
        assert!(tx.resume().is_err());
        tx.add_send(Message::new("a", Bytes::new())).unwrap();
        assert_eq!(tx.operation_count(), 1);
    }

    #[test]
    fn test_timeout_expiry() {
        let (_dir, _storage, office, _queue) = setup();
        let mut tx = Transaction::new(1, None, 1);
        let later = Instant::now() + Duration::from_secs(2);
        assert!(!tx.is_expired(Instant::now()));
        assert!(tx.is_expired(later));

        tx.expire(&office).unwrap();
        assert!(matches!(
            tx.add_send(Message::new("a", Bytes::new())),
            Err(TransactionError::TimedOut(_))
        ));
        assert!(!Transaction::new(2, None, 0).is_expired(later));
    }
}
