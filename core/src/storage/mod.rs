//! # Storage
//!
//! The broker treats durable storage as a collaborator behind the
//! [`StorageManager`] trait: records are appended, retrieved and deleted by
//! id, optionally inside a transaction that is later prepared, committed or
//! rolled back. Each call is assumed crash-atomic.
//!
//! Two implementations are provided:
//!
//! - [`memory::InMemoryStorageManager`] keeps everything in process memory.
//!   Sharing one instance between broker restarts in tests exercises the
//!   recovery path.
//! - [`journal::FileJournal`] appends every operation to a CRC-framed journal
//!   file and replays it on open.
//!
//! Record payloads are opaque bytes; the broker encodes messages with the
//! wire codec and everything else as JSON.

pub mod journal;
pub mod memory;

pub use journal::FileJournal;
pub use memory::InMemoryStorageManager;

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{CorvidError, Result};

pub type RecordId = i64;
pub type TxId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// A durable queue binding
    QueueBinding,
    /// A message resident in a durable queue
    Message,
    /// Acknowledgement of a paged message by one queue
    PageAck,
}

impl RecordKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RecordKind::QueueBinding => 1,
            RecordKind::Message => 2,
            RecordKind::PageAck => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordKind::QueueBinding),
            2 => Some(RecordKind::Message),
            3 => Some(RecordKind::PageAck),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    pub payload: Bytes,
}

/// Durable record store consumed by the post office, the paging cursors and
/// the transaction layer.
pub trait StorageManager: Send + Sync {
    /// Unique id for records, messages and transactions
    fn generate_id(&self) -> i64;

    /// Append a record, returning its id. Inside a transaction the record
    /// becomes visible on commit.
    fn append(&self, kind: RecordKind, payload: Bytes, tx: Option<TxId>) -> Result<RecordId>;

    fn retrieve(&self, id: RecordId) -> Result<Option<StoredRecord>>;

    /// Delete a record. Inside a transaction the delete applies on commit.
    fn delete(&self, id: RecordId, tx: Option<TxId>) -> Result<()>;

    fn prepare(&self, tx: TxId) -> Result<()>;

    fn commit(&self, tx: TxId) -> Result<()>;

    fn rollback(&self, tx: TxId) -> Result<()>;

    /// All committed records in id order
    fn load_committed(&self) -> Result<Vec<StoredRecord>>;
}

#[derive(Debug, Clone)]
pub(crate) enum PendingOp {
    Add(StoredRecord),
    Delete(RecordId),
}

/// Committed records plus per-transaction pending operations. Both storage
/// implementations keep their state in one of these.
#[derive(Debug, Default)]
pub(crate) struct RecordStore {
    committed: BTreeMap<RecordId, StoredRecord>,
    pending: HashMap<TxId, Vec<PendingOp>>,
    prepared: HashSet<TxId>,
}

impl RecordStore {
    pub(crate) fn add(&mut self, record: StoredRecord, tx: Option<TxId>) {
        match tx {
            Some(tx) => self
                .pending
                .entry(tx)
                .or_default()
                .push(PendingOp::Add(record)),
            None => {
                self.committed.insert(record.id, record);
            }
        }
    }

    pub(crate) fn delete(&mut self, id: RecordId, tx: Option<TxId>) {
        match tx {
            Some(tx) => self
                .pending
                .entry(tx)
                .or_default()
                .push(PendingOp::Delete(id)),
            None => {
                self.committed.remove(&id);
            }
        }
    }

    pub(crate) fn get(&self, id: RecordId) -> Option<StoredRecord> {
        self.committed.get(&id).cloned()
    }

    pub(crate) fn prepare(&mut self, tx: TxId) -> Result<()> {
        if self.prepared.contains(&tx) {
            return Err(CorvidError::Storage(format!(
                "transaction {tx} already prepared"
            )));
        }
        self.prepared.insert(tx);
        Ok(())
    }

    /// Apply a transaction's pending operations. A transaction with no
    /// recorded work commits as a no-op.
    pub(crate) fn commit(&mut self, tx: TxId) {
        self.prepared.remove(&tx);
        let ops = self.pending.remove(&tx).unwrap_or_default();
        trace!(tx, operations = ops.len(), "Committing storage transaction");
        for op in ops {
            match op {
                PendingOp::Add(record) => {
                    self.committed.insert(record.id, record);
                }
                PendingOp::Delete(id) => {
                    self.committed.remove(&id);
                }
            }
        }
    }

    pub(crate) fn rollback(&mut self, tx: TxId) {
        self.prepared.remove(&tx);
        self.pending.remove(&tx);
    }

    pub(crate) fn committed(&self) -> Vec<StoredRecord> {
        self.committed.values().cloned().collect()
    }

    pub(crate) fn max_id(&self) -> i64 {
        let committed = self.committed.keys().next_back().copied().unwrap_or(0);
        let pending = self
            .pending
            .iter()
            .flat_map(|(tx, ops)| {
                ops.iter()
                    .map(|op| match op {
                        PendingOp::Add(r) => r.id,
                        PendingOp::Delete(id) => *id,
                    })
                    .chain(std::iter::once(*tx))
            })
            .max()
            .unwrap_or(0);
        committed.max(pending)
    }

    pub(crate) fn pending_transactions(&self) -> Vec<TxId> {
        self.pending.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: RecordId) -> StoredRecord {
        StoredRecord {
            id,
            kind: RecordKind::Message,
            payload: Bytes::from(format!("r{id}")),
        }
    }

    #[test]
    fn test_transactional_add_visible_after_commit() {
        let mut store = RecordStore::default();
        store.add(record(1), Some(10));
        assert!(store.get(1).is_none());
        store.commit(10);
        assert_eq!(store.get(1), Some(record(1)));
    }

    #[test]
    fn test_rollback_discards_pending() {
        let mut store = RecordStore::default();
        store.add(record(1), None);
        store.delete(1, Some(11));
        store.add(record(2), Some(11));
        store.rollback(11);
        assert!(store.get(1).is_some());
        assert!(store.get(2).is_none());
        assert!(store.pending_transactions().is_empty());
    }

    #[test]
    fn test_double_prepare_rejected() {
        let mut store = RecordStore::default();
        store.prepare(5).unwrap();
        assert!(store.prepare(5).is_err());
        store.commit(5);
        assert!(store.prepare(5).is_ok());
    }

    #[test]
    fn test_record_kind_codes() {
        for kind in [
            RecordKind::QueueBinding,
            RecordKind::Message,
            RecordKind::PageAck,
        ] {
            assert_eq!(RecordKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(RecordKind::from_u8(0), None);
    }
}
