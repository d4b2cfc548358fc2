//! Process-memory storage manager

use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{RecordId, RecordKind, RecordStore, StorageManager, StoredRecord, TxId};
use crate::Result;

/// Keeps records in memory. Survives broker restarts only when the same
/// instance is handed to the new broker.
#[derive(Debug, Default)]
pub struct InMemoryStorageManager {
    store: Mutex<RecordStore>,
    next_id: AtomicI64,
}

impl InMemoryStorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.store.lock().committed().len()
    }
}

impl StorageManager for InMemoryStorageManager {
    fn generate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn append(&self, kind: RecordKind, payload: Bytes, tx: Option<TxId>) -> Result<RecordId> {
        let id = self.generate_id();
        self.store
            .lock()
            .add(StoredRecord { id, kind, payload }, tx);
        Ok(id)
    }

    fn retrieve(&self, id: RecordId) -> Result<Option<StoredRecord>> {
        Ok(self.store.lock().get(id))
    }

    fn delete(&self, id: RecordId, tx: Option<TxId>) -> Result<()> {
        self.store.lock().delete(id, tx);
        Ok(())
    }

    fn prepare(&self, tx: TxId) -> Result<()> {
        self.store.lock().prepare(tx)
    }

    fn commit(&self, tx: TxId) -> Result<()> {
        self.store.lock().commit(tx);
        Ok(())
    }

    fn rollback(&self, tx: TxId) -> Result<()> {
        self.store.lock().rollback(tx);
        Ok(())
    }

    fn load_committed(&self) -> Result<Vec<StoredRecord>> {
        Ok(self.store.lock().committed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_retrieve_delete() {
        let storage = InMemoryStorageManager::new();
        let id = storage
            .append(RecordKind::QueueBinding, Bytes::from_static(b"{}"), None)
            .unwrap();
        let record = storage.retrieve(id).unwrap().unwrap();
        assert_eq!(record.kind, RecordKind::QueueBinding);

        storage.delete(id, None).unwrap();
        assert!(storage.retrieve(id).unwrap().is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let storage = InMemoryStorageManager::new();
        let a = storage.generate_id();
        let b = storage.generate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_transaction_commit_and_rollback() {
        let storage = InMemoryStorageManager::new();
        let tx = storage.generate_id();
        let id = storage
            .append(RecordKind::Message, Bytes::from_static(b"m"), Some(tx))
            .unwrap();
        assert!(storage.retrieve(id).unwrap().is_none());
        storage.prepare(tx).unwrap();
        storage.commit(tx).unwrap();
        assert!(storage.retrieve(id).unwrap().is_some());

        let tx2 = storage.generate_id();
        storage.delete(id, Some(tx2)).unwrap();
        storage.rollback(tx2).unwrap();
        assert!(storage.retrieve(id).unwrap().is_some());
        assert_eq!(storage.record_count(), 1);
    }
}
