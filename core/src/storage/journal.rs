//! Append-only journal storage
//!
//! Entry format (big-endian):
//! `[length: 4 bytes][crc: 4 bytes][op: 1][tx: 8][id: 8][kind: 1][payload...]`
//!
//! `length` covers everything after itself; the CRC32 covers everything after
//! the CRC. Replay stops at the first truncated or corrupt entry, which is
//! where an interrupted write left the tail.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{RecordId, RecordKind, RecordStore, StorageManager, StoredRecord, TxId};
use crate::{CorvidError, Result};

pub const JOURNAL_FILE_NAME: &str = "corvid.journal";

const FRAME_HEADER_SIZE: usize = 8;
const ENTRY_HEADER_SIZE: usize = 1 + 8 + 8 + 1;
const NO_TX: i64 = -1;

const OP_ADD: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_PREPARE: u8 = 3;
const OP_COMMIT: u8 = 4;
const OP_ROLLBACK: u8 = 5;

/// Frame a payload as `[len][crc32][payload]`
pub(crate) fn frame_record(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split framed records, stopping at the first incomplete or corrupt one.
/// Returns the payloads and the number of bytes that were valid.
pub(crate) fn read_frames(data: &[u8]) -> (Vec<Bytes>, usize) {
    let mut frames = Vec::new();
    let mut pos = 0;

    while data.len() - pos >= FRAME_HEADER_SIZE {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        if len < 4 || data.len() - pos - 4 < len {
            break;
        }
        let crc = u32::from_be_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]);
        let payload = &data[pos + FRAME_HEADER_SIZE..pos + 4 + len];
        if crc32fast::hash(payload) != crc {
            warn!(offset = pos, "CRC mismatch, ignoring remainder of file");
            break;
        }
        frames.push(Bytes::copy_from_slice(payload));
        pos += 4 + len;
    }

    (frames, pos)
}

struct JournalInner {
    store: RecordStore,
    writer: BufWriter<File>,
}

/// File-backed [`StorageManager`]
pub struct FileJournal {
    path: PathBuf,
    inner: Mutex<JournalInner>,
    next_id: AtomicI64,
    sync_writes: bool,
}

impl std::fmt::Debug for FileJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJournal")
            .field("path", &self.path)
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl FileJournal {
    /// Open or create the journal in `dir`, replaying existing entries
    pub fn open<P: AsRef<Path>>(dir: P, sync_writes: bool) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE_NAME);

        let mut data = Vec::new();
        if path.exists() {
            File::open(&path)?.read_to_end(&mut data)?;
        }
        let (frames, valid_len) = read_frames(&data);
        if valid_len < data.len() {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = data.len(),
                "Truncating corrupt journal tail"
            );
        }

        let mut store = RecordStore::default();
        let mut max_seen = 0;
        for frame in &frames {
            max_seen = max_seen.max(Self::replay_entry(&mut store, frame)?);
        }
        for tx in store.pending_transactions() {
            debug!(tx, "Discarding unfinished journal transaction");
            store.rollback(tx);
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(valid_len as u64)?;
        let mut writer = BufWriter::new(file);
        std::io::Seek::seek(&mut writer, std::io::SeekFrom::End(0))?;

        let next_id = store.max_id().max(max_seen);
        info!(
            path = %path.display(),
            entries = frames.len(),
            records = store.committed().len(),
            "Journal opened"
        );

        Ok(Self {
            path,
            inner: Mutex::new(JournalInner { store, writer }),
            next_id: AtomicI64::new(next_id),
            sync_writes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply one entry, returning the largest id it mentions
    fn replay_entry(store: &mut RecordStore, frame: &Bytes) -> Result<i64> {
        if frame.len() < ENTRY_HEADER_SIZE {
            return Err(CorvidError::Storage("journal entry too short".into()));
        }
        let op = frame[0];
        let tx = i64::from_be_bytes(frame[1..9].try_into().map_err(|_| bad_entry())?);
        let id = i64::from_be_bytes(frame[9..17].try_into().map_err(|_| bad_entry())?);
        let max_seen = id.max(tx);
        let tx = (tx != NO_TX).then_some(tx);

        match op {
            OP_ADD => {
                let kind = RecordKind::from_u8(frame[17]).ok_or_else(bad_entry)?;
                let payload = frame.slice(ENTRY_HEADER_SIZE..);
                store.add(StoredRecord { id, kind, payload }, tx);
            }
            OP_DELETE => store.delete(id, tx),
            OP_PREPARE => {
                if let Some(tx) = tx {
                    store.prepare(tx)?;
                }
            }
            OP_COMMIT => {
                if let Some(tx) = tx {
                    store.commit(tx);
                }
            }
            OP_ROLLBACK => {
                if let Some(tx) = tx {
                    store.rollback(tx);
                }
            }
            other => {
                return Err(CorvidError::Storage(format!(
                    "unknown journal operation {other}"
                )))
            }
        }
        Ok(max_seen)
    }

    fn write_entry(
        &self,
        inner: &mut JournalInner,
        op: u8,
        tx: Option<TxId>,
        id: RecordId,
        kind: u8,
        payload: &[u8],
    ) -> Result<()> {
        let mut entry = BytesMut::with_capacity(ENTRY_HEADER_SIZE + payload.len());
        entry.put_u8(op);
        entry.put_i64(tx.unwrap_or(NO_TX));
        entry.put_i64(id);
        entry.put_u8(kind);
        entry.put_slice(payload);

        inner.writer.write_all(&frame_record(&entry))?;
        inner.writer.flush()?;
        if self.sync_writes {
            inner.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

fn bad_entry() -> CorvidError {
    CorvidError::Storage("malformed journal entry".into())
}

impl StorageManager for FileJournal {
    fn generate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn append(&self, kind: RecordKind, payload: Bytes, tx: Option<TxId>) -> Result<RecordId> {
        let id = self.generate_id();
        let mut inner = self.inner.lock();
        self.write_entry(&mut inner, OP_ADD, tx, id, kind.as_u8(), &payload)?;
        inner.store.add(StoredRecord { id, kind, payload }, tx);
        Ok(id)
    }

    fn retrieve(&self, id: RecordId) -> Result<Option<StoredRecord>> {
        Ok(self.inner.lock().store.get(id))
    }

    fn delete(&self, id: RecordId, tx: Option<TxId>) -> Result<()> {
        let mut inner = self.inner.lock();
        self.write_entry(&mut inner, OP_DELETE, tx, id, 0, &[])?;
        inner.store.delete(id, tx);
        Ok(())
    }

    fn prepare(&self, tx: TxId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.store.prepare(tx)?;
        self.write_entry(&mut inner, OP_PREPARE, Some(tx), 0, 0, &[])
    }

    fn commit(&self, tx: TxId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.write_entry(&mut inner, OP_COMMIT, Some(tx), 0, 0, &[])?;
        inner.store.commit(tx);
        Ok(())
    }

    fn rollback(&self, tx: TxId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.write_entry(&mut inner, OP_ROLLBACK, Some(tx), 0, 0, &[])?;
        inner.store.rollback(tx);
        Ok(())
    }

    fn load_committed(&self) -> Result<Vec<StoredRecord>> {
        Ok(self.inner.lock().store.committed())
    }
}
