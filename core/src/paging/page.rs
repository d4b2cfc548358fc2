//! Page files
//!
//! A page is an append-only file named `{page_nr:09}.page` holding framed
//! [`PagedMessage`] records (`[length][crc32][payload]`, the journal
//! framing). A torn tail left by a crash is ignored on read.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::protocol::codec::{get_u32, get_u64};
use crate::protocol::Message;
use crate::storage::journal::{frame_record, read_frames};
use crate::{CorvidError, Result};

pub const PAGE_FILE_EXTENSION: &str = "page";

/// A message written to a page together with the queues it was routed to
#[derive(Debug, Clone, PartialEq)]
pub struct PagedMessage {
    pub message: Message,
    pub queue_ids: Vec<u64>,
}

impl PagedMessage {
    pub fn is_for(&self, queue_id: u64) -> bool {
        self.queue_ids.contains(&queue_id)
    }

    fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(4 + self.queue_ids.len() * 8 + self.message.encoded_size());
        buf.put_u32(self.queue_ids.len() as u32);
        for id in &self.queue_ids {
            buf.put_u64(*id);
        }
        self.message.encode(&mut buf);
        buf.freeze()
    }

    fn decode(mut buf: Bytes) -> Result<Self> {
        let count = get_u32(&mut buf)? as usize;
        let mut queue_ids = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            queue_ids.push(get_u64(&mut buf)?);
        }
        let message = Message::decode(&mut buf)?;
        Ok(Self { message, queue_ids })
    }
}

pub fn page_file_name(page_nr: u64) -> String {
    format!("{page_nr:09}.{PAGE_FILE_EXTENSION}")
}

/// Page numbers present in `dir`, ascending
pub fn list_pages(dir: &Path) -> Result<Vec<u64>> {
    let mut pages = Vec::new();
    if !dir.exists() {
        return Ok(pages);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PAGE_FILE_EXTENSION) {
            continue;
        }
        match path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(nr) => pages.push(nr),
            None => warn!(path = %path.display(), "Ignoring unrecognised page file"),
        }
    }
    pages.sort_unstable();
    Ok(pages)
}

/// Page open for writing
#[derive(Debug)]
pub struct Page {
    page_nr: u64,
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    message_count: u32,
}

impl Page {
    pub fn create(dir: &Path, page_nr: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(page_file_name(page_nr));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        debug!(page_nr, path = %path.display(), "Page created");
        Ok(Self {
            page_nr,
            path,
            writer: BufWriter::new(file),
            size: 0,
            message_count: 0,
        })
    }

    pub fn page_nr(&self) -> u64 {
        self.page_nr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    /// Append a message, returning its message number in this page
    pub fn write(&mut self, paged: &PagedMessage) -> Result<u32> {
        let record = frame_record(&paged.encode());
        self.writer.write_all(&record)?;
        self.writer.flush()?;
        self.size += record.len() as u64;
        let message_nr = self.message_count;
        self.message_count += 1;
        Ok(message_nr)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every intact message of a page
pub fn read_page(dir: &Path, page_nr: u64) -> Result<Vec<PagedMessage>> {
    let path = dir.join(page_file_name(page_nr));
    let mut data = Vec::new();
    File::open(&path)
        .map_err(|e| CorvidError::Storage(format!("cannot open page {}: {e}", path.display())))?
        .read_to_end(&mut data)?;

    let (frames, valid) = read_frames(&data);
    if valid < data.len() {
        warn!(page_nr, valid, len = data.len(), "Page has a corrupt tail");
    }
    frames.into_iter().map(PagedMessage::decode).collect()
}

pub fn page_file_size(dir: &Path, page_nr: u64) -> u64 {
    std::fs::metadata(dir.join(page_file_name(page_nr)))
        .map(|m| m.len())
        .unwrap_or(0)
}

pub fn delete_page(dir: &Path, page_nr: u64) -> Result<()> {
    let path = dir.join(page_file_name(page_nr));
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn paged(text: &'static str, queues: &[u64]) -> PagedMessage {
        PagedMessage {
            message: Message::new("orders", Bytes::from_static(text.as_bytes())),
            queue_ids: queues.to_vec(),
        }
    }

    #[test]
    fn test_write_and_read_page() {
        let dir = tempdir().unwrap();
        let mut page = Page::create(dir.path(), 3).unwrap();
        assert_eq!(page.write(&paged("a", &[1])).unwrap(), 0);
        assert_eq!(page.write(&paged("b", &[1, 2])).unwrap(), 1);
        page.sync().unwrap();
        assert_eq!(page_file_size(dir.path(), 3), page.size());

        let messages = read_page(dir.path(), 3).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[1].message.body[..], b"b");
        assert!(messages[1].is_for(2));
        assert!(!messages[0].is_for(2));
    }

    #[test]
    fn test_list_and_delete_pages() {
        let dir = tempdir().unwrap();
        for nr in [5, 1, 12] {
            Page::create(dir.path(), nr).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(list_pages(dir.path()).unwrap(), vec![1, 5, 12]);

        delete_page(dir.path(), 5).unwrap();
        delete_page(dir.path(), 5).unwrap();
        assert_eq!(list_pages(dir.path()).unwrap(), vec![1, 12]);
    }

    #[test]
    fn test_file_name_is_zero_padded() {
        assert_eq!(page_file_name(42), "000000042.page");
    }
}
