//! # Paging
//!
//! When an address exceeds its memory limit its messages spill to page files
//! on disk. Each queue bound to the address reads them back in order through
//! its own [`PageCursor`], addressing messages by [`PagePosition`].
//!
//! - [`position`] - page/message positions and their ordering
//! - [`page`] - page files and the paged message record
//! - [`page_cache`] - bounded LRU of loaded pages with explicit reload
//! - [`cursor`] - per-queue read and acknowledgement state
//! - [`store`] - per-address size accounting, policy and page lifecycle

pub mod cursor;
pub mod page;
pub mod page_cache;
pub mod position;
pub mod store;

pub use cursor::{PageAckRecord, PageCursor};
pub use page::PagedMessage;
pub use page_cache::{PageCache, PageCacheManager, PageCacheStats};
pub use position::PagePosition;
pub use store::{Admission, CreditGrant, PagingStore};

use std::path::{Path, PathBuf};

/// Directory holding the pages of `address` under `paging_root`.
///
/// Bytes outside `[A-Za-z0-9.-]` are written as `_XX` hex, so every address
/// gets its own single path component.
pub fn address_directory(paging_root: &Path, address: &str) -> PathBuf {
    let mut name = String::with_capacity(address.len());
    for byte in address.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-') {
            name.push(byte as char);
        } else {
            name.push_str(&format!("_{byte:02X}"));
        }
    }
    if name.is_empty() {
        name.push('_');
    } else if name.bytes().all(|b| b == b'.') {
        name.replace_range(..1, "_2E");
    }
    paging_root.join(name)
}
