//! Positional addressing of paged messages

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Locator of one message inside the paged sequence of an address.
///
/// Positions order by page number, then message number; `record_id` (the
/// storage id of the ack record, once acknowledged) takes no part in
/// ordering or equality. A position does not hold its page's cache: the
/// page is looked up by number in the bounded page cache and reloaded from
/// disk when it has been evicted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PagePosition {
    pub page_nr: u64,
    pub message_nr: u32,
    #[serde(default)]
    pub record_id: Option<i64>,
}

impl PagePosition {
    pub fn new(page_nr: u64, message_nr: u32) -> Self {
        Self {
            page_nr,
            message_nr,
            record_id: None,
        }
    }

    pub fn with_record_id(mut self, record_id: i64) -> Self {
        self.record_id = Some(record_id);
        self
    }

    /// Successor inside the same page
    pub fn next_message(&self) -> Self {
        Self::new(self.page_nr, self.message_nr + 1)
    }

    /// First message of the following page
    pub fn next_page(&self) -> Self {
        Self::new(self.page_nr + 1, 0)
    }

    /// Whether `self` immediately follows `previous`.
    ///
    /// Within a page that means the next message number. Across a page
    /// boundary `self` must be message 0 of the next page and `previous` must
    /// have been the last message of its page, which the caller states via
    /// `previous_page_last`; when that is unknown the boundary case is false.
    pub fn is_right_after(&self, previous: &PagePosition, previous_page_last: Option<u32>) -> bool {
        if self.page_nr == previous.page_nr {
            return previous.message_nr.checked_add(1) == Some(self.message_nr);
        }
        self.page_nr == previous.page_nr + 1
            && self.message_nr == 0
            && previous_page_last == Some(previous.message_nr)
    }
}

impl PartialEq for PagePosition {
    fn eq(&self, other: &Self) -> bool {
        self.page_nr == other.page_nr && self.message_nr == other.message_nr
    }
}

impl Eq for PagePosition {}

impl PartialOrd for PagePosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PagePosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.page_nr
            .cmp(&other.page_nr)
            .then(self.message_nr.cmp(&other.message_nr))
    }
}

impl std::hash::Hash for PagePosition {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.page_nr.hash(state);
        self.message_nr.hash(state);
    }
}

impl std::fmt::Display for PagePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_nr, self.message_nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_order() {
        let mut positions = vec![
            PagePosition::new(2, 0),
            PagePosition::new(1, 5),
            PagePosition::new(1, 0),
            PagePosition::new(3, 1),
        ];
        positions.sort();
        assert_eq!(
            positions,
            vec![
                PagePosition::new(1, 0),
                PagePosition::new(1, 5),
                PagePosition::new(2, 0),
                PagePosition::new(3, 1),
            ]
        );
    }

    #[test]
    fn test_record_id_ignored_by_equality() {
        let a = PagePosition::new(4, 2).with_record_id(99);
        assert_eq!(a, PagePosition::new(4, 2));
    }

    #[test]
    fn test_successors() {
        let p = PagePosition::new(7, 3);
        assert_eq!(p.next_message(), PagePosition::new(7, 4));
        assert_eq!(p.next_page(), PagePosition::new(8, 0));
        assert!(p.next_message().record_id.is_none());
    }

    #[test]
    fn test_right_after_within_page() {
        let prev = PagePosition::new(1, 4);
        assert!(PagePosition::new(1, 5).is_right_after(&prev, None));
        assert!(!PagePosition::new(1, 6).is_right_after(&prev, None));
        assert!(!PagePosition::new(1, 4).is_right_after(&prev, None));
    }

    #[test]
    fn test_right_after_page_boundary() {
        let prev = PagePosition::new(1, 5);
        let next = PagePosition::new(2, 0);

        assert!(next.is_right_after(&prev, Some(5)));
        assert!(!next.is_right_after(&prev, Some(6)));
        assert!(!next.is_right_after(&prev, Some(4)));
        assert!(!next.is_right_after(&prev, None));
        assert!(!PagePosition::new(2, 1).is_right_after(&prev, Some(5)));
        assert!(!PagePosition::new(3, 0).is_right_after(&prev, Some(5)));
    }
}
