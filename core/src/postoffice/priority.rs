//! Priority-ordered linked list
//!
//! One FIFO per priority level. Iteration and polling always exhaust the
//! highest level before looking at lower ones.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct PriorityLinkedList<T> {
    levels: Vec<VecDeque<T>>,
    size: usize,
}

impl<T> PriorityLinkedList<T> {
    pub fn new(levels: usize) -> Self {
        let levels = levels.max(1);
        Self {
            levels: (0..levels).map(|_| VecDeque::new()).collect(),
            size: 0,
        }
    }

    fn level(&self, priority: u8) -> usize {
        (priority as usize).min(self.levels.len() - 1)
    }

    pub fn add_tail(&mut self, item: T, priority: u8) {
        let level = self.level(priority);
        self.levels[level].push_back(item);
        self.size += 1;
    }

    pub fn add_head(&mut self, item: T, priority: u8) {
        let level = self.level(priority);
        self.levels[level].push_front(item);
        self.size += 1;
    }

    pub fn poll(&mut self) -> Option<T> {
        let item = self.levels.iter_mut().rev().find_map(|l| l.pop_front());
        if item.is_some() {
            self.size -= 1;
        }
        item
    }

    pub fn peek(&self) -> Option<&T> {
        self.levels.iter().rev().find_map(|l| l.front())
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Items in delivery order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.levels.iter().rev().flat_map(|l| l.iter())
    }

    pub(crate) fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub(crate) fn get(&self, level: usize, index: usize) -> Option<&T> {
        self.levels.get(level).and_then(|l| l.get(index))
    }

    pub(crate) fn remove_at(&mut self, level: usize, index: usize) -> Option<T> {
        let item = self.levels.get_mut(level).and_then(|l| l.remove(index));
        if item.is_some() {
            self.size -= 1;
        }
        item
    }

    /// Remove the first item matching `predicate`
    pub fn remove_first<F: FnMut(&T) -> bool>(&mut self, mut predicate: F) -> Option<T> {
        for level in (0..self.levels.len()).rev() {
            if let Some(index) = self.levels[level].iter().position(&mut predicate) {
                return self.remove_at(level, index);
            }
        }
        None
    }

    /// Empty the list, returning items in delivery order
    pub fn drain(&mut self) -> Vec<T> {
        self.size = 0;
        self.levels
            .iter_mut()
            .rev()
            .flat_map(|l| l.drain(..))
            .collect()
    }
}
