//! Fixed-capacity newest-first list

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Newest-first list that drops its oldest items beyond `capacity`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ListDoc<T>", bound(deserialize = "T: Deserialize<'de>"))]
pub struct BoundedList<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedList<T> {
    /// Create an empty list. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Rebuild from items already ordered newest-first (e.g. a persisted list)
    pub fn from_newest_first(capacity: usize, items: impl IntoIterator<Item = T>) -> Self {
        let mut list = Self::new(capacity);
        list.items.extend(items.into_iter().take(list.capacity));
        list
    }

    /// Insert at head, evicting from the tail. Returns the number of evicted items.
    pub fn push(&mut self, item: T) -> usize {
        self.items.push_front(item);
        self.evict()
    }

    /// Push items given oldest-first, so the last one ends up at the head
    pub fn push_all(&mut self, oldest_first: impl IntoIterator<Item = T>) -> usize {
        oldest_first.into_iter().map(|item| self.push(item)).sum()
    }

    fn evict(&mut self) -> usize {
        let over = self.items.len().saturating_sub(self.capacity);
        self.items.truncate(self.capacity);
        over
    }

    /// Change the capacity, evicting immediately if it shrinks
    pub fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity.max(1);
        self.evict()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Newest item
    pub fn head(&self) -> Option<&T> {
        self.items.front()
    }

    /// Iterate newest-first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> BoundedList<T> {
    /// Copy out newest-first
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Persisted form; loading re-applies the capacity rules
#[derive(Deserialize)]
struct ListDoc<T> {
    capacity: usize,
    items: Vec<T>,
}

impl<T> From<ListDoc<T>> for BoundedList<T> {
    fn from(doc: ListDoc<T>) -> Self {
        BoundedList::from_newest_first(doc.capacity, doc.items)
    }
}
