//! Bounded LRU set used by the event processor to deduplicate index events.

use std::collections::HashMap;

/// Outcome of an insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insertion {
    /// The key was not present (it may have been evicted earlier).
    New,
    /// The key was already present; it has been refreshed to most recent.
    Existed,
}

#[derive(Clone, Debug)]
struct Node {
    key: String,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A recency set with a fixed capacity. Inserting past capacity evicts the
/// least-recently-inserted key. A capacity of zero disables tracking: every
/// insertion reports [Insertion::New].
#[derive(Debug, Default)]
pub struct LruSet {
    capacity: usize,
    map: HashMap<String, usize>,
    nodes: Vec<Node>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Record a key, reporting whether it was already present.
    pub fn insert(&mut self, key: &str) -> Insertion {
        if self.capacity == 0 {
            return Insertion::New;
        }

        if let Some(&slot) = self.map.get(key) {
            self.unlink(slot);
            self.push_front(slot);
            return Insertion::Existed;
        }

        let slot = if self.nodes.len() == self.capacity {
            // reuse the least recent slot
            let slot = self.tail.expect("full lru must have a tail");
            self.unlink(slot);
            let evicted = std::mem::replace(&mut self.nodes[slot].key, key.to_string());
            self.map.remove(&evicted);
            slot
        } else {
            self.nodes.push(Node {
                key: key.to_string(),
                prev: None,
                next: None,
            });
            self.nodes.len() - 1
        };

        self.map.insert(key.to_string(), slot);
        self.push_front(slot);
        Insertion::New
    }

    /// Drop every key while keeping the allocated capacity.
    pub fn clear(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[slot].prev = None;
        self.nodes[slot].next = None;
    }

    fn push_front(&mut self, slot: usize) {
        self.nodes[slot].prev = None;
        self.nodes[slot].next = self.head;
        if let Some(head) = self.head {
            self.nodes[head].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}
