//! Offline message queue: store-and-forward buffer for credentials without a
//! live connection.
//!
//! FIFO per credential; no ordering guarantee across credentials; no content
//! dedup. Unbounded; growth is logged by the engine but no drop or TTL
//! policy is applied.

use crate::protocol::Queued;

#[derive(Debug)]
pub struct OfflineQueue<T> {
    entries: Vec<Queued<T>>,
}

impl<T> Default for OfflineQueue<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> OfflineQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffer a message, returning the new queue depth.
    pub fn push(&mut self, entry: Queued<T>) -> usize {
        self.entries.push(entry);
        self.entries.len()
    }

    /// Remove and return every entry whose credential currently has a live
    /// connection, preserving enqueue order. Everything else is retained for
    /// the next tick.
    pub fn drain_ready(&mut self, is_live: impl Fn(&str) -> bool) -> Vec<Queued<T>> {
        let (ready, waiting) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| is_live(&entry.credential));
        self.entries = waiting;
        ready
    }

    /// Remove and return every entry for one credential, in enqueue order.
    /// Used for the targeted drain at agent authentication.
    pub fn drain_credential(&mut self, credential: &str) -> Vec<Queued<T>> {
        let (matching, rest) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.credential == credential);
        self.entries = rest;
        matching
    }
}
