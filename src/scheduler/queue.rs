use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::ClientId;

/// One waiting client.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub client_id: ClientId,
    pub enqueued_at: Instant,
    /// Last time the client polled its position.
    pub last_seen: Instant,
}

/// FIFO of clients waiting for an item.
///
/// `entries` holds the order, `index` maps each client to its slot in
/// `entries`. Every structural change patches the index before returning.
#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: Vec<QueueEntry>,
    index: HashMap<ClientId, usize>,
}

impl WaitQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client at the back. Returns its 1-based position.
    ///
    /// A client that is already queued keeps its place; only its
    /// `last_seen` is refreshed.
    pub fn enqueue(&mut self, client_id: ClientId, now: Instant) -> usize {
        if let Some(&slot) = self.index.get(&client_id) {
            self.entries[slot].last_seen = now;
            return slot + 1;
        }

        self.index.insert(client_id.clone(), self.entries.len());
        self.entries.push(QueueEntry {
            client_id,
            enqueued_at: now,
            last_seen: now,
        });
        self.entries.len()
    }

    /// 1-based position of a client, if queued.
    pub fn position(&self, client_id: &ClientId) -> Option<usize> {
        self.index.get(client_id).map(|slot| slot + 1)
    }

    /// Refresh `last_seen` for a queued client without changing its place.
    pub fn touch(&mut self, client_id: &ClientId, now: Instant) -> Option<usize> {
        let slot = *self.index.get(client_id)?;
        self.entries[slot].last_seen = now;
        Some(slot + 1)
    }

    /// Pop the longest-waiting client.
    pub fn dequeue_front(&mut self) -> Option<ClientId> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = self.entries.remove(0);
        self.index.remove(&entry.client_id);
        self.reindex_from(0);
        Some(entry.client_id)
    }

    /// Remove a client wherever it sits. Returns true if it was queued.
    pub fn remove(&mut self, client_id: &ClientId) -> bool {
        let Some(slot) = self.index.remove(client_id) else {
            return false;
        };
        self.entries.remove(slot);
        self.reindex_from(slot);
        true
    }

    /// Drop every client that has not polled within `timeout`.
    /// Survivors keep their relative order.
    pub fn evict_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let mut evicted = Vec::new();
        self.entries.retain(|entry| {
            if now.saturating_duration_since(entry.last_seen) > timeout {
                evicted.push(entry.client_id.clone());
                false
            } else {
                true
            }
        });

        if !evicted.is_empty() {
            for client_id in &evicted {
                self.index.remove(client_id);
            }
            self.reindex_from(0);
        }
        evicted
    }

    // Slots before `start` are unchanged.
    fn reindex_from(&mut self, start: usize) {
        for (slot, entry) in self.entries.iter().enumerate().skip(start) {
            self.index.insert(entry.client_id.clone(), slot);
        }
    }

    /// Check whether a client is waiting.
    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.index.contains_key(client_id)
    }

    /// Waiting clients, front first.
    pub fn clients(&self) -> impl Iterator<Item = &ClientId> {
        self.entries.iter().map(|e| &e.client_id)
    }

    /// Number of waiting clients.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
