use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::{DispatchError, Result};
use crate::identity::ClientId;
use crate::scheduler::item::WorkItem;
use crate::scheduler::progress::SessionProgress;

/// Binding of one client to one item, together with its answer progress.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub client_id: ClientId,
    pub item: WorkItem,
    pub assigned_at: DateTime<Utc>,
    pub last_seen: Instant,
    pub progress: SessionProgress,
}

impl Assignment {
    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// Client <-> item assignments.
///
/// At most one assignment per client and at most one per item id.
#[derive(Debug, Default)]
pub struct AssignmentTable {
    by_client: HashMap<ClientId, Assignment>,
    owners: HashMap<String, ClientId>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `item` to `client_id` and start a fresh session of `total_steps`.
    pub fn assign(
        &mut self,
        client_id: ClientId,
        item: WorkItem,
        total_steps: u32,
        now: Instant,
    ) -> Result<&Assignment> {
        if self.by_client.contains_key(&client_id) {
            return Err(DispatchError::AlreadyAssigned(client_id));
        }
        if self.owners.contains_key(&item.id) {
            return Err(DispatchError::ItemTaken(item.id));
        }

        tracing::info!(client_id = %client_id, item_id = %item.id, total_steps, "Captcha assigned");

        self.owners.insert(item.id.clone(), client_id.clone());
        let assignment = Assignment {
            progress: SessionProgress::new(item.id.clone(), total_steps),
            client_id: client_id.clone(),
            item,
            assigned_at: Utc::now(),
            last_seen: now,
        };
        Ok(&*self.by_client.entry(client_id).or_insert(assignment))
    }

    pub fn lookup_by_client(&self, client_id: &ClientId) -> Option<&Assignment> {
        self.by_client.get(client_id)
    }

    pub fn lookup_by_client_mut(&mut self, client_id: &ClientId) -> Option<&mut Assignment> {
        self.by_client.get_mut(client_id)
    }

    pub fn owner_of(&self, item_id: &str) -> Option<&ClientId> {
        self.owners.get(item_id)
    }

    pub fn is_assigned(&self, item_id: &str) -> bool {
        self.owners.contains_key(item_id)
    }

    /// Remove a client's assignment and session. No-op if absent.
    pub fn release(&mut self, client_id: &ClientId) -> Option<Assignment> {
        let assignment = self.by_client.remove(client_id)?;
        self.owners.remove(&assignment.item.id);
        Some(assignment)
    }

    /// Remove whichever assignment holds `item_id`.
    pub fn release_item(&mut self, item_id: &str) -> Option<Assignment> {
        let client_id = self.owners.get(item_id)?.clone();
        self.release(&client_id)
    }

    /// Clients whose assignment has been idle longer than `timeout`.
    pub fn idle_clients(&self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        self.by_client
            .values()
            .filter(|a| a.is_idle(now, timeout))
            .map(|a| a.client_id.clone())
            .collect()
    }

    pub fn item_ids(&self) -> impl Iterator<Item = &str> {
        self.owners.keys().map(String::as_str)
    }

    pub fn clear(&mut self) -> usize {
        let n = self.by_client.len();
        self.by_client.clear();
        self.owners.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }
}
