use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::identity::ClientId;
use crate::scheduler::assignment::AssignmentTable;
use crate::scheduler::item::WorkItem;
use crate::scheduler::pool::ItemPool;
use crate::scheduler::progress::StepOutcome;
use crate::scheduler::queue::WaitQueue;

/// Answer to a "request work" call.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Assigned(WorkItem),
    Queued { position: usize, queue_length: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub position: Option<usize>,
    pub queue_length: usize,
}

/// An answer that was recorded and must now be forwarded upstream.
#[derive(Debug, Clone)]
pub struct RecordedAnswer {
    pub client_id: ClientId,
    pub item: WorkItem,
    pub answers: BTreeMap<u32, String>,
    pub outcome: StepOutcome,
}

impl RecordedAnswer {
    pub fn session_id(&self) -> &str {
        &self.item.id
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Clients whose item disappeared upstream.
    pub released: Vec<ClientId>,
    pub promoted: Vec<ClientId>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub evicted: Vec<ClientId>,
    /// Item ids taken back from idle clients.
    pub reclaimed: Vec<String>,
    pub promoted: Vec<ClientId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub pooled: usize,
    pub assigned: usize,
    pub queued: usize,
}

/// Owner of the pool, the assignment table and the wait queue.
///
/// Every method runs to completion without yielding, so each call is one
/// transaction: a client is never observed both queued and assigned, and no
/// item ever has two owners.
#[derive(Debug)]
pub struct Dispatcher {
    pool: ItemPool,
    assignments: AssignmentTable,
    queue: WaitQueue,
    /// Solved item ids, kept until the source stops listing them.
    retired: HashSet<String>,
    default_steps: u32,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Dispatcher {
    pub fn new(default_steps: u32) -> Self {
        Self {
            pool: ItemPool::new(),
            assignments: AssignmentTable::new(),
            queue: WaitQueue::new(),
            retired: HashSet::new(),
            default_steps: default_steps.max(1),
        }
    }

    /// Admission: return the client's current item, hand it a pooled item,
    /// or queue it.
    pub fn request_work(&mut self, client_id: &ClientId, now: Instant) -> Result<Admission> {
        if let Some(assignment) = self.assignments.lookup_by_client_mut(client_id) {
            assignment.touch(now);
            return Ok(Admission::Assigned(assignment.item.clone()));
        }

        // Items only go to clients no earlier arrival is still waiting ahead of.
        let entitled = match self.queue.position(client_id) {
            Some(position) => position <= self.pool.len(),
            None => self.queue.len() < self.pool.len(),
        };

        if entitled {
            if let Some(item) = self.pool.take_best() {
                let assigned = self.assign(client_id.clone(), item, now)?;
                self.queue.remove(client_id);
                return Ok(Admission::Assigned(assigned));
            }
        }

        let position = self.queue.enqueue(client_id.clone(), now);
        tracing::debug!(client_id = %client_id, position, "Client waiting for captcha");
        Ok(Admission::Queued {
            position,
            queue_length: self.queue.len(),
        })
    }

    /// Current queue position, refreshing the client's liveness.
    pub fn queue_position(&mut self, client_id: &ClientId, now: Instant) -> QueueStatus {
        QueueStatus {
            position: self.queue.touch(client_id, now),
            queue_length: self.queue.len(),
        }
    }

    /// Record the next answer for the caller's session.
    ///
    /// `session_id`, when given, must name the caller's own session.
    pub fn record_answer(
        &mut self,
        client_id: &ClientId,
        session_id: Option<&str>,
        answer: &str,
        now: Instant,
    ) -> Result<RecordedAnswer> {
        let assignment = self
            .assignments
            .lookup_by_client_mut(client_id)
            .ok_or(DispatchError::NoAssignment)?;

        if let Some(session_id) = session_id {
            if session_id != assignment.item.id {
                tracing::warn!(
                    client_id = %client_id,
                    session_id,
                    "Answer submitted for a session the client does not own"
                );
                return Err(DispatchError::Forbidden);
            }
        }

        assignment.touch(now);
        let outcome = assignment.progress.record(answer).ok_or_else(|| {
            DispatchError::InvalidRequest("session already completed".to_string())
        })?;

        tracing::info!(
            client_id = %client_id,
            item_id = %assignment.item.id,
            step = outcome.step,
            total = outcome.total,
            completed = outcome.completed,
            "Answer recorded"
        );

        Ok(RecordedAnswer {
            client_id: client_id.clone(),
            item: assignment.item.clone(),
            answers: assignment.progress.answers.clone(),
            outcome,
        })
    }

    /// Release a completed session and retire its item.
    ///
    /// Returns false if the client no longer holds that session.
    pub fn finish(&mut self, client_id: &ClientId, session_id: &str) -> bool {
        let owns = self
            .assignments
            .lookup_by_client(client_id)
            .is_some_and(|a| a.item.id == session_id && a.progress.completed);
        if !owns {
            return false;
        }

        if let Some(assignment) = self.assignments.release(client_id) {
            tracing::info!(client_id = %client_id, item_id = %assignment.item.id, "Captcha retired");
            self.retired.insert(assignment.item.id);
        }
        true
    }

    /// Bring local state in line with a freshly fetched item set.
    pub fn reconcile(&mut self, fetched: Vec<WorkItem>, now: Instant) -> Reconciliation {
        let ids: HashSet<String> = fetched.iter().map(|item| item.id.clone()).collect();
        let keep: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut result = Reconciliation::default();

        result.removed = self.pool.retain_ids(&keep);

        let vanished: Vec<String> = self
            .assignments
            .item_ids()
            .filter(|id| !keep.contains(id))
            .map(str::to_string)
            .collect();
        for item_id in vanished {
            if let Some(assignment) = self.assignments.release_item(&item_id) {
                tracing::info!(
                    client_id = %assignment.client_id,
                    item_id = %item_id,
                    "Assigned captcha vanished upstream, releasing client"
                );
                result.released.push(assignment.client_id);
            }
            result.removed.push(item_id);
        }

        self.retired.retain(|id| keep.contains(id.as_str()));

        for item in fetched {
            if self.retired.contains(&item.id) || self.assignments.is_assigned(&item.id) {
                continue;
            }
            let id = item.id.clone();
            if self.pool.put_back_if_missing(item) {
                result.added.push(id);
            }
        }

        result.promoted = self.promote_waiting(now);
        result
    }

    /// Drop all items, assignments and sessions.
    ///
    /// Waiting clients stay queued. Retired ids are kept: only a successful
    /// reconcile knows which ones the source has dropped.
    pub fn clear(&mut self) {
        let pooled = self.pool.clear();
        let assigned = self.assignments.clear();
        tracing::warn!(pooled, assigned, "Cleared captcha pool and assignments");
    }

    /// Evict silent queue entries and reclaim idle assignments.
    pub fn evict(
        &mut self,
        now: Instant,
        queue_timeout: Duration,
        assignment_timeout: Duration,
    ) -> Eviction {
        let mut result = Eviction {
            evicted: self.queue.evict_stale(now, queue_timeout),
            ..Eviction::default()
        };

        for client_id in &result.evicted {
            // Queued clients hold no session; drop any left behind.
            if let Some(assignment) = self.assignments.release(client_id) {
                self.put_back_if_missing(assignment.item);
            }
        }

        for client_id in self.assignments.idle_clients(now, assignment_timeout) {
            let Some(assignment) = self.assignments.release(&client_id) else {
                continue;
            };
            if assignment.progress.completed {
                self.retired.insert(assignment.item.id);
                continue;
            }
            tracing::info!(
                client_id = %client_id,
                item_id = %assignment.item.id,
                "Reclaimed captcha from idle client"
            );
            result.reclaimed.push(assignment.item.id.clone());
            self.put_back_if_missing(assignment.item);
        }

        result.promoted = self.promote_waiting(now);
        result
    }

    /// Return an item to the pool unless it is pooled or assigned already.
    pub fn put_back_if_missing(&mut self, item: WorkItem) -> bool {
        if self.assignments.is_assigned(&item.id) || self.retired.contains(&item.id) {
            return false;
        }
        self.pool.put_back_if_missing(item)
    }

    /// Hand pooled items to waiting clients in FIFO order.
    fn promote_waiting(&mut self, now: Instant) -> Vec<ClientId> {
        let mut promoted = Vec::new();
        while !self.pool.is_empty() {
            let Some(client_id) = self.queue.dequeue_front() else {
                break;
            };
            if self.assignments.lookup_by_client(&client_id).is_some() {
                continue;
            }
            let Some(item) = self.pool.take_best() else {
                break;
            };
            match self.assign(client_id.clone(), item, now) {
                Ok(_) => promoted.push(client_id),
                Err(e) => tracing::error!(client_id = %client_id, error = %e, "Promotion failed"),
            }
        }
        promoted
    }

    /// Assign a pooled item. On failure the item goes back to the pool.
    fn assign(&mut self, client_id: ClientId, item: WorkItem, now: Instant) -> Result<WorkItem> {
        let total_steps = item.step_count().unwrap_or(self.default_steps);
        match self.assignments.assign(client_id, item.clone(), total_steps, now) {
            Ok(assignment) => Ok(assignment.item.clone()),
            Err(e) => {
                self.pool.put_back_if_missing(item);
                Err(e)
            }
        }
    }

    pub fn assignments(&self) -> &AssignmentTable {
        &self.assignments
    }

    pub fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    pub fn pool(&self) -> &ItemPool {
        &self.pool
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            pooled: self.pool.len(),
            assigned: self.assignments.len(),
            queued: self.queue.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> WorkItem {
        WorkItem::new(id, format!("https://img.example/{id}.png"), "")
    }

    #[test]
    fn failed_assignment_leaves_pool_and_queue_untouched() {
        let now = Instant::now();
        let mut dispatcher = Dispatcher::new(1);
        let (x, y) = (ClientId::new("x"), ClientId::new("y"));

        dispatcher.request_work(&x, now).unwrap();
        // Corrupt state on purpose: "a" is pooled while y already owns it.
        dispatcher.pool.put_back_if_missing(item("a"));
        dispatcher.assignments.assign(y, item("a"), 1, now).unwrap();

        assert!(matches!(
            dispatcher.request_work(&x, now),
            Err(DispatchError::ItemTaken(id)) if id == "a"
        ));
        assert!(dispatcher.pool.contains("a"));
        assert_eq!(dispatcher.queue.position(&x), Some(1));
    }
}
