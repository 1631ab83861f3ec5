use std::collections::HashSet;

use crate::scheduler::item::WorkItem;

/// Unassigned items, kept in the order they were first seen.
#[derive(Debug, Default)]
pub struct ItemPool {
    items: Vec<WorkItem>,
}

impl ItemPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether an item with this id is pooled.
    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.id == id)
    }

    /// Insert an item unless one with the same id is already pooled.
    /// Returns true if the item was added.
    pub fn put_back_if_missing(&mut self, item: WorkItem) -> bool {
        if self.contains(&item.id) {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Remove and return the item with the smallest data volume.
    /// Ties go to the earliest inserted item.
    pub fn take_best(&mut self) -> Option<WorkItem> {
        let (index, _) = self
            .items
            .iter()
            .enumerate()
            .min_by_key(|(_, item)| item.data_volume())?;
        Some(self.items.remove(index))
    }

    /// Drop every pooled item whose id is not in `keep`. Returns the removed ids.
    pub fn retain_ids(&mut self, keep: &HashSet<&str>) -> Vec<String> {
        let mut removed = Vec::new();
        self.items.retain(|item| {
            if keep.contains(item.id.as_str()) {
                true
            } else {
                removed.push(item.id.clone());
                false
            }
        });
        removed
    }

    /// Drop every pooled item. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    /// Number of unassigned items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if no item is available.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pooled items in insertion order.
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }
}
