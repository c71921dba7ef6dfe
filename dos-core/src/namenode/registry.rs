use crate::namenode::session::ReplicaHandle;
use std::collections::{BTreeSet, HashMap};

/// A connected data node as the name node sees it.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: String,
    pub lease_endpoint: String,
    pub reported_size: u64,
    pub handle: ReplicaHandle,
}

impl NodeRecord {
    pub fn new(
        handle: ReplicaHandle,
        lease_endpoint: impl Into<String>,
        reported_size: u64,
    ) -> Self {
        Self {
            id: handle.id().to_string(),
            lease_endpoint: lease_endpoint.into(),
            reported_size,
            handle,
        }
    }
}

/// Connected data nodes, ordered for placement.
///
/// Binary heap keyed on reported size with an id -> slot index so that size
/// updates are O(log n). [`ReplicaRegistry::next`] hands out the node with
/// the largest reported size; equal sizes fall back to id order.
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    heap: Vec<NodeRecord>,
    positions: HashMap<String, usize>,
}

fn above(a: &NodeRecord, b: &NodeRecord) -> bool {
    a.reported_size > b.reported_size || (a.reported_size == b.reported_size && a.id < b.id)
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&NodeRecord> {
        self.positions.get(id).map(|&slot| &self.heap[slot])
    }

    /// Insert a node. A record already present under the same id is replaced.
    pub fn register(&mut self, record: NodeRecord) {
        if let Some(&slot) = self.positions.get(&record.id) {
            self.heap[slot] = record;
            self.fix(slot);
            return;
        }

        let slot = self.heap.len();
        self.positions.insert(record.id.clone(), slot);
        self.heap.push(record);
        self.sift_up(slot);
    }

    /// Put back a record previously taken with [`ReplicaRegistry::next`].
    pub fn reinsert(&mut self, record: NodeRecord) {
        self.register(record);
    }

    /// Remove and return the current placement candidate.
    pub fn next(&mut self) -> Option<NodeRecord> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_slot(0))
    }

    pub fn remove(&mut self, id: &str) -> Option<NodeRecord> {
        let slot = *self.positions.get(id)?;
        Some(self.remove_slot(slot))
    }

    /// Remove `id` only if it is still registered through `connection`.
    pub fn remove_connection(&mut self, id: &str, connection: u64) -> Option<NodeRecord> {
        match self.get(id) {
            Some(record) if record.handle.connection() == connection => self.remove(id),
            _ => None,
        }
    }

    /// Returns whether the node's position changed.
    pub fn update_size(&mut self, id: &str, reported_size: u64) -> bool {
        let Some(&slot) = self.positions.get(id) else {
            return false;
        };
        self.heap[slot].reported_size = reported_size;
        let moved = self.fix(slot);
        if moved {
            tracing::debug!("node {} moved in placement order, size {}", id, reported_size);
        }
        moved
    }

    pub fn for_each(&self, mut visit: impl FnMut(&NodeRecord)) {
        for record in &self.heap {
            visit(record);
        }
    }

    pub fn handles(&self) -> Vec<ReplicaHandle> {
        self.heap.iter().map(|record| record.handle.clone()).collect()
    }

    /// Lease endpoints of the registered nodes among `ids`.
    pub fn lease_endpoints(&self, ids: &BTreeSet<String>) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.get(id))
            .map(|record| record.lease_endpoint.clone())
            .collect()
    }

    fn remove_slot(&mut self, slot: usize) -> NodeRecord {
        let record = self.heap.swap_remove(slot);
        self.positions.remove(&record.id);
        if slot < self.heap.len() {
            self.positions.insert(self.heap[slot].id.clone(), slot);
            self.fix(slot);
        }
        record
    }

    fn fix(&mut self, slot: usize) -> bool {
        self.sift_down(slot) || self.sift_up(slot)
    }

    fn sift_up(&mut self, mut slot: usize) -> bool {
        let start = slot;
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !above(&self.heap[slot], &self.heap[parent]) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
        slot != start
    }

    fn sift_down(&mut self, mut slot: usize) -> bool {
        let start = slot;
        let len = self.heap.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut best = slot;
            if left < len && above(&self.heap[left], &self.heap[best]) {
                best = left;
            }
            if right < len && above(&self.heap[right], &self.heap[best]) {
                best = right;
            }
            if best == slot {
                break;
            }
            self.swap(slot, best);
            slot = best;
        }
        slot != start
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].id.clone(), a);
        self.positions.insert(self.heap[b].id.clone(), b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, size: u64) -> NodeRecord {
        NodeRecord::new(ReplicaHandle::detached(id, 1), format!("ws://{}", id), size)
    }

    fn drain(registry: &mut ReplicaRegistry) -> Vec<String> {
        let mut order = Vec::new();
        while let Some(record) = registry.next() {
            order.push(record.id);
        }
        order
    }

    #[test]
    fn test_next_yields_largest_reported_size_first() {
        let mut registry = ReplicaRegistry::new();
        registry.register(record("small", 10));
        registry.register(record("large", 300));
        registry.register(record("medium", 120));
        registry.register(record("empty", 0));

        assert_eq!(drain(&mut registry), vec!["large", "medium", "small", "empty"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_size_reorders() {
        let mut registry = ReplicaRegistry::new();
        registry.register(record("a", 10));
        registry.register(record("b", 20));
        registry.register(record("c", 30));

        assert!(registry.update_size("a", 100));
        assert!(!registry.update_size("missing", 5));
        assert_eq!(registry.get("a").unwrap().reported_size, 100);

        assert_eq!(drain(&mut registry), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_reinsert_after_next_and_remove() {
        let mut registry = ReplicaRegistry::new();
        for (id, size) in [("a", 5), ("b", 6), ("c", 7), ("d", 8)] {
            registry.register(record(id, size));
        }

        let first = registry.next().unwrap();
        assert_eq!(first.id, "d");
        assert!(!registry.exists("d"));
        registry.reinsert(first);
        assert!(registry.exists("d"));

        assert!(registry.remove("b").is_some());
        assert!(registry.remove("b").is_none());
        assert_eq!(registry.len(), 3);
        assert_eq!(drain(&mut registry), vec!["d", "c", "a"]);
    }

    #[test]
    fn test_remove_connection_ignores_newer_session() {
        let mut registry = ReplicaRegistry::new();
        registry.register(NodeRecord::new(ReplicaHandle::detached("a", 2), "ws://a", 1));

        assert!(registry.remove_connection("a", 1).is_none());
        assert!(registry.exists("a"));
        assert!(registry.remove_connection("a", 2).is_some());
        assert!(!registry.exists("a"));
    }

    #[test]
    fn test_lease_endpoints_skip_unregistered() {
        let mut registry = ReplicaRegistry::new();
        registry.register(record("a", 1));
        registry.register(record("b", 2));

        let ids: BTreeSet<String> = ["a", "gone"].iter().map(|s| s.to_string()).collect();
        assert_eq!(registry.lease_endpoints(&ids), vec!["ws://a".to_string()]);
    }
}
