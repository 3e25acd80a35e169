use std::sync::Arc;

use parking_lot::Mutex;

use crate::worker::{WorkerId, WorkerNode};

#[derive(Debug)]
struct NodeEntry {
    node: Arc<dyn WorkerNode>,
    /// Set once the node reported `Active` and was counted as running.
    active: bool,
}

/// The cluster's worker membership. The cluster is the only writer; the
/// scheduler loop reads it to find free capacity.
#[derive(Debug, Default)]
pub struct NodeSet {
    entries: Mutex<Vec<NodeEntry>>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Returns false if a node with the same id is already present.
    pub fn insert(&self, node: Arc<dyn WorkerNode>) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.node.id() == node.id()) {
            return false;
        }
        entries.push(NodeEntry {
            node,
            active: false,
        });
        true
    }

    /// Mark a node active. Returns true only on the first activation of a
    /// known node.
    pub fn activate(&self, id: WorkerId) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.node.id() == id) {
            Some(entry) if !entry.active => {
                entry.active = true;
                true
            }
            _ => false,
        }
    }

    /// Remove a node, returning it and whether it had been counted active.
    pub fn remove(&self, id: WorkerId) -> Option<(Arc<dyn WorkerNode>, bool)> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| e.node.id() == id)?;
        let entry = entries.swap_remove(pos);
        Some((entry.node, entry.active))
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<dyn WorkerNode>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.node.id() == id)
            .map(|e| e.node.clone())
    }

    /// First active node with a free slot. Nodes and jobs are treated as
    /// interchangeable, so there is no ranking.
    pub fn free_node(&self) -> Option<Arc<dyn WorkerNode>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.active && e.node.available_threads() > 0)
            .map(|e| e.node.clone())
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn WorkerNode>> {
        self.entries.lock().iter().map(|e| e.node.clone()).collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
