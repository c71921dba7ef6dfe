use crate::namenode::session::ReplicaHandle;
use crate::protocol::ObjectPayload;
use std::collections::{BTreeMap, HashSet};

/// Standby replica waiting for a recovery payload.
#[derive(Debug, Clone)]
pub struct GhostRecord {
    pub id: String,
    pub handle: ReplicaHandle,
}

/// Registered ghosts. Not part of placement.
#[derive(Debug, Default)]
pub struct GhostPool {
    ghosts: BTreeMap<String, GhostRecord>,
}

impl GhostPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ghosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ghosts.is_empty()
    }

    pub fn register(&mut self, handle: ReplicaHandle) {
        let id = handle.id().to_string();
        self.ghosts.insert(id.clone(), GhostRecord { id, handle });
    }

    pub fn remove_connection(&mut self, id: &str, connection: u64) -> Option<GhostRecord> {
        match self.ghosts.get(id) {
            Some(ghost) if ghost.handle.connection() == connection => self.ghosts.remove(id),
            _ => None,
        }
    }

    /// Take one ghost out of the pool. A ghost serves one failure event.
    pub fn take(&mut self) -> Option<GhostRecord> {
        let id = self
            .ghosts
            .iter()
            .find(|(_, ghost)| !ghost.handle.is_closed())
            .map(|(id, _)| id.clone())?;
        self.ghosts.remove(&id)
    }
}

/// Flatten distributed-read replies, keeping the first copy seen per name.
pub fn aggregate_first_seen(replies: Vec<Vec<ObjectPayload>>) -> Vec<ObjectPayload> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for payload in replies.into_iter().flatten() {
        if seen.insert(payload.name.clone()) {
            entries.push(payload);
        }
    }
    entries
}

/// Result of recovering a lost data node onto a ghost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed_node: String,
    pub ghost: String,
    pub sequence: u64,
    pub required: Vec<String>,
    pub recovered: Vec<String>,
}
