//! Name node: namespace, placement, broadcast and recovery.
//!
//! [`NameNode`] holds the namespace directory, the replica registry and the
//! ghost pool behind one async mutex. Namespace decisions, the create round
//! and sequence reservation run inside it; broadcast fan-out runs on its own
//! task and is awaited outside.

pub mod broadcast;
pub mod namespace;
pub mod recovery;
pub mod registry;
pub mod session;

pub use broadcast::{BroadcastCoordinator, BroadcastReport, PendingBroadcast};
pub use namespace::NamespaceDirectory;
pub use recovery::{GhostPool, GhostRecord, RecoveryReport};
pub use registry::{NodeRecord, ReplicaRegistry};
pub use session::{Ack, ReplicaHandle, ReplicaRole};

use crate::error::{DosError, Result};
use crate::protocol::{Command, GhostFrame, GhostStatus, NodeFrame, NodeFrameBody, Outbound};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone)]
pub struct NameNodeOptions {
    pub replication: usize,
    /// Minimum registered ghosts for a create to proceed. 0 disables.
    pub tolerance: usize,
    pub create_ack_timeout: Option<Duration>,
    pub namespace_file: Option<PathBuf>,
    pub initial_sequence: u64,
}

impl Default for NameNodeOptions {
    fn default() -> Self {
        Self {
            replication: 2,
            tolerance: 0,
            create_ack_timeout: Some(Duration::from_millis(5000)),
            namespace_file: None,
            initial_sequence: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub holders: Vec<String>,
    pub commit: BroadcastReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameNodeStatus {
    pub nodes: usize,
    pub ghosts: usize,
    pub objects: usize,
    pub sequence: u64,
}

struct NameState {
    namespace: NamespaceDirectory,
    registry: ReplicaRegistry,
    ghosts: GhostPool,
}

pub struct NameNode {
    options: NameNodeOptions,
    state: Mutex<NameState>,
    broadcast: BroadcastCoordinator,
    connections: AtomicU64,
}

impl NameNode {
    pub fn new(options: NameNodeOptions) -> Result<Self> {
        if options.replication == 0 {
            return Err(DosError::Config(
                "replication factor must be at least 1".to_string(),
            ));
        }

        let namespace = match &options.namespace_file {
            Some(path) => NamespaceDirectory::load(path)?,
            None => NamespaceDirectory::new(),
        };

        Ok(Self {
            broadcast: BroadcastCoordinator::new(options.initial_sequence),
            state: Mutex::new(NameState {
                namespace,
                registry: ReplicaRegistry::new(),
                ghosts: GhostPool::new(),
            }),
            connections: AtomicU64::new(0),
            options,
        })
    }

    pub fn options(&self) -> &NameNodeOptions {
        &self.options
    }

    pub fn sequence(&self) -> u64 {
        self.broadcast.current()
    }

    pub async fn status(&self) -> NameNodeStatus {
        let state = self.state.lock().await;
        NameNodeStatus {
            nodes: state.registry.len(),
            ghosts: state.ghosts.len(),
            objects: state.namespace.len(),
            sequence: self.broadcast.current(),
        }
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.state.lock().await.namespace.exists(name)
    }

    pub async fn holders_of(&self, name: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.namespace.holders_of(name)?.iter().cloned().collect())
    }

    pub async fn create_object(&self, name: &str, data: &[u8]) -> Result<CreateOutcome> {
        let replication = self.options.replication;
        let mut state = self.state.lock().await;

        if state.namespace.exists(name) {
            return Err(DosError::ObjectAlreadyExists(name.to_string()));
        }

        let tolerance = self.options.tolerance;
        if tolerance > 0 && state.ghosts.len() < tolerance {
            return Err(DosError::ToleranceNotMet {
                required: tolerance,
                available: state.ghosts.len(),
            });
        }

        if state.registry.len() < replication {
            return Err(DosError::NotEnoughReplicas {
                required: replication,
                found: state.registry.len(),
            });
        }

        let holders = {
            let mut drawn = DrawnNodes::new(&mut state.registry);
            let mut holders = Vec::with_capacity(replication);
            for _ in 0..replication {
                let Some(candidate) = drawn.draw() else {
                    break;
                };
                let acked = self
                    .broadcast
                    .deliver_create(&candidate, name, data, self.options.create_ack_timeout)
                    .await;
                if acked {
                    holders.push(candidate.id().to_string());
                }
            }
            holders
        };

        if holders.len() < replication {
            tracing::warn!(
                "create {} failed: {} of {} replicas acked, staged copies stay orphaned",
                name,
                holders.len(),
                replication
            );
            return Err(DosError::ReplicationFailed {
                required: replication,
                acked: holders.len(),
            });
        }

        state.namespace.add(name)?;
        for holder in &holders {
            state.namespace.add_holder(name, holder);
        }
        self.save_namespace(&state.namespace);
        let commit = self.broadcast.commit(state.registry.handles(), name);
        drop(state);

        tracing::info!("created {} on {:?}", name, holders);
        let commit = commit.report().await;
        Ok(CreateOutcome { holders, commit })
    }

    pub async fn delete_object(&self, name: &str) -> Result<BroadcastReport> {
        let delete = {
            let mut state = self.state.lock().await;
            state.namespace.delete(name)?;
            self.save_namespace(&state.namespace);
            self.broadcast.delete(state.registry.handles(), name)
        };

        tracing::info!("deleting {} @lamport{}", name, delete.sequence());
        Ok(delete.report().await)
    }

    pub async fn update_object(&self, name: &str, data: &[u8]) -> Result<BroadcastReport> {
        let update = {
            let state = self.state.lock().await;
            if !state.namespace.exists(name) {
                return Err(DosError::ObjectNotFound(name.to_string()));
            }
            self.broadcast.update(state.registry.handles(), name, data)
        };

        tracing::info!("updating {} @lamport{}", name, update.sequence());
        Ok(update.report().await)
    }

    /// Lease endpoints of the registered holders of `name`.
    pub async fn lease_object(&self, name: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let holders = state.namespace.holders_of(name)?;
        Ok(state.registry.lease_endpoints(holders))
    }

    /// Serve one data-node control stream until it ends, then run recovery
    /// for whatever the node was holding.
    ///
    /// The first frame must be a heartbeat; it carries the node's id and
    /// lease endpoint.
    pub async fn serve_replica(
        &self,
        mut inbound: mpsc::Receiver<NodeFrame>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<Option<RecoveryReport>> {
        let first = inbound.recv().await.ok_or_else(|| {
            DosError::Transport("stream closed before first heartbeat".to_string())
        })?;
        if first.body != NodeFrameBody::Beat {
            return Err(DosError::InvalidRequest(format!(
                "first frame from {} is not a heartbeat",
                first.id
            )));
        }

        let connection = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let node_id = first.id.clone();
        let mut session = session::spawn(
            &node_id,
            ReplicaRole::Data,
            connection,
            inbound,
            outbound,
        );

        let registered_at = {
            let mut state = self.state.lock().await;
            // Every broadcast reserves its sequence under this lock, so the
            // node sees exactly the broadcasts numbered above this value.
            let registered_at = self.broadcast.current();
            session
                .handle
                .announce(Command::Registered {
                    sequence: registered_at,
                })?;
            state.registry.register(NodeRecord::new(
                session.handle.clone(),
                first.lease_endpoint.clone(),
                first.reported_size,
            ));
            claim_reported(&mut state.namespace, &node_id, &first.object_names);
            registered_at
        };
        tracing::info!(
            "[{}] registered @lamport{}, lease {}, size {}",
            node_id,
            registered_at,
            first.lease_endpoint,
            first.reported_size
        );

        while let Some(beat) = session.beats.recv().await {
            let mut state = self.state.lock().await;
            state.registry.update_size(&node_id, beat.reported_size);
            claim_reported(&mut state.namespace, &node_id, &beat.object_names);
        }
        let _ = session.task.await;

        self.handle_disconnect(&node_id, connection).await
    }

    /// Serve one ghost stream. The ghost sits in the pool until it is chosen
    /// for a recovery or disconnects.
    pub async fn serve_ghost(
        &self,
        ghost_id: &str,
        inbound: mpsc::Receiver<NodeFrame>,
        outbound: mpsc::Sender<Outbound>,
    ) {
        let connection = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let session = session::spawn(ghost_id, ReplicaRole::Ghost, connection, inbound, outbound);

        self.state
            .lock()
            .await
            .ghosts
            .register(session.handle.clone());
        tracing::info!("[ghost {}] registered", ghost_id);

        let _ = session.task.await;

        if self
            .state
            .lock()
            .await
            .ghosts
            .remove_connection(ghost_id, connection)
            .is_some()
        {
            tracing::info!("[ghost {}] left the pool", ghost_id);
        }
    }

    async fn handle_disconnect(
        &self,
        node_id: &str,
        connection: u64,
    ) -> Result<Option<RecoveryReport>> {
        let required = {
            let mut state = self.state.lock().await;
            if state.registry.remove_connection(node_id, connection).is_none() {
                // Replaced by a newer connection under the same id.
                return Ok(None);
            }
            let required = state.namespace.objects_held_by(node_id);
            state.namespace.remove_holder(node_id);
            required
        };
        tracing::info!("[{}] removed, held {} objects", node_id, required.len());

        if required.is_empty() {
            return Ok(None);
        }

        match self.recover(node_id, required).await {
            Ok(report) => Ok(Some(report)),
            Err(DosError::NoGhostAvailable) => {
                tracing::error!(
                    "[{}] no ghost available, objects stay under-replicated",
                    node_id
                );
                Err(DosError::NoGhostAvailable)
            }
            Err(error) => Err(error),
        }
    }

    async fn recover(&self, failed_node: &str, required: Vec<String>) -> Result<RecoveryReport> {
        let (ghost, read) = {
            let mut state = self.state.lock().await;
            let ghost = state.ghosts.take().ok_or(DosError::NoGhostAvailable)?;
            let read = self
                .broadcast
                .distributed_read(state.registry.handles(), &required);
            (ghost, read)
        };
        tracing::info!(
            "[{}] recovering {} objects onto ghost {}",
            failed_node,
            required.len(),
            ghost.id
        );

        let (read, replies) = read.finish().await;
        let create_entries = recovery::aggregate_first_seen(replies);
        let recovered: Vec<String> = create_entries
            .iter()
            .map(|entry| entry.name.clone())
            .collect();

        let sequence = self.broadcast.current();
        ghost.handle.recover(GhostFrame {
            status: GhostStatus::Done,
            sequence,
            create_entries,
        })?;

        {
            let mut state = self.state.lock().await;
            for name in &required {
                state.namespace.add_holder(name, &ghost.id);
            }
        }

        let missing: BTreeSet<&String> = required
            .iter()
            .filter(|name| !recovered.contains(name))
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                "[{}] no live copy found for {:?} during read @lamport{}",
                failed_node,
                missing,
                read.sequence
            );
        }

        Ok(RecoveryReport {
            failed_node: failed_node.to_string(),
            ghost: ghost.id,
            sequence,
            required,
            recovered,
        })
    }

    fn save_namespace(&self, namespace: &NamespaceDirectory) {
        if let Some(path) = &self.options.namespace_file {
            if let Err(error) = namespace.save(path) {
                tracing::warn!(
                    "failed to write namespace file {}: {}",
                    path.display(),
                    error
                );
            }
        }
    }
}

/// Record `node_id` as holder of reported names whose entry has no holder,
/// as after a snapshot load. Entries that already have holders keep them.
fn claim_reported(namespace: &mut NamespaceDirectory, node_id: &str, object_names: &[String]) {
    for name in object_names {
        if namespace.claim_unheld(name, node_id) {
            tracing::info!("[{}] claimed unheld object {}", node_id, name);
        }
    }
}

/// Nodes taken out of the registry for one create round. Whatever happens
/// to the round, including cancellation, they go back on drop.
struct DrawnNodes<'a> {
    registry: &'a mut ReplicaRegistry,
    drawn: Vec<NodeRecord>,
}

impl<'a> DrawnNodes<'a> {
    fn new(registry: &'a mut ReplicaRegistry) -> Self {
        Self {
            registry,
            drawn: Vec::new(),
        }
    }

    fn draw(&mut self) -> Option<ReplicaHandle> {
        let candidate = self.registry.next()?;
        let handle = candidate.handle.clone();
        self.drawn.push(candidate);
        Some(handle)
    }
}

impl Drop for DrawnNodes<'_> {
    fn drop(&mut self) {
        for candidate in self.drawn.drain(..) {
            self.registry.reinsert(candidate);
        }
    }
}
