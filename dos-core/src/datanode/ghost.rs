use crate::datanode::lease::{LeaseNotification, LeasePublisher};
use crate::datanode::store::LocalStore;
use crate::error::{DosError, Result};
use crate::protocol::GhostFrame;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a ghost installed before rejoining as a data node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryInstall {
    /// Applied sequence to start from as a data node.
    pub sequence: u64,
    pub installed: Vec<String>,
}

/// Standby side of the ghost channel. Waits for one recovery payload and
/// materializes it locally.
pub struct GhostAgent {
    node_id: String,
    store: Arc<dyn LocalStore>,
    lease: Arc<dyn LeasePublisher>,
}

impl GhostAgent {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn LocalStore>,
        lease: Arc<dyn LeasePublisher>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            lease,
        }
    }

    pub async fn await_recovery(
        &self,
        mut inbound: mpsc::Receiver<GhostFrame>,
    ) -> Result<RecoveryInstall> {
        tracing::info!("[ghost {}] waiting for recovery", self.node_id);
        let frame = inbound.recv().await.ok_or_else(|| {
            DosError::Transport("ghost stream closed before recovery".to_string())
        })?;
        self.install(frame)
    }

    pub fn install(&self, frame: GhostFrame) -> Result<RecoveryInstall> {
        let mut installed = Vec::with_capacity(frame.create_entries.len());
        for entry in frame.create_entries {
            let revision = self.store.write(&entry.name, &entry.data)?;
            self.lease
                .publish(LeaseNotification::created(&entry.name, revision, &entry.data));
            installed.push(entry.name);
        }

        tracing::info!(
            "[ghost {}] installed {} objects @lamport{}",
            self.node_id,
            installed.len(),
            frame.sequence
        );
        Ok(RecoveryInstall {
            sequence: frame.sequence,
            installed,
        })
    }
}
