//! Data-node side of the control stream.

pub mod apply;
pub mod ghost;
pub mod lease;
pub mod queue;
pub mod store;

pub use apply::{Disposition, SequencedApplier};
pub use ghost::{GhostAgent, RecoveryInstall};
pub use lease::{LeaseEvent, LeaseHub, LeaseNotification, LeasePublisher, RecordingPublisher};
pub use queue::{BlockedCommand, CommandQueue, MemoryQueue, RedisQueue};
pub use store::{LocalStore, SqliteStore, StoredObject};

use crate::error::{DosError, Result};
use crate::protocol::{Command, NodeFrame, ServerFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct DataNodeOptions {
    pub node_id: String,
    pub lease_endpoint: String,
    pub initial_sequence: u64,
    pub heartbeat_interval: Duration,
}

/// Runs one data node's control stream: heartbeats out, commands in.
pub struct ReplicaAgent {
    options: DataNodeOptions,
    store: Arc<dyn LocalStore>,
    applier: SequencedApplier,
}

impl ReplicaAgent {
    pub fn new(
        options: DataNodeOptions,
        store: Arc<dyn LocalStore>,
        queue: Arc<dyn CommandQueue>,
        lease: Arc<dyn LeasePublisher>,
    ) -> Self {
        let applier = SequencedApplier::new(options.initial_sequence, store.clone(), queue, lease);
        Self {
            options,
            store,
            applier,
        }
    }

    pub fn applied_sequence(&self) -> u64 {
        self.applier.applied_sequence()
    }

    /// Returns only on failure. A closed stream is an error: the node has
    /// no way back into the cluster without a restart.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<ServerFrame>,
        outbound: mpsc::Sender<NodeFrame>,
    ) -> Result<()> {
        // The name node registers us from this first beat.
        outbound
            .send(self.beat()?)
            .await
            .map_err(|_| DosError::Transport("control stream closed".to_string()))?;

        let _heartbeat = AbortOnDrop(tokio::spawn(heartbeat_loop(
            self.options.clone(),
            self.store.clone(),
            outbound.clone(),
        )));

        loop {
            let Some(frame) = inbound.recv().await else {
                return Err(DosError::Transport(
                    "control stream closed by name node".to_string(),
                ));
            };
            self.handle_frame(frame, &outbound).await?;
        }
    }

    async fn handle_frame(
        &mut self,
        frame: ServerFrame,
        outbound: &mpsc::Sender<NodeFrame>,
    ) -> Result<()> {
        let ServerFrame {
            message_tag,
            command,
        } = frame;
        tracing::debug!(
            "received {} tagged {}",
            command.label(&self.options.node_id),
            message_tag
        );

        let reply = match &command {
            Command::Registered { .. } => None,
            Command::DistributedRead { object_names, .. } => {
                let payload = self.store.read_many(object_names)?;
                tracing::info!(
                    "answering distributed read with {} of {} objects",
                    payload.len(),
                    object_names.len()
                );
                Some(NodeFrame::read_result(
                    &self.options.node_id,
                    message_tag,
                    payload,
                ))
            }
            _ => Some(NodeFrame::ack(&self.options.node_id, message_tag)),
        };

        self.applier.handle(&command).await?;

        let Some(reply) = reply else {
            return Ok(());
        };
        outbound
            .send(reply)
            .await
            .map_err(|_| DosError::Transport("control stream closed".to_string()))
    }

    fn beat(&self) -> Result<NodeFrame> {
        beat_frame(&self.options, self.store.as_ref())
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn beat_frame(options: &DataNodeOptions, store: &dyn LocalStore) -> Result<NodeFrame> {
    Ok(NodeFrame::beat(
        options.node_id.clone(),
        options.lease_endpoint.clone(),
        store.size()?,
        store.list_objects()?,
    ))
}

async fn heartbeat_loop(
    options: DataNodeOptions,
    store: Arc<dyn LocalStore>,
    outbound: mpsc::Sender<NodeFrame>,
) {
    let mut ticker = tokio::time::interval(options.heartbeat_interval);
    // The first tick fires immediately and the initial beat is already sent.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let frame = match beat_frame(&options, store.as_ref()) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!("failed to read store for heartbeat: {}", error);
                continue;
            }
        };
        if outbound.send(frame).await.is_err() {
            break;
        }
    }
}
