use crate::datanode::lease::{LeaseNotification, LeasePublisher};
use crate::datanode::queue::{BlockedCommand, CommandQueue};
use crate::datanode::store::LocalStore;
use crate::error::Result;
use crate::protocol::{Command, ObjectPayload};
use std::sync::Arc;

/// What happened to one received command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Create parked in the pending queue.
    Staged,
    /// Applied in order, plus `drained` parked successors.
    Applied { drained: usize },
    /// Ahead of the applied counter; parked.
    Blocked,
    /// At or below the applied counter; dropped.
    Duplicate,
    /// Applied counter moved to the name node's value, plus `drained`
    /// parked successors.
    Resynced { drained: usize },
}

/// Applies the node's share of the global sequence, in order, exactly once.
///
/// Single consumer: only the node's command loop calls into it.
pub struct SequencedApplier {
    applied: u64,
    store: Arc<dyn LocalStore>,
    queue: Arc<dyn CommandQueue>,
    lease: Arc<dyn LeasePublisher>,
}

impl SequencedApplier {
    pub fn new(
        initial_sequence: u64,
        store: Arc<dyn LocalStore>,
        queue: Arc<dyn CommandQueue>,
        lease: Arc<dyn LeasePublisher>,
    ) -> Self {
        Self {
            applied: initial_sequence,
            store,
            queue,
            lease,
        }
    }

    pub fn applied_sequence(&self) -> u64 {
        self.applied
    }

    pub async fn handle(&mut self, command: &Command) -> Result<Disposition> {
        if let Command::Registered { sequence } = command {
            let drained = self.resync(*sequence).await?;
            return Ok(Disposition::Resynced { drained });
        }

        if let Command::Create { object_name, data } = command {
            self.queue
                .push_create(ObjectPayload::new(object_name.clone(), data.clone()))
                .await?;
            return Ok(Disposition::Staged);
        }

        let (Some(sequence), Some(blocked)) =
            (command.sequence(), BlockedCommand::from_command(command))
        else {
            return Ok(Disposition::Duplicate);
        };

        if sequence <= self.applied {
            tracing::warn!(
                "dropping {} @lamport{}, already applied up to {}",
                command.kind(),
                sequence,
                self.applied
            );
            return Ok(Disposition::Duplicate);
        }

        if sequence != self.applied + 1 {
            tracing::info!(
                "blocking {} @lamport{}, waiting for {}",
                command.kind(),
                sequence,
                self.applied + 1
            );
            self.queue.block(sequence, blocked).await?;
            return Ok(Disposition::Blocked);
        }

        self.apply(blocked).await?;
        self.applied = sequence;
        let drained = self.drain().await?;
        Ok(Disposition::Applied { drained })
    }

    /// Adopt `sequence` as applied. Broadcasts up to it were issued before
    /// this node registered and will never reach it.
    pub async fn resync(&mut self, sequence: u64) -> Result<usize> {
        if sequence != self.applied {
            tracing::info!(
                "applied sequence moves from {} to {} on registration",
                self.applied,
                sequence
            );
        }
        self.applied = sequence;
        self.drain().await
    }

    async fn drain(&mut self) -> Result<usize> {
        let mut drained = 0;
        while let Some(head) = self.queue.peek_blocked().await? {
            if head > self.applied + 1 {
                break;
            }
            let Some((sequence, blocked)) = self.queue.pop_blocked().await? else {
                break;
            };
            if sequence <= self.applied {
                continue;
            }
            tracing::info!("replaying blocked command @lamport{}", sequence);
            self.apply(blocked).await?;
            self.applied = sequence;
            drained += 1;
        }
        Ok(drained)
    }

    async fn apply(&self, command: BlockedCommand) -> Result<()> {
        match command {
            BlockedCommand::Commit { name } => {
                while let Some(entry) = self.queue.pull_create(&name).await? {
                    let revision = self.store.write(&entry.name, &entry.data)?;
                    tracing::info!("committed {} at revision {}", entry.name, revision);
                    self.lease
                        .publish(LeaseNotification::created(&entry.name, revision, &entry.data));
                }
            }
            BlockedCommand::Delete { name } => match self.store.delete(&name) {
                Ok(revision) => {
                    tracing::info!("deleted {}", name);
                    self.lease
                        .publish(LeaseNotification::deleted(&name, revision + 1));
                }
                Err(error) if error.is_not_in_store() => {
                    tracing::debug!("delete of {} skipped, not held here", name);
                }
                Err(error) => return Err(error),
            },
            BlockedCommand::Update { name, data } => match self.store.update(&name, &data) {
                Ok(revision) => {
                    tracing::info!("updated {} to revision {}", name, revision);
                    self.lease
                        .publish(LeaseNotification::updated(&name, revision, &data));
                }
                Err(error) if error.is_not_in_store() => {
                    tracing::debug!("update of {} skipped, not held here", name);
                }
                Err(error) => return Err(error),
            },
            BlockedCommand::Read => {}
        }
        Ok(())
    }
}
