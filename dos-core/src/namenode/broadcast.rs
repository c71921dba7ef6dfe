use crate::namenode::session::{Ack, ReplicaHandle};
use crate::protocol::{Command, ObjectPayload};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Outcome of one broadcast across a set of replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sequence: u64,
    pub acked: Vec<String>,
    pub failed: Vec<String>,
}

/// Owner of the lamport counter. Every broadcast takes exactly one value
/// from it, no matter how many replicas receive the command.
#[derive(Debug)]
pub struct BroadcastCoordinator {
    lamport: AtomicU64,
}

impl BroadcastCoordinator {
    pub fn new(initial: u64) -> Self {
        Self {
            lamport: AtomicU64::new(initial),
        }
    }

    pub fn current(&self) -> u64 {
        self.lamport.load(Ordering::SeqCst)
    }

    fn next_sequence(&self) -> u64 {
        self.lamport.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stage `data` on a single replica. Unsequenced; returns whether the
    /// replica acked within `timeout`.
    pub async fn deliver_create(
        &self,
        target: &ReplicaHandle,
        object_name: &str,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> bool {
        let command = Command::Create {
            object_name: object_name.to_string(),
            data: data.to_vec(),
        };
        let label = command.label(target.id());

        let delivery = target.deliver(command);
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, delivery).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!("{} timed out after {:?}", label, limit);
                    return false;
                }
            },
            None => delivery.await,
        };

        match outcome {
            Ok(_) => {
                tracing::info!("{} acked", label);
                true
            }
            Err(error) => {
                tracing::warn!("{} failed: {}", label, error);
                false
            }
        }
    }

    /// Reserve a sequence and start delivering a commit to every target.
    ///
    /// The sequence is taken before this returns, so callers holding the
    /// name-node lock get a sequence consistent with the target snapshot.
    /// Delivery runs on its own task and completes even if the returned
    /// handle is dropped.
    pub fn commit(&self, targets: Vec<ReplicaHandle>, object_name: &str) -> PendingBroadcast {
        let sequence = self.next_sequence();
        self.start(
            targets,
            Command::Commit {
                sequence,
                object_name: object_name.to_string(),
            },
        )
    }

    pub fn delete(&self, targets: Vec<ReplicaHandle>, object_name: &str) -> PendingBroadcast {
        let sequence = self.next_sequence();
        self.start(
            targets,
            Command::Delete {
                sequence,
                object_name: object_name.to_string(),
            },
        )
    }

    pub fn update(
        &self,
        targets: Vec<ReplicaHandle>,
        object_name: &str,
        data: &[u8],
    ) -> PendingBroadcast {
        let sequence = self.next_sequence();
        self.start(
            targets,
            Command::Update {
                sequence,
                object_name: object_name.to_string(),
                data: data.to_vec(),
            },
        )
    }

    /// Ask every target for the named objects it holds. Results come back
    /// in target order.
    pub fn distributed_read(
        &self,
        targets: Vec<ReplicaHandle>,
        object_names: &[String],
    ) -> PendingBroadcast {
        let sequence = self.next_sequence();
        self.start(
            targets,
            Command::DistributedRead {
                sequence,
                object_names: object_names.to_vec(),
            },
        )
    }

    fn start(&self, targets: Vec<ReplicaHandle>, command: Command) -> PendingBroadcast {
        let sequence = command.sequence().unwrap_or_default();
        let target_ids = targets.iter().map(|target| target.id().to_string()).collect();
        PendingBroadcast {
            sequence,
            targets: target_ids,
            task: tokio::spawn(fan_out(targets, sequence, command)),
        }
    }
}

/// A broadcast in flight. Dropping it does not stop delivery.
pub struct PendingBroadcast {
    sequence: u64,
    targets: Vec<String>,
    task: JoinHandle<(BroadcastReport, Vec<Vec<ObjectPayload>>)>,
}

impl PendingBroadcast {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub async fn report(self) -> BroadcastReport {
        self.finish().await.0
    }

    pub async fn finish(self) -> (BroadcastReport, Vec<Vec<ObjectPayload>>) {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!("broadcast @lamport{} task failed: {}", self.sequence, error);
                let report = BroadcastReport {
                    sequence: self.sequence,
                    acked: Vec::new(),
                    failed: self.targets,
                };
                (report, Vec::new())
            }
        }
    }
}

async fn fan_out(
    targets: Vec<ReplicaHandle>,
    sequence: u64,
    command: Command,
) -> (BroadcastReport, Vec<Vec<ObjectPayload>>) {
    let mut report = BroadcastReport {
        sequence,
        ..Default::default()
    };
    let mut results = Vec::new();

    for target in &targets {
        let label = command.label(target.id());
        match target.deliver(command.clone()).await {
            Ok(ack) => {
                tracing::info!("{} @lamport{} acked", label, sequence);
                if let Ack::ReadResult(payload) = ack {
                    results.push(payload);
                }
                report.acked.push(target.id().to_string());
            }
            Err(error) => {
                tracing::warn!("{} @lamport{} failed: {}", label, sequence, error);
                report.failed.push(target.id().to_string());
            }
        }
    }

    (report, results)
}
