//! Per-connection session actor.
//!
//! One task owns a replica's outbound frame queue and its pending-ack table.
//! Everything else talks to the replica through a cloneable [`ReplicaHandle`].
//! When the connection ends the table is dropped, which closes every
//! outstanding waiter.

use crate::error::{DosError, Result};
use crate::protocol::{
    Command, GhostFrame, NodeFrame, NodeFrameBody, ObjectPayload, Outbound, RequestId, ServerFrame,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Data,
    Ghost,
}

/// What a replica sent back for one delivered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Received,
    ReadResult(Vec<ObjectPayload>),
}

/// Size report carried by a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeatReport {
    pub reported_size: u64,
    pub object_names: Vec<String>,
}

enum SessionRequest {
    Deliver {
        command: Command,
        reply: oneshot::Sender<Ack>,
    },
    Announce {
        command: Command,
    },
    Recover {
        frame: GhostFrame,
    },
}

#[derive(Clone)]
pub struct ReplicaHandle {
    id: Arc<str>,
    role: ReplicaRole,
    connection: u64,
    requests: mpsc::UnboundedSender<SessionRequest>,
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("connection", &self.connection)
            .finish()
    }
}

impl ReplicaHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    /// Serial of the connection this handle belongs to. A node that
    /// reconnects under the same id gets a new serial.
    pub fn connection(&self) -> u64 {
        self.connection
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session has ended.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Queue a command on this replica's stream and wait for its ack.
    ///
    /// Fails with [`DosError::ReplicaClosed`] when the connection ends before
    /// the ack arrives. There is no timeout here; callers that need one wrap
    /// the future.
    pub async fn deliver(&self, command: Command) -> Result<Ack> {
        let (reply, ack) = oneshot::channel();
        self.requests
            .send(SessionRequest::Deliver { command, reply })
            .map_err(|_| DosError::ReplicaClosed(self.id.to_string()))?;

        ack.await
            .map_err(|_| DosError::ReplicaClosed(self.id.to_string()))
    }

    /// Queue a command that expects no ack. It keeps its place in the
    /// stream relative to later deliveries.
    pub fn announce(&self, command: Command) -> Result<()> {
        self.requests
            .send(SessionRequest::Announce { command })
            .map_err(|_| DosError::ReplicaClosed(self.id.to_string()))
    }

    /// Push a recovery payload. Only meaningful for ghosts.
    pub fn recover(&self, frame: GhostFrame) -> Result<()> {
        self.requests
            .send(SessionRequest::Recover { frame })
            .map_err(|_| DosError::ReplicaClosed(self.id.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn detached(id: &str, connection: u64) -> Self {
        let (requests, _) = mpsc::unbounded_channel();
        let (_, closed) = watch::channel(true);
        Self {
            id: Arc::from(id),
            role: ReplicaRole::Data,
            connection,
            requests,
            closed,
        }
    }
}

/// Running session. `beats` yields heartbeats until the connection ends;
/// `task` completes at the same moment.
pub struct Session {
    pub handle: ReplicaHandle,
    pub beats: mpsc::UnboundedReceiver<BeatReport>,
    pub task: JoinHandle<()>,
}

pub fn spawn(
    id: &str,
    role: ReplicaRole,
    connection: u64,
    inbound: mpsc::Receiver<NodeFrame>,
    outbound: mpsc::Sender<Outbound>,
) -> Session {
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let (beats_tx, beats_rx) = mpsc::unbounded_channel();

    let handle = ReplicaHandle {
        id: Arc::from(id),
        role,
        connection,
        requests: requests_tx,
        closed: closed_rx,
    };

    let actor = SessionActor {
        id: id.to_string(),
        requests: requests_rx,
        inbound,
        outbound,
        beats: beats_tx,
        pending: HashMap::new(),
        next_request: 0,
    };

    let task = tokio::spawn(async move {
        actor.run().await;
        let _ = closed_tx.send(true);
    });

    Session {
        handle,
        beats: beats_rx,
        task,
    }
}

struct SessionActor {
    id: String,
    requests: mpsc::UnboundedReceiver<SessionRequest>,
    inbound: mpsc::Receiver<NodeFrame>,
    outbound: mpsc::Sender<Outbound>,
    beats: mpsc::UnboundedSender<BeatReport>,
    pending: HashMap<RequestId, oneshot::Sender<Ack>>,
    next_request: u64,
}

impl SessionActor {
    async fn run(mut self) {
        let mut requests_open = true;

        loop {
            tokio::select! {
                request = self.requests.recv(), if requests_open => match request {
                    Some(request) => {
                        if !self.send_request(request).await {
                            tracing::warn!("[replica {}] outbound stream closed", self.id);
                            break;
                        }
                    }
                    None => requests_open = false,
                },
                frame = self.inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => {
                        tracing::info!("[replica {}] closed connection", self.id);
                        break;
                    }
                },
            }
        }

        for (tag, _) in self.pending.drain() {
            tracing::info!("[replica {}] closing ack channel for {}", self.id, tag);
        }
    }

    async fn send_request(&mut self, request: SessionRequest) -> bool {
        match request {
            SessionRequest::Deliver { command, reply } => {
                // Waiters that gave up (timeouts) no longer need their slot.
                self.pending.retain(|_, waiter| !waiter.is_closed());

                self.next_request += 1;
                let message_tag = RequestId(self.next_request);
                tracing::info!(
                    "sending {} tagged {}",
                    command.label(&self.id),
                    message_tag
                );
                self.pending.insert(message_tag, reply);

                let frame = ServerFrame {
                    message_tag,
                    command,
                };
                self.outbound.send(Outbound::Command(frame)).await.is_ok()
            }
            SessionRequest::Announce { command } => {
                self.next_request += 1;
                let message_tag = RequestId(self.next_request);
                tracing::info!("sending {}", command.label(&self.id));
                let frame = ServerFrame {
                    message_tag,
                    command,
                };
                self.outbound.send(Outbound::Command(frame)).await.is_ok()
            }
            SessionRequest::Recover { frame } => {
                tracing::info!(
                    "[ghost {}] pushing {} recovered objects @lamport{}",
                    self.id,
                    frame.create_entries.len(),
                    frame.sequence
                );
                self.outbound.send(Outbound::Recovery(frame)).await.is_ok()
            }
        }
    }

    fn handle_frame(&mut self, frame: NodeFrame) {
        match frame.body {
            NodeFrameBody::Beat => {
                let _ = self.beats.send(BeatReport {
                    reported_size: frame.reported_size,
                    object_names: frame.object_names,
                });
            }
            NodeFrameBody::Ack { message_tag } => {
                self.resolve(message_tag, Ack::Received, "ack");
            }
            NodeFrameBody::DistributedReadResult {
                message_tag,
                payload,
            } => {
                self.resolve(message_tag, Ack::ReadResult(payload), "distributed read");
            }
        }
    }

    fn resolve(&mut self, message_tag: RequestId, ack: Ack, what: &str) {
        match self.pending.remove(&message_tag) {
            Some(waiter) => {
                tracing::debug!("[replica {}] {} tagged {}", self.id, what, message_tag);
                let _ = waiter.send(ack);
            }
            None => {
                tracing::warn!(
                    "[replica {}] {} error, message tag {} has no waiter",
                    self.id,
                    what,
                    message_tag
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(sequence: u64) -> Command {
        Command::Commit {
            sequence,
            object_name: "o".to_string(),
        }
    }

    #[tokio::test]
    async fn acks_resolve_by_request_id() {
        let (node_tx, node_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let session = spawn("n1", ReplicaRole::Data, 1, node_rx, out_tx);

        let handle = session.handle.clone();
        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.deliver(commit(1)).await }
        });
        let second = tokio::spawn({
            let handle = handle.clone();
            async move { handle.deliver(commit(2)).await }
        });

        let mut tags = Vec::new();
        for _ in 0..2 {
            match out_rx.recv().await.unwrap() {
                Outbound::Command(frame) => tags.push(frame.message_tag),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_ne!(tags[0], tags[1]);

        // Ack in reverse order; each waiter still gets its own.
        node_tx.send(NodeFrame::ack("n1", tags[1])).await.unwrap();
        node_tx.send(NodeFrame::ack("n1", tags[0])).await.unwrap();

        assert_eq!(first.await.unwrap().unwrap(), Ack::Received);
        assert_eq!(second.await.unwrap().unwrap(), Ack::Received);
    }

    #[tokio::test]
    async fn disconnect_fails_outstanding_waiters() {
        let (node_tx, node_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let session = spawn("n1", ReplicaRole::Data, 1, node_rx, out_tx);

        let handle = session.handle.clone();
        let waiter = tokio::spawn(async move { handle.deliver(commit(1)).await });

        assert!(out_rx.recv().await.is_some());
        drop(node_tx);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DosError::ReplicaClosed(_))));

        session.task.await.unwrap();
        assert!(session.handle.is_closed());
        assert!(session.handle.deliver(commit(2)).await.is_err());
    }

    #[tokio::test]
    async fn beats_are_forwarded() {
        let (node_tx, node_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let mut session = spawn("n1", ReplicaRole::Data, 1, node_rx, out_tx);

        node_tx
            .send(NodeFrame::beat("n1", "ws://lease", 42, vec!["a".to_string()]))
            .await
            .unwrap();

        let beat = session.beats.recv().await.unwrap();
        assert_eq!(beat.reported_size, 42);
        assert_eq!(beat.object_names, vec!["a".to_string()]);

        drop(node_tx);
        assert!(session.beats.recv().await.is_none());
    }

    #[tokio::test]
    async fn announce_precedes_later_deliveries() {
        let (_node_tx, node_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let session = spawn("n1", ReplicaRole::Data, 1, node_rx, out_tx);

        session
            .handle
            .announce(Command::Registered { sequence: 4 })
            .unwrap();
        let handle = session.handle.clone();
        tokio::spawn(async move { handle.deliver(commit(5)).await });

        let kinds: Vec<&'static str> = [out_rx.recv().await, out_rx.recv().await]
            .into_iter()
            .map(|outbound| match outbound {
                Some(Outbound::Command(frame)) => frame.command.kind(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();
        assert_eq!(kinds, vec!["registered", "commit"]);
    }
}
