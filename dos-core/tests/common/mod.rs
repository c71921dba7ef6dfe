#![allow(dead_code)]

use dos_core::datanode::{GhostAgent, MemoryQueue, RecordingPublisher, ReplicaAgent, SqliteStore};
use dos_core::{
    DataNodeOptions, GhostFrame, NameNode, NameNodeOptions, NodeFrame, Outbound, RecoveryReport,
    Result, ServerFrame,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn namenode(replication: usize) -> Arc<NameNode> {
    Arc::new(
        NameNode::new(NameNodeOptions {
            replication,
            create_ack_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        })
        .unwrap(),
    )
}

pub fn lease_endpoint(id: &str) -> String {
    format!("ws://{}.lease", id)
}

/// A replica agent wired to a name node over in-process channels.
pub struct TestNode {
    pub id: String,
    pub store: Arc<SqliteStore>,
    pub lease: Arc<RecordingPublisher>,
    pub serve: JoinHandle<Result<Option<RecoveryReport>>>,
    upstream: JoinHandle<()>,
    agent: JoinHandle<Result<()>>,
}

impl TestNode {
    /// Cut the node's stream as the name node sees it and wait for the
    /// name node to finish handling the loss.
    pub async fn disconnect(self) -> Result<Option<RecoveryReport>> {
        self.upstream.abort();
        let outcome = self.serve.await.unwrap();
        let _ = self.agent.await;
        outcome
    }
}

pub async fn attach_node(namenode: &Arc<NameNode>, id: &str, dir: &Path) -> TestNode {
    attach_node_at(namenode, id, dir, 0).await
}

pub async fn attach_node_at(
    namenode: &Arc<NameNode>,
    id: &str,
    dir: &Path,
    initial_sequence: u64,
) -> TestNode {
    let store = Arc::new(SqliteStore::open(dir.join(format!("{}.db", id))).unwrap());
    let lease = Arc::new(RecordingPublisher::new());
    let agent = ReplicaAgent::new(
        DataNodeOptions {
            node_id: id.to_string(),
            lease_endpoint: lease_endpoint(id),
            initial_sequence,
            heartbeat_interval: Duration::from_secs(3600),
        },
        store.clone(),
        Arc::new(MemoryQueue::new()),
        lease.clone(),
    );

    let (agent_tx, mut agent_rx) = mpsc::channel::<NodeFrame>(64);
    let (inbound_tx, inbound_rx) = mpsc::channel::<NodeFrame>(64);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);
    let (command_tx, command_rx) = mpsc::channel::<ServerFrame>(64);

    let upstream = tokio::spawn(async move {
        while let Some(frame) = agent_rx.recv().await {
            if inbound_tx.send(frame).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            if let Outbound::Command(frame) = outbound {
                if command_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
    });

    let serve = tokio::spawn({
        let namenode = namenode.clone();
        async move { namenode.serve_replica(inbound_rx, outbound_tx).await }
    });
    let agent = tokio::spawn(agent.run(command_rx, agent_tx));

    let before = namenode.status().await.nodes;
    wait_for(|| {
        let namenode = namenode.clone();
        async move { namenode.status().await.nodes > before }
    })
    .await;

    TestNode {
        id: id.to_string(),
        store,
        lease,
        serve,
        upstream,
        agent,
    }
}

/// A ghost registered with the name node. Recovery frames arrive on
/// `recovery`.
pub struct TestGhost {
    pub id: String,
    pub recovery: mpsc::Receiver<GhostFrame>,
    _keepalive: mpsc::Sender<NodeFrame>,
    pub serve: JoinHandle<()>,
}

impl TestGhost {
    pub async fn install(&mut self, dir: &Path) -> (Arc<SqliteStore>, dos_core::RecoveryInstall) {
        let store = Arc::new(SqliteStore::open(dir.join(format!("{}.db", self.id))).unwrap());
        let agent = GhostAgent::new(
            self.id.clone(),
            store.clone(),
            Arc::new(RecordingPublisher::new()),
        );
        let frame = tokio::time::timeout(Duration::from_secs(5), self.recovery.recv())
            .await
            .unwrap()
            .unwrap();
        let install = agent.install(frame).unwrap();
        (store, install)
    }
}

pub async fn attach_ghost(namenode: &Arc<NameNode>, id: &str) -> TestGhost {
    let (keepalive, inbound_rx) = mpsc::channel::<NodeFrame>(1);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(8);
    let (recovery_tx, recovery) = mpsc::channel::<GhostFrame>(8);

    tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            if let Outbound::Recovery(frame) = outbound {
                if recovery_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
    });

    let serve = tokio::spawn({
        let namenode = namenode.clone();
        let id = id.to_string();
        async move { namenode.serve_ghost(&id, inbound_rx, outbound_tx).await }
    });

    let before = namenode.status().await.ghosts;
    wait_for(|| {
        let namenode = namenode.clone();
        async move { namenode.status().await.ghosts > before }
    })
    .await;

    TestGhost {
        id: id.to_string(),
        recovery,
        _keepalive: keepalive,
        serve,
    }
}

pub async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
