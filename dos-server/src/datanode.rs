use crate::config::{DataNodeConfig, QueueBackend};
use crate::lease_server;
use dos_core::datanode::{CommandQueue, GhostAgent, LocalStore};
use dos_core::{
    DosError, GhostFrame, LeaseHub, MemoryQueue, NodeFrame, RedisQueue, ReplicaAgent, Result,
    ServerFrame, SqliteStore,
};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

const FRAME_BUFFER: usize = 256;

pub async fn run_datanode(config: DataNodeConfig) -> Result<()> {
    config.validate()?;
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open(&config.store)?);
    let hub = Arc::new(LeaseHub::default());
    let _lease = lease_server::spawn(&config.lease_addr, hub.clone()).await?;

    serve_control(&config, store, hub, config.initial_sequence).await
}

/// Wait on the ghost channel for a recovery payload, install it, then carry
/// on as a regular data node.
pub async fn run_ghost(config: DataNodeConfig) -> Result<()> {
    config.validate()?;
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open(&config.store)?);
    let hub = Arc::new(LeaseHub::default());
    let _lease = lease_server::spawn(&config.lease_addr, hub.clone()).await?;

    let url = format!(
        "ws://{}/internal/v1/ghosts/{}/stream",
        config.name_node, config.node_id
    );
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|error| DosError::Transport(format!("connect {}: {}", url, error)))?;
    tracing::info!("[ghost {}] connected to {}", config.node_id, config.name_node);

    let (mut sink, stream) = socket.split();
    let (recovery_tx, recovery_rx) = mpsc::channel::<GhostFrame>(1);
    let reader = read_frames(stream, recovery_tx);

    let ghost = GhostAgent::new(config.node_id.clone(), store.clone(), hub.clone());
    let install = ghost.await_recovery(recovery_rx).await;
    reader.abort();
    let _ = sink.close().await;
    let install = install?;

    tracing::info!(
        "[ghost {}] rejoining as data node @lamport{}",
        config.node_id,
        install.sequence
    );
    serve_control(&config, store, hub, install.sequence).await
}

async fn serve_control(
    config: &DataNodeConfig,
    store: Arc<dyn LocalStore>,
    hub: Arc<LeaseHub>,
    initial_sequence: u64,
) -> Result<()> {
    let queue: Arc<dyn CommandQueue> = match config.queue {
        QueueBackend::Memory => Arc::new(MemoryQueue::new()),
        QueueBackend::Redis => Arc::new(RedisQueue::new(&config.redis_url, &config.node_id).await?),
    };

    let url = format!("ws://{}/internal/v1/replicas/stream", config.name_node);
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|error| DosError::Transport(format!("connect {}: {}", url, error)))?;
    tracing::info!(
        "[{}] connected to {}, lease endpoint {}",
        config.node_id,
        config.name_node,
        config.lease_endpoint()
    );

    let (mut sink, stream) = socket.split();
    let (frames_tx, frames_rx) = mpsc::channel::<ServerFrame>(FRAME_BUFFER);
    let (replies_tx, mut replies_rx) = mpsc::channel::<NodeFrame>(FRAME_BUFFER);

    let reader = read_frames(stream, frames_tx);
    let writer = tokio::spawn(async move {
        while let Some(frame) = replies_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(error) => {
                    tracing::error!("failed to encode frame: {}", error);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let agent = ReplicaAgent::new(config.options(initial_sequence), store, queue, hub);
    let result = agent.run(frames_rx, replies_tx).await;

    reader.abort();
    writer.abort();
    result
}

fn read_frames<S, T>(mut stream: S, frames: mpsc::Sender<T>) -> JoinHandle<()>
where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
    T: DeserializeOwned + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<T>(&text) {
                    Ok(frame) => {
                        if frames.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => tracing::warn!("dropping malformed frame: {}", error),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!("name node stream error: {}", error);
                    break;
                }
            }
        }
    })
}
