use super::ServerState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use dos_core::{NodeFrame, Outbound};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const FRAME_BUFFER: usize = 256;

pub(crate) async fn replica_stream(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_replica_socket(state, socket))
}

pub(crate) async fn ghost_stream(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_ghost_socket(state, id, socket))
}

async fn serve_replica_socket(state: Arc<ServerState>, socket: WebSocket) {
    let (inbound_rx, outbound_tx, reader, writer) = pump(socket);

    match state.namenode.serve_replica(inbound_rx, outbound_tx).await {
        Ok(Some(report)) => tracing::info!(
            "recovered {} of {} objects from {} onto ghost {}",
            report.recovered.len(),
            report.required.len(),
            report.failed_node,
            report.ghost
        ),
        Ok(None) => {}
        Err(error) => tracing::warn!("replica stream ended: {}", error),
    }

    reader.abort();
    let _ = writer.await;
}

async fn serve_ghost_socket(state: Arc<ServerState>, id: String, socket: WebSocket) {
    let (inbound_rx, outbound_tx, reader, writer) = pump(socket);

    state.namenode.serve_ghost(&id, inbound_rx, outbound_tx).await;

    reader.abort();
    let _ = writer.await;
}

/// Bridge a socket to session channels: text frames in, JSON out.
fn pump(
    socket: WebSocket,
) -> (
    mpsc::Receiver<NodeFrame>,
    mpsc::Sender<Outbound>,
    JoinHandle<()>,
    JoinHandle<()>,
) {
    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<NodeFrame>(FRAME_BUFFER);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(FRAME_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let text = match outbound.to_json() {
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
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<NodeFrame>(&text) {
                    Ok(frame) => {
                        if inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => tracing::warn!("dropping malformed frame: {}", error),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!("control stream error: {}", error);
                    break;
                }
            }
        }
    });

    (inbound_rx, outbound_tx, reader, writer)
}
