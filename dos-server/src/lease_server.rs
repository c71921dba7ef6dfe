use dos_core::{LeaseHub, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Serve lease subscriptions on `addr`. A subscriber connecting to
/// `/<object>` receives that object's notifications; `/` receives all.
pub async fn spawn(addr: &str, hub: Arc<LeaseHub>) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("lease server listening on {}", addr);

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_subscriber(stream, peer, hub.clone()));
                }
                Err(error) => tracing::warn!("lease accept failed: {}", error),
            }
        }
    }))
}

async fn serve_subscriber(stream: TcpStream, peer: SocketAddr, hub: Arc<LeaseHub>) {
    let mut path = String::new();
    let capture_path =
        |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        };

    let socket = match tokio_tungstenite::accept_hdr_async(stream, capture_path).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::warn!("lease handshake with {} failed: {}", peer, error);
            return;
        }
    };

    let object = path.trim_start_matches('/').to_string();
    tracing::info!("lease subscriber {} for '{}'", peer, object);

    let (mut sink, mut source) = socket.split();
    let mut notifications = hub.subscribe();

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(notification) => {
                    if !object.is_empty() && notification.object_name != object {
                        continue;
                    }
                    if sink.send(Message::Text(notification.message())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("lease subscriber {} lagged, skipped {}", peer, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            message = source.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::info!("lease subscriber {} left", peer);
}
