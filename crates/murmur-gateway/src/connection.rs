use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use murmur_types::events::{ChatMessage, InboundFrame};

use crate::error::HubError;
use crate::hub::{ConnectionHub, ConnectionId, Registration};

/// How long the writer gets to flush a close frame before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Serve an upgraded WebSocket until either side goes away.
///
/// `authenticated_as` is set when the upgrade passed the access gate; it
/// replaces whatever `from` the client puts in its frames.
pub async fn handle_socket(socket: WebSocket, hub: ConnectionHub, authenticated_as: Option<String>) {
    let (sender, receiver) = socket.split();
    serve_connection(hub, receiver, sender, authenticated_as).await;
}

pub fn decode_frame(payload: &[u8]) -> Result<InboundFrame, HubError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Connection loop over any message stream/sink pair.
///
/// Registers with the hub, spawns the writer, and reads until close, error,
/// a bad frame, or the hub cancelling us. The connection is always
/// deregistered on the way out.
pub async fn serve_connection<R, E, W>(
    hub: ConnectionHub,
    mut receiver: R,
    sender: W,
    authenticated_as: Option<String>,
) where
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display,
{
    let Registration {
        id,
        outbound,
        cancel,
    } = hub.register().await;
    let mut guard = DeregisterOnDrop {
        hub: Some(hub.clone()),
        id,
    };

    let mut writer = tokio::spawn(write_loop(id, sender, outbound, cancel.clone()));

    read_loop(&hub, id, &mut receiver, &cancel, authenticated_as.as_deref()).await;

    cancel.cancel();
    hub.deregister(id).await;
    guard.disarm();

    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        warn!("Connection {} writer did not finish, aborting", id);
        writer.abort();
    }
    info!("Connection {} closed", id);
}

async fn read_loop<R, E>(
    hub: &ConnectionHub,
    id: ConnectionId,
    receiver: &mut R,
    cancel: &CancellationToken,
    authenticated_as: Option<&str>,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Connection {} cancelled", id);
                return;
            }
            next = receiver.next() => next,
        };

        let decoded = match next {
            Some(Ok(Message::Text(text))) => decode_frame(text.as_str().as_bytes()),
            Some(Ok(Message::Binary(data))) => decode_frame(&data),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                debug!("Connection {} closed by peer", id);
                return;
            }
            Some(Err(e)) => {
                warn!("Connection {} read error: {}", id, e);
                return;
            }
        };

        let mut frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Connection {} sent a bad frame: {}", id, e);
                return;
            }
        };
        if let Some(username) = authenticated_as {
            frame.from = username.to_owned();
        }

        if let Err(e) = hub.ingest(frame).await {
            error!("Connection {} message not relayed: {}", id, e);
            return;
        }
    }
}

async fn write_loop<W>(
    id: ConnectionId,
    mut sender: W,
    mut outbound: mpsc::Receiver<ChatMessage>,
    cancel: CancellationToken,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode message for connection {}: {}", id, e);
                continue;
            }
        };

        if let Err(e) = sender.send(Message::Text(text.into())).await {
            warn!("Write to connection {} failed: {}", id, e);
            cancel.cancel();
            break;
        }
    }

    // Best effort; the peer may already be gone.
    let _ = sender.send(Message::Close(None)).await;
    let _ = sender.close().await;
}

/// Deregisters the connection if the serving future is dropped early.
struct DeregisterOnDrop {
    hub: Option<ConnectionHub>,
    id: ConnectionId,
}

impl DeregisterOnDrop {
    fn disarm(&mut self) {
        self.hub = None;
    }
}

impl Drop for DeregisterOnDrop {
    fn drop(&mut self) {
        let Some(hub) = self.hub.take() else {
            return;
        };
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { hub.deregister(id).await });
        }
    }
}
