//! Per-connection stream loops.
//!
//! Each registered stream runs exactly two execution loops: an outbound loop
//! that drains the bounded queue into the socket (and keeps the link alive
//! with periodic pings), and an inbound loop that reads solely to detect
//! liveness and closure. Either loop calls unregister on the way out;
//! unregistration is idempotent, so self-eviction racing registry-side
//! eviction is harmless and local to this stream.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;
use crate::ws::registry::Stream;

/// Server ping cadence; detects abrupt disconnects on otherwise quiet links.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Run both loops for an authenticated, registered stream. Returns when the
/// stream is fully shut down.
pub async fn run_stream(socket: WebSocket, state: AppState, stream: Stream) {
    let Stream {
        id,
        user_id,
        outbound,
        sender,
        cancel,
    } = stream;

    let (ws_sender, ws_receiver) = socket.split();

    tracing::info!(user_id, stream_id = id, "websocket stream started");

    let registry = state.registry.clone();
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        outbound_loop(ws_sender, outbound, writer_cancel).await;
        // Self-eviction on write failure; no-op if already unregistered.
        registry.unregister(user_id, id);
    });

    inbound_loop(ws_receiver, &sender, &cancel, user_id, id).await;

    state.registry.unregister(user_id, id);

    // Drop our queue sender so the outbound loop sees closure even if it was
    // mid-drain, then wait for it to finish.
    drop(sender);
    let _ = writer.await;

    tracing::info!(user_id, stream_id = id, "websocket stream stopped");
}

/// Drain the outbound queue into the socket, in enqueue order. Terminates on
/// queue closure, cancellation, or write failure. Messages still buffered at
/// termination are discarded; a best-effort close frame is sent first.
async fn outbound_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    let mut ping = interval(PING_INTERVAL);
    // Skip the immediate first tick.
    ping.tick().await;

    loop {
        tokio::select! {
            // Checked first so an evicted stream stops sending backlog
            // immediately instead of racing the queue.
            biased;

            _ = cancel.cancelled() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
            queued = outbound.recv() => match queued {
                Some(msg) => {
                    if ws_sender.send(msg).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Read from the socket solely for liveness. This is a push channel: the
/// handshake was the last inbound message of protocol significance, so
/// anything except control frames is discarded.
async fn inbound_loop(
    mut ws_receiver: SplitStream<WebSocket>,
    sender: &mpsc::Sender<Message>,
    cancel: &CancellationToken,
    user_id: i64,
    stream_id: u64,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Ping(payload))) => {
                    // Pong rides the outbound queue; if the queue is full the
                    // stream is about to be evicted anyway.
                    let _ = sender.try_send(Message::Pong(payload));
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(user_id, stream_id, reason = ?frame, "client closed stream");
                    break;
                }
                Some(Ok(_)) => {
                    tracing::debug!(user_id, stream_id, "discarding unexpected inbound message");
                }
                Some(Err(e)) => {
                    tracing::debug!(user_id, stream_id, error = %e, "websocket receive error");
                    break;
                }
                None => break,
            }
        }
    }
}
