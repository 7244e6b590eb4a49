//! Connection registry: the process-wide index from user id to that user's
//! live WebSocket streams, and the fan-out path that delivers notifications
//! to them.
//!
//! All index access goes through [`Registry::register`],
//! [`Registry::unregister`] and [`Registry::fan_out`]; the underlying map is
//! never exposed for outside iteration. Delivery is best-effort: a stream
//! whose outbound queue is full when a notification arrives is evicted
//! immediately, never retried, so a stalled consumer cannot delay the
//! mutation handler that produced the event or its sibling streams.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::ws::event::Event;

/// Outbound queue capacity per stream. A full queue marks a slow consumer.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Registry-side view of one live stream: the queue sender plus the token
/// that terminates the stream's loops.
struct StreamEntry {
    id: u64,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

/// The half of a registered stream handed to the connection actor.
pub struct Stream {
    /// Process-unique stream id; the unregistration key.
    pub id: u64,
    pub user_id: i64,
    /// Receiving end of the outbound queue, drained by the outbound loop.
    pub outbound: mpsc::Receiver<Message>,
    /// Loop-local sender for pongs. Shares FIFO order with fan-out traffic.
    pub sender: mpsc::Sender<Message>,
    /// Cancelled on unregistration; observed by both loops.
    pub cancel: CancellationToken,
}

/// Shared index of live streams per user.
pub struct Registry {
    index: DashMap<i64, Vec<StreamEntry>>,
    next_stream_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            index: DashMap::new(),
            next_stream_id: AtomicU64::new(1),
        }
    }

    /// Create and insert a new stream for `user_id`, creating the user's set
    /// if absent. The stream is visible to fan-out as soon as this returns,
    /// and never before its entry is fully constructed.
    pub fn register(&self, user_id: i64) -> Stream {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);

        self.index.entry(user_id).or_default().push(StreamEntry {
            id,
            tx: tx.clone(),
            cancel: cancel.clone(),
        });

        tracing::debug!(user_id, stream_id = id, "stream registered");

        Stream {
            id,
            user_id,
            outbound: rx,
            sender: tx,
            cancel,
        }
    }

    /// Remove a stream from its owner's set. Idempotent: removing an
    /// already-removed stream is a no-op. Cancels the stream's token so both
    /// of its loops terminate; safe to call concurrently from either loop
    /// and from slow-consumer eviction.
    pub fn unregister(&self, user_id: i64, stream_id: u64) {
        let mut removed = false;
        if let Some(mut streams) = self.index.get_mut(&user_id) {
            streams.retain(|entry| {
                if entry.id == stream_id {
                    entry.cancel.cancel();
                    removed = true;
                    false
                } else {
                    true
                }
            });
        }
        // Prune the user's entry once its last stream is gone.
        self.index.remove_if(&user_id, |_, streams| streams.is_empty());

        if removed {
            tracing::debug!(user_id, stream_id, "stream unregistered");
        }
    }

    /// Deliver `event` to every stream currently registered for `user_id`.
    ///
    /// The envelope is serialized once, then offered to each stream's queue
    /// without blocking. A full queue evicts that stream on the spot; a
    /// closed queue means the stream is already shutting down and is removed
    /// as well. No registered streams is a silent no-op. Delivery errors
    /// never surface to the caller.
    pub fn fan_out(&self, user_id: i64, event: &Event) {
        let Some(mut streams) = self.index.get_mut(&user_id) else {
            return;
        };

        let wire = Message::Text(event.to_wire().into());

        streams.retain(|entry| match entry.tx.try_send(wire.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    user_id,
                    stream_id = entry.id,
                    "outbound queue full, evicting slow consumer"
                );
                entry.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                entry.cancel.cancel();
                false
            }
        });

        let emptied = streams.is_empty();
        drop(streams);
        if emptied {
            self.index.remove_if(&user_id, |_, streams| streams.is_empty());
        }
    }

    /// Number of live streams currently registered for a user.
    pub fn connections_for(&self, user_id: i64) -> usize {
        self.index.get(&user_id).map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
