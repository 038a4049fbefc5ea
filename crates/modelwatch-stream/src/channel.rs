use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::frame;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one streaming connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Why a frame could not be pushed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushError {
    /// The buffer is at capacity
    Full,
    /// The receiving side is gone
    Closed,
}

/// Producer half of a client's bounded outbound buffer.
///
/// The registry holds the only long-lived copy; once it is dropped the
/// receiver drains what is buffered and then sees the end of the stream.
#[derive(Clone, Debug)]
pub struct ClientChannel {
    id: ChannelId,
    tx: mpsc::Sender<Bytes>,
}

/// Consumer half, owned by the streaming connection
#[derive(Debug)]
pub struct ChannelReceiver {
    id: ChannelId,
    rx: mpsc::Receiver<Bytes>,
}

/// Create a bounded FIFO channel for one connection
pub fn channel(capacity: usize) -> (ClientChannel, ChannelReceiver) {
    let id = ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ClientChannel { id, tx }, ChannelReceiver { id, rx })
}

impl ClientChannel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Push without waiting; never blocks the producer
    pub fn try_push(&self, frame: Bytes) -> Result<(), PushError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ChannelReceiver {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Next buffered frame; `None` once every producer is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Next buffered frame, or a heartbeat frame if nothing arrives within
    /// `heartbeat`; `None` once every producer is gone
    pub async fn next_frame(&mut self, heartbeat: Duration) -> Option<Bytes> {
        match tokio::time::timeout(heartbeat, self.rx.recv()).await {
            Ok(frame) => frame,
            Err(_) => Some(frame::heartbeat()),
        }
    }

    /// Non-blocking read, used by tests and draining
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}
