//! Per-client delivery pipeline.
//!
//! Each connection owns one bounded outbound queue. The command processor
//! holds a [`SessionHandle`] and only ever pushes into it without waiting;
//! the connection's outbound loop drains the matching [`OutboundQueue`].
//!
//! ```text
//!  CommandProcessor ──try_deliver──► [ bounded queue ] ──next()──► WebSocket
//!         │                                ▲
//!         └──────────── close() ───────────┘  (session dead)
//! ```
//!
//! A full queue is never waited on: the caller treats the session as dead,
//! closes it, and moves on.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

/// One serialized outbound event, shared by every session it is sent to.
pub type Frame = Arc<str>;

/// Unique id of one connection, distinct from the identity its peer claims.
pub type SessionId = Uuid;

/// Why a non-blocking delivery did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    Full,
    #[error("session is closed")]
    Closed,
}

/// Producer side of a session's outbound queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    /// Create a session pipeline with room for `capacity` frames.
    pub fn channel(capacity: usize) -> (SessionHandle, OutboundQueue) {
        Self::channel_with_shutdown(capacity, CancellationToken::new())
    }

    /// Like [`SessionHandle::channel`], but closed when `shutdown` is.
    ///
    /// The server passes a child of its own token so that a server shutdown
    /// tears down every session.
    pub fn channel_with_shutdown(capacity: usize, shutdown: CancellationToken) -> (SessionHandle, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = SessionHandle {
            id: Uuid::new_v4(),
            tx,
            shutdown: shutdown.clone(),
        };
        (handle, OutboundQueue { rx, shutdown })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn try_deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        if self.shutdown.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Mark the session dead. Both connection loops observe this and exit.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the session has been closed from either side.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }
}

/// Consumer side of a session's outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
}

impl OutboundQueue {
    /// Wait for the next frame.
    ///
    /// After the session is closed, frames already queued are still handed
    /// out (a rejection notice must reach its peer); `None` follows once the
    /// queue is empty.
    pub async fn next(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.shutdown.cancelled() => self.rx.try_recv().ok(),
        }
    }

    /// Take a queued frame if one is ready.
    pub fn try_next(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Frames currently waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
