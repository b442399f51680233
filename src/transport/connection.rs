//! Transport abstraction: a bidirectional, frame-preserving byte connection.
//!
//! A [`Transport`] is a pair of bounded queues. The sending half is cheap to
//! clone and is what the broker stores as a subscription destination; the
//! receiving half is owned by the task reading that connection. WebSocket
//! connections are bridged onto this shape by [`super::websocket`], and
//! [`Transport::pair`] builds an in-memory connection for tests and embedding.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::utils::error::TransportError;

pub type ConnectionId = Uuid;

#[derive(Debug)]
pub(crate) enum Frame {
    Data(Bytes),
    Close,
}

/// Sending half of a connection.
#[derive(Debug, Clone)]
pub struct TransportSender {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
}

/// Receiving half of a connection.
#[derive(Debug)]
pub struct TransportReceiver {
    rx: mpsc::Receiver<Frame>,
    closed: bool,
}

#[derive(Debug)]
pub struct Transport {
    sender: TransportSender,
    receiver: TransportReceiver,
}

impl TransportSender {
    pub(crate) fn new(id: ConnectionId, tx: mpsc::Sender<Frame>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues one frame, waiting for queue space if the remote is slow.
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(Frame::Data(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Like [`send`](Self::send) but gives up after `limit`.
    pub async fn send_timeout(&self, frame: Bytes, limit: Duration) -> Result<(), TransportError> {
        match tokio::time::timeout(limit, self.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(limit)),
        }
    }

    /// Asks the connection to shut down. Frames queued before the request are
    /// still flushed.
    pub fn close(&self) {
        // a full queue means the writer is wedged; dropping the last sender
        // ends it as well
        let _ = self.tx.try_send(Frame::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl TransportReceiver {
    pub(crate) fn new(rx: mpsc::Receiver<Frame>) -> Self {
        Self { rx, closed: false }
    }

    /// Next inbound frame, or `None` once the connection is closed.
    pub async fn receive(&mut self) -> Option<Bytes> {
        if self.closed {
            return None;
        }
        match self.rx.recv().await {
            Some(Frame::Data(frame)) => Some(frame),
            Some(Frame::Close) | None => {
                self.closed = true;
                None
            }
        }
    }

    /// Waits up to `limit` for the next frame.
    pub async fn receive_timeout(&mut self, limit: Duration) -> Result<Bytes, TransportError> {
        match tokio::time::timeout(limit, self.receive()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(limit)),
        }
    }
}

impl Transport {
    pub(crate) fn from_parts(sender: TransportSender, receiver: TransportReceiver) -> Self {
        Self { sender, receiver }
    }

    /// Two connected in-memory transports; each queue holds `capacity` frames.
    pub fn pair(capacity: usize) -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        let a = Transport::from_parts(
            TransportSender::new(Uuid::new_v4(), a_tx),
            TransportReceiver::new(b_rx),
        );
        let b = Transport::from_parts(
            TransportSender::new(Uuid::new_v4(), b_tx),
            TransportReceiver::new(a_rx),
        );
        (a, b)
    }

    pub fn id(&self) -> ConnectionId {
        self.sender.id()
    }

    pub fn sender(&self) -> &TransportSender {
        &self.sender
    }

    pub fn split(self) -> (TransportSender, TransportReceiver) {
        (self.sender, self.receiver)
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.sender.send(frame).await
    }

    pub async fn receive(&mut self) -> Option<Bytes> {
        self.receiver.receive().await
    }

    pub fn close(&self) {
        self.sender.close();
    }
}
