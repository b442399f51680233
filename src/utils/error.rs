//! The `error` module defines the error types used within `autobahn`.
//!
//! Failures are split by where they are contained:
//!
//! - [`DecodeError`]: a malformed or unknown frame. The frame is dropped and the
//!   connection stays open.
//! - [`EncodeError`]: a message that cannot be put on the wire (bad topic).
//! - [`TransportError`]: connect/read/write failures and delivery timeouts. The
//!   affected connection is closed or the peer is marked for lazy reconnect.
//! - [`Error`]: what the public broker, client and config APIs return.

use std::time::Duration;

use thiserror::Error;

/// A frame could not be turned into a [`Message`](crate::transport::message::Message).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),

    #[error("topic is not valid UTF-8: {0}")]
    InvalidTopic(#[from] std::str::Utf8Error),

    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("malformed control message body: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

/// A message could not be encoded.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("topic is {0} bytes long, the wire format allows at most 255")]
    TopicTooLong(usize),

    #[error("failed to serialize control message body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Failures of a single connection or a single delivery.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    /// A delivery or handshake did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Errors returned by the public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid address '{0}', expected host:port")]
    InvalidAddress(String),

    #[error("client is not connected, call begin() first")]
    NotConnected,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
