//! The `transport` module is responsible for the bytes on the wire.
//!
//! It defines the message codec shared by brokers and clients, the abstract
//! connection type every broker destination is built on, and the WebSocket
//! server and dialer that carry those connections between processes.

pub mod address;
pub mod connection;
pub mod message;
pub mod websocket;

pub use address::Address;
pub use connection::{ConnectionId, Transport, TransportReceiver, TransportSender};
pub use message::{Message, NodeId};
