//! # Autobahn
//!
//! `autobahn` is a federated publish/subscribe broker for a multi-process robot
//! stack. Every node runs one broker; local processes talk to it through a thin
//! [`Client`], and brokers peer with each other over WebSockets so a publish on
//! one node reaches subscribers on any other.
//!
//! ## Core Modules
//!
//! - `broker`: subscription registry, peer gossip and publish fan-out.
//! - `client`: the handle in-process publishers and subscribers use.
//! - `config`: loads settings from files and `AUTOBAHN_*` environment variables.
//! - `transport`: the wire codec, addresses and the WebSocket transport.
//! - `utils`: error types and logging setup.
//!
//! A publish is forwarded to a peer only after that peer has announced
//! interest in the topic, so traffic crosses the mesh only where someone is
//! listening.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::Broker;
pub use client::Client;
pub use transport::{Address, Message, NodeId};
pub use utils::error::{Error, Result};

#[cfg(test)]
mod tests;
