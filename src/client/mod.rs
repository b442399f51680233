//! The `client` module is the thin handle in-process code uses to publish and
//! subscribe through its local broker.
//!
//! A [`Client`] holds one connection to the broker. It does no routing: the
//! broker fans out everything the client publishes, and the client only
//! dispatches inbound publishes to the callbacks registered for that exact
//! topic.

pub mod pubsub_client;
pub use pubsub_client::Client;

#[cfg(test)]
mod tests;
