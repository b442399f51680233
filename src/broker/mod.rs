//! The `broker` module is the per-node message broker: subscription registry,
//! peer federation and publish fan-out.

pub mod engine;
pub mod peer;
pub mod registry;
pub mod routes;

pub use engine::Broker;
pub use peer::Peer;
pub use registry::{Callback, Destination, DestinationKey, Registry, SubscriptionId, callback};
