use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::transport::{ConnectionId, NodeId, TransportSender};

/// Handler invoked with the payload of every matching publish.
pub type Callback = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Identifies one in-process subscription.
pub type SubscriptionId = Uuid;

/// Wraps an async closure into a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// One recipient of a topic's publishes.
#[derive(Clone)]
pub enum Destination {
    /// A connected client or broker link. `node` is set once the remote has
    /// identified itself as a broker.
    Remote {
        sender: TransportSender,
        node: Option<NodeId>,
    },
    /// An in-process subscriber sharing the broker's address space.
    Local {
        id: SubscriptionId,
        callback: Callback,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKey {
    Connection(ConnectionId),
    Local(SubscriptionId),
}

impl Destination {
    pub fn key(&self) -> DestinationKey {
        match self {
            Self::Remote { sender, .. } => DestinationKey::Connection(sender.id()),
            Self::Local { id, .. } => DestinationKey::Local(*id),
        }
    }

    /// Broker on the other end, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::Remote { node, .. } => *node,
            Self::Local { .. } => None,
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote { sender, node } => f
                .debug_struct("Remote")
                .field("connection", &sender.id())
                .field("node", node)
                .finish(),
            Self::Local { id, .. } => f.debug_struct("Local").field("id", id).finish(),
        }
    }
}

/// Maps each topic to the destinations interested in it.
///
/// Membership is a set: adding the same destination twice is a no-op, and
/// topics with no destinations left are dropped.
#[derive(Debug, Default)]
pub struct Registry {
    topics: HashMap<String, HashMap<DestinationKey, Destination>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the destination was not yet subscribed to `topic`.
    pub fn add(&mut self, topic: &str, destination: Destination) -> bool {
        let subscribers = self.topics.entry(topic.to_string()).or_default();
        let key = destination.key();
        if subscribers.contains_key(&key) {
            return false;
        }
        subscribers.insert(key, destination);
        true
    }

    /// Returns `true` if something was removed.
    pub fn remove(&mut self, topic: &str, key: &DestinationKey) -> bool {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(key).is_some();
        if subscribers.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Empty for unknown topics.
    pub fn destinations_for(&self, topic: &str) -> Vec<Destination> {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, topic: &str, key: &DestinationKey) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|subscribers| subscribers.contains_key(key))
    }

    pub fn all_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Topics wanted by at least one destination that is not broker `node`.
    pub fn topics_excluding(&self, node: NodeId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, subscribers)| subscribers.values().any(|d| d.node() != Some(node)))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Drops `key` from every topic, returning the topics it was removed from.
    pub fn remove_everywhere(&mut self, key: &DestinationKey) -> Vec<String> {
        let mut removed = Vec::new();
        self.topics.retain(|topic, subscribers| {
            if subscribers.remove(key).is_some() {
                removed.push(topic.clone());
            }
            !subscribers.is_empty()
        });
        removed
    }
}
