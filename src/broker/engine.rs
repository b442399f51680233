//! Broker engine
//!
//! One `Broker` per process. It owns the subscription registry, a handle per
//! configured peer and the duplicate-suppression route table, and serves every
//! connection (accepted clients, accepted broker links and links it dialed
//! itself) on its own task.
//!
//! Connection lifecycle: the acceptor sends its `TopicList` first. A connection
//! is treated as a client until it sends a `TopicList`, at which point it is a
//! link to the broker named in that message. On close, the connection is
//! removed from every topic.
//!
//! Publish fan-out delivers to all local destinations and interested peers
//! concurrently. Each delivery is bounded by `send_timeout`, and the next frame
//! from the same connection is read only after the fan-out finished, which keeps
//! per-connection ordering intact.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::{BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::broker::peer::{Handshake, Link, Peer};
use crate::broker::registry::{Destination, DestinationKey, Registry, SubscriptionId, callback};
use crate::broker::routes::RouteTable;
use crate::config::BrokerSettings;
use crate::transport::message::{Message, random_node_id, validate_topic};
use crate::transport::websocket::start_websocket_server;
use crate::transport::{NodeId, Transport, TransportReceiver, TransportSender};
use crate::utils::error::{Error, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unknown,
    Broker(NodeId),
}

struct Connection {
    sender: TransportSender,
    role: Role,
    /// Index into the peer list when this broker dialed the link.
    peer: Option<usize>,
}

impl Connection {
    fn node(&self) -> Option<NodeId> {
        match self.role {
            Role::Unknown => None,
            Role::Broker(node) => Some(node),
        }
    }

    fn destination(&self) -> Destination {
        Destination::Remote {
            sender: self.sender.clone(),
            node: self.node(),
        }
    }
}

struct Inner {
    id: NodeId,
    settings: BrokerSettings,
    registry: RwLock<Registry>,
    peers: Vec<Peer>,
    routes: Mutex<RouteTable>,
}

/// The per-node broker. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// Creates a broker with a freshly drawn node id.
    pub fn new(settings: BrokerSettings) -> Self {
        Self::with_id(random_node_id(), settings)
    }

    pub fn with_id(id: NodeId, settings: BrokerSettings) -> Self {
        let peers = settings.peers.iter().cloned().map(Peer::new).collect();
        let routes = RouteTable::new(settings.route_idle());
        info!("Broker {id} created with {} peer(s)", settings.peers.len());
        Self {
            inner: Arc::new(Inner {
                id,
                settings,
                registry: RwLock::new(Registry::new()),
                peers,
                routes: Mutex::new(routes),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    pub fn peers(&self) -> &[Peer] {
        &self.inner.peers
    }

    /// Topics with at least one destination on this broker.
    pub fn topics(&self) -> Vec<String> {
        self.inner.registry.read().all_topics()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.registry.read().destinations_for(topic).len()
    }

    /// Serves WebSocket connections from `listener` until the task is dropped.
    pub async fn run(&self, listener: TcpListener) {
        start_websocket_server(listener, self.clone()).await;
    }

    /// Serves an accepted connection until it closes.
    pub async fn handle_connection(&self, transport: Transport) {
        let (sender, receiver) = transport.split();
        let hello = Message::TopicList {
            topics: self.topics(),
            id: self.id(),
        };
        if let Err(e) = self.send_message(&sender, &hello).await {
            warn!("Failed to greet connection {}: {e}", sender.id());
            sender.close();
            return;
        }

        let conn = Connection {
            sender,
            role: Role::Unknown,
            peer: None,
        };
        self.serve(conn, receiver).await;
    }

    /// Registers an in-process subscriber and announces the interest to peers.
    pub async fn subscribe<F, Fut>(&self, topic: &str, f: F) -> Result<SubscriptionId, Error>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        validate_topic(topic)?;
        let id = Uuid::new_v4();
        self.inner.registry.write().add(
            topic,
            Destination::Local {
                id,
                callback: callback(f),
            },
        );
        debug!("Local subscriber {id} subscribed to {topic}");
        self.announce(topic, None).await;
        Ok(id)
    }

    /// Removes an in-process subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        self.inner
            .registry
            .write()
            .remove(topic, &DestinationKey::Local(id))
    }

    /// Publishes from inside this process; the broker is the origin.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), Error> {
        validate_topic(topic)?;
        self.fan_out(topic, self.id(), None, payload.into()).await;
        Ok(())
    }

    // Boxed with an explicit `Send` bound: peer links are served from inside
    // fan-out, which is itself reached from here.
    fn serve(&self, mut conn: Connection, mut receiver: TransportReceiver) -> BoxFuture<'static, ()> {
        let broker = self.clone();
        Box::pin(async move {
            while let Some(frame) = receiver.receive().await {
                match Message::decode(&frame) {
                    Ok(message) => broker.dispatch(&mut conn, message).await,
                    Err(e) => warn!("Dropping frame from {}: {e}", conn.sender.id()),
                }
            }
            broker.disconnect(&conn);
        })
    }

    async fn dispatch(&self, conn: &mut Connection, message: Message) {
        match message {
            Message::TopicList { topics, id } => {
                if id == self.id() {
                    warn!("Connection {} claims this broker's node id", conn.sender.id());
                    return;
                }
                conn.role = Role::Broker(id);
                debug!(
                    "Connection {} is broker {id} wanting {} topic(s)",
                    conn.sender.id(),
                    topics.len()
                );
                for topic in topics {
                    self.add_interest(topic, conn.destination(), Some(id));
                }
            }
            Message::Subscribe { topic, id } => {
                self.add_interest(topic, conn.destination(), Some(id));
            }
            Message::Unsubscribe { topic, .. } => {
                let key = DestinationKey::Connection(conn.sender.id());
                if self.inner.registry.write().remove(&topic, &key) {
                    debug!("{} unsubscribed from {topic}", conn.sender.id());
                }
            }
            Message::Publish { topic, id, payload } => {
                let (origin, arrival) = match conn.role {
                    // clients are not part of the federation; this broker
                    // becomes the origin
                    Role::Unknown => (self.id(), None),
                    Role::Broker(node) => {
                        if id == self.id() {
                            trace!("Dropping own publish on {topic} echoed by {node}");
                            return;
                        }
                        let admitted = self.inner.routes.lock().admit(
                            id,
                            &topic,
                            conn.sender.id(),
                            Instant::now(),
                        );
                        if !admitted {
                            trace!("Dropping duplicate publish on {topic} from origin {id} via {node}");
                            return;
                        }
                        (id, Some(node))
                    }
                };
                trace!("{} published to {topic}", conn.sender.id());
                self.fan_out(&topic, origin, arrival, payload).await;
            }
        }
    }

    /// Subscribes `destination` and announces the topic in the background.
    fn add_interest(&self, topic: String, destination: Destination, source: Option<NodeId>) {
        let added = self.inner.registry.write().add(&topic, destination.clone());
        if added {
            debug!("{destination:?} subscribed to {topic}");
        }
        let broker = self.clone();
        tokio::spawn(async move { broker.announce(&topic, source).await });
    }

    /// Tells every peer, other than `source`, about interest in `topic`. Each
    /// peer hears about a topic at most once per link.
    async fn announce(&self, topic: &str, source: Option<NodeId>) {
        let announcements = self.inner.peers.iter().enumerate().map(|(idx, peer)| async move {
            let skip = |peer: &Peer| {
                (source.is_some() && peer.peer_id() == source) || peer.has_announced(topic)
            };
            if skip(peer) {
                return;
            }
            let sender = match self.peer_link(idx).await {
                Ok(sender) => sender,
                Err(e) => {
                    warn!("Peer {} unreachable, not announcing {topic}: {e}", peer.address());
                    return;
                }
            };
            // the handshake may have told us who the peer is or covered the topic
            if skip(peer) {
                return;
            }
            match self
                .send_message(&sender, &Message::subscribe(topic, self.id()))
                .await
            {
                Ok(()) => {
                    peer.mark_announced(topic);
                    debug!("Announced {topic} to peer {}", peer.address());
                }
                Err(e) => {
                    warn!("Failed to announce {topic} to peer {}: {e}", peer.address());
                    if matches!(e, TransportError::Closed) {
                        peer.disconnected(sender.id());
                    }
                }
            }
        });
        join_all(announcements).await;
    }

    /// Delivers one publish to every interested destination and peer except
    /// the origin broker and the broker it arrived from.
    async fn fan_out(&self, topic: &str, origin: NodeId, arrival: Option<NodeId>, payload: Bytes) {
        let frame = match Message::publish(topic, origin, payload.clone()).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot forward publish on {topic}: {e}");
                return;
            }
        };
        let excluded = |node: NodeId| node == origin || Some(node) == arrival;

        let destinations = self.inner.registry.read().destinations_for(topic);
        let covered = Mutex::new(HashSet::new());
        let mut deliveries: Vec<BoxFuture<'_, ()>> = Vec::new();

        for destination in destinations {
            if let Some(node) = destination.node() {
                if excluded(node) || !covered.lock().insert(node) {
                    continue;
                }
            }
            deliveries.push(Box::pin(self.deliver(
                topic,
                destination,
                frame.clone(),
                payload.clone(),
            )));
        }

        for (idx, peer) in self.inner.peers.iter().enumerate() {
            let Some(node) = peer.peer_id() else {
                // never connected: dial first, its topic list decides
                let (covered, frame) = (&covered, frame.clone());
                deliveries.push(Box::pin(async move {
                    let sender = match self.peer_link(idx).await {
                        Ok(sender) => sender,
                        Err(e) => {
                            warn!("Peer {} unavailable, dropping {topic}: {e}", peer.address());
                            return;
                        }
                    };
                    let Some(node) = peer.peer_id() else {
                        return;
                    };
                    if excluded(node) || !peer.knows(topic) || !covered.lock().insert(node) {
                        return;
                    }
                    self.send_to_peer(peer, &sender, topic, frame).await;
                }));
                continue;
            };
            if excluded(node) || !peer.knows(topic) || !covered.lock().insert(node) {
                continue;
            }
            deliveries.push(Box::pin(self.deliver_to_peer(idx, topic, frame.clone())));
        }

        trace!("Fanning out {topic} to {} destination(s)", deliveries.len());
        join_all(deliveries).await;
    }

    async fn deliver(&self, topic: &str, destination: Destination, frame: Bytes, payload: Bytes) {
        let limit = self.inner.settings.send_timeout();
        match destination {
            Destination::Remote { sender, .. } => {
                if let Err(e) = sender.send_timeout(frame, limit).await {
                    warn!("Dropped delivery on {topic} to {}: {e}", sender.id());
                }
            }
            Destination::Local { id, callback } => {
                if tokio::time::timeout(limit, callback(payload)).await.is_err() {
                    warn!("Local subscriber {id} on {topic} timed out after {limit:?}");
                }
            }
        }
    }

    async fn deliver_to_peer(&self, idx: usize, topic: &str, frame: Bytes) {
        let peer = &self.inner.peers[idx];
        let sender = match self.peer_link(idx).await {
            Ok(sender) => sender,
            Err(e) => {
                warn!("Peer {} unavailable, dropping {topic}: {e}", peer.address());
                return;
            }
        };
        self.send_to_peer(peer, &sender, topic, frame).await;
    }

    async fn send_to_peer(&self, peer: &Peer, sender: &TransportSender, topic: &str, frame: Bytes) {
        if let Err(e) = sender
            .send_timeout(frame, self.inner.settings.send_timeout())
            .await
        {
            warn!("Dropped delivery on {topic} to peer {}: {e}", peer.address());
            if matches!(e, TransportError::Closed) {
                peer.disconnected(sender.id());
            }
        }
    }

    /// The live link to peer `idx`, dialing it if needed. A freshly dialed
    /// link is served like any other connection.
    async fn peer_link(&self, idx: usize) -> Result<TransportSender, TransportError> {
        let peer = &self.inner.peers[idx];
        let registry = &self.inner.registry;
        let topics_for = |node: NodeId| registry.read().topics_excluding(node);
        let handshake = Handshake {
            self_id: self.id(),
            capacity: self.inner.settings.channel_capacity,
            timeout: self.inner.settings.connect_timeout(),
            topics_for: &topics_for,
        };

        match peer.ensure_connected(handshake).await? {
            Link::Established(sender) => Ok(sender),
            Link::Fresh {
                sender,
                receiver,
                node,
            } => {
                info!("Connected to peer {} (broker {node})", peer.address());
                let conn = Connection {
                    sender: sender.clone(),
                    role: Role::Broker(node),
                    peer: Some(idx),
                };
                tokio::spawn(self.serve(conn, receiver));
                Ok(sender)
            }
        }
    }

    async fn send_message(
        &self,
        sender: &TransportSender,
        message: &Message,
    ) -> Result<(), TransportError> {
        let frame = message.encode()?;
        sender
            .send_timeout(frame, self.inner.settings.send_timeout())
            .await
    }

    fn disconnect(&self, conn: &Connection) {
        let id = conn.sender.id();
        let topics = self
            .inner
            .registry
            .write()
            .remove_everywhere(&DestinationKey::Connection(id));
        self.inner.routes.lock().forget_link(id);
        if let Some(idx) = conn.peer {
            self.inner.peers[idx].disconnected(id);
        }
        conn.sender.close();
        info!("{id} disconnected, removed from {} topic(s)", topics.len());
    }
}
