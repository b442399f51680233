//! Handle on one federated broker.
//!
//! The link is dialed lazily. A freshly dialed link is only usable once the
//! remote's `TopicList` has arrived: that message tells us which topics the
//! peer wants and which [`NodeId`] it runs under. Anything else as the first
//! message is a protocol violation and the link is dropped.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::transport::message::Message;
use crate::transport::websocket;
use crate::transport::{Address, ConnectionId, NodeId, TransportReceiver, TransportSender};
use crate::utils::error::TransportError;

#[derive(Debug, Default)]
struct PeerState {
    link: Option<TransportSender>,
    /// Interest advertised by the peer when we last connected. Not kept live.
    known_topics: HashSet<String>,
    peer_id: Option<NodeId>,
    /// Topics already announced over the current link.
    announced: HashSet<String>,
}

/// What this broker tells a peer right after dialing it.
pub(crate) struct Handshake<'a> {
    pub self_id: NodeId,
    pub capacity: usize,
    pub timeout: Duration,
    /// Our topic list, given the peer's node id.
    pub topics_for: &'a (dyn Fn(NodeId) -> Vec<String> + Send + Sync),
}

pub(crate) enum Link {
    Established(TransportSender),
    /// Just dialed; the caller owns the receiving half from here on.
    Fresh {
        sender: TransportSender,
        receiver: TransportReceiver,
        node: NodeId,
    },
}

#[derive(Debug)]
pub struct Peer {
    address: Address,
    state: Mutex<PeerState>,
    dial: tokio::sync::Mutex<()>,
}

impl Peer {
    pub fn new(address: Address) -> Self {
        debug!("Configured peer {address}");
        Self {
            address,
            state: Mutex::new(PeerState::default()),
            dial: tokio::sync::Mutex::new(()),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Node id learned from the last successful connect.
    pub fn peer_id(&self) -> Option<NodeId> {
        self.state.lock().peer_id
    }

    pub fn knows(&self, topic: &str) -> bool {
        self.state.lock().known_topics.contains(topic)
    }

    pub fn known_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().known_topics.iter().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<TransportSender> {
        self.state
            .lock()
            .link
            .as_ref()
            .filter(|link| !link.is_closed())
            .cloned()
    }

    pub(crate) fn has_announced(&self, topic: &str) -> bool {
        self.state.lock().announced.contains(topic)
    }

    pub(crate) fn mark_announced(&self, topic: &str) {
        self.state.lock().announced.insert(topic.to_string());
    }

    /// Forgets the link if it is still `link`, so the next use redials.
    pub(crate) fn disconnected(&self, link: ConnectionId) {
        let mut state = self.state.lock();
        if state.link.as_ref().is_some_and(|current| current.id() == link) {
            state.link = None;
            state.announced.clear();
        }
    }

    /// Returns the live link, dialing and completing the handshake first if
    /// there is none.
    pub(crate) async fn ensure_connected(&self, hs: Handshake<'_>) -> Result<Link, TransportError> {
        if let Some(sender) = self.current() {
            return Ok(Link::Established(sender));
        }

        let _dialing = self.dial.lock().await;
        if let Some(sender) = self.current() {
            return Ok(Link::Established(sender));
        }

        let transport = websocket::connect(&self.address, hs.capacity, hs.timeout).await?;
        let (sender, mut receiver) = transport.split();

        let (known, node, ours) = match exchange_topic_lists(&sender, &mut receiver, &hs).await {
            Ok(result) => result,
            Err(e) => {
                sender.close();
                return Err(e);
            }
        };

        {
            let mut state = self.state.lock();
            state.link = Some(sender.clone());
            state.known_topics = known.into_iter().collect();
            state.peer_id = Some(node);
            state.announced = ours.into_iter().collect();
        }

        Ok(Link::Fresh {
            sender,
            receiver,
            node,
        })
    }
}

/// Reads the peer's `TopicList`, then sends ours.
async fn exchange_topic_lists(
    sender: &TransportSender,
    receiver: &mut TransportReceiver,
    hs: &Handshake<'_>,
) -> Result<(Vec<String>, NodeId, Vec<String>), TransportError> {
    let first = receiver.receive_timeout(hs.timeout).await?;
    let (known, node) = match Message::decode(&first)? {
        Message::TopicList { topics, id } => (topics, id),
        other => {
            return Err(TransportError::Handshake(format!(
                "expected a topic list first, got message type '{}'",
                other.tag() as char
            )));
        }
    };
    if node == hs.self_id {
        return Err(TransportError::Handshake("peer is this broker".to_string()));
    }

    let ours = (hs.topics_for)(node);
    let hello = Message::TopicList {
        topics: ours.clone(),
        id: hs.self_id,
    }
    .encode()?;
    sender.send_timeout(hello, hs.timeout).await?;

    Ok((known, node, ours))
}
