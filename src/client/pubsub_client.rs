use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::broker::{Callback, callback};
use crate::config::BrokerSettings;
use crate::transport::message::{Message, NodeId, random_node_id, validate_topic};
use crate::transport::{Address, TransportReceiver, TransportSender, websocket};
use crate::utils::error::{Error, Result, TransportError};

type Callbacks = Arc<RwLock<HashMap<String, Vec<Callback>>>>;

/// Handle used by in-process code to talk to its local broker.
///
/// Subscriptions made before [`begin`](Client::begin) are kept and sent once
/// the connection is up. Inbound publishes are matched against subscribed
/// topics by exact comparison. Callbacks of one topic run one at a time in
/// arrival order; different topics do not wait on each other.
pub struct Client {
    address: Address,
    id: NodeId,
    capacity: usize,
    connect_timeout: Duration,
    sender: Mutex<Option<TransportSender>>,
    callbacks: Callbacks,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(address: Address) -> Self {
        Self::with_settings(address, &BrokerSettings::default())
    }

    /// Uses the queue capacity and connect timeout from `settings`.
    pub fn with_settings(address: Address, settings: &BrokerSettings) -> Self {
        Self {
            address,
            id: random_node_id(),
            capacity: settings.channel_capacity,
            connect_timeout: settings.connect_timeout(),
            sender: Mutex::new(None),
            callbacks: Arc::new(RwLock::new(HashMap::new())),
            listener: Mutex::new(None),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Connects to the broker and starts the receive loop. Calling it again
    /// while connected does nothing.
    pub async fn begin(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let transport =
            websocket::connect(&self.address, self.capacity, self.connect_timeout).await?;
        let (sender, mut receiver) = transport.split();

        // the broker greets every connection with its topic list; a thin
        // client has no routing of its own
        let greeting = receiver.receive_timeout(self.connect_timeout).await?;
        match Message::decode(&greeting) {
            Ok(Message::TopicList { id, .. }) => {
                debug!("Client {} connected to broker {id} at {}", self.id, self.address)
            }
            Ok(other) => {
                sender.close();
                return Err(TransportError::Handshake(format!(
                    "expected a topic list, got message type '{}'",
                    other.tag() as char
                ))
                .into());
            }
            Err(e) => {
                sender.close();
                return Err(TransportError::from(e).into());
            }
        }

        let handle = tokio::spawn(receive_loop(
            self.id,
            receiver,
            self.callbacks.clone(),
            self.capacity,
        ));
        if let Some(old) = self.listener.lock().replace(handle) {
            old.abort();
        }

        // install the sender before replaying, so a concurrent `subscribe`
        // either sees it or is part of the replay
        *self.sender.lock() = Some(sender.clone());
        let topics: Vec<String> = self.callbacks.read().keys().cloned().collect();
        for topic in topics {
            send(&sender, &Message::subscribe(topic, self.id)).await?;
        }
        Ok(())
    }

    /// Registers `f` for publishes on exactly `topic`.
    pub async fn subscribe<F, Fut>(&self, topic: &str, f: F) -> Result<()>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        validate_topic(topic)?;
        let first = {
            let mut callbacks = self.callbacks.write();
            let entry = callbacks.entry(topic.to_string()).or_default();
            entry.push(callback(f));
            entry.len() == 1
        };
        if first {
            if let Some(sender) = self.current_sender() {
                send(&sender, &Message::subscribe(topic, self.id)).await?;
            }
        }
        Ok(())
    }

    /// Drops every callback for `topic` and tells the broker.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if self.callbacks.write().remove(topic).is_none() {
            return Ok(());
        }
        if let Some(sender) = self.current_sender() {
            let message = Message::Unsubscribe {
                topic: topic.to_string(),
                id: self.id,
            };
            send(&sender, &message).await?;
        }
        Ok(())
    }

    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        let sender = self.current_sender().ok_or(Error::NotConnected)?;
        send(&sender, &Message::publish(topic, self.id, payload)).await
    }

    /// Closes the connection. Subscriptions are kept for the next `begin`.
    pub fn close(&self) {
        if let Some(sender) = self.sender.lock().take() {
            sender.close();
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }

    fn current_sender(&self) -> Option<TransportSender> {
        self.sender.lock().clone()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

async fn send(sender: &TransportSender, message: &Message) -> Result<()> {
    let frame = message.encode()?;
    sender.send(frame).await?;
    Ok(())
}

async fn receive_loop(
    id: NodeId,
    mut receiver: TransportReceiver,
    callbacks: Callbacks,
    capacity: usize,
) {
    // one worker per topic: callbacks of a topic run in order, and a slow
    // callback only holds up its own topic
    let mut workers: HashMap<String, mpsc::Sender<Bytes>> = HashMap::new();
    while let Some(frame) = receiver.receive().await {
        match Message::decode(&frame) {
            Ok(Message::Publish { topic, payload, .. }) => {
                if !callbacks.read().contains_key(&topic) {
                    trace!("Client {id} has no callback for {topic}");
                    continue;
                }
                let worker = workers.entry(topic.clone()).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(capacity.max(1));
                    tokio::spawn(topic_worker(topic.clone(), rx, callbacks.clone()));
                    tx
                });
                match worker.try_send(payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Client {id} callbacks on {topic} are behind, dropping a message")
                    }
                    Err(TrySendError::Closed(_)) => {
                        workers.remove(&topic);
                    }
                }
            }
            Ok(other) => trace!("Client {id} ignoring message type '{}'", other.tag() as char),
            Err(e) => warn!("Client {id} dropping frame: {e}"),
        }
    }
    debug!("Client {id} connection closed");
}

async fn topic_worker(topic: String, mut rx: mpsc::Receiver<Bytes>, callbacks: Callbacks) {
    while let Some(payload) = rx.recv().await {
        let matching = callbacks.read().get(&topic).cloned().unwrap_or_default();
        trace!("Running {} callback(s) for {topic}", matching.len());
        for callback in matching {
            callback(payload.clone()).await;
        }
    }
}
