//! Wire messages exchanged between clients and brokers, and between brokers.
//!
//! Every frame starts with a one-byte tag. Control messages carry a small JSON
//! object after the tag; `Publish` uses a compact binary layout so payloads
//! (images, serialized sensor frames) are never pushed through a text encoding:
//!
//! ```text
//! 'p' | topic_len: u8 | topic: [u8; topic_len] | sender: u32 (BE) | payload...
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::utils::error::{DecodeError, EncodeError};

/// Random per-process broker (or client) identifier used for loop avoidance.
pub type NodeId = u32;

pub const TAG_TOPIC_LIST: u8 = b't';
pub const TAG_SUBSCRIBE: u8 = b's';
pub const TAG_UNSUBSCRIBE: u8 = b'u';
pub const TAG_PUBLISH: u8 = b'p';

/// Longest topic the one-byte length prefix can carry.
pub const MAX_TOPIC_LEN: usize = u8::MAX as usize;

/// Draws a fresh random [`NodeId`].
pub fn random_node_id() -> NodeId {
    rand::random()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Sent once, right after a connection is accepted or dialed.
    TopicList { topics: Vec<String>, id: NodeId },
    /// Announces new interest in `topic`.
    Subscribe { topic: String, id: NodeId },
    /// Withdraws the sending connection's interest in `topic`.
    Unsubscribe { topic: String, id: NodeId },
    Publish {
        topic: String,
        id: NodeId,
        payload: Bytes,
    },
}

#[derive(Serialize, Deserialize)]
struct TopicListBody {
    topics: Vec<String>,
    id: NodeId,
}

#[derive(Serialize, Deserialize)]
struct TopicBody {
    topic: String,
    id: NodeId,
}

impl Message {
    pub fn publish(topic: impl Into<String>, id: NodeId, payload: impl Into<Bytes>) -> Self {
        Self::Publish {
            topic: topic.into(),
            id,
            payload: payload.into(),
        }
    }

    pub fn subscribe(topic: impl Into<String>, id: NodeId) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            id,
        }
    }

    /// Tag byte of this variant.
    pub fn tag(&self) -> u8 {
        match self {
            Self::TopicList { .. } => TAG_TOPIC_LIST,
            Self::Subscribe { .. } => TAG_SUBSCRIBE,
            Self::Unsubscribe { .. } => TAG_UNSUBSCRIBE,
            Self::Publish { .. } => TAG_PUBLISH,
        }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        match self {
            Self::TopicList { topics, id } => {
                for topic in topics {
                    validate_topic(topic)?;
                }
                encode_json(
                    TAG_TOPIC_LIST,
                    &TopicListBody {
                        topics: topics.clone(),
                        id: *id,
                    },
                )
            }
            Self::Subscribe { topic, id } | Self::Unsubscribe { topic, id } => {
                validate_topic(topic)?;
                encode_json(
                    self.tag(),
                    &TopicBody {
                        topic: topic.clone(),
                        id: *id,
                    },
                )
            }
            Self::Publish { topic, id, payload } => {
                validate_topic(topic)?;
                let mut buf = BytesMut::with_capacity(2 + topic.len() + 4 + payload.len());
                buf.put_u8(TAG_PUBLISH);
                buf.put_u8(topic.len() as u8);
                buf.put_slice(topic.as_bytes());
                buf.put_u32(*id);
                buf.put_slice(payload);
                Ok(buf.freeze())
            }
        }
    }

    /// Decodes one frame. The tag is checked before anything else is read.
    pub fn decode(frame: &Bytes) -> Result<Self, DecodeError> {
        let tag = *frame.first().ok_or(DecodeError::EmptyFrame)?;
        match tag {
            TAG_TOPIC_LIST => {
                let body: TopicListBody = serde_json::from_slice(&frame[1..])?;
                if body.topics.iter().any(String::is_empty) {
                    return Err(DecodeError::EmptyTopic);
                }
                Ok(Self::TopicList {
                    topics: body.topics,
                    id: body.id,
                })
            }
            TAG_SUBSCRIBE | TAG_UNSUBSCRIBE => {
                let body: TopicBody = serde_json::from_slice(&frame[1..])?;
                if body.topic.is_empty() {
                    return Err(DecodeError::EmptyTopic);
                }
                Ok(if tag == TAG_SUBSCRIBE {
                    Self::Subscribe {
                        topic: body.topic,
                        id: body.id,
                    }
                } else {
                    Self::Unsubscribe {
                        topic: body.topic,
                        id: body.id,
                    }
                })
            }
            TAG_PUBLISH => decode_publish(frame),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

fn decode_publish(frame: &Bytes) -> Result<Message, DecodeError> {
    let topic_len = *frame.get(1).ok_or(DecodeError::Truncated("topic length"))? as usize;
    if topic_len == 0 {
        return Err(DecodeError::EmptyTopic);
    }
    let topic_end = 2 + topic_len;
    let topic = frame
        .get(2..topic_end)
        .ok_or(DecodeError::Truncated("topic"))?;
    let topic = std::str::from_utf8(topic)?.to_owned();

    let id_bytes: [u8; 4] = frame
        .get(topic_end..topic_end + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or(DecodeError::Truncated("sender id"))?;

    Ok(Message::Publish {
        topic,
        id: u32::from_be_bytes(id_bytes),
        // shares the frame's allocation
        payload: frame.slice(topic_end + 4..),
    })
}

fn encode_json<T: Serialize>(tag: u8, body: &T) -> Result<Bytes, EncodeError> {
    let mut buf = vec![tag];
    serde_json::to_writer(&mut buf, body)?;
    Ok(Bytes::from(buf))
}

/// Checks that `topic` fits the wire format.
pub fn validate_topic(topic: &str) -> Result<(), EncodeError> {
    if topic.is_empty() {
        return Err(EncodeError::EmptyTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(EncodeError::TopicTooLong(topic.len()));
    }
    Ok(())
}
