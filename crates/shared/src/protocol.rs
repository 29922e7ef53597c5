//! Broadcasting protocol definitions: channel topics, event names, the
//! WebSocket envelope, and the call-signaling record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    Comment, CommentDeleted, ConversationMessage, FriendshipRequest, Notification, Post, PostLike,
};

// --- Channels ---

/// Whether a channel is open to any connected client or requires server-side
/// authorization before events are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelKind {
    Public,
    Private,
}

/// A named real-time topic. The wire name scheme is `posts`, `post.{id}`,
/// `conversation.{id}`, `user.{id}` and `call.{session}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// The flat feed channel (`posts`).
    Feed,
    /// Updates for a single post (`post.{id}`).
    Post(u64),
    /// Messages within a conversation (`conversation.{id}`).
    Conversation(u64),
    /// Per-user notifications and friendship events (`user.{id}`).
    User(u64),
    /// Live signaling updates for one call session (`call.{session}`).
    Call(String),
}

impl Topic {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Topic::Feed | Topic::Post(_) => ChannelKind::Public,
            Topic::Conversation(_) | Topic::User(_) | Topic::Call(_) => ChannelKind::Private,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Topic::Feed => "posts".to_string(),
            Topic::Post(id) => format!("post.{id}"),
            Topic::Conversation(id) => format!("conversation.{id}"),
            Topic::User(id) => format!("user.{id}"),
            Topic::Call(session) => format!("call.{session}"),
        }
    }

    /// Parse a wire channel name back into a topic.
    pub fn parse(name: &str) -> Option<Topic> {
        if name == "posts" {
            return Some(Topic::Feed);
        }
        let (prefix, rest) = name.split_once('.')?;
        match prefix {
            "post" => rest.parse().ok().map(Topic::Post),
            "conversation" => rest.parse().ok().map(Topic::Conversation),
            "user" => rest.parse().ok().map(Topic::User),
            "call" if !rest.is_empty() => Some(Topic::Call(rest.to_string())),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

// --- Events ---

/// Named events the server broadcasts. The mixed naming (`post.created` vs
/// `CommentCreated`) matches the server's wire names exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PostCreated,
    PostLiked,
    CommentCreated,
    CommentDeleted,
    MessageNew,
    FriendshipRequestReceived,
    NotificationCreated,
    CallAnswer,
    CallCandidate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PostCreated => "post.created",
            EventKind::PostLiked => "post.liked",
            EventKind::CommentCreated => "CommentCreated",
            EventKind::CommentDeleted => "CommentDeleted",
            EventKind::MessageNew => "message.new",
            EventKind::FriendshipRequestReceived => "friendship.request_received",
            EventKind::NotificationCreated => "notification.created",
            EventKind::CallAnswer => "call.answer",
            EventKind::CallCandidate => "call.candidate",
        }
    }

    pub fn parse(name: &str) -> Option<EventKind> {
        Some(match name {
            "post.created" => EventKind::PostCreated,
            "post.liked" => EventKind::PostLiked,
            "CommentCreated" => EventKind::CommentCreated,
            "CommentDeleted" => EventKind::CommentDeleted,
            "message.new" => EventKind::MessageNew,
            "friendship.request_received" => EventKind::FriendshipRequestReceived,
            "notification.created" => EventKind::NotificationCreated,
            "call.answer" => EventKind::CallAnswer,
            "call.candidate" => EventKind::CallCandidate,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded channel event with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    PostCreated(Post),
    PostLiked(PostLike),
    CommentCreated(Comment),
    CommentDeleted(CommentDeleted),
    MessageNew(ConversationMessage),
    FriendshipRequestReceived(FriendshipRequest),
    NotificationCreated(Notification),
    CallAnswer(CallAnswerEvent),
    CallCandidate(CallCandidateEvent),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::PostCreated(_) => EventKind::PostCreated,
            ChannelEvent::PostLiked(_) => EventKind::PostLiked,
            ChannelEvent::CommentCreated(_) => EventKind::CommentCreated,
            ChannelEvent::CommentDeleted(_) => EventKind::CommentDeleted,
            ChannelEvent::MessageNew(_) => EventKind::MessageNew,
            ChannelEvent::FriendshipRequestReceived(_) => EventKind::FriendshipRequestReceived,
            ChannelEvent::NotificationCreated(_) => EventKind::NotificationCreated,
            ChannelEvent::CallAnswer(_) => EventKind::CallAnswer,
            ChannelEvent::CallCandidate(_) => EventKind::CallCandidate,
        }
    }

    /// Decode a raw broadcast payload into the typed event for `kind`.
    pub fn decode(kind: EventKind, payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let payload = payload.clone();
        Ok(match kind {
            EventKind::PostCreated => ChannelEvent::PostCreated(serde_json::from_value(payload)?),
            EventKind::PostLiked => ChannelEvent::PostLiked(serde_json::from_value(payload)?),
            EventKind::CommentCreated => {
                ChannelEvent::CommentCreated(serde_json::from_value(payload)?)
            }
            EventKind::CommentDeleted => {
                ChannelEvent::CommentDeleted(serde_json::from_value(payload)?)
            }
            EventKind::MessageNew => ChannelEvent::MessageNew(serde_json::from_value(payload)?),
            EventKind::FriendshipRequestReceived => {
                ChannelEvent::FriendshipRequestReceived(serde_json::from_value(payload)?)
            }
            EventKind::NotificationCreated => {
                ChannelEvent::NotificationCreated(serde_json::from_value(payload)?)
            }
            EventKind::CallAnswer => ChannelEvent::CallAnswer(serde_json::from_value(payload)?),
            EventKind::CallCandidate => {
                ChannelEvent::CallCandidate(serde_json::from_value(payload)?)
            }
        })
    }
}

// --- WebSocket envelope ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> WsEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    Subscribe {
        channel: String,
        /// Authorization token for private channels, obtained from the
        /// dedicated auth endpoint. Absent for public channels.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<String>,
    },
    Unsubscribe {
        channel: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// An event broadcast on a channel the client joined.
    Broadcast {
        channel: String,
        event: String,
        payload: serde_json::Value,
    },
    /// Subscription acknowledged by the server.
    Ack { channel: String },
    Error {
        code: String,
        message: String,
        correlation_id: Option<String>,
    },
}

/// Pop up to two levels of `{ "data": ... }` nesting off a JSON value.
/// Endpoints are inconsistent about single vs. double envelopes.
pub fn unwrap_data(mut value: serde_json::Value) -> serde_json::Value {
    for _ in 0..2 {
        match value {
            serde_json::Value::Object(ref mut map) if map.len() == 1 && map.contains_key("data") => {
                value = map.remove("data").unwrap_or(serde_json::Value::Null);
            }
            _ => break,
        }
    }
    value
}

// --- Call signaling ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP session description as stored in a signaling record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// Which peer contributed a candidate. Callers append to the offer-side
/// collection, callees to the answer-side collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CandidateSide {
    Caller,
    Callee,
}

/// A serialized ICE candidate. Field names mirror the browser's
/// `RTCIceCandidateInit` so records interoperate with web peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// The persisted signaling document for one call session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub session_id: String,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub is_established: bool,
}

/// Payload of a `call.answer` broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswerEvent {
    pub session_id: String,
    pub answer: SessionDescription,
    pub is_established: bool,
}

/// Payload of a `call.candidate` broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCandidateEvent {
    pub session_id: String,
    pub side: CandidateSide,
    pub candidate: IceCandidate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_round_trip() {
        for topic in [
            Topic::Feed,
            Topic::Post(7),
            Topic::Conversation(42),
            Topic::User(3),
            Topic::Call("abc-123".to_string()),
        ] {
            assert_eq!(Topic::parse(&topic.name()), Some(topic.clone()));
        }
        assert_eq!(Topic::parse("post.not-a-number"), None);
        assert_eq!(Topic::parse("unknown.1"), None);
        assert_eq!(Topic::parse("call."), None);
    }

    #[test]
    fn event_kind_wire_names() {
        assert_eq!(EventKind::parse("post.created"), Some(EventKind::PostCreated));
        assert_eq!(EventKind::parse("CommentCreated"), Some(EventKind::CommentCreated));
        assert_eq!(EventKind::parse("comment.created"), None);
        assert_eq!(EventKind::MessageNew.as_str(), "message.new");
    }

    #[test]
    fn unwrap_data_handles_both_envelope_depths() {
        let single = serde_json::json!({ "data": { "id": 1 } });
        assert_eq!(unwrap_data(single), serde_json::json!({ "id": 1 }));

        let double = serde_json::json!({ "data": { "data": [1, 2] } });
        assert_eq!(unwrap_data(double), serde_json::json!([1, 2]));

        // An object that carries more than `data` is left alone.
        let mixed = serde_json::json!({ "data": [1], "meta": {} });
        assert_eq!(unwrap_data(mixed.clone()), mixed);
    }

    #[test]
    fn subscribe_command_omits_auth_when_public() {
        let envelope = WsEnvelope::new(ClientCommand::Subscribe {
            channel: "posts".to_string(),
            auth: None,
        });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert!(json["data"].get("auth").is_none());
    }
}
