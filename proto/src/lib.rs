//! Data model and realtime wire frames shared by the chat server and clients.

pub mod model;

pub use model::*;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A fan-out channel a session can subscribe to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Topic {
    Conversation(Uuid),
    Folder(String),
}

/// Control frames sent by a client over the realtime channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    SubscribeConversation { id: Uuid },
    UnsubscribeConversation { id: Uuid },
    SubscribeFolder { id: String },
    UnsubscribeFolder { id: String },
    GetStatus,
    Typing { conversation_id: Uuid, is_typing: bool },
    /// Declares which conversation the client is currently viewing.
    Focus { conversation_id: Option<Uuid> },
}

/// Capability advertisement sent with `connected`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Features {
    pub typing: bool,
    pub presence: bool,
    pub read_receipts: bool,
    pub calls: bool,
    pub folders: bool,
    pub heartbeat_timeout_secs: u64,
    pub typing_ttl_secs: u64,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            typing: true,
            presence: true,
            read_receipts: true,
            calls: true,
            folders: true,
            heartbeat_timeout_secs: 60,
            typing_ttl_secs: 5,
        }
    }
}

/// Events pushed from the server to a client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        user_id: Uuid,
        session_id: Uuid,
        features: Features,
    },
    Pong {
        server_time: Timestamp,
    },
    Status {
        session_id: Uuid,
        user_id: Uuid,
        connected_at: Timestamp,
        subscriptions: Vec<Topic>,
    },
    NewMessage {
        message: Message,
    },
    MessageUpdated {
        message: Message,
    },
    Receipts {
        conversation_id: Uuid,
        user_id: Uuid,
        kind: ReceiptKind,
        message_ids: Vec<Uuid>,
    },
    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
        display_name: String,
        is_typing: bool,
    },
    Presence {
        user_id: Uuid,
        is_online: bool,
        last_seen_at: Option<Timestamp>,
    },
    CallUpdated {
        call: CallSession,
    },
    ConversationUpdated {
        conversation: Conversation,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    /// Conversation the event belongs to, if any.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            ServerEvent::NewMessage { message } | ServerEvent::MessageUpdated { message } => {
                Some(message.conversation_id)
            }
            ServerEvent::Receipts {
                conversation_id, ..
            }
            | ServerEvent::Typing {
                conversation_id, ..
            } => Some(*conversation_id),
            ServerEvent::CallUpdated { call } => Some(call.conversation_id),
            ServerEvent::ConversationUpdated { conversation } => Some(conversation.id),
            _ => None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Server event as it travels on the wire.
///
/// `seq` is the per-conversation commit sequence for fanned-out mutations and
/// absent for session-local replies such as `pong`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EventFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl EventFrame {
    pub fn unsequenced(event: ServerEvent) -> Self {
        Self { seq: None, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_shapes() {
        let f: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(f, ClientFrame::Ping);
        let id = Uuid::new_v4();
        let f: ClientFrame =
            serde_json::from_str(&format!(r#"{{"type":"subscribe_conversation","id":"{id}"}}"#))
                .unwrap();
        assert_eq!(f, ClientFrame::SubscribeConversation { id });
        let f: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe_folder","id":"inbox"}"#).unwrap();
        assert_eq!(f, ClientFrame::SubscribeFolder { id: "inbox".into() });
    }

    #[test]
    fn event_frame_roundtrip() {
        let frame = EventFrame {
            seq: Some(7),
            event: ServerEvent::Typing {
                conversation_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                display_name: "Alice".into(),
                is_typing: true,
            },
        };
        let s = serde_json::to_string(&frame).unwrap();
        let v: serde_json::Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v["type"], "typing");
        assert_eq!(v["seq"], 7);
        let de: EventFrame = serde_json::from_str(&s).unwrap();
        assert_eq!(frame, de);
    }

    #[test]
    fn pong_has_no_seq() {
        let s = serde_json::to_string(&EventFrame::unsequenced(ServerEvent::Pong {
            server_time: 1,
        }))
        .unwrap();
        assert!(!s.contains("seq"));
    }
}
