use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationScope {
    #[default]
    Internal,
    External,
    CrossTenant,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantType {
    #[default]
    Internal,
    ExternalUser,
    Guest,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    #[default]
    Member,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
    Call,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

/// Lifecycle of a call session.
///
/// `Ringing` and `Ongoing` are the only non-terminal states.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Ongoing,
    Declined,
    NoAnswer,
    Missed,
    Ended,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CallStatus::Ringing | CallStatus::Ongoing)
    }
}

/// Membership record of a user, external contact or guest in a conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: Uuid,
    pub display_name: String,
    #[serde(default)]
    pub participant_type: ParticipantType,
    #[serde(default)]
    pub role: ParticipantRole,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub last_seen_at: Option<Timestamp>,
    /// Derived from `last_seen_at` when a view is built; never stored.
    #[serde(default)]
    pub is_online: bool,
    pub joined_at: Timestamp,
    #[serde(default)]
    pub left_at: Option<Timestamp>,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub scope: ConversationScope,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub last_message_at: Option<Timestamp>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_sender: Option<Uuid>,
    #[serde(default)]
    pub is_archived: bool,
    pub participants: Vec<Participant>,
}

impl Conversation {
    pub fn participant(&self, user_id: &Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &Uuid) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.user_id == user_id)
    }

    /// True when the user is a participant that has not left.
    pub fn is_active_member(&self, user_id: &Uuid) -> bool {
        self.participant(user_id).is_some_and(Participant::is_active)
    }

    pub fn active_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_active())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: Uuid,
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
    #[serde(default)]
    pub forwarded_from_id: Option<Uuid>,
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<Uuid>>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub delivered_to: BTreeSet<Uuid>,
    #[serde(default)]
    pub read_by: BTreeSet<Uuid>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub edited_at: Option<Timestamp>,
}

impl Message {
    /// Total order of messages within a conversation.
    pub fn order_key(&self) -> (Timestamp, Uuid) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub call_type: CallType,
    pub caller_id: Uuid,
    pub media_room: String,
    pub status: CallStatus,
    pub started_at: Timestamp,
    #[serde(default)]
    pub answered_at: Option<Timestamp>,
    #[serde(default)]
    pub ended_at: Option<Timestamp>,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
}

/// Credential for joining the media room of a call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MediaToken {
    pub call_id: Uuid,
    pub media_room: String,
    pub token: String,
    pub expires_at: Timestamp,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReceiptEntry {
    pub user_id: Uuid,
    pub display_name: String,
    pub has_left: bool,
}

/// Aggregate "seen by" view of one message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReadReceipts {
    pub message_id: Uuid,
    pub delivered_to: Vec<ReceiptEntry>,
    pub read_by: Vec<ReceiptEntry>,
    pub delivered_count: usize,
    pub read_count: usize,
    pub total_participants: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub last_seen_at: Option<Timestamp>,
    pub is_online: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Delivered,
    Read,
}
