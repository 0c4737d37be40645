//! Conversation & message aggregate.
//!
//! One [`ConversationStore`] per process owns every conversation and its
//! message history. Each conversation sits behind its own mutex, so conflicting
//! writes to the same conversation (edit racing delete, two appends) serialize
//! while different conversations proceed in parallel. Every mutation is
//! written to the [`Journal`] first, then committed in memory, then published
//! through the [`Broadcaster`] while the conversation lock is still held; the
//! per-conversation `seq` therefore matches commit order.

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SyncError};
use crate::fanout::{Broadcaster, Delivery, NullBroadcaster};
use crate::journal::{Journal, NullJournal, Snapshot};
use crate::preview;
use crate::receipts::UnreadLedger;
use chat_proto::{
    Attachment, CallSession, CallStatus, CallType, Conversation, ConversationKind,
    ConversationScope, Message, MessageType, Participant, ParticipantRole, ParticipantType,
    ServerEvent, Timestamp, Topic,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_PAGE: usize = 50;
pub const MAX_PAGE: usize = 200;
pub const MAX_CONTENT_CHARS: usize = 10_000;
pub const MAX_NAME_CHARS: usize = 120;
pub const MAX_EMOJI_CHARS: usize = 32;

/// Who performs a mutation, and from which realtime session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
}

impl Actor {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            session_id: None,
        }
    }

    pub fn with_session(user_id: Uuid, session_id: Uuid) -> Self {
        Self {
            user_id,
            session_id: Some(session_id),
        }
    }
}

/// Cursor for message history pagination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cursor {
    Timestamp(Timestamp),
    Id(Uuid),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFilter {
    #[default]
    All,
    Unread,
    Group,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ConversationFilter {
    #[serde(default)]
    pub filter: ListFilter,
    /// List archived conversations instead of active ones.
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewParticipant {
    pub user_id: Uuid,
    pub display_name: String,
    #[serde(default)]
    pub participant_type: ParticipantType,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewGroup {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub scope: ConversationScope,
    #[serde(default)]
    pub participants: Vec<NewParticipant>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_archived: Option<bool>,
    /// Applies to the caller's own participant entry.
    #[serde(default)]
    pub is_muted: Option<bool>,
}

impl ConversationPatch {
    /// Name, description or avatar: owner-only group metadata.
    pub fn touches_metadata(&self) -> bool {
        self.name.is_some() || self.description.is_some() || self.avatar_url.is_some()
    }
}

/// A message as submitted by its sender.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMessage {
    /// Client-chosen id; resending the same id is a no-op.
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip)]
    pub forwarded_from_id: Option<Uuid>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(Message),
    /// A message with the same id was already present; nothing changed.
    Duplicate(Message),
}

impl AppendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            AppendOutcome::Appended(m) | AppendOutcome::Duplicate(m) => m,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            AppendOutcome::Appended(m) | AppendOutcome::Duplicate(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardFailure {
    pub conversation_id: Uuid,
    pub code: String,
    pub error: String,
}

/// Outcome of a best-effort forward: successes are never rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardReport {
    pub forwarded: Vec<Message>,
    pub failed: Vec<ForwardFailure>,
}

/// Deterministic id of the direct conversation between two users.
pub fn direct_conversation_id(a: Uuid, b: Uuid) -> Uuid {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("direct:{lo}:{hi}").as_bytes())
}

/// Listing order: newest activity first, conversations without messages last,
/// ties broken by creation time descending.
pub fn listing_order(a: &Conversation, b: &Conversation) -> Ordering {
    b.last_message_at
        .cmp(&a.last_message_at)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub(crate) struct Thread {
    pub(crate) conversation: Conversation,
    pub(crate) messages: BTreeMap<(Timestamp, Uuid), Message>,
    pub(crate) index: HashMap<Uuid, Timestamp>,
    seq: u64,
}

impl Thread {
    fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            messages: BTreeMap::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }

    pub(crate) fn get(&self, id: &Uuid) -> Option<&Message> {
        let ts = self.index.get(id)?;
        self.messages.get(&(*ts, *id))
    }

    pub(crate) fn get_mut(&mut self, id: &Uuid) -> Option<&mut Message> {
        let ts = *self.index.get(id)?;
        self.messages.get_mut(&(ts, *id))
    }

    pub(crate) fn newest(&self) -> Option<&Message> {
        self.messages.values().next_back()
    }

    fn insert(&mut self, message: Message) {
        self.index.insert(message.id, message.created_at);
        self.messages.insert(message.order_key(), message);
    }

    /// Creation time for a new message that keeps the history strictly ordered
    /// by commit even when the wall clock repeats a millisecond.
    fn next_created_at(&self, now: Timestamp) -> Timestamp {
        self.newest()
            .map_or(now, |m| now.max(m.created_at.saturating_add(1)))
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

pub struct ConversationStore {
    threads: RwLock<HashMap<Uuid, Arc<Mutex<Thread>>>>,
    message_index: RwLock<HashMap<Uuid, Uuid>>,
    pub(crate) unread: UnreadLedger,
    broadcaster: Arc<dyn Broadcaster>,
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// In-memory store with no realtime transport attached.
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            message_index: RwLock::new(HashMap::new()),
            unread: UnreadLedger::default(),
            broadcaster: Arc::new(NullBroadcaster),
            journal: Arc::new(NullJournal),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now_ms()
    }

    pub(crate) fn journal(&self) -> &dyn Journal {
        self.journal.as_ref()
    }

    pub(crate) fn thread(&self, id: &Uuid) -> Result<Arc<Mutex<Thread>>> {
        self.threads
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("conversation", *id))
    }

    pub(crate) fn thread_of_message(&self, message_id: &Uuid) -> Result<Arc<Mutex<Thread>>> {
        let conversation_id = self
            .message_index
            .read()
            .get(message_id)
            .copied()
            .ok_or_else(|| SyncError::not_found("message", *message_id))?;
        self.thread(&conversation_id)
    }

    pub(crate) fn emit(&self, thread: &mut Thread, origin: Option<Uuid>, event: ServerEvent) {
        let seq = thread.next_seq();
        self.broadcaster.publish(Delivery {
            topic: Topic::Conversation(thread.conversation.id),
            seq: Some(seq),
            origin,
            event,
        });
    }

    /// Publish an event in a conversation's commit order without mutating it.
    pub(crate) fn emit_in(
        &self,
        conversation_id: &Uuid,
        origin: Option<Uuid>,
        event: ServerEvent,
    ) -> Result<()> {
        let thread = self.thread(conversation_id)?;
        let mut t = thread.lock();
        self.emit(&mut t, origin, event);
        Ok(())
    }

    /// Rebuild the aggregate from a journal snapshot.
    pub fn restore(&self, snapshot: Snapshot) -> (usize, usize) {
        let mut threads = self.threads.write();
        let mut index = self.message_index.write();
        for conversation in snapshot.conversations {
            for p in conversation.active_participants() {
                self.unread.add(p.user_id, u64::from(p.unread_count));
            }
            threads.insert(conversation.id, Arc::new(Mutex::new(Thread::new(conversation))));
        }
        let mut restored = 0;
        for message in snapshot.messages {
            let Some(thread) = threads.get(&message.conversation_id) else {
                warn!(message_id = %message.id, "dropping message of unknown conversation");
                continue;
            };
            index.insert(message.id, message.conversation_id);
            thread.lock().insert(message);
            restored += 1;
        }
        info!(conversations = threads.len(), messages = restored, "store restored");
        (threads.len(), restored)
    }

    // ---- conversations ----

    pub fn open_direct(
        &self,
        actor: &Actor,
        me: NewParticipant,
        other: NewParticipant,
        scope: ConversationScope,
    ) -> Result<Conversation> {
        if me.user_id != actor.user_id {
            return Err(SyncError::forbidden("cannot open a conversation for someone else"));
        }
        if me.user_id == other.user_id {
            return Err(SyncError::validation("direct conversation needs two distinct users"));
        }
        let id = direct_conversation_id(me.user_id, other.user_id);
        let mut threads = self.threads.write();
        if let Some(existing) = threads.get(&id) {
            return Ok(existing.lock().conversation.clone());
        }
        let now = self.now();
        let conversation = Conversation {
            id,
            kind: ConversationKind::Direct,
            scope,
            name: None,
            avatar_url: None,
            description: None,
            created_at: now,
            last_message_at: None,
            last_message_preview: None,
            last_message_sender: None,
            is_archived: false,
            participants: vec![
                new_participant(me, ParticipantRole::Member, now),
                new_participant(other, ParticipantRole::Member, now),
            ],
        };
        self.journal.save_conversation(&conversation)?;
        threads.insert(id, Arc::new(Mutex::new(Thread::new(conversation.clone()))));
        info!(conversation_id = %id, "direct conversation created");
        Ok(conversation)
    }

    pub fn create_group(
        &self,
        actor: &Actor,
        creator: NewParticipant,
        group: NewGroup,
    ) -> Result<Conversation> {
        if creator.user_id != actor.user_id {
            return Err(SyncError::forbidden("cannot create a group for someone else"));
        }
        let name = validate_name(&group.name)?;
        let now = self.now();
        let mut seen = HashSet::from([creator.user_id]);
        let mut participants = vec![new_participant(creator, ParticipantRole::Owner, now)];
        for p in group.participants {
            if seen.insert(p.user_id) {
                participants.push(new_participant(p, ParticipantRole::Member, now));
            }
        }
        let conversation = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group,
            scope: group.scope,
            name: Some(name),
            avatar_url: non_empty(group.avatar_url),
            description: non_empty(group.description),
            created_at: now,
            last_message_at: None,
            last_message_preview: None,
            last_message_sender: None,
            is_archived: false,
            participants,
        };
        self.journal.save_conversation(&conversation)?;
        self.threads.write().insert(
            conversation.id,
            Arc::new(Mutex::new(Thread::new(conversation.clone()))),
        );
        info!(conversation_id = %conversation.id, members = conversation.participants.len(), "group created");
        Ok(conversation)
    }

    fn commit_conversation(
        &self,
        thread: &mut Thread,
        origin: Option<Uuid>,
        updated: Conversation,
    ) -> Result<Conversation> {
        self.journal.save_conversation(&updated)?;
        thread.conversation = updated.clone();
        self.emit(
            thread,
            origin,
            ServerEvent::ConversationUpdated {
                conversation: updated.clone(),
            },
        );
        Ok(updated)
    }

    /// Apply a patch as one commit. Every field is checked before anything
    /// changes, so a rejected patch leaves the conversation untouched.
    pub fn update_conversation(
        &self,
        actor: &Actor,
        conversation_id: &Uuid,
        patch: ConversationPatch,
    ) -> Result<Conversation> {
        let thread = self.thread(conversation_id)?;
        let mut t = thread.lock();
        require_member(&t.conversation, &actor.user_id)?;
        let mut updated = t.conversation.clone();
        if patch.touches_metadata() {
            if t.conversation.kind == ConversationKind::Direct {
                return Err(SyncError::validation("direct conversations have no editable metadata"));
            }
            require_owner(&t.conversation, &actor.user_id)?;
            if let Some(name) = patch.name {
                updated.name = Some(validate_name(&name)?);
            }
            if patch.description.is_some() {
                updated.description = non_empty(patch.description);
            }
            if patch.avatar_url.is_some() {
                updated.avatar_url = non_empty(patch.avatar_url);
            }
        }
        if let Some(archived) = patch.is_archived {
            updated.is_archived = archived;
        }
        if let Some(muted) = patch.is_muted {
            if let Some(p) = updated.participant_mut(&actor.user_id) {
                p.is_muted = muted;
            }
        }
        if updated == t.conversation {
            return Ok(updated);
        }
        self.commit_conversation(&mut t, actor.session_id, updated)
    }

    pub fn set_archived(
        &self,
        actor: &Actor,
        conversation_id: &Uuid,
        archived: bool,
    ) -> Result<Conversation> {
        let patch = ConversationPatch {
            is_archived: Some(archived),
            ..ConversationPatch::default()
        };
        self.update_conversation(actor, conversation_id, patch)
    }

    pub fn set_muted(
        &self,
        actor: &Actor,
        conversation_id: &Uuid,
        muted: bool,
    ) -> Result<Conversation> {
        let patch = ConversationPatch {
            is_muted: Some(muted),
            ..ConversationPatch::default()
        };
        self.update_conversation(actor, conversation_id, patch)
    }

    pub fn add_participant(
        &self,
        actor: &Actor,
        conversation_id: &Uuid,
        participant: NewParticipant,
    ) -> Result<Conversation> {
        let thread = self.thread(conversation_id)?;
        let mut t = thread.lock();
        if t.conversation.kind == ConversationKind::Direct {
            return Err(SyncError::validation("direct conversations have exactly two participants"));
        }
        require_owner(&t.conversation, &actor.user_id)?;
        let now = self.now();
        let mut updated = t.conversation.clone();
        match updated.participant_mut(&participant.user_id) {
            Some(p) if p.is_active() => return Ok(updated),
            Some(p) => {
                p.left_at = None;
                p.joined_at = now;
                p.unread_count = 0;
                p.display_name = participant.display_name;
            }
            None => updated
                .participants
                .push(new_participant(participant, ParticipantRole::Member, now)),
        }
        self.commit_conversation(&mut t, actor.session_id, updated)
    }

    /// Leave a group. The participant stays in the record for history.
    pub fn leave(&self, actor: &Actor, conversation_id: &Uuid) -> Result<Conversation> {
        let thread = self.thread(conversation_id)?;
        let mut t = thread.lock();
        if t.conversation.kind == ConversationKind::Direct {
            return Err(SyncError::validation("direct conversations cannot be left; archive instead"));
        }
        require_member(&t.conversation, &actor.user_id)?;
        let now = self.now();
        let mut updated = t.conversation.clone();
        let mut cleared = 0;
        let mut was_owner = false;
        if let Some(p) = updated.participant_mut(&actor.user_id) {
            cleared = p.unread_count;
            was_owner = p.role == ParticipantRole::Owner;
            p.left_at = Some(now);
            p.unread_count = 0;
        }
        let has_owner = updated
            .active_participants()
            .any(|p| p.role == ParticipantRole::Owner);
        if was_owner && !has_owner {
            // hand the group to the longest-standing remaining member
            if let Some(heir) = updated
                .participants
                .iter_mut()
                .filter(|p| p.is_active())
                .min_by_key(|p| p.joined_at)
            {
                heir.role = ParticipantRole::Owner;
            }
        }
        let updated = self.commit_conversation(&mut t, actor.session_id, updated)?;
        self.unread.subtract(actor.user_id, u64::from(cleared));
        if self.unread.active_conversation(&actor.user_id) == Some(*conversation_id) {
            self.unread.set_active(actor.user_id, None);
        }
        Ok(updated)
    }

    /// Replace a conversation with the server's copy (replica side).
    ///
    /// The local user's unread counters are kept, since they are maintained
    /// incrementally from events the replica already applied.
    pub fn upsert_conversation(&self, mut incoming: Conversation) -> Result<Conversation> {
        let mut threads = self.threads.write();
        if let Some(existing) = threads.get(&incoming.id) {
            let mut t = existing.lock();
            for p in incoming.participants.iter_mut() {
                if let Some(local) = t.conversation.participant(&p.user_id) {
                    p.unread_count = local.unread_count;
                }
            }
            if t.conversation.last_message_at > incoming.last_message_at {
                incoming.last_message_at = t.conversation.last_message_at;
                incoming.last_message_preview = t.conversation.last_message_preview.clone();
                incoming.last_message_sender = t.conversation.last_message_sender;
            }
            self.journal.save_conversation(&incoming)?;
            t.conversation = incoming.clone();
            return Ok(incoming);
        }
        self.journal.save_conversation(&incoming)?;
        for p in incoming.active_participants() {
            self.unread.add(p.user_id, u64::from(p.unread_count));
        }
        threads.insert(incoming.id, Arc::new(Mutex::new(Thread::new(incoming.clone()))));
        Ok(incoming)
    }

    pub fn conversation(&self, viewer: &Uuid, conversation_id: &Uuid) -> Result<Conversation> {
        let thread = self.thread(conversation_id)?;
        let t = thread.lock();
        if t.conversation.participant(viewer).is_none() {
            return Err(SyncError::forbidden("not a participant"));
        }
        Ok(t.conversation.clone())
    }

    pub fn list_conversations(&self, viewer: &Uuid, filter: &ConversationFilter) -> Vec<Conversation> {
        let threads: Vec<_> = self.threads.read().values().cloned().collect();
        let mut out: Vec<Conversation> = threads
            .iter()
            .filter_map(|thread| {
                let t = thread.lock();
                let c = &t.conversation;
                let me = c.participant(viewer).filter(|p| p.is_active())?;
                if c.is_archived != filter.archived {
                    return None;
                }
                match filter.filter {
                    ListFilter::Unread if me.unread_count == 0 => None,
                    ListFilter::Group if c.kind != ConversationKind::Group => None,
                    _ => Some(c.clone()),
                }
            })
            .collect();
        out.sort_by(listing_order);
        out
    }

    /// Conversations the user is an active member of.
    pub fn conversation_ids_for(&self, user_id: &Uuid) -> Vec<Uuid> {
        let threads: Vec<_> = self.threads.read().values().cloned().collect();
        threads
            .iter()
            .filter_map(|thread| {
                let t = thread.lock();
                t.conversation
                    .is_active_member(user_id)
                    .then_some(t.conversation.id)
            })
            .collect()
    }

    pub fn is_active_member(&self, conversation_id: &Uuid, user_id: &Uuid) -> bool {
        self.thread(conversation_id)
            .map(|t| t.lock().conversation.is_active_member(user_id))
            .unwrap_or(false)
    }

    pub fn display_name(&self, conversation_id: &Uuid, user_id: &Uuid) -> Option<String> {
        let thread = self.thread(conversation_id).ok()?;
        let t = thread.lock();
        t.conversation
            .participant(user_id)
            .map(|p| p.display_name.clone())
    }

    // ---- messages ----

    /// History page, oldest first: the newest `limit` messages strictly
    /// before the cursor.
    pub fn list_messages(
        &self,
        viewer: &Uuid,
        conversation_id: &Uuid,
        before: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let thread = self.thread(conversation_id)?;
        let t = thread.lock();
        if t.conversation.participant(viewer).is_none() {
            return Err(SyncError::forbidden("not a participant"));
        }
        let upper = match before {
            None => Bound::Unbounded,
            Some(Cursor::Timestamp(ts)) => Bound::Excluded((ts, Uuid::nil())),
            Some(Cursor::Id(id)) => {
                let ts = t
                    .index
                    .get(&id)
                    .ok_or_else(|| SyncError::not_found("message", id))?;
                Bound::Excluded((*ts, id))
            }
        };
        let mut page: Vec<Message> = t
            .messages
            .range((Bound::Unbounded, upper))
            .rev()
            .take(limit.clamp(1, MAX_PAGE))
            .map(|(_, m)| m.clone())
            .collect();
        page.reverse();
        Ok(page)
    }

    pub fn message(&self, viewer: &Uuid, message_id: &Uuid) -> Result<Message> {
        let thread = self.thread_of_message(message_id)?;
        let t = thread.lock();
        if t.conversation.participant(viewer).is_none() {
            return Err(SyncError::forbidden("not a participant"));
        }
        t.get(message_id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("message", *message_id))
    }

    /// Validate and commit a message from an active participant.
    pub fn send_message(
        &self,
        actor: &Actor,
        conversation_id: &Uuid,
        draft: NewMessage,
    ) -> Result<AppendOutcome> {
        let thread = self.thread(conversation_id)?;
        let mut t = thread.lock();
        if !t.conversation.is_active_member(&actor.user_id) {
            return Err(SyncError::forbidden("not a participant"));
        }
        if let Some(id) = draft.id {
            if let Some(existing) = t.get(&id) {
                return Ok(AppendOutcome::Duplicate(existing.clone()));
            }
            if self.message_index.read().contains_key(&id) {
                return Err(SyncError::conflict("message id already used in another conversation"));
            }
        }
        if matches!(draft.message_type, MessageType::System | MessageType::Call) {
            return Err(SyncError::validation("system and call messages are server generated"));
        }
        let content = non_empty(draft.content);
        if content.is_none() && draft.attachments.is_empty() {
            return Err(SyncError::validation("empty_message"));
        }
        if content
            .as_deref()
            .is_some_and(|c| c.chars().count() > MAX_CONTENT_CHARS)
        {
            return Err(SyncError::validation("message too long"));
        }
        if let Some(reply) = draft.reply_to_id {
            if t.get(&reply).is_none() {
                return Err(SyncError::validation("reply target is not in this conversation"));
            }
        }
        let attachments = draft
            .attachments
            .into_iter()
            .map(|mut a| {
                if a.id.is_nil() {
                    a.id = Uuid::new_v4();
                }
                a
            })
            .collect();
        let message = Message {
            id: draft.id.unwrap_or_else(Uuid::new_v4),
            conversation_id: *conversation_id,
            sender_id: actor.user_id,
            content,
            message_type: draft.message_type,
            reply_to_id: draft.reply_to_id,
            forwarded_from_id: draft.forwarded_from_id,
            reactions: BTreeMap::new(),
            is_edited: false,
            is_deleted: false,
            delivered_to: Default::default(),
            read_by: Default::default(),
            attachments,
            created_at: t.next_created_at(self.now()),
            edited_at: None,
        };
        self.append_locked(&mut t, actor.session_id, message, true)
    }

    /// Idempotent entry point for locally sent and remotely received messages.
    pub fn append_message(&self, origin: Option<Uuid>, message: Message) -> Result<AppendOutcome> {
        let thread = self.thread(&message.conversation_id)?;
        let mut t = thread.lock();
        if let Some(existing) = t.get(&message.id) {
            return Ok(AppendOutcome::Duplicate(existing.clone()));
        }
        self.check_unclaimed(&message)?;
        if let Some(reply) = message.reply_to_id {
            let owner = self.message_index.read().get(&reply).copied();
            if owner.is_some_and(|c| c != message.conversation_id) {
                return Err(SyncError::validation("reply target is not in this conversation"));
            }
        }
        self.append_locked(&mut t, origin, message, true)
    }

    /// A message id names one message in one conversation.
    fn check_unclaimed(&self, message: &Message) -> Result<()> {
        match self.message_index.read().get(&message.id) {
            Some(owner) if *owner != message.conversation_id => Err(SyncError::conflict(
                "message id already used in another conversation",
            )),
            _ => Ok(()),
        }
    }

    /// Insert a message new to this thread. With `count_unread` false the
    /// message is history the unread counters already account for.
    fn append_locked(
        &self,
        t: &mut Thread,
        origin: Option<Uuid>,
        message: Message,
        count_unread: bool,
    ) -> Result<AppendOutcome> {
        let mut conversation = t.conversation.clone();
        if conversation
            .last_message_at
            .map_or(true, |at| message.created_at >= at)
        {
            conversation.last_message_at = Some(message.created_at);
            conversation.last_message_preview = Some(preview::preview(&message));
            conversation.last_message_sender = Some(message.sender_id);
        }
        let mut bumped = Vec::new();
        for p in conversation.participants.iter_mut().filter(|p| {
            count_unread
                && p.is_active()
                && p.user_id != message.sender_id
                && !message.read_by.contains(&p.user_id)
        }) {
            if self.unread.active_conversation(&p.user_id) != Some(conversation.id) {
                p.unread_count += 1;
                bumped.push(p.user_id);
            }
        }
        self.journal
            .save_messages(std::slice::from_ref(&message), Some(&conversation))?;
        for user in bumped {
            self.unread.add(user, 1);
        }
        t.conversation = conversation;
        t.insert(message.clone());
        self.message_index
            .write()
            .insert(message.id, message.conversation_id);
        debug!(conversation_id = %message.conversation_id, message_id = %message.id, "message appended");
        self.emit(
            t,
            origin,
            ServerEvent::NewMessage {
                message: message.clone(),
            },
        );
        Ok(AppendOutcome::Appended(message))
    }

    /// Replace a stored message and refresh the preview if it is the newest.
    fn commit_message(
        &self,
        t: &mut Thread,
        origin: Option<Uuid>,
        updated: Message,
    ) -> Result<Message> {
        let conversation = if t.newest().map(|m| m.id) == Some(updated.id) {
            let mut c = t.conversation.clone();
            c.last_message_at = Some(updated.created_at);
            c.last_message_preview = Some(preview::preview(&updated));
            Some(c)
        } else {
            None
        };
        self.journal
            .save_messages(std::slice::from_ref(&updated), conversation.as_ref())?;
        if let Some(c) = conversation {
            t.conversation = c;
        }
        if let Some(slot) = t.get_mut(&updated.id) {
            *slot = updated.clone();
        }
        self.emit(
            t,
            origin,
            ServerEvent::MessageUpdated {
                message: updated.clone(),
            },
        );
        Ok(updated)
    }

    fn locked_message(t: &Thread, message_id: &Uuid) -> Result<Message> {
        t.get(message_id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("message", *message_id))
    }

    pub fn edit_message(&self, actor: &Actor, message_id: &Uuid, content: &str) -> Result<Message> {
        let thread = self.thread_of_message(message_id)?;
        let mut t = thread.lock();
        let current = Self::locked_message(&t, message_id)?;
        if current.sender_id != actor.user_id {
            return Err(SyncError::forbidden("only the sender can edit a message"));
        }
        if current.is_deleted {
            return Err(SyncError::validation("deleted messages cannot be edited"));
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::validation("empty_message"));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(SyncError::validation("message too long"));
        }
        if current.content.as_deref() == Some(content) {
            return Ok(current);
        }
        let mut updated = current;
        updated.content = Some(content.to_string());
        updated.is_edited = true;
        updated.edited_at = Some(self.now());
        self.commit_message(&mut t, actor.session_id, updated)
    }

    /// Soft delete: the row stays in place as a tombstone.
    pub fn delete_message(&self, actor: &Actor, message_id: &Uuid) -> Result<Message> {
        let thread = self.thread_of_message(message_id)?;
        let mut t = thread.lock();
        let current = Self::locked_message(&t, message_id)?;
        let is_owner = t
            .conversation
            .participant(&actor.user_id)
            .is_some_and(|p| p.is_active() && p.role == ParticipantRole::Owner);
        if current.sender_id != actor.user_id && !is_owner {
            return Err(SyncError::forbidden("only the sender or an owner can delete a message"));
        }
        if current.is_deleted {
            return Ok(current);
        }
        let mut updated = current;
        updated.content = None;
        updated.attachments.clear();
        updated.is_deleted = true;
        self.commit_message(&mut t, actor.session_id, updated)
    }

    /// Toggle the caller's membership in the user set of `emoji`.
    pub fn toggle_reaction(&self, actor: &Actor, message_id: &Uuid, emoji: &str) -> Result<Message> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
            return Err(SyncError::validation("invalid reaction"));
        }
        let thread = self.thread_of_message(message_id)?;
        let mut t = thread.lock();
        require_member(&t.conversation, &actor.user_id)?;
        let mut updated = Self::locked_message(&t, message_id)?;
        if updated.is_deleted {
            return Err(SyncError::validation("cannot react to a deleted message"));
        }
        let users = updated.reactions.entry(emoji.to_string()).or_default();
        if !users.remove(&actor.user_id) {
            users.insert(actor.user_id);
        }
        if users.is_empty() {
            updated.reactions.remove(emoji);
        }
        self.commit_message(&mut t, actor.session_id, updated)
    }

    /// Copy a message into each target. Failures do not undo earlier copies.
    pub fn forward_message(
        &self,
        actor: &Actor,
        message_id: &Uuid,
        targets: &[Uuid],
    ) -> Result<ForwardReport> {
        let source = self.message(&actor.user_id, message_id)?;
        if source.is_deleted {
            return Err(SyncError::validation("cannot forward a deleted message"));
        }
        if targets.is_empty() {
            return Err(SyncError::validation("no target conversations"));
        }
        let mut report = ForwardReport::default();
        let mut seen = HashSet::new();
        for target in targets.iter().filter(|t| seen.insert(**t)) {
            let draft = NewMessage {
                id: None,
                content: source.content.clone(),
                message_type: match source.message_type {
                    MessageType::System | MessageType::Call => MessageType::Text,
                    other => other,
                },
                reply_to_id: None,
                attachments: source
                    .attachments
                    .iter()
                    .map(|a| Attachment {
                        id: Uuid::new_v4(),
                        ..a.clone()
                    })
                    .collect(),
                forwarded_from_id: Some(source.id),
            };
            match self.send_message(actor, target, draft) {
                Ok(outcome) => report.forwarded.push(outcome.into_message()),
                Err(e) => {
                    warn!(conversation_id = %target, error = %e, "forward target failed");
                    report.failed.push(ForwardFailure {
                        conversation_id: *target,
                        code: e.code().into(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Merge a remote copy of a message into the local one (replica side).
    ///
    /// The id and sender never change; the position follows the remote
    /// timestamp, which is authoritative. Tombstones and edit flags are
    /// sticky and receipt sets only grow. A message not held locally is
    /// inserted as history: unread counters come from the conversation
    /// snapshot and are left alone.
    pub fn merge_message(&self, origin: Option<Uuid>, remote: Message) -> Result<Message> {
        let thread = self.thread(&remote.conversation_id)?;
        let mut t = thread.lock();
        let Some(local) = t.get(&remote.id).cloned() else {
            self.check_unclaimed(&remote)?;
            return self
                .append_locked(&mut t, origin, remote, false)
                .map(AppendOutcome::into_message);
        };
        let mut merged = remote;
        merged.sender_id = local.sender_id;
        merged.is_deleted |= local.is_deleted;
        merged.is_edited |= local.is_edited;
        if merged.is_deleted {
            merged.content = None;
            merged.attachments.clear();
        }
        merged.delivered_to.extend(local.delivered_to.iter().copied());
        merged.read_by.extend(local.read_by.iter().copied());
        if merged == local {
            return Ok(local);
        }
        if merged.created_at != local.created_at {
            t.messages.remove(&local.order_key());
            t.insert(merged.clone());
        }
        self.commit_message(&mut t, origin, merged)
    }

    /// Append the call-log entry for a call that reached a terminal state.
    pub fn log_call(&self, call: &CallSession) -> Result<AppendOutcome> {
        let thread = self.thread(&call.conversation_id)?;
        let mut t = thread.lock();
        let id = Uuid::new_v5(&call.id, b"call-log");
        if let Some(existing) = t.get(&id) {
            return Ok(AppendOutcome::Duplicate(existing.clone()));
        }
        let message = Message {
            id,
            conversation_id: call.conversation_id,
            sender_id: call.caller_id,
            content: Some(call_summary(call)),
            message_type: MessageType::Call,
            reply_to_id: None,
            forwarded_from_id: None,
            reactions: BTreeMap::new(),
            is_edited: false,
            is_deleted: false,
            delivered_to: Default::default(),
            read_by: Default::default(),
            attachments: Vec::new(),
            created_at: t.next_created_at(self.now()),
            edited_at: None,
        };
        self.append_locked(&mut t, None, message, true)
    }
}

fn call_summary(call: &CallSession) -> String {
    let kind = match call.call_type {
        CallType::Audio => "audio",
        CallType::Video => "video",
    };
    match call.status {
        CallStatus::Ended => {
            let secs = call.duration_seconds.unwrap_or(0);
            let label = if kind == "audio" { "Audio" } else { "Video" };
            format!("{label} call ({}:{:02})", secs / 60, secs % 60)
        }
        CallStatus::Missed => format!("Missed {kind} call"),
        CallStatus::NoAnswer => format!("Unanswered {kind} call"),
        CallStatus::Declined => format!("Declined {kind} call"),
        CallStatus::Ringing | CallStatus::Ongoing => format!("Ongoing {kind} call"),
    }
}

fn new_participant(p: NewParticipant, role: ParticipantRole, now: Timestamp) -> Participant {
    Participant {
        user_id: p.user_id,
        display_name: p.display_name,
        participant_type: p.participant_type,
        role,
        unread_count: 0,
        is_muted: false,
        last_seen_at: None,
        is_online: false,
        joined_at: now,
        left_at: None,
    }
}

fn require_member(c: &Conversation, user: &Uuid) -> Result<()> {
    if c.is_active_member(user) {
        Ok(())
    } else {
        Err(SyncError::forbidden("not a participant"))
    }
}

fn require_owner(c: &Conversation, user: &Uuid) -> Result<()> {
    match c.participant(user) {
        Some(p) if p.is_active() && p.role == ParticipantRole::Owner => Ok(()),
        Some(p) if p.is_active() => Err(SyncError::forbidden("only an owner can do this")),
        _ => Err(SyncError::forbidden("not a participant")),
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SyncError::validation("group name is required"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(SyncError::validation("group name too long"));
    }
    Ok(name.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
