//! Client-side replica of the conversations a user can see.
//!
//! A replica applies local actions optimistically and merges server events
//! through the same idempotent store operations, so an event that arrives both
//! as an echo and from the optimistic path leaves a single copy behind.
//! Failures never propagate out of [`Replica::apply`]; they land in a single
//! error slot the UI can render as a retry affordance.

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SyncError};
use crate::presence::PresenceService;
use crate::store::{Actor, ConversationStore, NewMessage};
use crate::typing::{TypingChange, TypingTracker};
use chat_proto::{
    CallSession, Conversation, EventFrame, Features, Message, PresenceRecord, ServerEvent,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Replica {
    user_id: Uuid,
    store: Arc<ConversationStore>,
    typing: TypingTracker,
    presence: PresenceService,
    calls: RwLock<HashMap<Uuid, CallSession>>,
    last_seq: Mutex<HashMap<Uuid, u64>>,
    stale: Mutex<BTreeSet<Uuid>>,
    session_id: Mutex<Option<Uuid>>,
    last_error: Mutex<Option<SyncError>>,
}

impl Replica {
    pub fn new(user_id: Uuid) -> Self {
        Self::with_clock(user_id, &Features::default(), Arc::new(SystemClock))
    }

    pub fn with_clock(user_id: Uuid, features: &Features, clock: Arc<dyn Clock>) -> Self {
        let ttl = Duration::from_secs(features.typing_ttl_secs);
        Self {
            user_id,
            store: Arc::new(ConversationStore::new().with_clock(clock.clone())),
            typing: TypingTracker::new(ttl, Duration::ZERO, clock.clone()),
            presence: PresenceService::new(
                Duration::from_secs(features.heartbeat_timeout_secs),
                clock,
            ),
            calls: RwLock::new(HashMap::new()),
            last_seq: Mutex::new(HashMap::new()),
            stale: Mutex::new(BTreeSet::new()),
            session_id: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn session_id(&self) -> Option<Uuid> {
        *self.session_id.lock()
    }

    fn actor(&self) -> Actor {
        Actor {
            user_id: self.user_id,
            session_id: self.session_id(),
        }
    }

    // ---- error slot ----

    pub fn record_error(&self, error: SyncError) {
        warn!(error = %error, "sync error");
        *self.last_error.lock() = Some(error);
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.lock().clone()
    }

    pub fn take_error(&self) -> Option<SyncError> {
        self.last_error.lock().take()
    }

    // ---- snapshots from the REST read path ----

    pub fn load_conversations(&self, conversations: Vec<Conversation>) {
        for c in conversations {
            for p in &c.participants {
                if let Some(seen) = p.last_seen_at {
                    self.presence.observe(p.user_id, seen);
                }
            }
            if let Err(e) = self.store.upsert_conversation(c) {
                self.record_error(e);
            }
        }
    }

    /// Merge a page of history. Clears the stale mark of the conversation.
    pub fn load_messages(&self, conversation_id: &Uuid, messages: Vec<Message>) {
        for m in messages {
            if let Err(e) = self.store.merge_message(None, m) {
                self.record_error(e);
            }
        }
        self.stale.lock().remove(conversation_id);
    }

    // ---- local actions ----

    /// Apply a message locally before the server has seen it. The returned
    /// message carries the id the server copy must reuse.
    pub fn stage_message(&self, conversation_id: &Uuid, mut draft: NewMessage) -> Result<Message> {
        draft.id.get_or_insert_with(Uuid::new_v4);
        self.store
            .send_message(&self.actor(), conversation_id, draft)
            .map(|outcome| outcome.into_message())
    }

    /// The server accepted a staged message; adopt its copy.
    pub fn confirm_message(&self, message: Message) {
        if let Err(e) = self.store.merge_message(None, message) {
            self.record_error(e);
        }
    }

    /// Declare the conversation on screen. Focusing marks it read locally;
    /// the caller reports the read to the server.
    pub fn focus(&self, conversation_id: Option<Uuid>) -> Vec<Uuid> {
        self.store
            .set_active_conversation(self.user_id, conversation_id);
        let Some(conversation_id) = conversation_id else {
            return Vec::new();
        };
        match self.store.mark_read(&self.actor(), &conversation_id, None) {
            Ok(ids) => ids,
            Err(e) => {
                self.record_error(e);
                Vec::new()
            }
        }
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        let mut list = self
            .store
            .list_conversations(&self.user_id, &Default::default());
        for c in list.iter_mut() {
            self.presence.decorate(c);
        }
        list
    }

    pub fn total_unread(&self) -> u64 {
        self.store.total_unread(&self.user_id)
    }

    /// Other users typing in a conversation.
    pub fn typing_in(&self, conversation_id: &Uuid) -> Vec<(Uuid, String)> {
        self.typing.typing_in(conversation_id)
    }

    pub fn expire_typing(&self) -> usize {
        self.typing.sweep().len()
    }

    pub fn presence(&self, user_id: &Uuid) -> PresenceRecord {
        self.presence.record(user_id)
    }

    pub fn call(&self, call_id: &Uuid) -> Option<CallSession> {
        self.calls.read().get(call_id).cloned()
    }

    pub fn active_call(&self, conversation_id: &Uuid) -> Option<CallSession> {
        self.calls
            .read()
            .values()
            .find(|c| c.conversation_id == *conversation_id && !c.status.is_terminal())
            .cloned()
    }

    /// Conversations where a sequence gap was seen and history should be
    /// re-read through the polling path.
    pub fn stale_conversations(&self) -> Vec<Uuid> {
        self.stale.lock().iter().copied().collect()
    }

    pub fn mark_stale(&self, conversation_id: Uuid) {
        self.stale.lock().insert(conversation_id);
    }

    // ---- remote events ----

    fn track_seq(&self, conversation_id: Uuid, seq: u64) {
        let mut last = self.last_seq.lock();
        let previous = last.entry(conversation_id).or_insert(0);
        if *previous != 0 && seq > *previous + 1 {
            debug!(%conversation_id, expected = *previous + 1, got = seq, "sequence gap");
            self.stale.lock().insert(conversation_id);
        }
        *previous = (*previous).max(seq);
    }

    /// Merge one server frame. Never fails; errors go to the error slot.
    pub fn apply(&self, frame: &EventFrame) {
        if let (Some(seq), Some(conversation_id)) = (frame.seq, frame.event.conversation_id()) {
            self.track_seq(conversation_id, seq);
        }
        if let Err(e) = self.apply_event(&frame.event) {
            if let SyncError::NotFound { .. } = e {
                // the conversation is not loaded yet; catch up by polling
                if let Some(id) = frame.event.conversation_id() {
                    self.mark_stale(id);
                    return;
                }
            }
            self.record_error(e);
        }
    }

    fn apply_event(&self, event: &ServerEvent) -> Result<()> {
        match event {
            ServerEvent::Connected { session_id, .. } => {
                *self.session_id.lock() = Some(*session_id);
                // events may have been missed while disconnected
                let known: Vec<Uuid> = self.last_seq.lock().drain().map(|(id, _)| id).collect();
                self.stale.lock().extend(known);
            }
            ServerEvent::Pong { .. } | ServerEvent::Status { .. } => {}
            ServerEvent::NewMessage { message } => {
                self.store.append_message(None, message.clone())?;
                self.typing
                    .set_typing(message.conversation_id, message.sender_id, "", false);
            }
            ServerEvent::MessageUpdated { message } => {
                self.store.merge_message(None, message.clone())?;
            }
            ServerEvent::Receipts {
                conversation_id,
                user_id,
                kind,
                message_ids,
            } => {
                self.store
                    .apply_receipts(None, conversation_id, *user_id, *kind, message_ids)?;
            }
            ServerEvent::Typing {
                conversation_id,
                user_id,
                display_name,
                is_typing,
            } => {
                if *user_id != self.user_id {
                    let change = self.typing.set_typing(
                        *conversation_id,
                        *user_id,
                        display_name,
                        *is_typing,
                    );
                    if change == TypingChange::Started {
                        debug!(%conversation_id, %user_id, "typing started");
                    }
                }
            }
            ServerEvent::Presence {
                user_id,
                last_seen_at,
                ..
            } => {
                if let Some(seen) = last_seen_at {
                    self.presence.observe(*user_id, *seen);
                }
            }
            ServerEvent::CallUpdated { call } => {
                let mut calls = self.calls.write();
                let regress = calls
                    .get(&call.id)
                    .is_some_and(|known| known.status.is_terminal() && !call.status.is_terminal());
                if !regress {
                    calls.insert(call.id, call.clone());
                }
            }
            ServerEvent::ConversationUpdated { conversation } => {
                self.store.upsert_conversation(conversation.clone())?;
            }
            ServerEvent::Error { code, message } => {
                return Err(SyncError::Transport(format!("{code}: {message}")));
            }
        }
        Ok(())
    }
}
