//! Delivery and read receipts, unread counters and the per-user total.
//!
//! Per-conversation counters live on the participant records; the total is a
//! separate ledger adjusted by the same deltas, never recomputed by summing.
//! Both move under the conversation lock so they cannot drift apart.

use crate::error::{Result, SyncError};
use crate::store::{Actor, ConversationStore, Thread};
use chat_proto::{Message, ReadReceipts, ReceiptEntry, ReceiptKind, ServerEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
pub(crate) struct UnreadLedger {
    totals: Mutex<HashMap<Uuid, u64>>,
    active: Mutex<HashMap<Uuid, Uuid>>,
}

impl UnreadLedger {
    pub(crate) fn active_conversation(&self, user_id: &Uuid) -> Option<Uuid> {
        self.active.lock().get(user_id).copied()
    }

    pub(crate) fn set_active(&self, user_id: Uuid, conversation_id: Option<Uuid>) {
        let mut active = self.active.lock();
        match conversation_id {
            Some(c) => active.insert(user_id, c),
            None => active.remove(&user_id),
        };
    }

    pub(crate) fn add(&self, user_id: Uuid, n: u64) {
        if n > 0 {
            *self.totals.lock().entry(user_id).or_default() += n;
        }
    }

    pub(crate) fn subtract(&self, user_id: Uuid, n: u64) {
        if let Some(total) = self.totals.lock().get_mut(&user_id) {
            *total = total.saturating_sub(n);
        }
    }

    pub(crate) fn total(&self, user_id: &Uuid) -> u64 {
        self.totals.lock().get(user_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUnread {
    pub conversation_id: Uuid,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    pub total: u64,
    pub conversations: Vec<ConversationUnread>,
}

impl ConversationStore {
    /// Record which conversation the user currently has open. Messages
    /// arriving there do not count as unread for them.
    pub fn set_active_conversation(&self, user_id: Uuid, conversation_id: Option<Uuid>) {
        self.unread.set_active(user_id, conversation_id);
    }

    pub fn active_conversation(&self, user_id: &Uuid) -> Option<Uuid> {
        self.unread.active_conversation(user_id)
    }

    pub fn total_unread(&self, user_id: &Uuid) -> u64 {
        self.unread.total(user_id)
    }

    pub fn unread_summary(&self, user_id: &Uuid) -> UnreadSummary {
        let mut conversations: Vec<ConversationUnread> = self
            .list_conversations(user_id, &Default::default())
            .into_iter()
            .chain(self.list_conversations(
                user_id,
                &crate::store::ConversationFilter {
                    archived: true,
                    ..Default::default()
                },
            ))
            .filter_map(|c| {
                let unread_count = c.participant(user_id)?.unread_count;
                (unread_count > 0).then_some(ConversationUnread {
                    conversation_id: c.id,
                    unread_count,
                })
            })
            .collect();
        conversations.sort_by_key(|c| c.conversation_id);
        UnreadSummary {
            total: self.total_unread(user_id),
            conversations,
        }
    }

    /// Mark messages as delivered to the actor. `None` means every message in
    /// the conversation. Returns only the ids that were newly marked.
    pub fn mark_delivered(
        &self,
        actor: &Actor,
        conversation_id: &Uuid,
        message_ids: Option<&[Uuid]>,
    ) -> Result<Vec<Uuid>> {
        let thread = self.thread(conversation_id)?;
        let mut t = thread.lock();
        if !t.conversation.is_active_member(&actor.user_id) {
            return Err(SyncError::forbidden("not a participant"));
        }
        let user = actor.user_id;
        let pending = |m: &&Message| m.sender_id != user && !m.delivered_to.contains(&user);
        let changed: Vec<Message> = match message_ids {
            None => t.messages.values().filter(pending).cloned().collect(),
            Some(ids) => ids
                .iter()
                .filter_map(|id| t.get(id))
                .filter(pending)
                .cloned()
                .collect(),
        };
        let changed: Vec<Message> = changed
            .into_iter()
            .map(|mut m| {
                m.delivered_to.insert(user);
                m
            })
            .collect();
        self.commit_receipts(&mut t, actor, ReceiptKind::Delivered, changed, 0)
    }

    /// Mark everything up to and including `through` (or the newest message)
    /// as read. Reading through the newest message resets the actor's unread
    /// counter; reading through an older one only takes off the messages it
    /// newly marked.
    pub fn mark_read(
        &self,
        actor: &Actor,
        conversation_id: &Uuid,
        through: Option<Uuid>,
    ) -> Result<Vec<Uuid>> {
        let thread = self.thread(conversation_id)?;
        let mut t = thread.lock();
        let user = actor.user_id;
        let unread = match t.conversation.participant(&user) {
            Some(p) if p.is_active() => p.unread_count,
            _ => return Err(SyncError::forbidden("not a participant")),
        };
        let upper = match through {
            Some(id) => {
                let ts = *t
                    .index
                    .get(&id)
                    .ok_or_else(|| SyncError::not_found("message", id))?;
                Some((ts, id))
            }
            None => t.newest().map(Message::order_key),
        };
        let changed: Vec<Message> = match upper {
            Some(upper) => t
                .messages
                .range(..=upper)
                .map(|(_, m)| m)
                .filter(|m| m.sender_id != user && !m.read_by.contains(&user))
                .map(|m| {
                    let mut m = m.clone();
                    m.read_by.insert(user);
                    m
                })
                .collect(),
            None => Vec::new(),
        };
        let reaches_newest = upper.is_none() || upper == t.newest().map(Message::order_key);
        let cleared = cleared_unread(unread, reaches_newest, changed.len());
        self.commit_receipts(&mut t, actor, ReceiptKind::Read, changed, cleared)
    }

    /// Merge receipts observed elsewhere (another device, the server) into
    /// the local copy. A read receipt covering the newest message clears the
    /// participant's counter; older ones take off what they newly mark.
    pub fn apply_receipts(
        &self,
        origin: Option<Uuid>,
        conversation_id: &Uuid,
        user_id: Uuid,
        kind: ReceiptKind,
        message_ids: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        let thread = self.thread(conversation_id)?;
        let mut t = thread.lock();
        let changed: Vec<Message> = message_ids
            .iter()
            .filter_map(|id| t.get(id))
            .filter(|m| {
                let set = match kind {
                    ReceiptKind::Delivered => &m.delivered_to,
                    ReceiptKind::Read => &m.read_by,
                };
                !set.contains(&user_id)
            })
            .map(|m| {
                let mut m = m.clone();
                match kind {
                    ReceiptKind::Delivered => m.delivered_to.insert(user_id),
                    ReceiptKind::Read => m.read_by.insert(user_id),
                };
                m
            })
            .collect();
        let cleared = match kind {
            ReceiptKind::Read => {
                let unread = t
                    .conversation
                    .participant(&user_id)
                    .map_or(0, |p| p.unread_count);
                let reaches_newest = t.newest().map_or(true, |m| message_ids.contains(&m.id));
                cleared_unread(unread, reaches_newest, changed.len())
            }
            ReceiptKind::Delivered => 0,
        };
        let actor = Actor {
            user_id,
            session_id: origin,
        };
        self.commit_receipts(&mut t, &actor, kind, changed, cleared)
    }

    /// `cleared` is how much comes off the actor's unread counter.
    fn commit_receipts(
        &self,
        t: &mut Thread,
        actor: &Actor,
        kind: ReceiptKind,
        changed: Vec<Message>,
        cleared: u32,
    ) -> Result<Vec<Uuid>> {
        let conversation = (cleared > 0).then(|| {
            let mut c = t.conversation.clone();
            if let Some(p) = c.participant_mut(&actor.user_id) {
                p.unread_count = p.unread_count.saturating_sub(cleared);
            }
            c
        });
        if changed.is_empty() && conversation.is_none() {
            return Ok(Vec::new());
        }
        self.journal().save_messages(&changed, conversation.as_ref())?;
        if let Some(c) = conversation {
            t.conversation = c;
            self.unread.subtract(actor.user_id, u64::from(cleared));
        }
        let ids: Vec<Uuid> = changed.iter().map(|m| m.id).collect();
        for m in changed {
            if let Some(slot) = t.get_mut(&m.id) {
                *slot = m;
            }
        }
        if !ids.is_empty() {
            let conversation_id = t.conversation.id;
            self.emit(
                t,
                actor.session_id,
                ServerEvent::Receipts {
                    conversation_id,
                    user_id: actor.user_id,
                    kind,
                    message_ids: ids.clone(),
                },
            );
        }
        Ok(ids)
    }

    /// Who received and who read a message. The denominator counts current
    /// participants except the sender; users who left stay listed.
    pub fn read_receipts(&self, viewer: &Uuid, message_id: &Uuid) -> Result<ReadReceipts> {
        let thread = self.thread_of_message(message_id)?;
        let t = thread.lock();
        if t.conversation.participant(viewer).is_none() {
            return Err(SyncError::forbidden("not a participant"));
        }
        let message = t
            .get(message_id)
            .ok_or_else(|| SyncError::not_found("message", *message_id))?;
        let entry = |user_id: &Uuid| match t.conversation.participant(user_id) {
            Some(p) => ReceiptEntry {
                user_id: *user_id,
                display_name: p.display_name.clone(),
                has_left: !p.is_active(),
            },
            None => ReceiptEntry {
                user_id: *user_id,
                display_name: String::new(),
                has_left: true,
            },
        };
        let delivered_to: Vec<ReceiptEntry> = message.delivered_to.iter().map(entry).collect();
        let read_by: Vec<ReceiptEntry> = message.read_by.iter().map(entry).collect();
        let total_participants = t
            .conversation
            .active_participants()
            .filter(|p| p.user_id != message.sender_id)
            .count();
        Ok(ReadReceipts {
            message_id: *message_id,
            delivered_count: delivered_to.len(),
            read_count: read_by.len(),
            delivered_to,
            read_by,
            total_participants,
        })
    }
}

/// How much of an unread counter a read receipt takes off.
fn cleared_unread(unread: u32, reaches_newest: bool, newly_read: usize) -> u32 {
    if reaches_newest {
        unread
    } else {
        unread.min(u32::try_from(newly_read).unwrap_or(u32::MAX))
    }
}
