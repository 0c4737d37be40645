use crate::clock::Clock;
use chat_proto::Timestamp;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What a typing signal changed, and therefore whether to broadcast it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingChange {
    Started,
    /// Still typing and the debounce window passed; re-announce.
    Refreshed,
    Stopped,
    Unchanged,
}

impl TypingChange {
    pub fn should_broadcast(self) -> bool {
        !matches!(self, TypingChange::Unchanged)
    }
}

/// A typing indicator that lapsed without an explicit stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingExpired {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
}

struct Entry {
    display_name: String,
    expires_at: Timestamp,
    announced_at: Timestamp,
}

/// Ephemeral who-is-typing state with a TTL per indicator.
pub struct TypingTracker {
    active: Mutex<HashMap<Uuid, HashMap<Uuid, Entry>>>,
    ttl_ms: i64,
    debounce_ms: i64,
    clock: Arc<dyn Clock>,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl TypingTracker {
    pub fn new(ttl: Duration, debounce: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            ttl_ms: millis(ttl),
            debounce_ms: millis(debounce),
            clock,
        }
    }

    pub fn set_typing(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        display_name: &str,
        is_typing: bool,
    ) -> TypingChange {
        let now = self.clock.now_ms();
        let mut guard = self.active.lock();
        if !is_typing {
            let removed = guard
                .get_mut(&conversation_id)
                .and_then(|users| users.remove(&user_id))
                .is_some();
            if guard.get(&conversation_id).is_some_and(HashMap::is_empty) {
                guard.remove(&conversation_id);
            }
            return if removed {
                TypingChange::Stopped
            } else {
                TypingChange::Unchanged
            };
        }
        let users = guard.entry(conversation_id).or_default();
        match users.get_mut(&user_id) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now.saturating_add(self.ttl_ms);
                if now - entry.announced_at >= self.debounce_ms {
                    entry.announced_at = now;
                    TypingChange::Refreshed
                } else {
                    TypingChange::Unchanged
                }
            }
            _ => {
                users.insert(
                    user_id,
                    Entry {
                        display_name: display_name.to_string(),
                        expires_at: now.saturating_add(self.ttl_ms),
                        announced_at: now,
                    },
                );
                TypingChange::Started
            }
        }
    }

    /// Users currently typing in a conversation, by display name.
    pub fn typing_in(&self, conversation_id: &Uuid) -> Vec<(Uuid, String)> {
        let now = self.clock.now_ms();
        let guard = self.active.lock();
        let mut out: Vec<(Uuid, String)> = guard
            .get(conversation_id)
            .into_iter()
            .flat_map(|users| users.iter())
            .filter(|(_, e)| e.expires_at > now)
            .map(|(id, e)| (*id, e.display_name.clone()))
            .collect();
        out.sort();
        out
    }

    /// Drop lapsed indicators and report them so a stop can be broadcast.
    pub fn sweep(&self) -> Vec<TypingExpired> {
        let now = self.clock.now_ms();
        let mut expired = Vec::new();
        let mut guard = self.active.lock();
        guard.retain(|conversation_id, users| {
            users.retain(|user_id, e| {
                if e.expires_at > now {
                    return true;
                }
                expired.push(TypingExpired {
                    conversation_id: *conversation_id,
                    user_id: *user_id,
                    display_name: std::mem::take(&mut e.display_name),
                });
                false
            });
            !users.is_empty()
        });
        expired
    }

    /// Remove every indicator of a user, e.g. when their last session closes.
    pub fn clear_user(&self, user_id: &Uuid) -> Vec<TypingExpired> {
        let mut cleared = Vec::new();
        let mut guard = self.active.lock();
        guard.retain(|conversation_id, users| {
            if let Some(e) = users.remove(user_id) {
                cleared.push(TypingExpired {
                    conversation_id: *conversation_id,
                    user_id: *user_id,
                    display_name: e.display_name,
                });
            }
            !users.is_empty()
        });
        cleared
    }
}
