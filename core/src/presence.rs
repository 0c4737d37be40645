use crate::clock::Clock;
use chat_proto::{Conversation, PresenceRecord, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Result of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub record: PresenceRecord,
    /// The user was offline (or unknown) before this heartbeat.
    pub came_online: bool,
}

/// Last-seen bookkeeping. Online status is never stored; it is derived from
/// the last heartbeat and the timeout each time it is read.
pub struct PresenceService {
    last_seen: RwLock<HashMap<Uuid, Timestamp>>,
    timeout_ms: i64,
    clock: Arc<dyn Clock>,
}

impl PresenceService {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            last_seen: RwLock::new(HashMap::new()),
            timeout_ms: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
            clock,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(0) as u64)
    }

    fn online_at(&self, last_seen: Timestamp, now: Timestamp) -> bool {
        now.saturating_sub(last_seen) < self.timeout_ms
    }

    pub fn heartbeat(&self, user_id: Uuid) -> Heartbeat {
        let now = self.clock.now_ms();
        let previous = self.last_seen.write().insert(user_id, now);
        Heartbeat {
            record: PresenceRecord {
                user_id,
                last_seen_at: Some(now),
                is_online: true,
            },
            came_online: previous.map_or(true, |p| !self.online_at(p, now)),
        }
    }

    /// Fold in a last-seen time learned from elsewhere. Never moves backwards.
    pub fn observe(&self, user_id: Uuid, last_seen: Timestamp) {
        let mut map = self.last_seen.write();
        let slot = map.entry(user_id).or_insert(last_seen);
        *slot = (*slot).max(last_seen);
    }

    pub fn is_online(&self, user_id: &Uuid) -> bool {
        let now = self.clock.now_ms();
        self.last_seen
            .read()
            .get(user_id)
            .is_some_and(|seen| self.online_at(*seen, now))
    }

    pub fn record(&self, user_id: &Uuid) -> PresenceRecord {
        let now = self.clock.now_ms();
        let last_seen_at = self.last_seen.read().get(user_id).copied();
        PresenceRecord {
            user_id: *user_id,
            last_seen_at,
            is_online: last_seen_at.is_some_and(|seen| self.online_at(seen, now)),
        }
    }

    pub fn snapshot<'a>(&self, users: impl IntoIterator<Item = &'a Uuid>) -> Vec<PresenceRecord> {
        users.into_iter().map(|u| self.record(u)).collect()
    }

    /// Fill the derived presence fields of every participant.
    pub fn decorate(&self, conversation: &mut Conversation) {
        for p in conversation.participants.iter_mut() {
            let record = self.record(&p.user_id);
            p.last_seen_at = record.last_seen_at;
            p.is_online = record.is_online;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn service() -> (PresenceService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (
            PresenceService::new(Duration::from_secs(60), clock.clone()),
            clock,
        )
    }

    #[test]
    fn online_follows_heartbeat_and_timeout() {
        let (presence, clock) = service();
        let user = Uuid::new_v4();
        assert!(!presence.is_online(&user));
        assert!(presence.heartbeat(user).came_online);
        clock.advance(30_000);
        assert!(presence.is_online(&user));
        assert!(!presence.heartbeat(user).came_online);
        clock.advance(60_000);
        assert!(!presence.is_online(&user));
        assert_eq!(presence.record(&user).last_seen_at, Some(1_030_000));
        assert!(presence.heartbeat(user).came_online);
    }

    #[test]
    fn observe_never_moves_backwards() {
        let (presence, _) = service();
        let user = Uuid::new_v4();
        presence.observe(user, 500);
        presence.observe(user, 100);
        assert_eq!(presence.record(&user).last_seen_at, Some(500));
    }

    #[test]
    fn decorate_fills_participants() {
        let (presence, _) = service();
        let user = Uuid::new_v4();
        presence.heartbeat(user);
        let mut conv = Conversation {
            id: Uuid::new_v4(),
            kind: chat_proto::ConversationKind::Direct,
            scope: Default::default(),
            name: None,
            avatar_url: None,
            description: None,
            created_at: 0,
            last_message_at: None,
            last_message_preview: None,
            last_message_sender: None,
            is_archived: false,
            participants: vec![chat_proto::Participant {
                user_id: user,
                display_name: "A".into(),
                participant_type: Default::default(),
                role: Default::default(),
                unread_count: 0,
                is_muted: false,
                last_seen_at: None,
                is_online: false,
                joined_at: 0,
                left_at: None,
            }],
        };
        presence.decorate(&mut conv);
        assert!(conv.participants[0].is_online);
    }
}
