//! Call signaling: the per-conversation call state machine.
//!
//! ```text
//! ringing --answer--> ongoing --end--> ended
//! ringing --decline--> declined
//! ringing --end--> missed
//! ringing --ring timeout--> no_answer
//! ```
//!
//! Media never flows through here; participants get a token for an external
//! media room instead.

use crate::error::{Result, SyncError};
use crate::store::{Actor, ConversationStore};
use chat_proto::{CallSession, CallStatus, CallType, MediaToken, ServerEvent, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Issues credentials for the external media room of a call.
pub trait MediaTokenIssuer: Send + Sync {
    fn issue(&self, call: &CallSession, user_id: Uuid, now: Timestamp) -> Result<MediaToken>;
}

/// Issuer producing random opaque tokens, for tests and local setups
/// without a media provider.
#[derive(Debug, Clone, Copy)]
pub struct OpaqueTokenIssuer {
    pub ttl: Duration,
}

impl Default for OpaqueTokenIssuer {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
        }
    }
}

impl MediaTokenIssuer for OpaqueTokenIssuer {
    fn issue(&self, call: &CallSession, _user_id: Uuid, now: Timestamp) -> Result<MediaToken> {
        Ok(MediaToken {
            call_id: call.id,
            media_room: call.media_room.clone(),
            token: Uuid::new_v4().simple().to_string(),
            expires_at: now + self.ttl.as_millis() as i64,
        })
    }
}

#[derive(Default)]
struct CallBook {
    calls: HashMap<Uuid, CallSession>,
    active_by_conversation: HashMap<Uuid, Uuid>,
}

pub struct CallCoordinator {
    store: Arc<ConversationStore>,
    issuer: Arc<dyn MediaTokenIssuer>,
    book: Mutex<CallBook>,
}

impl CallCoordinator {
    pub fn new(store: Arc<ConversationStore>, issuer: Arc<dyn MediaTokenIssuer>) -> Self {
        Self {
            store,
            issuer,
            book: Mutex::new(CallBook::default()),
        }
    }

    pub fn restore(&self, calls: Vec<CallSession>) {
        let mut book = self.book.lock();
        for call in calls {
            if !call.status.is_terminal() {
                book.active_by_conversation
                    .insert(call.conversation_id, call.id);
            }
            book.calls.insert(call.id, call);
        }
    }

    pub fn initiate(
        &self,
        actor: &Actor,
        conversation_id: &Uuid,
        call_type: CallType,
    ) -> Result<CallSession> {
        // surfaces not_found before forbidden
        self.store.conversation(&actor.user_id, conversation_id)?;
        if !self.store.is_active_member(conversation_id, &actor.user_id) {
            return Err(SyncError::forbidden("not a participant"));
        }
        let mut book = self.book.lock();
        if let Some(existing) = book
            .active_by_conversation
            .get(conversation_id)
            .and_then(|id| book.calls.get(id))
        {
            if !existing.status.is_terminal() {
                return Err(SyncError::conflict("a call is already in progress"));
            }
        }
        let id = Uuid::new_v4();
        let call = CallSession {
            id,
            conversation_id: *conversation_id,
            call_type,
            caller_id: actor.user_id,
            media_room: format!("call-{id}"),
            status: CallStatus::Ringing,
            started_at: self.store.clock().now_ms(),
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
        };
        let call = self.commit(&mut book, actor.session_id, call)?;
        info!(call_id = %call.id, conversation_id = %call.conversation_id, "call ringing");
        Ok(call)
    }

    pub fn answer(&self, actor: &Actor, call_id: &Uuid) -> Result<CallSession> {
        self.transition(actor, call_id, |call, now| {
            if call.status != CallStatus::Ringing {
                return Err(invalid(call, "answer"));
            }
            if call.caller_id == actor.user_id {
                return Err(SyncError::forbidden("the caller cannot answer their own call"));
            }
            Ok(CallSession {
                status: CallStatus::Ongoing,
                answered_at: Some(now),
                ..call.clone()
            })
        })
    }

    pub fn decline(&self, actor: &Actor, call_id: &Uuid) -> Result<CallSession> {
        self.transition(actor, call_id, |call, now| {
            if call.status != CallStatus::Ringing {
                return Err(invalid(call, "decline"));
            }
            if call.caller_id == actor.user_id {
                return Err(SyncError::forbidden("the caller cannot decline; end the call instead"));
            }
            Ok(CallSession {
                status: CallStatus::Declined,
                ended_at: Some(now),
                duration_seconds: Some(0),
                ..call.clone()
            })
        })
    }

    /// Hang up. An unanswered call becomes missed.
    pub fn end(&self, actor: &Actor, call_id: &Uuid) -> Result<CallSession> {
        self.transition(actor, call_id, |call, now| match call.status {
            CallStatus::Ongoing => {
                let answered = call.answered_at.unwrap_or(call.started_at);
                Ok(CallSession {
                    status: CallStatus::Ended,
                    ended_at: Some(now),
                    duration_seconds: Some((now.saturating_sub(answered).max(0) / 1000) as u64),
                    ..call.clone()
                })
            }
            CallStatus::Ringing => Ok(CallSession {
                status: CallStatus::Missed,
                ended_at: Some(now),
                duration_seconds: Some(0),
                ..call.clone()
            }),
            _ => Err(invalid(call, "end")),
        })
    }

    /// Media credential for a participant. While ringing only the caller may
    /// join the room; everyone else has to answer first.
    pub fn token(&self, actor: &Actor, call_id: &Uuid) -> Result<MediaToken> {
        let call = self.call(&actor.user_id, call_id)?;
        if !self
            .store
            .is_active_member(&call.conversation_id, &actor.user_id)
        {
            return Err(SyncError::forbidden("not a participant"));
        }
        match call.status {
            CallStatus::Ongoing => {}
            CallStatus::Ringing if call.caller_id == actor.user_id => {}
            _ => return Err(invalid(&call, "join")),
        }
        self.issuer
            .issue(&call, actor.user_id, self.store.clock().now_ms())
    }

    pub fn call(&self, viewer: &Uuid, call_id: &Uuid) -> Result<CallSession> {
        let call = self
            .book
            .lock()
            .calls
            .get(call_id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("call", *call_id))?;
        self.store.conversation(viewer, &call.conversation_id)?;
        Ok(call)
    }

    pub fn active_call(&self, viewer: &Uuid, conversation_id: &Uuid) -> Result<Option<CallSession>> {
        self.store.conversation(viewer, conversation_id)?;
        let book = self.book.lock();
        Ok(book
            .active_by_conversation
            .get(conversation_id)
            .and_then(|id| book.calls.get(id))
            .cloned())
    }

    /// Move calls that rang longer than `timeout` to no_answer.
    pub fn expire_ringing(&self, timeout: Duration) -> Vec<CallSession> {
        let now = self.store.clock().now_ms();
        let timeout_ms = timeout.as_millis() as i64;
        let mut book = self.book.lock();
        let stale: Vec<CallSession> = book
            .calls
            .values()
            .filter(|c| c.status == CallStatus::Ringing && now - c.started_at >= timeout_ms)
            .cloned()
            .collect();
        let mut expired = Vec::new();
        for call in stale {
            let next = CallSession {
                status: CallStatus::NoAnswer,
                ended_at: Some(now),
                duration_seconds: Some(0),
                ..call
            };
            match self.commit(&mut book, None, next) {
                Ok(c) => expired.push(c),
                Err(e) => warn!(error = %e, "failed to expire ringing call"),
            }
        }
        expired
    }

    fn transition(
        &self,
        actor: &Actor,
        call_id: &Uuid,
        step: impl FnOnce(&CallSession, Timestamp) -> Result<CallSession>,
    ) -> Result<CallSession> {
        let mut book = self.book.lock();
        let current = book
            .calls
            .get(call_id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("call", *call_id))?;
        if !self
            .store
            .is_active_member(&current.conversation_id, &actor.user_id)
        {
            return Err(SyncError::forbidden("not a participant"));
        }
        let next = step(&current, self.store.clock().now_ms())?;
        let next = self.commit(&mut book, actor.session_id, next)?;
        info!(call_id = %next.id, status = ?next.status, "call updated");
        Ok(next)
    }

    fn commit(
        &self,
        book: &mut CallBook,
        origin: Option<Uuid>,
        call: CallSession,
    ) -> Result<CallSession> {
        self.store.journal().save_call(&call)?;
        if call.status.is_terminal() {
            book.active_by_conversation.remove(&call.conversation_id);
        } else {
            book.active_by_conversation
                .insert(call.conversation_id, call.id);
        }
        book.calls.insert(call.id, call.clone());
        self.store.emit_in(
            &call.conversation_id,
            origin,
            ServerEvent::CallUpdated { call: call.clone() },
        )?;
        if call.status.is_terminal() {
            if let Err(e) = self.store.log_call(&call) {
                warn!(call_id = %call.id, error = %e, "failed to write call log entry");
            }
        }
        Ok(call)
    }
}

fn invalid(call: &CallSession, action: &'static str) -> SyncError {
    SyncError::InvalidTransition {
        from: call.status,
        action,
    }
}
