use crate::api::AppState;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sweep {
    pub typing_expired: usize,
    pub calls_expired: usize,
}

/// Broadcast stops for lapsed typing indicators and resolve calls that rang
/// past the ring timeout.
pub fn sweep(state: &AppState) -> Sweep {
    let expired = state.typing.sweep();
    for stop in &expired {
        state.publish_typing(
            stop.conversation_id,
            stop.user_id,
            stop.display_name.clone(),
            false,
            None,
        );
    }
    let calls = state.calls.expire_ringing(state.config.ring_timeout);
    for call in &calls {
        info!(call_id = %call.id, conversation_id = %call.conversation_id, "call went unanswered");
    }
    Sweep {
        typing_expired: expired.len(),
        calls_expired: calls.len(),
    }
}

/// Run [`sweep`] every `sweep_interval` until `shutdown` fires.
pub fn spawn_housekeeping(state: AppState, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(state.config.sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let done = sweep(&state);
                    if done != Sweep::default() {
                        debug!(?done, "housekeeping sweep");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chat_proto::{CallStatus, CallType, ServerEvent, Topic};
    use chatcore::{Actor, ManualClock, NewGroup, NewParticipant};
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn sweep_expires_typing_and_ringing_calls() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let state = AppState::with_clock(Config::new("127.0.0.1:0", dir.path()), clock.clone())
            .await
            .unwrap();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let conv = state
            .store
            .create_group(
                &Actor::user(alice),
                NewParticipant {
                    user_id: alice,
                    display_name: "Alice".into(),
                    participant_type: Default::default(),
                },
                NewGroup {
                    name: "Ops".into(),
                    participants: vec![NewParticipant {
                        user_id: bob,
                        display_name: "Bob".into(),
                        participant_type: Default::default(),
                    }],
                    ..Default::default()
                },
            )
            .unwrap();
        let (tx, mut rx) = chatcore::Hub::session_queue();
        state
            .hub
            .subscribe(Topic::Conversation(conv.id), Uuid::new_v4(), tx);

        state.typing.set_typing(conv.id, bob, "Bob", true);
        let call = state
            .calls
            .initiate(&Actor::user(alice), &conv.id, CallType::Audio)
            .unwrap();
        while rx.try_recv().is_ok() {}

        assert_eq!(sweep(&state), Sweep::default());
        clock.advance(state.config.ring_timeout.as_millis() as i64);
        assert_eq!(
            sweep(&state),
            Sweep {
                typing_expired: 1,
                calls_expired: 1
            }
        );
        assert_eq!(
            state.calls.call(&alice, &call.id).unwrap().status,
            CallStatus::NoAnswer
        );

        let mut saw_stop = false;
        while let Ok(d) = rx.try_recv() {
            if let ServerEvent::Typing { is_typing, user_id, .. } = &d.event {
                assert!(!is_typing);
                assert_eq!(*user_id, bob);
                saw_stop = true;
            }
        }
        assert!(saw_stop);
    }
}
