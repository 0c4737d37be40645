//! Realtime gateway: one task per WebSocket session, draining the session's
//! hub queue and answering its control frames.

use crate::{api::AppState, auth::AuthUser};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Extension, State},
    response::IntoResponse,
};
use chat_proto::{ClientFrame, EventFrame, ServerEvent, Timestamp, Topic};
use chatcore::{Clock, Delivery, Hub};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

struct Session {
    state: AppState,
    user: AuthUser,
    id: Uuid,
    connected_at: Timestamp,
    tx: UnboundedSender<Arc<Delivery>>,
}

impl Session {
    fn display_name(&self, conversation_id: &Uuid) -> String {
        self.state
            .store
            .display_name(conversation_id, &self.user.user_id)
            .unwrap_or_else(|| self.user.display_name.clone())
    }

    fn member_of(&self, conversation_id: &Uuid) -> bool {
        self.state
            .store
            .is_active_member(conversation_id, &self.user.user_id)
    }

    /// Whether a queued delivery may still reach this session. Conversation
    /// traffic stops once the user is no longer an active participant; the
    /// update announcing their own departure is the last frame they get.
    fn admits(&self, delivery: &Delivery) -> bool {
        let Topic::Conversation(id) = delivery.topic else {
            return true;
        };
        if self.member_of(&id) {
            return true;
        }
        self.state.hub.unsubscribe(&delivery.topic, self.id);
        debug!(session_id = %self.id, conversation_id = %id, "dropped subscription of former participant");
        match &delivery.event {
            ServerEvent::ConversationUpdated { conversation } => {
                conversation.participant(&self.user.user_id).is_some()
            }
            _ => false,
        }
    }

    /// Apply one control frame. Returns the direct reply, if any.
    fn handle(&self, frame: ClientFrame) -> Option<ServerEvent> {
        let state = &self.state;
        match frame {
            ClientFrame::Ping => {
                state.heartbeat(self.user.user_id);
                Some(ServerEvent::Pong {
                    server_time: state.store.clock().now_ms(),
                })
            }
            ClientFrame::SubscribeConversation { id } => {
                if !self.member_of(&id) {
                    return Some(ServerEvent::error(
                        "forbidden",
                        format!("not a participant of {id}"),
                    ));
                }
                if state
                    .hub
                    .subscribe(Topic::Conversation(id), self.id, self.tx.clone())
                {
                    debug!(session_id = %self.id, conversation_id = %id, "subscribed");
                    // catch the new subscriber up on who is typing right now
                    for (user_id, display_name) in state.typing.typing_in(&id) {
                        if user_id == self.user.user_id {
                            continue;
                        }
                        let _ = self.tx.send(Arc::new(Delivery {
                            topic: Topic::Conversation(id),
                            seq: None,
                            origin: None,
                            event: ServerEvent::Typing {
                                conversation_id: id,
                                user_id,
                                display_name,
                                is_typing: true,
                            },
                        }));
                    }
                }
                None
            }
            ClientFrame::UnsubscribeConversation { id } => {
                state.hub.unsubscribe(&Topic::Conversation(id), self.id);
                None
            }
            ClientFrame::SubscribeFolder { id } => {
                state
                    .hub
                    .subscribe(Topic::Folder(id), self.id, self.tx.clone());
                None
            }
            ClientFrame::UnsubscribeFolder { id } => {
                state.hub.unsubscribe(&Topic::Folder(id), self.id);
                None
            }
            ClientFrame::GetStatus => Some(ServerEvent::Status {
                session_id: self.id,
                user_id: self.user.user_id,
                connected_at: self.connected_at,
                subscriptions: state.hub.subscriptions(self.id),
            }),
            ClientFrame::Typing {
                conversation_id,
                is_typing,
            } => {
                if !self.member_of(&conversation_id) {
                    return Some(ServerEvent::error(
                        "forbidden",
                        format!("not a participant of {conversation_id}"),
                    ));
                }
                let name = self.display_name(&conversation_id);
                let change =
                    state
                        .typing
                        .set_typing(conversation_id, self.user.user_id, &name, is_typing);
                if change.should_broadcast() {
                    state.publish_typing(
                        conversation_id,
                        self.user.user_id,
                        name,
                        is_typing,
                        Some(self.id),
                    );
                }
                None
            }
            ClientFrame::Focus { conversation_id } => {
                if let Some(id) = conversation_id {
                    if !self.member_of(&id) {
                        return Some(ServerEvent::error(
                            "forbidden",
                            format!("not a participant of {id}"),
                        ));
                    }
                }
                state
                    .store
                    .set_active_conversation(self.user.user_id, conversation_id);
                None
            }
        }
    }

    fn close(&self) {
        let state = &self.state;
        state.hub.unsubscribe_all(self.id);
        if state.sessions.disconnect(self.user.user_id) {
            state.store.set_active_conversation(self.user.user_id, None);
            for stop in state.typing.clear_user(&self.user.user_id) {
                state.publish_typing(
                    stop.conversation_id,
                    stop.user_id,
                    stop.display_name,
                    false,
                    None,
                );
            }
        }
        info!(session_id = %self.id, user_id = %self.user.user_id, "session closed");
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    frame: &EventFrame,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(WsMessage::Text(text)).await,
        Err(e) => {
            warn!(error = %e, "unserializable frame dropped");
            Ok(())
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user: AuthUser) {
    let (tx, mut rx) = Hub::session_queue();
    let session = Session {
        connected_at: state.store.clock().now_ms(),
        id: Uuid::new_v4(),
        state,
        user,
        tx,
    };
    session.state.sessions.connect(session.user.user_id);
    session.state.heartbeat(session.user.user_id);
    info!(session_id = %session.id, user_id = %session.user.user_id, "session opened");

    let (mut sink, mut stream) = socket.split();
    let hello = EventFrame::unsequenced(ServerEvent::Connected {
        user_id: session.user.user_id,
        session_id: session.id,
        features: session.state.features(),
    });
    if send_frame(&mut sink, &hello).await.is_err() {
        session.close();
        return;
    }

    let idle = session.state.config.heartbeat_timeout;
    let mut deadline = Instant::now() + idle;
    loop {
        tokio::select! {
            Some(delivery) = rx.recv() => {
                if !session.admits(&delivery) {
                    continue;
                }
                if send_frame(&mut sink, &delivery.frame()).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    deadline = Instant::now() + idle;
                    let reply = match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => session.handle(frame),
                        Err(e) => Some(ServerEvent::error("invalid_frame", e.to_string())),
                    };
                    if let Some(reply) = reply {
                        if send_frame(&mut sink, &EventFrame::unsequenced(reply)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => deadline = Instant::now() + idle,
                Some(Err(e)) => {
                    debug!(session_id = %session.id, error = %e, "socket error");
                    break;
                }
            },
            _ = sleep_until(deadline) => {
                warn!(session_id = %session.id, "no activity within heartbeat timeout, closing");
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
    session.close();
}
