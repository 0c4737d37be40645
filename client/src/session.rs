//! A signed-in client: the local replica kept current by the realtime
//! channel, with REST for every mutation and for catching up.

use crate::connection::{
    ConnectionConfig, ConnectionManager, ConnectionObserver, ConnectionState, DisconnectReason,
    FrameSender,
};
use crate::rest::RestClient;
use chat_proto::{ClientFrame, EventFrame, Message};
use chatcore::store::DEFAULT_PAGE;
use chatcore::{NewMessage, Replica, Result, SyncError};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Feeds inbound frames into the replica and resubscribes after every
/// (re)connect.
struct ReplicaObserver {
    replica: Arc<Replica>,
    frames: FrameSender,
}

impl ReplicaObserver {
    fn subscribe_all(&self) {
        let user = self.replica.user_id();
        for id in self.replica.store().conversation_ids_for(&user) {
            self.frames
                .send(&ClientFrame::SubscribeConversation { id });
        }
    }
}

impl ConnectionObserver for ReplicaObserver {
    fn on_frame(&self, frame: &EventFrame) {
        self.replica.apply(frame);
        if let chat_proto::ServerEvent::Connected { .. } = frame.event {
            self.subscribe_all();
        }
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        if reason == DisconnectReason::GaveUp {
            self.replica.record_error(SyncError::Transport(
                "realtime channel unavailable".into(),
            ));
        }
    }

    fn on_error(&self, error: &SyncError) {
        // connect failures are retried; only report what the retry loop cannot fix
        if !matches!(error, SyncError::Transport(_)) {
            self.replica.record_error(error.clone());
        }
    }
}

pub struct ChatSession {
    replica: Arc<Replica>,
    rest: RestClient,
    connection: ConnectionManager,
}

impl ChatSession {
    /// Sign in, load the conversation list and open the realtime channel.
    pub async fn start(base_url: &str, connection: ConnectionConfig) -> Result<Self> {
        let manager = ConnectionManager::new(connection.clone());
        Self::start_with(base_url, connection, manager).await
    }

    pub async fn start_with(
        base_url: &str,
        connection: ConnectionConfig,
        manager: ConnectionManager,
    ) -> Result<Self> {
        let rest = RestClient::new(base_url, connection.token.clone());
        let me = rest.me().await?;
        info!(user_id = %me.user_id, "signed in as {}", me.display_name);
        let replica = Arc::new(Replica::new(me.user_id));
        let session = Self {
            replica: replica.clone(),
            rest,
            connection: manager,
        };
        session.reload_conversations().await?;
        session.connection.add_observer(Arc::new(ReplicaObserver {
            replica,
            frames: session.connection.sender(),
        }));
        session.connection.connect();
        Ok(session)
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn user_id(&self) -> Uuid {
        self.replica.user_id()
    }

    async fn reload_conversations(&self) -> Result<()> {
        let mut list = self.rest.list_conversations(false).await?;
        list.extend(self.rest.list_conversations(true).await?);
        self.replica.load_conversations(list);
        Ok(())
    }

    /// Re-read the conversation list, subscribe to new conversations and
    /// re-fetch history for every conversation marked stale.
    pub async fn refresh(&self) -> Result<usize> {
        let before = self
            .replica
            .store()
            .conversation_ids_for(&self.user_id());
        self.reload_conversations().await?;
        for id in self.replica.store().conversation_ids_for(&self.user_id()) {
            if !before.contains(&id) {
                self.connection
                    .send(&ClientFrame::SubscribeConversation { id });
            }
        }
        let stale = self.replica.stale_conversations();
        for id in &stale {
            self.load_history(*id).await?;
        }
        Ok(stale.len())
    }

    /// Fetch the latest page of a conversation into the replica.
    pub async fn load_history(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let page = self
            .rest
            .list_messages(conversation_id, None, DEFAULT_PAGE)
            .await?;
        debug!(%conversation_id, count = page.len(), "history loaded");
        self.replica.load_messages(&conversation_id, page.clone());
        Ok(page)
    }

    /// Send with an optimistic local copy. On failure the local copy stays and
    /// the error lands in the replica's error slot as well as the result.
    pub async fn send_text(&self, conversation_id: Uuid, text: &str) -> Result<Message> {
        let draft = NewMessage {
            id: Some(Uuid::new_v4()),
            content: Some(text.to_string()),
            ..Default::default()
        };
        self.replica.stage_message(&conversation_id, draft.clone())?;
        match self.rest.send_message(conversation_id, &draft).await {
            Ok(message) => {
                self.replica.confirm_message(message.clone());
                Ok(message)
            }
            Err(e) => {
                warn!(%conversation_id, error = %e, "send failed");
                self.replica.record_error(e.clone());
                Err(e)
            }
        }
    }

    /// Declare a conversation on screen: marks it read locally and on the
    /// server, and tells the server so new messages stop counting as unread.
    pub async fn focus(&self, conversation_id: Option<Uuid>) -> Result<()> {
        self.replica.focus(conversation_id);
        self.connection.send(&ClientFrame::Focus { conversation_id });
        if let Some(id) = conversation_id {
            self.rest.mark_read(id, None).await?;
        }
        Ok(())
    }

    /// Dropped silently unless the channel is open.
    pub fn set_typing(&self, conversation_id: Uuid, is_typing: bool) -> bool {
        self.connection.send(&ClientFrame::Typing {
            conversation_id,
            is_typing,
        })
    }

    pub fn is_live(&self) -> bool {
        self.connection.state() == ConnectionState::Open
    }

    pub fn close(&self) {
        self.connection.disconnect();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}
