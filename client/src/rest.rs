//! Thin REST client for the chat server. Every mutation goes through here;
//! the realtime channel only carries control frames and pushed events.

use chat_proto::{
    CallSession, CallType, Conversation, MediaToken, Message, PresenceRecord, ReadReceipts,
};
use chatcore::{ForwardReport, NewMessage, NewParticipant, Result, SyncError, UnreadSummary};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct Me {
    pub user_id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallWithToken {
    pub call: CallSession,
    pub token: MediaToken,
}

#[derive(Debug, Deserialize)]
struct Marked {
    message_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

/// Where to start a history page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Before {
    Message(Uuid),
    Timestamp(i64),
}

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

fn transport(e: reqwest::Error) -> SyncError {
    SyncError::Transport(e.to_string())
}

/// Rebuild the server's error from its status and body.
fn decode_error(status: StatusCode, body: Option<ErrorBody>, subject: Option<Uuid>) -> SyncError {
    let (code, message) = match body {
        Some(b) => (b.code, b.error),
        None => (String::new(), status.to_string()),
    };
    match (status, code.as_str()) {
        (StatusCode::NOT_FOUND, _) => SyncError::NotFound {
            entity: "resource",
            id: subject.unwrap_or(Uuid::nil()),
        },
        (StatusCode::FORBIDDEN, _) | (StatusCode::UNAUTHORIZED, _) => SyncError::Forbidden(message),
        (_, "conflict") | (_, "invalid_transition") | (StatusCode::CONFLICT, _) => {
            SyncError::Conflict(message)
        }
        (StatusCode::BAD_REQUEST, _) => SyncError::Validation(message),
        (StatusCode::BAD_GATEWAY, _) => SyncError::Transport(message),
        _ => SyncError::Storage(message),
    }
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
    }

    async fn exec<T: DeserializeOwned>(&self, req: RequestBuilder, subject: Option<Uuid>) -> Result<T> {
        let resp = req.send().await.map_err(transport)?;
        let status = resp.status();
        if status.is_success() {
            return resp.json().await.map_err(transport);
        }
        let body = resp.json::<ErrorBody>().await.ok();
        let err = decode_error(status, body, subject);
        debug!(%status, error = %err, "request rejected");
        Err(err)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, subject: Option<Uuid>) -> Result<T> {
        self.exec(self.request(Method::GET, path), subject).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        subject: Option<Uuid>,
    ) -> Result<T> {
        self.exec(self.request(Method::POST, path).json(body), subject)
            .await
    }

    pub async fn me(&self) -> Result<Me> {
        self.get("/api/me", None).await
    }

    // ---- conversations ----

    pub async fn list_conversations(&self, archived: bool) -> Result<Vec<Conversation>> {
        let path = if archived {
            "/api/conversations?archived=true"
        } else {
            "/api/conversations"
        };
        self.get(path, None).await
    }

    pub async fn conversation(&self, id: Uuid) -> Result<Conversation> {
        self.get(&format!("/api/conversations/{id}"), Some(id)).await
    }

    pub async fn create_group(&self, name: &str, participants: &[NewParticipant]) -> Result<Conversation> {
        let body = json!({ "name": name, "participants": participants });
        self.post("/api/conversations", &body, None).await
    }

    pub async fn open_direct(&self, user_id: Uuid, display_name: &str) -> Result<Conversation> {
        let body = json!({ "user_id": user_id, "display_name": display_name });
        self.post("/api/conversations/direct", &body, Some(user_id))
            .await
    }

    pub async fn set_archived(&self, id: Uuid, archived: bool) -> Result<Conversation> {
        let req = self
            .request(Method::PATCH, &format!("/api/conversations/{id}"))
            .json(&json!({ "is_archived": archived }));
        self.exec(req, Some(id)).await
    }

    pub async fn leave(&self, id: Uuid) -> Result<Conversation> {
        self.post(&format!("/api/conversations/{id}/leave"), &json!({}), Some(id))
            .await
    }

    // ---- messages ----

    pub async fn list_messages(&self, id: Uuid, before: Option<Before>, limit: usize) -> Result<Vec<Message>> {
        let mut path = format!("/api/conversations/{id}/messages?limit={limit}");
        match before {
            Some(Before::Message(m)) => path.push_str(&format!("&before_id={m}")),
            Some(Before::Timestamp(ts)) => path.push_str(&format!("&before={ts}")),
            None => {}
        }
        self.get(&path, Some(id)).await
    }

    pub async fn send_message(&self, conversation_id: Uuid, draft: &NewMessage) -> Result<Message> {
        let body = json!({
            "id": draft.id,
            "content": draft.content,
            "message_type": draft.message_type,
            "reply_to_id": draft.reply_to_id,
            "attachments": draft.attachments,
        });
        self.post(
            &format!("/api/conversations/{conversation_id}/messages"),
            &body,
            Some(conversation_id),
        )
        .await
    }

    pub async fn edit_message(&self, id: Uuid, content: &str) -> Result<Message> {
        let req = self
            .request(Method::PATCH, &format!("/api/messages/{id}"))
            .json(&json!({ "content": content }));
        self.exec(req, Some(id)).await
    }

    pub async fn delete_message(&self, id: Uuid) -> Result<Message> {
        let req = self.request(Method::DELETE, &format!("/api/messages/{id}"));
        self.exec(req, Some(id)).await
    }

    pub async fn toggle_reaction(&self, id: Uuid, emoji: &str) -> Result<Message> {
        self.post(
            &format!("/api/messages/{id}/reactions"),
            &json!({ "emoji": emoji }),
            Some(id),
        )
        .await
    }

    pub async fn forward(&self, id: Uuid, conversation_ids: &[Uuid]) -> Result<ForwardReport> {
        self.post(
            &format!("/api/messages/{id}/forward"),
            &json!({ "conversation_ids": conversation_ids }),
            Some(id),
        )
        .await
    }

    // ---- receipts ----

    /// Mark everything (or everything through `through`) read.
    pub async fn mark_read(&self, conversation_id: Uuid, through: Option<Uuid>) -> Result<Vec<Uuid>> {
        let marked: Marked = self
            .post(
                &format!("/api/conversations/{conversation_id}/read"),
                &json!({ "through": through }),
                Some(conversation_id),
            )
            .await?;
        Ok(marked.message_ids)
    }

    pub async fn mark_delivered(&self, conversation_id: Uuid, message_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let marked: Marked = self
            .post(
                &format!("/api/conversations/{conversation_id}/delivered"),
                &json!({ "message_ids": message_ids }),
                Some(conversation_id),
            )
            .await?;
        Ok(marked.message_ids)
    }

    pub async fn read_receipts(&self, message_id: Uuid) -> Result<ReadReceipts> {
        self.get(&format!("/api/messages/{message_id}/receipts"), Some(message_id))
            .await
    }

    pub async fn unread(&self) -> Result<UnreadSummary> {
        self.get("/api/unread", None).await
    }

    // ---- presence ----

    pub async fn heartbeat(&self) -> Result<PresenceRecord> {
        self.post("/api/presence/heartbeat", &json!({}), None).await
    }

    pub async fn presence(&self, users: &[Uuid]) -> Result<Vec<PresenceRecord>> {
        if users.is_empty() {
            return self.get("/api/presence", None).await;
        }
        let list = users
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.get(&format!("/api/presence?users={list}"), None).await
    }

    // ---- calls ----

    pub async fn initiate_call(&self, conversation_id: Uuid, call_type: CallType) -> Result<CallWithToken> {
        self.post(
            &format!("/api/conversations/{conversation_id}/calls"),
            &json!({ "call_type": call_type }),
            Some(conversation_id),
        )
        .await
    }

    pub async fn answer_call(&self, call_id: Uuid) -> Result<CallWithToken> {
        self.post(&format!("/api/calls/{call_id}/answer"), &json!({}), Some(call_id))
            .await
    }

    pub async fn decline_call(&self, call_id: Uuid) -> Result<CallSession> {
        self.post(&format!("/api/calls/{call_id}/decline"), &json!({}), Some(call_id))
            .await
    }

    pub async fn end_call(&self, call_id: Uuid) -> Result<CallSession> {
        self.post(&format!("/api/calls/{call_id}/end"), &json!({}), Some(call_id))
            .await
    }

    pub async fn call_token(&self, call_id: Uuid) -> Result<MediaToken> {
        self.get(&format!("/api/calls/{call_id}/token"), Some(call_id))
            .await
    }

    pub async fn active_call(&self, conversation_id: Uuid) -> Result<Option<CallSession>> {
        self.get(
            &format!("/api/conversations/{conversation_id}/call"),
            Some(conversation_id),
        )
        .await
    }
}
