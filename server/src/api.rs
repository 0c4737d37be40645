use crate::{
    auth::{self, AuthUser},
    config::Config,
    db::SqliteJournal,
    media::JwtMediaTokenIssuer,
    sessions::Sessions,
    ws,
};
use anyhow::Result;
use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chat_proto::{
    CallSession, CallType, ConversationScope, Features, MediaToken, ParticipantType,
    PresenceRecord, ServerEvent, Topic,
};
use chatcore::{
    Actor, Broadcaster, CallCoordinator, Clock, ConversationFilter, ConversationPatch,
    ConversationStore, Cursor, Delivery, Hub, NewGroup, NewMessage, NewParticipant,
    PresenceService, SyncError, SystemClock, TypingTracker,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<Hub>,
    pub store: Arc<ConversationStore>,
    pub presence: Arc<PresenceService>,
    pub typing: Arc<TypingTracker>,
    pub calls: Arc<CallCoordinator>,
    pub sessions: Arc<Sessions>,
    pub jwt_secret: Arc<Vec<u8>>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open the journal under `config.data_dir`, restore its snapshot and
    /// wire every service to the shared hub and clock.
    pub async fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let secret = auth::resolve_secret(config.jwt_secret.as_deref(), &config.data_dir)?;
        let journal = Arc::new(SqliteJournal::open(config.data_dir.join("chat.db"))?);
        let snapshot = journal.load()?;
        let calls_snapshot = snapshot.calls.clone();

        let hub = Arc::new(Hub::new());
        let store = Arc::new(
            ConversationStore::new()
                .with_clock(clock.clone())
                .with_broadcaster(hub.clone())
                .with_journal(journal),
        );
        store.restore(snapshot);
        let issuer = JwtMediaTokenIssuer::new(secret.clone(), config.media_token_ttl);
        let calls = Arc::new(CallCoordinator::new(store.clone(), Arc::new(issuer)));
        calls.restore(calls_snapshot);

        Ok(Self {
            presence: Arc::new(PresenceService::new(config.heartbeat_timeout, clock.clone())),
            typing: Arc::new(TypingTracker::new(
                config.typing_ttl,
                config.typing_debounce,
                clock,
            )),
            config: Arc::new(config),
            hub,
            store,
            calls,
            sessions: Arc::new(Sessions::new()),
            jwt_secret: Arc::new(secret),
        })
    }

    pub fn features(&self) -> Features {
        Features {
            heartbeat_timeout_secs: self.config.heartbeat_timeout.as_secs(),
            typing_ttl_secs: self.config.typing_ttl.as_secs(),
            ..Features::default()
        }
    }

    /// Count activity for a user and tell their conversations when they
    /// come back online.
    pub fn heartbeat(&self, user_id: Uuid) -> PresenceRecord {
        let beat = self.presence.heartbeat(user_id);
        if beat.came_online {
            self.announce_presence(beat.record);
        }
        beat.record
    }

    pub fn announce_presence(&self, record: PresenceRecord) {
        for conversation_id in self.store.conversation_ids_for(&record.user_id) {
            self.hub.publish(Delivery {
                topic: Topic::Conversation(conversation_id),
                seq: None,
                origin: None,
                event: ServerEvent::Presence {
                    user_id: record.user_id,
                    is_online: record.is_online,
                    last_seen_at: record.last_seen_at,
                },
            });
        }
    }

    /// Broadcast a typing change. Typing is never sequenced and never echoed
    /// to the session that produced it.
    pub fn publish_typing(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        display_name: String,
        is_typing: bool,
        origin: Option<Uuid>,
    ) {
        self.hub.publish(Delivery {
            topic: Topic::Conversation(conversation_id),
            seq: None,
            origin,
            event: ServerEvent::Typing {
                conversation_id,
                user_id,
                display_name,
                is_typing,
            },
        });
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/conversations",
            get(list_conversations).post(create_group),
        )
        .route("/api/conversations/direct", post(open_direct))
        .route(
            "/api/conversations/:id",
            get(get_conversation).patch(patch_conversation),
        )
        .route("/api/conversations/:id/participants", post(add_participant))
        .route("/api/conversations/:id/leave", post(leave))
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/conversations/:id/read", post(mark_read))
        .route("/api/conversations/:id/delivered", post(mark_delivered))
        .route("/api/conversations/:id/calls", post(initiate_call))
        .route("/api/conversations/:id/call", get(active_call))
        .route(
            "/api/messages/:id",
            get(get_message).patch(edit_message).delete(delete_message),
        )
        .route("/api/messages/:id/reactions", post(toggle_reaction))
        .route("/api/messages/:id/forward", post(forward_message))
        .route("/api/messages/:id/receipts", get(read_receipts))
        .route("/api/unread", get(unread))
        .route("/api/presence", get(presence))
        .route("/api/presence/heartbeat", post(heartbeat))
        .route("/api/calls/:id", get(get_call))
        .route("/api/calls/:id/answer", post(answer_call))
        .route("/api/calls/:id/decline", post(decline_call))
        .route("/api/calls/:id/end", post(end_call))
        .route("/api/calls/:id/token", get(call_token))
        .route("/api/folders/:id/events", post(publish_folder_event))
        .route("/api/me", get(me))
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Bearer token from the Authorization header, or the `token` query
/// parameter for WebSocket clients that cannot set headers.
fn bearer<B>(req: &Request<B>) -> Option<&str> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        return value.to_str().ok()?.strip_prefix("Bearer ");
    }
    req.uri()
        .query()?
        .split('&')
        .find_map(|kv| kv.strip_prefix("token="))
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let claims = bearer(&req).and_then(|token| auth::verify_jwt(&state.jwt_secret, token).ok());
    match claims {
        Some(claims) => {
            req.extensions_mut().insert(AuthUser::from(claims));
            Ok(next.run(req).await)
        }
        None => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResp {
    pub error: String,
    pub code: String,
}

/// A [`SyncError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::Forbidden(_) => StatusCode::FORBIDDEN,
            SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::Conflict(_) | SyncError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        let body = ErrorResp {
            error: self.0.to_string(),
            code: self.0.code().into(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn actor(user: &AuthUser) -> Actor {
    Actor::user(user.user_id)
}

fn me_as_participant(user: &AuthUser) -> NewParticipant {
    NewParticipant {
        user_id: user.user_id,
        display_name: user.display_name.clone(),
        participant_type: ParticipantType::Internal,
    }
}

async fn me(Extension(user): Extension<AuthUser>) -> impl IntoResponse {
    Json(serde_json::json!({
        "user_id": user.user_id,
        "display_name": user.display_name,
    }))
}

// ---- conversations ----

async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(filter): Query<ConversationFilter>,
) -> impl IntoResponse {
    let mut list = state.store.list_conversations(&user.user_id, &filter);
    for c in list.iter_mut() {
        state.presence.decorate(c);
    }
    Json(list)
}

async fn get_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let mut conversation = state.store.conversation(&user.user_id, &id)?;
    state.presence.decorate(&mut conversation);
    Ok(Json(conversation))
}

async fn create_group(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(group): Json<NewGroup>,
) -> ApiResult<impl IntoResponse> {
    let conversation = state
        .store
        .create_group(&actor(&user), me_as_participant(&user), group)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Deserialize)]
struct OpenDirectReq {
    user_id: Uuid,
    display_name: String,
    #[serde(default)]
    participant_type: ParticipantType,
    #[serde(default)]
    scope: ConversationScope,
}

async fn open_direct(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<OpenDirectReq>,
) -> ApiResult<impl IntoResponse> {
    let other = NewParticipant {
        user_id: req.user_id,
        display_name: req.display_name,
        participant_type: req.participant_type,
    };
    let mut conversation =
        state
            .store
            .open_direct(&actor(&user), me_as_participant(&user), other, req.scope)?;
    state.presence.decorate(&mut conversation);
    Ok(Json(conversation))
}

async fn patch_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(patch): Json<ConversationPatch>,
) -> ApiResult<impl IntoResponse> {
    state.store.update_conversation(&actor(&user), &id, patch)?;
    let mut conversation = state.store.conversation(&user.user_id, &id)?;
    state.presence.decorate(&mut conversation);
    Ok(Json(conversation))
}

async fn add_participant(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(participant): Json<NewParticipant>,
) -> ApiResult<impl IntoResponse> {
    let conversation = state
        .store
        .add_participant(&actor(&user), &id, participant)?;
    Ok(Json(conversation))
}

async fn leave(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let conversation = state.store.leave(&actor(&user), &id)?;
    if state
        .typing
        .set_typing(id, user.user_id, &user.display_name, false)
        .should_broadcast()
    {
        state.publish_typing(id, user.user_id, user.display_name.clone(), false, None);
    }
    Ok(Json(conversation))
}

// ---- messages ----

#[derive(Deserialize, Default)]
struct MessagesQuery {
    /// Only messages strictly older than this timestamp.
    #[serde(default)]
    before: Option<i64>,
    /// Only messages strictly older than this message. Wins over `before`.
    #[serde(default)]
    before_id: Option<Uuid>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Query(q): Query<MessagesQuery>,
) -> ApiResult<impl IntoResponse> {
    let cursor = match (q.before_id, q.before) {
        (Some(id), _) => Some(Cursor::Id(id)),
        (None, Some(ts)) => Some(Cursor::Timestamp(ts)),
        (None, None) => None,
    };
    let limit = q.limit.unwrap_or(chatcore::store::DEFAULT_PAGE);
    let messages = state
        .store
        .list_messages(&user.user_id, &id, cursor, limit)?;
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(message): Json<NewMessage>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.store.send_message(&actor(&user), &id, message)?;
    // sending implies the sender stopped typing
    if state
        .typing
        .set_typing(id, user.user_id, &user.display_name, false)
        .should_broadcast()
    {
        state.publish_typing(id, user.user_id, user.display_name.clone(), false, None);
    }
    let status = if outcome.is_duplicate() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome.into_message())))
}

async fn get_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.message(&user.user_id, &id)?))
}

#[derive(Deserialize)]
struct EditReq {
    content: String,
}

async fn edit_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<EditReq>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state.store.edit_message(&actor(&user), &id, &req.content)?,
    ))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.delete_message(&actor(&user), &id)?))
}

#[derive(Deserialize)]
struct ReactionReq {
    emoji: String,
}

async fn toggle_reaction(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReactionReq>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state.store.toggle_reaction(&actor(&user), &id, &req.emoji)?,
    ))
}

#[derive(Deserialize)]
struct ForwardReq {
    conversation_ids: Vec<Uuid>,
}

async fn forward_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<ForwardReq>,
) -> ApiResult<impl IntoResponse> {
    let report = state
        .store
        .forward_message(&actor(&user), &id, &req.conversation_ids)?;
    Ok(Json(report))
}

// ---- receipts ----

#[derive(Deserialize, Default)]
struct ReadReq {
    #[serde(default)]
    through: Option<Uuid>,
}

#[derive(Serialize)]
struct MarkedResp {
    message_ids: Vec<Uuid>,
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    body: Option<Json<ReadReq>>,
) -> ApiResult<impl IntoResponse> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let message_ids = state.store.mark_read(&actor(&user), &id, req.through)?;
    Ok(Json(MarkedResp { message_ids }))
}

#[derive(Deserialize, Default)]
struct DeliveredReq {
    #[serde(default)]
    message_ids: Option<Vec<Uuid>>,
}

async fn mark_delivered(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    body: Option<Json<DeliveredReq>>,
) -> ApiResult<impl IntoResponse> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let message_ids =
        state
            .store
            .mark_delivered(&actor(&user), &id, req.message_ids.as_deref())?;
    Ok(Json(MarkedResp { message_ids }))
}

async fn read_receipts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.read_receipts(&user.user_id, &id)?))
}

async fn unread(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> impl IntoResponse {
    Json(state.store.unread_summary(&user.user_id))
}

// ---- presence ----

async fn heartbeat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> impl IntoResponse {
    Json(state.heartbeat(user.user_id))
}

#[derive(Deserialize, Default)]
struct PresenceQuery {
    /// Comma separated user ids. Defaults to everyone sharing a conversation.
    #[serde(default)]
    users: Option<String>,
}

async fn presence(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<PresenceQuery>,
) -> ApiResult<impl IntoResponse> {
    let users: BTreeSet<Uuid> = match q.users.as_deref() {
        Some(list) => list
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.trim()
                    .parse::<Uuid>()
                    .map_err(|_| SyncError::validation(format!("invalid user id {s}")))
            })
            .collect::<Result<BTreeSet<Uuid>, SyncError>>()?,
        None => state
            .store
            .list_conversations(&user.user_id, &ConversationFilter::default())
            .into_iter()
            .chain(state.store.list_conversations(
                &user.user_id,
                &ConversationFilter {
                    archived: true,
                    ..Default::default()
                },
            ))
            .flat_map(|c| c.participants.into_iter().map(|p| p.user_id))
            .collect(),
    };
    Ok(Json(state.presence.snapshot(users.iter())))
}

// ---- calls ----

#[derive(Deserialize)]
struct InitiateReq {
    call_type: CallType,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CallWithToken {
    pub call: CallSession,
    pub token: MediaToken,
}

async fn initiate_call(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<InitiateReq>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor(&user);
    let call = state.calls.initiate(&actor, &id, req.call_type)?;
    let token = state.calls.token(&actor, &call.id)?;
    Ok((StatusCode::CREATED, Json(CallWithToken { call, token })))
}

async fn answer_call(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor(&user);
    let call = state.calls.answer(&actor, &id)?;
    let token = state.calls.token(&actor, &call.id)?;
    Ok(Json(CallWithToken { call, token }))
}

async fn decline_call(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.calls.decline(&actor(&user), &id)?))
}

async fn end_call(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.calls.end(&actor(&user), &id)?))
}

async fn call_token(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.calls.token(&actor(&user), &id)?))
}

async fn get_call(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.calls.call(&user.user_id, &id)?))
}

async fn active_call(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.calls.active_call(&user.user_id, &id)?))
}

// ---- folders ----

async fn publish_folder_event(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(folder): Path<String>,
    Json(event): Json<ServerEvent>,
) -> impl IntoResponse {
    let topic = Topic::Folder(folder);
    let subscribers = state.hub.subscriber_count(&topic);
    info!(user_id = %user.user_id, ?topic, subscribers, "folder event published");
    state.hub.publish(Delivery {
        topic,
        seq: None,
        origin: None,
        event,
    });
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    async fn state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new("127.0.0.1:0", dir.path());
        (AppState::new(config).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn health_is_public_and_api_is_not() {
        let (state, _dir) = state().await;
        let app = build_router(state);
        let resp = app
            .clone()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app
            .oneshot(
                Request::get("/api/conversations")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn token_query_parameter_is_accepted() {
        let (state, _dir) = state().await;
        let token = auth::issue_jwt(
            &state.jwt_secret,
            Uuid::new_v4(),
            "Alice",
            time::Duration::minutes(5),
        )
        .unwrap();
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::get(format!("/api/unread?token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn error_statuses() {
        let cases = [
            (SyncError::not_found("message", Uuid::nil()), StatusCode::NOT_FOUND),
            (SyncError::forbidden("x"), StatusCode::FORBIDDEN),
            (SyncError::validation("x"), StatusCode::BAD_REQUEST),
            (SyncError::conflict("x"), StatusCode::CONFLICT),
            (
                SyncError::InvalidTransition {
                    from: chat_proto::CallStatus::Ended,
                    action: "answer",
                },
                StatusCode::CONFLICT,
            ),
            (SyncError::Storage("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
