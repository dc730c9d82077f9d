use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, Method, StatusCode},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parlor_shared::constants::{APP_NAME, PROTOCOL_VERSION, TYPING_EXPIRY_SECS};
use parlor_shared::{ConversationId, MessageId, UserId};
use parlor_store::{Attachment, Conversation, FriendOverview, Message, User, UserSummary};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{FriendStatus, Hub};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::registry::RegistryStats;
use crate::socket::ws_upgrade;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub rate_limiter: RateLimiter<IpAddr>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, config: ServerConfig) -> Self {
        Self {
            hub,
            rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_upgrade))
        .route("/api/chats", get(list_chats))
        .route("/api/chats/private", post(create_private_chat))
        .route("/api/chats/group", post(create_group_chat))
        .route("/api/chats/{id}", get(get_chat))
        .route("/api/chats/{id}/participants", post(add_participants))
        .route("/api/chats/{id}/participants/{user_id}", delete(remove_participant))
        .route("/api/messages/{id}", get(message_history).post(send_message))
        .route("/api/messages/{id}/read", post(mark_read))
        .route("/api/friends", get(friend_overview))
        .route("/api/friends/send", post(send_friend_request))
        .route("/api/friends/accept", post(accept_friend_request))
        .route("/api/friends/reject", post(reject_friend_request))
        .route("/api/friends/suggestions", get(friend_suggestions))
        .route("/api/users/status", get(friend_statuses))
        .route("/admin/status", get(admin_status))
        .route("/admin/users", post(admin_create_user))
        .route("/admin/tokens", post(admin_issue_token))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `Authorization: Bearer <token>`, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// The user named by a valid session token.
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ServerError::Unauthorized("missing bearer token".into()))?;
        let claims = state.hub.sessions().verify(token)?;
        Ok(AuthUser(claims.user_id))
    }
}

// ─── Service ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    app: &'static str,
    name: String,
    version: &'static str,
    protocol: &'static str,
    typing_expiry_secs: u64,
    /// Hex-encoded Ed25519 key that verifies session tokens.
    session_public_key: String,
    connections: usize,
    online_users: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        app: APP_NAME,
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        typing_expiry_secs: TYPING_EXPIRY_SECS,
        session_public_key: hex::encode(state.hub.sessions().verifying_key().to_bytes()),
        connections: state.hub.registry().connection_count(),
        online_users: state.hub.presence().online_count(),
    })
}

// ─── Chats ───

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePrivateRequest {
    participant_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupRequest {
    name: String,
    participant_ids: Vec<UserId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantsRequest {
    participant_ids: Vec<UserId>,
}

async fn list_chats(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<Conversation>>, ServerError> {
    let chats = state
        .hub
        .store()
        .call(move |db| db.list_conversations_for(me))
        .await?;
    Ok(Json(chats))
}

async fn create_private_chat(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<CreatePrivateRequest>,
) -> Result<(StatusCode, Json<Conversation>), ServerError> {
    let other = req.participant_id;
    let (chat, created) = state
        .hub
        .store()
        .call(move |db| db.open_private(me, other))
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(chat)))
}

async fn create_group_chat(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Conversation>), ServerError> {
    let chat = state.hub.create_group(me, req.name, req.participant_ids).await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn get_chat(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> Result<Json<Conversation>, ServerError> {
    let chat = state
        .hub
        .store()
        .call(move |db| db.get_conversation_for(id, me))
        .await?;
    Ok(Json(chat))
}

async fn add_participants(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    Json(req): Json<ParticipantsRequest>,
) -> Result<Json<Conversation>, ServerError> {
    let chat = state.hub.add_participants(id, me, req.participant_ids).await?;
    Ok(Json(chat))
}

async fn remove_participant(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path((id, user_id)): Path<(ConversationId, UserId)>,
) -> Result<Json<Conversation>, ServerError> {
    let chat = state.hub.remove_participant(id, me, user_id).await?;
    Ok(Json(chat))
}

// ─── Messages ───

#[derive(Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadResponse {
    conversation_id: ConversationId,
    changed: bool,
}

async fn message_history(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let messages = state
        .hub
        .store()
        .call(move |db| db.message_history(id, me))
        .await?;
    Ok(Json(messages))
}

async fn send_message(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let message = state.hub.send_message(me, id, req.text, req.attachments).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
) -> Result<Json<MarkReadResponse>, ServerError> {
    let receipt = state.hub.mark_read(me, id).await?;
    Ok(Json(MarkReadResponse {
        conversation_id: receipt.conversation_id,
        changed: receipt.changed,
    }))
}

// ─── Friends ───

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FriendRequest {
    user_id: UserId,
}

async fn friend_overview(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<FriendOverview>, ServerError> {
    let overview = state.hub.store().call(move |db| db.friend_overview(me)).await?;
    Ok(Json(overview))
}

async fn send_friend_request(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<FriendRequest>,
) -> Result<StatusCode, ServerError> {
    let to = req.user_id;
    state
        .hub
        .store()
        .call(move |db| db.send_friend_request(me, to))
        .await?;
    Ok(StatusCode::CREATED)
}

async fn accept_friend_request(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<FriendRequest>,
) -> Result<StatusCode, ServerError> {
    let from = req.user_id;
    state
        .hub
        .store()
        .call(move |db| db.accept_friend_request(me, from))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reject_friend_request(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<FriendRequest>,
) -> Result<StatusCode, ServerError> {
    let from = req.user_id;
    let removed = state
        .hub
        .store()
        .call(move |db| db.reject_friend_request(me, from))
        .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServerError::NotFound("friend request".into()))
    }
}

async fn friend_suggestions(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<UserSummary>>, ServerError> {
    let limit = state.config.suggestion_limit;
    let suggestions = state
        .hub
        .store()
        .call(move |db| db.friend_suggestions(me, limit))
        .await?;
    Ok(Json(suggestions))
}

async fn friend_statuses(
    AuthUser(me): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<FriendStatus>>, ServerError> {
    Ok(Json(state.hub.friend_statuses(me).await?))
}

// ─── Admin ───

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminStatusResponse {
    name: String,
    uptime_secs: u64,
    online_users: usize,
    #[serde(flatten)]
    registry: RegistryStats,
}

#[derive(Deserialize)]
struct AdminCreateUserRequest {
    username: String,
    email: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminTokenRequest {
    user_id: UserId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminTokenResponse {
    token: String,
    user_id: UserId,
    expires_at: DateTime<Utc>,
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let token = bearer_token(headers).unwrap_or("");

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        online_users: state.hub.presence().online_count(),
        registry: state.hub.stats(),
    }))
}

async fn admin_create_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminCreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let user = state
        .hub
        .store()
        .call(move |db| db.create_user(&req.username, &req.email))
        .await?;

    info!(user = %user.id, username = %user.username, "Admin created user");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn admin_issue_token(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminTokenRequest>,
) -> Result<Json<AdminTokenResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let user_id = req.user_id;
    state.hub.store().call(move |db| db.get_user(user_id)).await?;
    let (token, claims) = state.hub.sessions().issue(user_id)?;

    info!(user = %user_id, expires_at = %claims.expires_at, "Admin issued session token");
    Ok(Json(AdminTokenResponse {
        token,
        user_id,
        expires_at: claims.expires_at,
    }))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration;
    use parlor_shared::session::SessionKeys;
    use tower::ServiceExt;

    use crate::hub::HubConfig;
    use crate::presence::PresenceTracker;
    use crate::registry::ConnectionRegistry;
    use crate::store::Store;

    const ADMIN: &str = "admin-secret";

    fn state() -> AppState {
        let hub = Hub::new(
            Store::in_memory().unwrap(),
            SessionKeys::generate(Duration::hours(1)),
            PresenceTracker::detached(),
            ConnectionRegistry::new(),
            HubConfig::default(),
        );
        let config = ServerConfig {
            admin_token: Some(ADMIN.to_string()),
            ..ServerConfig::default()
        };
        AppState::new(Arc::new(hub), config)
    }

    async fn call(
        state: &AppState,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = build_router(state.clone())
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    /// Create a user through the admin API and return `(id, token)`.
    async fn signup(state: &AppState, name: &str) -> (String, String) {
        let (status, user) = call(
            state,
            Method::POST,
            "/admin/users",
            Some(ADMIN),
            Some(serde_json::json!({ "username": name, "email": format!("{name}@example.com") })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = user["id"].as_str().unwrap().to_string();

        let (status, issued) = call(
            state,
            Method::POST,
            "/admin/tokens",
            Some(ADMIN),
            Some(serde_json::json!({ "userId": id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        (id, issued["token"].as_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (status, body) = call(&state(), Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_info_publishes_session_key() {
        let state = state();
        let (status, body) = call(&state, Method::GET, "/info", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessionPublicKey"].as_str().unwrap().len(), 64);
        assert_eq!(body["protocol"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let state = state();
        let (status, _) = call(&state, Method::GET, "/admin/status", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&state, Method::GET, "/admin/status", Some("wrong"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = call(&state, Method::GET, "/admin/status", Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_api_requires_session() {
        let state = state();
        let (status, _) = call(&state, Method::GET, "/api/chats", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&state, Method::GET, "/api/chats", Some("forged"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_private_chat_created_then_reused() {
        let state = state();
        let (_, alice) = signup(&state, "alice").await;
        let (bob_id, _) = signup(&state, "bob").await;

        let body = serde_json::json!({ "participantId": bob_id });
        let (status, first) =
            call(&state, Method::POST, "/api/chats/private", Some(&alice), Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, second) =
            call(&state, Method::POST, "/api/chats/private", Some(&alice), Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["id"], second["id"]);

        let (status, chats) = call(&state, Method::GET, "/api/chats", Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(chats.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rest_send_and_history() {
        let state = state();
        let (_, alice) = signup(&state, "alice").await;
        let (bob_id, bob) = signup(&state, "bob").await;
        let (_, carol) = signup(&state, "carol").await;

        let (_, chat) = call(
            &state,
            Method::POST,
            "/api/chats/private",
            Some(&alice),
            Some(serde_json::json!({ "participantId": bob_id })),
        )
        .await;
        let chat_id = chat["id"].as_str().unwrap();
        let uri = format!("/api/messages/{chat_id}");

        let (status, message) = call(
            &state,
            Method::POST,
            &uri,
            Some(&alice),
            Some(serde_json::json!({ "text": "hi bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) =
            call(&state, Method::POST, &uri, Some(&alice), Some(serde_json::json!({ "text": " " })))
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, history) = call(&state, Method::GET, &uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history[0]["text"], "hi bob");
        assert_eq!(history[0]["sender"]["username"], "alice");
        assert_eq!(history[0]["sender"]["email"], "alice@example.com");

        let (status, _) = call(&state, Method::GET, &uri, Some(&carol), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let read_uri = format!("/api/messages/{}/read", message["id"].as_str().unwrap());
        let (_, first) = call(&state, Method::POST, &read_uri, Some(&bob), None).await;
        let (_, second) = call(&state, Method::POST, &read_uri, Some(&bob), None).await;
        assert_eq!(first["changed"], true);
        assert_eq!(second["changed"], false);
    }

    #[tokio::test]
    async fn test_friend_flow_and_status() {
        let state = state();
        let (alice_id, alice) = signup(&state, "alice").await;
        let (bob_id, bob) = signup(&state, "bob").await;

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/friends/send",
            Some(&alice),
            Some(serde_json::json!({ "userId": bob_id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/friends/send",
            Some(&bob),
            Some(serde_json::json!({ "userId": alice_id })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/friends/accept",
            Some(&bob),
            Some(serde_json::json!({ "userId": alice_id })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, overview) = call(&state, Method::GET, "/api/friends", Some(&alice), None).await;
        assert_eq!(overview["friends"][0]["username"], "bob");

        let (_, statuses) = call(&state, Method::GET, "/api/users/status", Some(&alice), None).await;
        assert_eq!(statuses[0]["online"], false);

        let (_, suggestions) =
            call(&state, Method::GET, "/api/friends/suggestions", Some(&alice), None).await;
        assert!(suggestions.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_membership_routes() {
        let state = state();
        let (_, alice) = signup(&state, "alice").await;
        let (bob_id, bob) = signup(&state, "bob").await;
        let (carol_id, _) = signup(&state, "carol").await;

        let (status, group) = call(
            &state,
            Method::POST,
            "/api/chats/group",
            Some(&alice),
            Some(serde_json::json!({ "name": "Team", "participantIds": [bob_id] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let group_id = group["id"].as_str().unwrap();

        let (status, _) = call(
            &state,
            Method::POST,
            &format!("/api/chats/{group_id}/participants"),
            Some(&bob),
            Some(serde_json::json!({ "participantIds": [carol_id] })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, updated) = call(
            &state,
            Method::POST,
            &format!("/api/chats/{group_id}/participants"),
            Some(&alice),
            Some(serde_json::json!({ "participantIds": [carol_id] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["participants"].as_array().unwrap().len(), 3);
        let carol = updated["members"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["id"] == carol_id.as_str())
            .unwrap();
        assert_eq!(carol["username"], "carol");
        assert_eq!(carol["email"], "carol@example.com");

        // Anyone may leave on their own.
        let (status, updated) = call(
            &state,
            Method::DELETE,
            &format!("/api/chats/{group_id}/participants/{bob_id}"),
            Some(&bob),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["participants"].as_array().unwrap().len(), 2);
    }
}
