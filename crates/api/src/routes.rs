use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tradedesk_core::access::authorize;
use tradedesk_core::{Actor, ConversationId, ConversationPage, HistoryPage, RelayError, UserId};

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health
        .route("/health", get(health_check))
        // Chat window
        .route("/chat/conversation", get(current_conversation))
        .route("/chat/conversations/{id}/messages", get(conversation_messages))
        // Admin dashboard
        .route("/admin/conversations", get(list_conversations))
}

/// Relay errors rendered as JSON with a matching status code.
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::MissingField(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::PersistenceFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::TransportFailure(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!(error = ?self.0, "Request failed");
        }
        (status, Json(self.0.to_notice())).into_response()
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.rooms.connection_count().await,
    }))
}

// ---------------------------------------------------------------------------
// Chat window
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentConversationQuery {
    user_id: Option<UserId>,
    limit: Option<i64>,
}

/// The user's current conversation, created on first access, with its newest messages.
async fn current_conversation(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CurrentConversationQuery>,
) -> Result<Json<ConversationPage>, ApiError> {
    let user_id = query
        .user_id
        .filter(|id| *id > 0)
        .ok_or_else(|| RelayError::missing("userId"))?;
    let limit = state.config.page_size(query.limit);

    let conversation = state
        .store
        .current_conversation(user_id)
        .await
        .map_err(|e| RelayError::persistence("Failed to load conversation", e))?;
    let messages = state
        .store
        .messages_before(conversation.id, None, limit)
        .await
        .map_err(|e| RelayError::persistence("Failed to load messages", e))?;

    Ok(Json(ConversationPage {
        has_more: messages.len() as i64 == limit,
        conversation,
        messages,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    user_id: Option<UserId>,
    #[serde(default)]
    is_admin: bool,
    before: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

/// A page of messages strictly older than `before`, oldest first.
async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, ApiError> {
    let actor = match (query.user_id, query.is_admin) {
        (Some(user_id), is_admin) => Actor { user_id, is_admin },
        (None, true) => Actor::admin(0),
        (None, false) => return Err(RelayError::missing("userId").into()),
    };
    authorize(state.store.as_ref(), Some(id), &actor).await?;

    let limit = state.config.page_size(query.limit);
    let messages = state
        .store
        .messages_before(id, query.before, limit)
        .await
        .map_err(|e| RelayError::persistence("Failed to load messages", e))?;

    Ok(Json(HistoryPage {
        conversation_id: id,
        has_more: messages.len() as i64 == limit,
        messages,
    }))
}

// ---------------------------------------------------------------------------
// Admin dashboard
// ---------------------------------------------------------------------------

async fn list_conversations(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_conversations().await {
        Ok(list) => Json(list).into_response(),
        Err(e) => {
            ApiError(RelayError::persistence("Failed to list conversations", e)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::RelayConfig;
    use crate::state::AppState;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;
    use tradedesk_core::{ChatStore, NewMessage, SenderType};
    use tradedesk_data::InMemoryChatStore;

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn app(store: Arc<InMemoryChatStore>) -> axum::Router {
        let config = RelayConfig {
            history_page_size: 2,
            ..Default::default()
        };
        crate::build_router(Arc::new(AppState::new(store, config)))
    }

    async fn seed(store: &InMemoryChatStore, conversation_id: i64, count: usize) {
        for i in 0..count {
            store
                .create_message(&NewMessage {
                    conversation_id,
                    sender_id: 42,
                    sender_type: SenderType::User,
                    content: Some(format!("m{}", i)),
                    image_url: None,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) =
            get_json(app(Arc::new(InMemoryChatStore::new())), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_current_conversation_created_on_first_access() {
        let store = Arc::new(InMemoryChatStore::new());
        let (status, first) =
            get_json(app(store.clone()), "/api/chat/conversation?userId=42").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["conversation"]["userId"], 42);
        assert_eq!(first["messages"].as_array().unwrap().len(), 0);

        let (_, second) = get_json(app(store), "/api/chat/conversation?userId=42").await;
        assert_eq!(first["conversation"]["id"], second["conversation"]["id"]);
    }

    #[tokio::test]
    async fn test_current_conversation_requires_user() {
        let (status, body) =
            get_json(app(Arc::new(InMemoryChatStore::new())), "/api/chat/conversation").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Missing userId");
    }

    #[tokio::test]
    async fn test_history_is_authorized() {
        let store = Arc::new(InMemoryChatStore::new());
        let conversation = store.insert_conversation(42).await;

        let uri = format!("/api/chat/conversations/{}/messages?userId=99", conversation.id);
        let (status, body) = get_json(app(store.clone()), &uri).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["message"], "Access denied to this conversation");

        let uri = "/api/chat/conversations/404/messages?isAdmin=true";
        let (status, _) = get_json(app(store.clone()), uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let uri = format!("/api/chat/conversations/{}/messages?isAdmin=true", conversation.id);
        let (status, _) = get_json(app(store), &uri).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_history_pages_backwards() {
        let store = Arc::new(InMemoryChatStore::new());
        let conversation = store.insert_conversation(42).await;
        seed(&store, conversation.id, 3).await;

        let uri = format!("/api/chat/conversations/{}/messages?userId=42", conversation.id);
        let (_, newest) = get_json(app(store.clone()), &uri).await;
        let page = newest["messages"].as_array().unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0]["content"], "m1");
        assert_eq!(newest["hasMore"], true);

        let oldest_ts = store.messages(conversation.id).await[1].created_at;
        let before = oldest_ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let uri = format!(
            "/api/chat/conversations/{}/messages?userId=42&before={}",
            conversation.id, before
        );
        let (_, older) = get_json(app(store), &uri).await;
        let page = older["messages"].as_array().unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["content"], "m0");
        assert_eq!(older["hasMore"], false);
    }

    #[tokio::test]
    async fn test_admin_list_counts_unread() {
        let store = Arc::new(InMemoryChatStore::new());
        let conversation = store.insert_conversation(42).await;
        seed(&store, conversation.id, 2).await;

        let (status, body) = get_json(app(store), "/api/admin/conversations").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], conversation.id);
        assert_eq!(body[0]["unreadCount"], 2);
    }

    async fn preflight(origin: &str) -> axum::http::Response<Body> {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/health")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap();
        app(Arc::new(InMemoryChatStore::new()))
            .oneshot(request)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_preflight_from_listed_origin_allows_credentials() {
        let response = preflight("http://localhost:3000").await;
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn test_preflight_from_unlisted_origin_is_not_allowed() {
        let response = preflight("https://evil.example.com").await;
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }
}
