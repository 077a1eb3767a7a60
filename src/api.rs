//! HTTP + WebSocket server for the agent runtime
//!
//! `/ws` carries the session protocol; the REST routes expose tools and
//! stored conversations to the chat UI.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::agent::Engine;
use crate::config::DEFAULT_USER_ID;
use crate::session::{conversation_uuid, transcript, ServerMessage, Session};
use crate::store::ConversationStore;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
    pub store: Arc<dyn ConversationStore>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub user_id: Option<String>,
}

impl UserQuery {
    fn user_id(&self) -> String {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_USER_ID)
            .to_string()
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "store": state.store.backend(),
        "tools": state.engine.registry().len(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Tools & Conversations
/// =============================

async fn list_tools(State(state): State<ApiState>) -> Json<ApiResponse> {
    Json(ApiResponse::success(state.engine.registry().descriptors()))
}

async fn list_conversations(
    State(state): State<ApiState>,
    Query(query): Query<UserQuery>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.store.list(&query.user_id()).await {
        Ok(conversations) => (StatusCode::OK, Json(ApiResponse::success(conversations))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Failed to list conversations: {}", e))),
        ),
    }
}

async fn get_conversation(
    State(state): State<ApiState>,
    Path(raw_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = query.user_id();

    match state.store.load(conversation_uuid(&raw_id)).await {
        Ok(Some(stored)) if stored.meta.user_id == user_id => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "conversation": stored.meta,
                "messages": transcript(&stored.turns),
                "turns": stored.turns,
            }))),
        ),
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Conversation not found: {}", raw_id))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Failed to load conversation: {}", e))),
        ),
    }
}

async fn delete_conversation(
    State(state): State<ApiState>,
    Path(raw_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> (StatusCode, Json<ApiResponse>) {
    let id = conversation_uuid(&raw_id);
    let user_id = query.user_id();

    let owned = match state.store.load(id).await {
        Ok(stored) => stored.map_or(false, |s| s.meta.user_id == user_id),
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Failed to load conversation: {}", e))),
            )
        }
    };

    if !owned {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Conversation not found: {}", raw_id))),
        );
    }

    match state.store.delete(id).await {
        Ok(_) => {
            info!(conversation_id = %id, "Conversation deleted");
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({ "deleted": id }))),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Failed to delete conversation: {}", e))),
        ),
    }
}

/// =============================
/// WebSocket Session
/// =============================

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<UserQuery>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    let user_id = query.user_id();
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

/// Drive one connection.
///
/// Frames are read on their own task so a close is noticed mid-cycle; the
/// session task is then aborted, which drops the loop and any pending
/// confirmation.
async fn handle_socket(socket: WebSocket, user_id: String, state: ApiState) {
    info!(user_id = %user_id, "WebSocket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<String>();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode server message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                debug!("WebSocket send failed");
                break;
            }
        }
    });

    let mut session = Session::new(
        Arc::clone(&state.engine),
        Arc::clone(&state.store),
        user_id.clone(),
        out_tx,
    );
    let mut session_task = tokio::spawn(async move {
        while let Some(frame) = in_rx.recv().await {
            session.handle_text(&frame).await;
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            match message {
                Message::Text(text) => {
                    if in_tx.send(text).is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => {}
        _ = &mut send_task => {}
        _ = &mut session_task => {}
    }

    recv_task.abort();
    session_task.abort();
    send_task.abort();

    info!(user_id = %user_id, "WebSocket disconnected");
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .route("/api/tools", get(list_tools))
        .route("/api/conversations", get(list_conversations))
        .route(
            "/api/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("WebSocket: ws://127.0.0.1:{}/ws", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EngineConfig;
    use crate::llm::ScriptedModel;
    use crate::models::Turn;
    use crate::store::InMemoryConversationStore;
    use crate::tools::{wallet::wallet_tool_definitions, ToolRegistry};

    fn state() -> ApiState {
        ApiState {
            engine: Arc::new(Engine::new(
                Arc::new(ScriptedModel::from_responses(vec![])),
                Arc::new(ToolRegistry::new()),
                EngineConfig::default(),
            )),
            store: Arc::new(InMemoryConversationStore::new()),
        }
    }

    fn as_user(user_id: &str) -> Query<UserQuery> {
        Query(UserQuery {
            user_id: Some(user_id.to_string()),
        })
    }

    #[test]
    fn test_default_user() {
        assert_eq!(UserQuery::default().user_id(), DEFAULT_USER_ID);
        assert_eq!(
            UserQuery {
                user_id: Some("  ".into())
            }
            .user_id(),
            DEFAULT_USER_ID
        );
    }

    #[tokio::test]
    async fn test_conversation_routes_are_user_scoped() {
        let state = state();
        let meta = state.store.create("alice").await.unwrap();
        state
            .store
            .save(meta.id, &[Turn::user("hello"), Turn::assistant("hi alice")])
            .await
            .unwrap();

        let (status, Json(listed)) =
            list_conversations(State(state.clone()), as_user("alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.data.unwrap().as_array().unwrap().len(), 1);

        let (status, Json(found)) = get_conversation(
            State(state.clone()),
            Path(meta.id.to_string()),
            as_user("alice"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found.data.unwrap()["messages"][1]["content"], "hi alice");

        let (status, _) = get_conversation(
            State(state.clone()),
            Path(meta.id.to_string()),
            as_user("mallory"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = delete_conversation(
            State(state.clone()),
            Path(meta.id.to_string()),
            as_user("mallory"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            delete_conversation(State(state.clone()), Path(meta.id.to_string()), as_user("alice"))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.store.load(meta.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_tools() {
        let state = state();
        for descriptor in wallet_tool_definitions() {
            let tool = crate::tools::FunctionTool::new(descriptor, |_| async {
                Ok(crate::models::ToolOutput::ok(serde_json::json!({})))
            });
            state.engine.registry().register(Arc::new(tool)).unwrap();
        }

        let Json(response) = list_tools(State(state)).await;
        let tools = response.data.unwrap();
        assert!(response.success);
        assert_eq!(tools.as_array().unwrap().len(), 9);
        assert_eq!(tools[0]["name"], "deposit_savings");
    }
}
