//! Campus messaging relay.
//!
//! A WebSocket relay for the Campus school platform: session-authenticated
//! connections, group rooms, lazily-created private chats, content
//! moderation in front of persistence, and chunked file upload with
//! progress reporting. The outer web application owns session
//! establishment; the relay only reads the authenticated user id from the
//! session.

pub mod api;
pub mod error;
pub mod moderation;
pub mod registry;
pub mod relay;
pub mod storage;
pub mod upload;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_sessions::Session;

use relay::RelayState;

/// Session key under which the outer application stores the
/// authenticated user id.
pub const SESSION_USER_KEY: &str = "user_id";

/// Build the relay router. The caller layers the session middleware on
/// top so that the same store can also serve its own routes.
pub fn router(state: Arc<RelayState>) -> Router {
    let files_dir = state.files.root().to_path_buf();
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/groups", get(api::list_groups))
        .route("/api/groups/{id}/messages", get(api::group_messages))
        .route("/api/private", get(api::list_private_chats))
        .route("/api/private/{id}/messages", get(api::private_chat_messages))
        .nest_service("/files", ServeDir::new(files_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    session: Session,
) -> impl IntoResponse {
    // Resolve the session user before the upgrade; the socket handler
    // tells an unauthenticated client and hangs up.
    let user = match session.get::<String>(SESSION_USER_KEY).await {
        Ok(Some(user_id)) => state.db.user(&user_id).ok().flatten(),
        _ => None,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<RelayState>,
    user: Option<campus_core::model::User>,
) {
    relay::handle_connection(socket, state, user).await;
}
