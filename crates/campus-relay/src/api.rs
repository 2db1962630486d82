//! Session-authenticated read API for conversation history.
//!
//! The web application fetches group and private-chat history over HTTP;
//! the relay serves the read side of that. Requests without a session
//! user get 401, non-members and non-participants get 403.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use tower_sessions::Session;
use tracing::error;

use campus_core::model::{ChatGroup, MessageRecord, User};

use crate::SESSION_USER_KEY;
use crate::relay::RelayState;

/// One private chat as listed for its participant: the chat id and the
/// other party.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChatSummary {
    pub id: String,
    pub peer: String,
}

async fn session_user(session: &Session, state: &RelayState) -> Result<User, StatusCode> {
    let user_id: Option<String> = session
        .get(SESSION_USER_KEY)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let Some(user_id) = user_id else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    state
        .db
        .user(&user_id)
        .map_err(internal)?
        .ok_or(StatusCode::UNAUTHORIZED)
}

fn internal(e: rusqlite::Error) -> StatusCode {
    error!("API database error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// `GET /api/groups`: the caller's groups.
pub async fn list_groups(
    State(state): State<Arc<RelayState>>,
    session: Session,
) -> Result<Json<Vec<ChatGroup>>, StatusCode> {
    let user = session_user(&session, &state).await?;
    let ids = state.db.groups_of_user(&user.id).map_err(internal)?;
    let mut groups = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(group) = state.db.chat_group(&id).map_err(internal)? {
            groups.push(group);
        }
    }
    Ok(Json(groups))
}

/// `GET /api/groups/{id}/messages`: group history, members only.
pub async fn group_messages(
    State(state): State<Arc<RelayState>>,
    session: Session,
    Path(group_id): Path<String>,
) -> Result<Json<Vec<MessageRecord>>, StatusCode> {
    let user = session_user(&session, &state).await?;
    let Some(group) = state.db.chat_group(&group_id).map_err(internal)? else {
        return Err(StatusCode::NOT_FOUND);
    };
    if !group.is_member(&user.id) {
        return Err(StatusCode::FORBIDDEN);
    }
    let messages = state.db.messages_for_group(&group_id).map_err(internal)?;
    Ok(Json(messages))
}

/// `GET /api/private`: the caller's private chats.
pub async fn list_private_chats(
    State(state): State<Arc<RelayState>>,
    session: Session,
) -> Result<Json<Vec<PrivateChatSummary>>, StatusCode> {
    let user = session_user(&session, &state).await?;
    let chats = state.db.private_chats_of_user(&user.id).map_err(internal)?;
    let summaries = chats
        .into_iter()
        .filter_map(|chat| {
            let peer = chat.peer_of(&user.id)?.to_string();
            Some(PrivateChatSummary { id: chat.id, peer })
        })
        .collect();
    Ok(Json(summaries))
}

/// `GET /api/private/{id}/messages`: private history, participants only.
pub async fn private_chat_messages(
    State(state): State<Arc<RelayState>>,
    session: Session,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<MessageRecord>>, StatusCode> {
    let user = session_user(&session, &state).await?;
    let Some(chat) = state.db.private_chat(&chat_id).map_err(internal)? else {
        return Err(StatusCode::NOT_FOUND);
    };
    if !chat.involves(&user.id) {
        return Err(StatusCode::FORBIDDEN);
    }
    let messages = state.db.messages_for_private_chat(&chat_id).map_err(internal)?;
    Ok(Json(messages))
}
