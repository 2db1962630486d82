//! Core relay logic: connection bootstrap and message fan-out.
//!
//! One broadcast channel carries every outbound event; each connection's
//! send task filters by scope. Group delivery is room-based: a connection
//! joins the rooms of the groups its user belonged to at connect time, so
//! membership changes apply on reconnect. Private delivery resolves the
//! connection registry fresh at send time.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast};
use tracing::{error, info, warn};

use campus_core::events::{ClientEvent, OutgoingMessage, ServerEvent};
use campus_core::model::{ChatType, Conversation, MessageBody, NewMessage, PrivateChat, User};

use crate::error::{RelayError, Result};
use crate::moderation::ModerationGate;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::storage::Storage;
use crate::upload::FileStore;

/// Maximum broadcast channel capacity.
const BROADCAST_CAPACITY: usize = 256;

/// Which connections an outbound event is for.
#[derive(Debug, Clone)]
pub enum Scope {
    /// One connection: targeted notices and upload progress.
    Connection(ConnectionId),
    /// An explicit set, resolved from the registry: private delivery.
    Connections(Vec<ConnectionId>),
    /// Every connection subscribed to a group's room.
    Room(String),
}

/// One event on the broadcast channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub scope: Scope,
    pub event: ServerEvent,
}

/// Shared relay state.
pub struct RelayState {
    /// Live connections per user. Mutated only by the connection
    /// bootstrap, read by the private fan-out path.
    pub registry: RwLock<ConnectionRegistry>,
    /// Broadcast channel for outbound events.
    pub broadcast_tx: broadcast::Sender<Outbound>,
    /// Persistent storage (SQLite).
    pub db: Storage,
    /// Content moderation gate.
    pub gate: Box<dyn ModerationGate>,
    /// Stored-file root for uploads.
    pub files: FileStore,
    next_connection_id: AtomicU64,
}

impl RelayState {
    pub fn new(db: Storage, gate: Box<dyn ModerationGate>, files: FileStore) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            registry: RwLock::new(ConnectionRegistry::new()),
            broadcast_tx,
            db,
            gate,
            files,
            next_connection_id: AtomicU64::new(1),
        }
    }

    fn mint_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Put one event on the bus. Send errors only mean nobody is
    /// connected, which is fine.
    pub fn send_to(&self, scope: Scope, event: ServerEvent) {
        let _ = self.broadcast_tx.send(Outbound { scope, event });
    }
}

/// Handle a single WebSocket connection.
pub async fn handle_connection(socket: WebSocket, state: Arc<RelayState>, user: Option<User>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // No authenticated session: say so and stop. The connection never
    // reaches the registry.
    let Some(user) = user else {
        let notice = serde_json::to_string(&ServerEvent::NotConnected).unwrap();
        let _ = ws_tx.send(Message::Text(notice.into())).await;
        let _ = ws_tx.close().await;
        return;
    };

    let conn_id = state.mint_connection_id();
    let mut broadcast_rx = state.broadcast_tx.subscribe();

    // Room snapshot: the groups this user belongs to right now.
    let rooms: HashSet<String> = match state.db.groups_of_user(&user.id) {
        Ok(groups) => groups.into_iter().collect(),
        Err(e) => {
            error!("Failed to resolve groups for {}: {e}", user.id);
            HashSet::new()
        }
    };

    state.registry.write().await.register(&user.id, conn_id);
    info!("User connected: {} ({conn_id}), {} room(s)", user.id, rooms.len());

    // Forward scoped broadcast events to this connection.
    let mut send_task = tokio::spawn(async move {
        while let Ok(out) = broadcast_rx.recv().await {
            let deliver = match &out.scope {
                Scope::Connection(id) => *id == conn_id,
                Scope::Connections(ids) => ids.contains(&conn_id),
                Scope::Room(group_id) => rooms.contains(group_id),
            };
            if !deliver {
                continue;
            }
            let json = serde_json::to_string(&out.event).unwrap();
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Read incoming events from the client.
    let state_clone = state.clone();
    let user_clone = user.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => {
                    // Frames that don't parse are dropped without reply.
                    if let Ok(event) = serde_json::from_str::<ClientEvent>(&text) {
                        match event {
                            ClientEvent::SendMessage { message, chat_id } => {
                                handle_send_message(
                                    &state_clone,
                                    conn_id,
                                    &user_clone,
                                    message,
                                    &chat_id,
                                )
                                .await;
                            }
                            ClientEvent::UploadFile {
                                file_name,
                                size,
                                data,
                                chat_type,
                                chat_id,
                            } => {
                                crate::upload::handle_upload_file(
                                    &state_clone,
                                    conn_id,
                                    &user_clone,
                                    file_name,
                                    size,
                                    data,
                                    chat_type,
                                    &chat_id,
                                )
                                .await;
                            }
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.registry.write().await.unregister(&user.id, conn_id);
    info!("User disconnected: {} ({conn_id})", user.id);
}

/// Dispatch one text message, mapping failures onto targeted notices.
pub async fn handle_send_message(
    state: &RelayState,
    conn_id: ConnectionId,
    user: &User,
    message: OutgoingMessage,
    chat_id: &str,
) {
    let result = match message.chat_type {
        ChatType::Group => send_group_message(state, conn_id, user, &message.content, chat_id).await,
        ChatType::Private => {
            send_private_message(state, conn_id, user, &message.content, chat_id).await
        }
    };

    if let Err(e) = result {
        let reason = match e {
            RelayError::ContentFlagged => "message content was flagged".to_string(),
            RelayError::ModerationUnavailable(detail) => {
                warn!("Moderation unavailable, blocking send: {detail}");
                "content screening is unavailable".to_string()
            }
            other => {
                error!("Failed to deliver message from {}: {other}", user.id);
                "message could not be delivered".to_string()
            }
        };
        state.send_to(Scope::Connection(conn_id), ServerEvent::MessageRejected { reason });
    }
}

async fn send_group_message(
    state: &RelayState,
    conn_id: ConnectionId,
    user: &User,
    content: &str,
    group_id: &str,
) -> Result<()> {
    let authorized = state
        .db
        .chat_group(group_id)?
        .is_some_and(|group| group.is_member(&user.id));
    if !authorized {
        state.send_to(Scope::Connection(conn_id), ServerEvent::NotAuthorized);
        return Ok(());
    }

    screen(state, content).await?;

    let record = state.db.store_message(&NewMessage {
        sender_id: user.id.clone(),
        body: MessageBody::Text(content.to_string()),
        conversation: Conversation::Group(group_id.to_string()),
    })?;

    state.send_to(Scope::Room(group_id.to_string()), ServerEvent::NewMessage(record));
    Ok(())
}

async fn send_private_message(
    state: &RelayState,
    conn_id: ConnectionId,
    user: &User,
    content: &str,
    chat_id: &str,
) -> Result<()> {
    let Some(chat) = resolve_private_chat(state, user, chat_id)? else {
        state.send_to(Scope::Connection(conn_id), ServerEvent::NotAuthorized);
        return Ok(());
    };

    screen(state, content).await?;

    let record = state.db.store_message(&NewMessage {
        sender_id: user.id.clone(),
        body: MessageBody::Text(content.to_string()),
        conversation: Conversation::Private(chat.id.clone()),
    })?;

    let targets = private_targets(state, &chat).await;
    state.send_to(Scope::Connections(targets), ServerEvent::NewMessage(record));
    Ok(())
}

/// Every text message goes through the gate before persistence; a
/// moderation failure blocks the send (fail closed).
async fn screen(state: &RelayState, content: &str) -> Result<()> {
    let verdict = state.gate.screen(content).await?;
    if verdict.flagged {
        return Err(RelayError::ContentFlagged);
    }
    Ok(())
}

/// Resolve the private conversation a `chatId` names.
///
/// An id of an existing chat requires the sender to be a participant.
/// Otherwise the id is taken as the counterpart user, and the pair's chat
/// is looked up or created. `None` means the action is not authorized.
pub(crate) fn resolve_private_chat(
    state: &RelayState,
    user: &User,
    chat_id: &str,
) -> Result<Option<PrivateChat>> {
    if let Some(chat) = state.db.private_chat(chat_id)? {
        if chat.involves(&user.id) {
            return Ok(Some(chat));
        }
        return Ok(None);
    }

    match state.db.user(chat_id)? {
        Some(peer) if peer.id != user.id => {
            Ok(Some(state.db.find_or_create_private_chat(&user.id, &peer.id)?))
        }
        _ => Ok(None),
    }
}

/// Live connections of both participants (0, 1, or more; the sender's own
/// connections included).
pub(crate) async fn private_targets(state: &RelayState, chat: &PrivateChat) -> Vec<ConnectionId> {
    let registry = state.registry.read().await;
    let mut targets = registry.connections_of(&chat.user1);
    targets.extend(registry.connections_of(&chat.user2));
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{AllowAllGate, Verdict};
    use async_trait::async_trait;
    use campus_core::model::{ChatGroup, GroupMember, GroupRole, MessageType, Role};

    struct FlagAllGate;

    #[async_trait]
    impl ModerationGate for FlagAllGate {
        async fn screen(&self, _text: &str) -> Result<Verdict> {
            Ok(Verdict { flagged: true, toxicity: 1.0, threat: 1.0 })
        }
    }

    struct BrokenGate;

    #[async_trait]
    impl ModerationGate for BrokenGate {
        async fn screen(&self, _text: &str) -> Result<Verdict> {
            Err(RelayError::ModerationUnavailable("connection refused".into()))
        }
    }

    fn state_with_gate(gate: Box<dyn ModerationGate>) -> (tempfile::TempDir, RelayState) {
        let dir = tempfile::tempdir().unwrap();
        let db = Storage::open(&dir.path().join("relay.db")).unwrap();
        let files = FileStore::new(&dir.path().join("files")).unwrap();
        (dir, RelayState::new(db, gate, files))
    }

    fn user(id: &str) -> User {
        User {
            id: id.into(),
            first_name: format!("{id}-first"),
            last_name: format!("{id}-last"),
            avatar: None,
            role: Role::Student,
        }
    }

    fn seed_group(state: &RelayState, id: &str, owner: &str, members: &[&str]) {
        state
            .db
            .insert_chat_group(&ChatGroup {
                id: id.into(),
                owner_id: owner.into(),
                name: format!("{id}-name"),
                image: None,
                members: members
                    .iter()
                    .map(|m| GroupMember { user_id: (*m).into(), role: GroupRole::Member })
                    .collect(),
            })
            .unwrap();
    }

    fn text(content: &str, chat_type: ChatType) -> OutgoingMessage {
        OutgoingMessage { chat_type, content: content.into() }
    }

    #[tokio::test]
    async fn non_member_group_send_is_rejected_without_persistence() {
        let (_dir, state) = state_with_gate(Box::new(AllowAllGate));
        state.db.insert_user(&user("mallory")).unwrap();
        seed_group(&state, "g1", "owner", &["alice"]);
        let mut rx = state.broadcast_tx.subscribe();

        handle_send_message(&state, ConnectionId(1), &user("mallory"), text("hi", ChatType::Group), "g1")
            .await;

        let out = rx.try_recv().unwrap();
        assert!(matches!(out.event, ServerEvent::NotAuthorized));
        assert!(matches!(out.scope, Scope::Connection(ConnectionId(1))));
        assert!(state.db.messages_for_group("g1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn member_group_send_is_persisted_and_broadcast_to_the_room() {
        let (_dir, state) = state_with_gate(Box::new(AllowAllGate));
        state.db.insert_user(&user("alice")).unwrap();
        seed_group(&state, "g1", "owner", &["alice"]);
        let mut rx = state.broadcast_tx.subscribe();

        handle_send_message(&state, ConnectionId(1), &user("alice"), text("hello", ChatType::Group), "g1")
            .await;

        let out = rx.try_recv().unwrap();
        match (&out.scope, &out.event) {
            (Scope::Room(room), ServerEvent::NewMessage(record)) => {
                assert_eq!(room, "g1");
                assert_eq!(record.content.as_deref(), Some("hello"));
                assert_eq!(record.chat_type, ChatType::Group);
                assert_eq!(record.chat_group.as_deref(), Some("g1"));
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
        assert_eq!(state.db.messages_for_group("g1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flagged_content_is_rejected_and_not_persisted() {
        let (_dir, state) = state_with_gate(Box::new(FlagAllGate));
        state.db.insert_user(&user("alice")).unwrap();
        seed_group(&state, "g1", "alice", &[]);
        let mut rx = state.broadcast_tx.subscribe();

        handle_send_message(&state, ConnectionId(1), &user("alice"), text("rude", ChatType::Group), "g1")
            .await;

        let out = rx.try_recv().unwrap();
        assert!(matches!(out.event, ServerEvent::MessageRejected { .. }));
        assert!(state.db.messages_for_group("g1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn moderation_outage_fails_closed() {
        let (_dir, state) = state_with_gate(Box::new(BrokenGate));
        state.db.insert_user(&user("alice")).unwrap();
        seed_group(&state, "g1", "alice", &[]);
        let mut rx = state.broadcast_tx.subscribe();

        handle_send_message(&state, ConnectionId(1), &user("alice"), text("hi", ChatType::Group), "g1")
            .await;

        assert!(matches!(rx.try_recv().unwrap().event, ServerEvent::MessageRejected { .. }));
        assert!(state.db.messages_for_group("g1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_private_message_creates_the_chat_and_the_second_reuses_it() {
        let (_dir, state) = state_with_gate(Box::new(AllowAllGate));
        state.db.insert_user(&user("alice")).unwrap();
        state.db.insert_user(&user("bob")).unwrap();
        let mut rx = state.broadcast_tx.subscribe();

        // chatId is bob's user id on the very first message.
        handle_send_message(&state, ConnectionId(1), &user("alice"), text("hi", ChatType::Private), "bob")
            .await;
        let first = match rx.try_recv().unwrap().event {
            ServerEvent::NewMessage(record) => record,
            other => panic!("unexpected event: {other:?}"),
        };
        let chat_id = first.private_chat.clone().unwrap();
        assert_eq!(first.chat_type, ChatType::Private);
        assert!(first.chat_group.is_none());

        handle_send_message(
            &state,
            ConnectionId(1),
            &user("bob"),
            text("hi back", ChatType::Private),
            "alice",
        )
        .await;
        let second = match rx.try_recv().unwrap().event {
            ServerEvent::NewMessage(record) => record,
            other => panic!("unexpected event: {other:?}"),
        };

        assert_eq!(second.private_chat.as_deref(), Some(chat_id.as_str()));
        assert_eq!(state.db.private_chats_of_user("alice").unwrap().len(), 1);
        assert_eq!(state.db.messages_for_private_chat(&chat_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn private_delivery_targets_both_participants_connections() {
        let (_dir, state) = state_with_gate(Box::new(AllowAllGate));
        state.db.insert_user(&user("alice")).unwrap();
        state.db.insert_user(&user("bob")).unwrap();
        {
            let mut registry = state.registry.write().await;
            registry.register("alice", ConnectionId(1));
            registry.register("bob", ConnectionId(2));
            registry.register("bob", ConnectionId(3));
        }
        let mut rx = state.broadcast_tx.subscribe();

        handle_send_message(&state, ConnectionId(1), &user("alice"), text("hi", ChatType::Private), "bob")
            .await;

        let out = rx.try_recv().unwrap();
        match out.scope {
            Scope::Connections(mut ids) => {
                ids.sort();
                assert_eq!(ids, vec![ConnectionId(1), ConnectionId(2), ConnectionId(3)]);
            }
            other => panic!("unexpected scope: {other:?}"),
        }
    }

    #[tokio::test]
    async fn outsider_cannot_post_into_an_existing_private_chat() {
        let (_dir, state) = state_with_gate(Box::new(AllowAllGate));
        for id in ["alice", "bob", "mallory"] {
            state.db.insert_user(&user(id)).unwrap();
        }
        let chat = state.db.find_or_create_private_chat("alice", "bob").unwrap();
        let mut rx = state.broadcast_tx.subscribe();

        handle_send_message(
            &state,
            ConnectionId(9),
            &user("mallory"),
            text("hi", ChatType::Private),
            &chat.id,
        )
        .await;

        assert!(matches!(rx.try_recv().unwrap().event, ServerEvent::NotAuthorized));
        assert!(state.db.messages_for_private_chat(&chat.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_records_skip_the_moderation_gate() {
        // The gate would flag anything, but file messages carry no text.
        let (_dir, state) = state_with_gate(Box::new(FlagAllGate));
        state.db.insert_user(&user("alice")).unwrap();
        let chat = state.db.find_or_create_private_chat("alice", "bob").unwrap();

        let record = state
            .db
            .store_message(&NewMessage {
                sender_id: "alice".into(),
                body: MessageBody::File {
                    unique_file_name: "u~f.pdf".into(),
                    original_file_name: "f.pdf".into(),
                },
                conversation: Conversation::Private(chat.id),
            })
            .unwrap();
        assert_eq!(record.message_type, MessageType::File);
    }
}
