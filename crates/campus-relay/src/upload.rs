//! Chunked file upload handling.
//!
//! Chunks arrive base64-encoded inside one frame and are written in order,
//! with per-chunk progress reported to the uploader. The file handle lives
//! in a guard that removes the partial file on every exit path except an
//! explicit commit, so aborted or unauthorized uploads leave nothing
//! behind.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};
use uuid::Uuid;

use campus_core::events::ServerEvent;
use campus_core::model::{ChatType, Conversation, MessageBody, NewMessage, User};

use crate::error::{RelayError, Result};
use crate::registry::ConnectionId;
use crate::relay::{RelayState, Scope, private_targets, resolve_private_chat};

/// Root directory for stored upload files.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create the store, making the root directory if needed.
    pub fn new(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self { root: root.to_path_buf() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Globally-unique stored name: a fresh token joined to a sanitized
    /// version of the original name.
    pub fn stored_file_name(&self, original: &str) -> String {
        format!("{}~{}", Uuid::new_v4(), sanitize_file_name(original))
    }

    pub fn path_of(&self, stored_name: &str) -> PathBuf {
        self.root.join(stored_name)
    }
}

/// Replace whitespace and path-hostile characters with underscores.
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_whitespace() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
            {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Scoped handle for one in-progress upload. Dropping the guard without
/// committing closes the handle and removes the partial file.
pub struct UploadGuard {
    path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl UploadGuard {
    pub async fn create(path: PathBuf) -> std::io::Result<Self> {
        let file = File::create(&path).await?;
        Ok(Self { path, file: Some(file), committed: false })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Flush, close, and keep the file.
    pub async fn commit(mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        // Close the handle before touching the path.
        drop(self.file.take());
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial upload {}: {e}", self.path.display());
                }
            }
        }
    }
}

/// Handle one `uploadFile` request.
///
/// Frames missing required fields never parse and are dropped upstream
/// without reply; requests that parse but are invalid get an explicit
/// `uploadFailed` so the client can tell what happened.
#[allow(clippy::too_many_arguments)]
pub async fn handle_upload_file(
    state: &RelayState,
    conn_id: ConnectionId,
    user: &User,
    file_name: String,
    size: u64,
    data: Vec<String>,
    chat_type: ChatType,
    chat_id: &str,
) {
    if file_name.trim().is_empty() || size == 0 || data.is_empty() {
        reject(state, conn_id, &file_name, "missing file name, size, or data");
        return;
    }

    let mut chunks = Vec::with_capacity(data.len());
    for encoded in &data {
        match BASE64.decode(encoded) {
            Ok(chunk) => chunks.push(chunk),
            Err(_) => {
                reject(state, conn_id, &file_name, "chunk data is not valid base64");
                return;
            }
        }
    }

    if let Err(e) =
        run_upload(state, conn_id, user, &file_name, size, chunks, chat_type, chat_id).await
    {
        match e {
            RelayError::InvalidUpload(reason) => reject(state, conn_id, &file_name, &reason),
            other => {
                error!("Upload of {file_name} from {} failed: {other}", user.id);
                reject(state, conn_id, &file_name, "upload could not be completed");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_upload(
    state: &RelayState,
    conn_id: ConnectionId,
    user: &User,
    file_name: &str,
    size: u64,
    chunks: Vec<Vec<u8>>,
    chat_type: ChatType,
    chat_id: &str,
) -> Result<()> {
    let unique_file_name = state.files.stored_file_name(file_name);
    let mut guard = UploadGuard::create(state.files.path_of(&unique_file_name)).await?;

    // Write in arrival order, reporting progress against the declared size.
    let mut written: u64 = 0;
    for chunk in &chunks {
        guard.write_chunk(chunk).await?;
        written += chunk.len() as u64;
        state.send_to(
            Scope::Connection(conn_id),
            ServerEvent::UploadProgress {
                file_name: file_name.to_string(),
                progress: written as f64 / size as f64 * 100.0,
            },
        );
    }

    // Authorize after the write, like the send path. An unauthorized
    // upload drops the guard and with it the file.
    let (conversation, scope) = match chat_type {
        ChatType::Group => {
            let authorized = state
                .db
                .chat_group(chat_id)?
                .is_some_and(|group| group.is_member(&user.id));
            if !authorized {
                state.send_to(Scope::Connection(conn_id), ServerEvent::NotAuthorized);
                return Ok(());
            }
            (Conversation::Group(chat_id.to_string()), Scope::Room(chat_id.to_string()))
        }
        ChatType::Private => {
            let Some(chat) = resolve_private_chat(state, user, chat_id)? else {
                state.send_to(Scope::Connection(conn_id), ServerEvent::NotAuthorized);
                return Ok(());
            };
            let targets = private_targets(state, &chat).await;
            (Conversation::Private(chat.id), Scope::Connections(targets))
        }
    };

    let record = state.db.store_message(&NewMessage {
        sender_id: user.id.clone(),
        body: MessageBody::File {
            unique_file_name,
            original_file_name: file_name.to_string(),
        },
        conversation,
    })?;

    guard.commit().await?;
    state.send_to(
        Scope::Connection(conn_id),
        ServerEvent::UploadComplete { file_name: file_name.to_string() },
    );
    state.send_to(scope, ServerEvent::NewMessage(record));
    Ok(())
}

fn reject(state: &RelayState, conn_id: ConnectionId, file_name: &str, reason: &str) {
    state.send_to(
        Scope::Connection(conn_id),
        ServerEvent::UploadFailed {
            file_name: file_name.to_string(),
            reason: reason.to_string(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::AllowAllGate;
    use crate::storage::Storage;
    use campus_core::model::{Role, SenderInfo};

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(&dir.path().join("files")).unwrap();
        (dir, store)
    }

    #[test]
    fn stored_names_are_unique_and_sanitized() {
        let (_dir, store) = store();
        let a = store.stored_file_name("my report.pdf");
        let b = store.stored_file_name("my report.pdf");

        assert_ne!(a, b);
        assert!(a.ends_with("~my_report.pdf"));
        assert!(!a.contains(' '));
    }

    #[test]
    fn path_hostile_characters_are_replaced() {
        assert_eq!(sanitize_file_name("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_file_name("tab\there"), "tab_here");
    }

    #[tokio::test]
    async fn dropped_guard_removes_the_partial_file() {
        let (_dir, store) = store();
        let path = store.path_of("partial.bin");
        {
            let mut guard = UploadGuard::create(path.clone()).await.unwrap();
            guard.write_chunk(b"half of the").await.unwrap();
            // Dropped uncommitted, as on an error or abort path.
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn committed_guard_keeps_the_file() {
        let (_dir, store) = store();
        let path = store.path_of("kept.bin");
        let mut guard = UploadGuard::create(path.clone()).await.unwrap();
        guard.write_chunk(b"all of it").await.unwrap();
        guard.commit().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"all of it");
    }

    fn relay_state() -> (tempfile::TempDir, RelayState) {
        let dir = tempfile::tempdir().unwrap();
        let db = Storage::open(&dir.path().join("relay.db")).unwrap();
        let files = FileStore::new(&dir.path().join("files")).unwrap();
        (dir, RelayState::new(db, Box::new(AllowAllGate), files))
    }

    fn alice() -> User {
        User {
            id: "alice".into(),
            first_name: "Alice".into(),
            last_name: "Doe".into(),
            avatar: None,
            role: Role::Student,
        }
    }

    fn sender_of(record: &campus_core::model::MessageRecord) -> &SenderInfo {
        &record.sender
    }

    #[tokio::test]
    async fn invalid_but_parseable_request_gets_an_explicit_rejection() {
        let (_dir, state) = relay_state();
        let mut rx = state.broadcast_tx.subscribe();

        handle_upload_file(
            &state,
            ConnectionId(1),
            &alice(),
            "report.pdf".into(),
            0, // declared size of zero
            vec!["aGk=".into()],
            ChatType::Group,
            "g1",
        )
        .await;

        assert!(matches!(rx.try_recv().unwrap().event, ServerEvent::UploadFailed { .. }));
    }

    #[tokio::test]
    async fn unauthorized_upload_leaves_no_file_and_no_record() {
        let (dir, state) = relay_state();
        state.db.insert_user(&alice()).unwrap();
        let mut rx = state.broadcast_tx.subscribe();

        // No such group: not authorized.
        handle_upload_file(
            &state,
            ConnectionId(1),
            &alice(),
            "notes.txt".into(),
            2,
            vec![BASE64.encode(b"hi")],
            ChatType::Group,
            "missing-group",
        )
        .await;

        // One progress event for the chunk, then the rejection.
        assert!(matches!(rx.try_recv().unwrap().event, ServerEvent::UploadProgress { .. }));
        assert!(matches!(rx.try_recv().unwrap().event, ServerEvent::NotAuthorized));

        let files: Vec<_> = std::fs::read_dir(dir.path().join("files")).unwrap().collect();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn successful_private_upload_persists_and_completes() {
        let (dir, state) = relay_state();
        state.db.insert_user(&alice()).unwrap();
        state
            .db
            .insert_user(&User {
                id: "bob".into(),
                first_name: "Bob".into(),
                last_name: "Roe".into(),
                avatar: None,
                role: Role::Student,
            })
            .unwrap();
        let mut rx = state.broadcast_tx.subscribe();

        let payload = b"the file body";
        handle_upload_file(
            &state,
            ConnectionId(1),
            &alice(),
            "notes.txt".into(),
            payload.len() as u64,
            vec![BASE64.encode(payload)],
            ChatType::Private,
            "bob",
        )
        .await;

        match rx.try_recv().unwrap().event {
            ServerEvent::UploadProgress { progress, .. } => assert_eq!(progress, 100.0),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap().event, ServerEvent::UploadComplete { .. }));
        let record = match rx.try_recv().unwrap().event {
            ServerEvent::NewMessage(record) => record,
            other => panic!("unexpected event: {other:?}"),
        };

        assert_eq!(record.original_file_name.as_deref(), Some("notes.txt"));
        assert_eq!(sender_of(&record).id, "alice");
        let stored = record.unique_file_name.unwrap();
        assert_eq!(std::fs::read(dir.path().join("files").join(&stored)).unwrap(), payload);

        let chat = state.db.private_chats_of_user("alice").unwrap().remove(0);
        assert_eq!(state.db.messages_for_private_chat(&chat.id).unwrap().len(), 1);
    }
}
