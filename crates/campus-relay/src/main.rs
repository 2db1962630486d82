//! Campus relay server binary.

use std::path::Path;
use std::sync::Arc;
use tower_sessions::{MemoryStore, SessionManagerLayer};
use tracing_subscriber::EnvFilter;

use campus_relay::relay::RelayState;
use campus_relay::storage::Storage;
use campus_relay::upload::FileStore;
use campus_relay::{moderation, router};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::var("CAMPUS_ADDR").unwrap_or_else(|_| "0.0.0.0:4310".to_string());
    let db_path = std::env::var("CAMPUS_DB").unwrap_or_else(|_| "campus.db".to_string());
    let files_dir = std::env::var("CAMPUS_FILES_DIR").unwrap_or_else(|_| "files".to_string());

    let db = Storage::open(Path::new(&db_path)).expect("failed to open database");
    let files = FileStore::new(Path::new(&files_dir)).expect("failed to create files directory");
    let gate = moderation::from_env();
    let state = Arc::new(RelayState::new(db, gate, files));

    // The outer web application shares this layer and writes the
    // authenticated user id into the session at login.
    let session_layer = SessionManagerLayer::new(MemoryStore::default()).with_secure(false);

    let app = router(state).layer(session_layer);

    tracing::info!("Campus relay listening on {addr}");
    tracing::info!("WebSocket:    ws://{addr}/ws");
    tracing::info!("History API:  http://{addr}/api/");
    tracing::info!("Stored files: http://{addr}/files/");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");
    axum::serve(listener, app).await.expect("server error");
}
