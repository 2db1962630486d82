//! The socket wire protocol.
//!
//! All frames are JSON text messages, internally tagged with `"type"` and
//! carrying camelCase field names. Frames that fail to deserialize are
//! silently ignored by the relay, so adding fields here is a compatible
//! change as long as existing ones keep their shape.

use serde::{Deserialize, Serialize};

use crate::model::{ChatType, MessageRecord};

/// A text message as the client submits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub chat_type: ChatType,
    pub content: String,
}

/// Events the relay consumes from clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Send a text message to a group or private chat.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        message: OutgoingMessage,
        /// Group id, private chat id, or (for a first private message)
        /// the counterpart user id.
        chat_id: String,
    },

    /// Upload a file to a conversation as an ordered sequence of
    /// base64-encoded chunks.
    #[serde(rename_all = "camelCase")]
    UploadFile {
        file_name: String,
        /// Declared total size in bytes; progress is reported against it.
        size: u64,
        data: Vec<String>,
        chat_type: ChatType,
        chat_id: String,
    },
}

/// Events the relay produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// The connection has no authenticated session; nothing else will
    /// ever be sent on it.
    NotConnected,

    /// The sender is not a member of the target group, or not a
    /// participant of the target private chat.
    NotAuthorized,

    /// A persisted message, delivered to every resolved recipient.
    NewMessage(MessageRecord),

    /// Per-chunk upload progress, sent to the uploader only.
    #[serde(rename_all = "camelCase")]
    UploadProgress { file_name: String, progress: f64 },

    /// The file is fully written and its message persisted.
    #[serde(rename_all = "camelCase")]
    UploadComplete { file_name: String },

    /// A text message was not delivered: flagged content, a moderation
    /// outage (screening fails closed), or a persistence failure.
    #[serde(rename_all = "camelCase")]
    MessageRejected { reason: String },

    /// An upload was not completed; no message was created and the
    /// partial file was removed.
    #[serde(rename_all = "camelCase")]
    UploadFailed { file_name: String, reason: String },
}
