//! SQLite persistence for users, chat groups, private chats, and messages.
//!
//! Users and groups are provisioned by the administrative side of the
//! platform; the relay reads them for authorization and room subscription
//! and only ever writes private chats and messages.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use campus_core::model::{
    ChatGroup, ChatType, Conversation, GroupMember, GroupRole, MessageBody, MessageRecord,
    MessageType, NewMessage, PrivateChat, Role, SenderInfo, User,
};

/// Current unix time in milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Persistent storage backed by SQLite.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read/write performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id         TEXT PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name  TEXT NOT NULL,
                avatar     TEXT,
                role       TEXT NOT NULL DEFAULT 'student'
            );

            CREATE TABLE IF NOT EXISTS chat_groups (
                id         TEXT PRIMARY KEY,
                owner_id   TEXT NOT NULL,
                name       TEXT NOT NULL,
                image      TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chat_groups_owner
                ON chat_groups(owner_id);

            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                user_id  TEXT NOT NULL,
                role     TEXT NOT NULL DEFAULT 'member',
                PRIMARY KEY (group_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_group_members_user
                ON group_members(user_id);

            CREATE TABLE IF NOT EXISTS private_chats (
                id         TEXT PRIMARY KEY,
                user1      TEXT NOT NULL,
                user2      TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_private_chats_user1
                ON private_chats(user1);
            CREATE INDEX IF NOT EXISTS idx_private_chats_user2
                ON private_chats(user2);

            CREATE TABLE IF NOT EXISTS messages (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id          TEXT NOT NULL,
                message_type       TEXT NOT NULL,
                content            TEXT,
                unique_file_name   TEXT,
                original_file_name TEXT,
                chat_type          TEXT NOT NULL,
                chat_group         TEXT,
                private_chat       TEXT,
                created_at         INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_group
                ON messages(chat_group, id);
            CREATE INDEX IF NOT EXISTS idx_messages_private
                ON messages(private_chat, id);",
        )?;

        info!("Database opened: {}", path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ── Users ──

    /// Look up a user by id.
    pub fn user(&self, id: &str) -> Result<Option<User>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, first_name, last_name, avatar, role FROM users WHERE id = ?1",
            params![id],
            |row| {
                let role: String = row.get(4)?;
                Ok(User {
                    id: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    avatar: row.get(3)?,
                    role: Role::parse(&role).unwrap_or_default(),
                })
            },
        )
        .optional()
    }

    /// Insert a user record. Provisioning normally happens outside the
    /// relay; this exists for seeding and tests.
    pub fn insert_user(&self, user: &User) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO users (id, first_name, last_name, avatar, role)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user.id, user.first_name, user.last_name, user.avatar, user.role.as_str()],
        )?;
        Ok(())
    }

    // ── Chat groups ──

    /// Load a group with its member list.
    pub fn chat_group(&self, id: &str) -> Result<Option<ChatGroup>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let group = conn
            .query_row(
                "SELECT id, owner_id, name, image FROM chat_groups WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, owner_id, name, image)) = group else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT user_id, role FROM group_members WHERE group_id = ?1")?;
        let members = stmt
            .query_map(params![id], |row| {
                let role: String = row.get(1)?;
                Ok(GroupMember {
                    user_id: row.get(0)?,
                    role: GroupRole::parse(&role).unwrap_or(GroupRole::Member),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(Some(ChatGroup { id, owner_id, name, image, members }))
    }

    /// Ids of every group the user owns or is listed in. Resolved once at
    /// connect time to build the connection's room set, and by the history
    /// API.
    pub fn groups_of_user(&self, user_id: &str) -> Result<Vec<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id FROM chat_groups WHERE owner_id = ?1
             UNION
             SELECT group_id FROM group_members WHERE user_id = ?1",
        )?;
        let groups = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(groups)
    }

    /// Insert a group and its member rows. Seeding/tests only.
    pub fn insert_chat_group(&self, group: &ChatGroup) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO chat_groups (id, owner_id, name, image, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![group.id, group.owner_id, group.name, group.image, now_millis()],
        )?;
        for member in &group.members {
            conn.execute(
                "INSERT OR REPLACE INTO group_members (group_id, user_id, role)
                 VALUES (?1, ?2, ?3)",
                params![group.id, member.user_id, member.role.as_str()],
            )?;
        }
        Ok(())
    }

    // ── Private chats ──

    /// Look up a private chat by id.
    pub fn private_chat(&self, id: &str) -> Result<Option<PrivateChat>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user1, user2 FROM private_chats WHERE id = ?1",
            params![id],
            |row| {
                Ok(PrivateChat { id: row.get(0)?, user1: row.get(1)?, user2: row.get(2)? })
            },
        )
        .optional()
    }

    /// Find the chat between two users, checking both column orderings, or
    /// create it. The lookup and insert run under the single connection
    /// lock, so no duplicate pair can be created within one process.
    pub fn find_or_create_private_chat(
        &self,
        a: &str,
        b: &str,
    ) -> Result<PrivateChat, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let existing = conn
            .query_row(
                "SELECT id, user1, user2 FROM private_chats
                 WHERE (user1 = ?1 AND user2 = ?2) OR (user1 = ?2 AND user2 = ?1)",
                params![a, b],
                |row| {
                    Ok(PrivateChat { id: row.get(0)?, user1: row.get(1)?, user2: row.get(2)? })
                },
            )
            .optional()?;

        if let Some(chat) = existing {
            return Ok(chat);
        }

        let chat = PrivateChat {
            id: Uuid::new_v4().to_string(),
            user1: a.to_string(),
            user2: b.to_string(),
        };
        conn.execute(
            "INSERT INTO private_chats (id, user1, user2, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![chat.id, chat.user1, chat.user2, now_millis()],
        )?;
        Ok(chat)
    }

    /// All private chats the user participates in.
    pub fn private_chats_of_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<PrivateChat>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user1, user2 FROM private_chats
             WHERE user1 = ?1 OR user2 = ?1
             ORDER BY created_at ASC",
        )?;
        let chats = stmt
            .query_map(params![user_id], |row| {
                Ok(PrivateChat { id: row.get(0)?, user1: row.get(1)?, user2: row.get(2)? })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(chats)
    }

    // ── Messages ──

    /// Insert one message and return the persisted record with the sender
    /// projection populated. Exactly one conversation column is set,
    /// discriminated by the conversation variant.
    pub fn store_message(&self, message: &NewMessage) -> Result<MessageRecord, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();

        let (content, unique_file_name, original_file_name) = match &message.body {
            MessageBody::Text(content) => (Some(content.as_str()), None, None),
            MessageBody::File { unique_file_name, original_file_name } => {
                (None, Some(unique_file_name.as_str()), Some(original_file_name.as_str()))
            }
        };
        let (chat_group, private_chat) = match &message.conversation {
            Conversation::Group(id) => (Some(id.as_str()), None),
            Conversation::Private(id) => (None, Some(id.as_str())),
        };
        let created_at = now_millis();

        conn.execute(
            "INSERT INTO messages
                (sender_id, message_type, content, unique_file_name, original_file_name,
                 chat_type, chat_group, private_chat, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.sender_id,
                message.body.message_type().as_str(),
                content,
                unique_file_name,
                original_file_name,
                message.conversation.chat_type().as_str(),
                chat_group,
                private_chat,
                created_at,
            ],
        )?;
        let id = conn.last_insert_rowid();

        let sender = conn.query_row(
            "SELECT id, first_name, last_name, avatar FROM users WHERE id = ?1",
            params![message.sender_id],
            |row| {
                Ok(SenderInfo {
                    id: row.get(0)?,
                    first_name: row.get(1)?,
                    last_name: row.get(2)?,
                    avatar: row.get(3)?,
                })
            },
        )?;

        Ok(MessageRecord {
            id,
            sender,
            message_type: message.body.message_type(),
            content: content.map(str::to_string),
            unique_file_name: unique_file_name.map(str::to_string),
            original_file_name: original_file_name.map(str::to_string),
            chat_type: message.conversation.chat_type(),
            chat_group: chat_group.map(str::to_string),
            private_chat: private_chat.map(str::to_string),
            created_at,
        })
    }

    /// History for a group, ascending by insertion order.
    pub fn messages_for_group(
        &self,
        group_id: &str,
    ) -> Result<Vec<MessageRecord>, rusqlite::Error> {
        self.messages_where("m.chat_group = ?1", group_id)
    }

    /// History for a private chat, ascending by insertion order.
    pub fn messages_for_private_chat(
        &self,
        chat_id: &str,
    ) -> Result<Vec<MessageRecord>, rusqlite::Error> {
        self.messages_where("m.private_chat = ?1", chat_id)
    }

    fn messages_where(
        &self,
        filter: &str,
        id: &str,
    ) -> Result<Vec<MessageRecord>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT m.id, m.message_type, m.content, m.unique_file_name,
                    m.original_file_name, m.chat_type, m.chat_group, m.private_chat,
                    m.created_at, u.id, u.first_name, u.last_name, u.avatar
             FROM messages m
             JOIN users u ON u.id = m.sender_id
             WHERE {filter}
             ORDER BY m.id ASC",
        ))?;
        let records = stmt
            .query_map(params![id], |row| {
                let message_type: String = row.get(1)?;
                let chat_type: String = row.get(5)?;
                Ok(MessageRecord {
                    id: row.get(0)?,
                    message_type: MessageType::parse(&message_type)
                        .unwrap_or(MessageType::Text),
                    content: row.get(2)?,
                    unique_file_name: row.get(3)?,
                    original_file_name: row.get(4)?,
                    chat_type: ChatType::parse(&chat_type).unwrap_or(ChatType::Group),
                    chat_group: row.get(6)?,
                    private_chat: row.get(7)?,
                    created_at: row.get(8)?,
                    sender: SenderInfo {
                        id: row.get(9)?,
                        first_name: row.get(10)?,
                        last_name: row.get(11)?,
                        avatar: row.get(12)?,
                    },
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }
}
