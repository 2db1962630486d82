//! The Campus messaging domain model.
//!
//! Users and chat groups are provisioned by the administrative side of the
//! platform; the messaging core only ever reads them. Private chats are
//! created lazily the first time one user messages another. Messages are
//! immutable once persisted.

use serde::{Deserialize, Serialize};

/// Platform role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Tutor,
    #[default]
    Student,
}

impl Role {
    /// Storage-side string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Tutor => "tutor",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "tutor" => Some(Role::Tutor),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

/// Which kind of conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Group,
    Private,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Group => "group",
            ChatType::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Option<ChatType> {
        match s {
            "group" => Some(ChatType::Group),
            "private" => Some(ChatType::Private),
            _ => None,
        }
    }
}

/// Payload kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<MessageType> {
        match s {
            "text" => Some(MessageType::Text),
            "file" => Some(MessageType::File),
            _ => None,
        }
    }
}

/// Role of a user inside a chat group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    Member,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRole::Owner => "owner",
            GroupRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<GroupRole> {
        match s {
            "owner" => Some(GroupRole::Owner),
            "member" => Some(GroupRole::Member),
            _ => None,
        }
    }
}

/// A platform user, as the messaging core sees one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub avatar: Option<String>,
    pub role: Role,
}

/// The sender projection embedded in every delivered message record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub avatar: Option<String>,
}

/// A listed member of a chat group (the owner is tracked separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub user_id: String,
    pub role: GroupRole,
}

/// A group chat room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatGroup {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image: Option<String>,
    pub members: Vec<GroupMember>,
}

impl ChatGroup {
    /// A user is in a group if they own it or appear in the member list.
    pub fn is_member(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.members.iter().any(|m| m.user_id == user_id)
    }
}

/// A one-to-one conversation between two distinct users.
///
/// The pair is unordered: at most one chat exists per pair, in either
/// column order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChat {
    pub id: String,
    pub user1: String,
    pub user2: String,
}

impl PrivateChat {
    /// Whether the given user is one of the two participants.
    pub fn involves(&self, user_id: &str) -> bool {
        self.user1 == user_id || self.user2 == user_id
    }

    /// The other participant, if `user_id` is one of the two.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.user1 == user_id {
            Some(&self.user2)
        } else if self.user2 == user_id {
            Some(&self.user1)
        } else {
            None
        }
    }
}

/// The conversation a message belongs to: exactly one of a group or a
/// private chat, enforced by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversation {
    Group(String),
    Private(String),
}

impl Conversation {
    pub fn chat_type(&self) -> ChatType {
        match self {
            Conversation::Group(_) => ChatType::Group,
            Conversation::Private(_) => ChatType::Private,
        }
    }
}

/// Type-specific payload of a message.
#[derive(Debug, Clone)]
pub enum MessageBody {
    Text(String),
    File {
        unique_file_name: String,
        original_file_name: String,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Text(_) => MessageType::Text,
            MessageBody::File { .. } => MessageType::File,
        }
    }
}

/// Input to message persistence: one message as the sender submitted it.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub body: MessageBody,
    pub conversation: Conversation,
}

/// A persisted message, as delivered to clients and history readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    pub sender: SenderInfo,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unique_file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_file_name: Option<String>,
    pub chat_type: ChatType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chat_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub private_chat: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> ChatGroup {
        ChatGroup {
            id: "g1".into(),
            owner_id: "owner".into(),
            name: "Math tutoring".into(),
            image: None,
            members: vec![
                GroupMember { user_id: "alice".into(), role: GroupRole::Member },
                GroupMember { user_id: "bob".into(), role: GroupRole::Member },
            ],
        }
    }

    #[test]
    fn owner_is_a_member() {
        assert!(group().is_member("owner"));
    }

    #[test]
    fn listed_member_is_a_member() {
        assert!(group().is_member("alice"));
        assert!(group().is_member("bob"));
    }

    #[test]
    fn outsider_is_not_a_member() {
        assert!(!group().is_member("mallory"));
    }

    #[test]
    fn private_chat_peer_resolution() {
        let chat = PrivateChat {
            id: "p1".into(),
            user1: "alice".into(),
            user2: "bob".into(),
        };
        assert!(chat.involves("alice"));
        assert!(chat.involves("bob"));
        assert!(!chat.involves("mallory"));
        assert_eq!(chat.peer_of("alice"), Some("bob"));
        assert_eq!(chat.peer_of("bob"), Some("alice"));
        assert_eq!(chat.peer_of("mallory"), None);
    }

    #[test]
    fn conversation_discriminates_chat_type() {
        assert_eq!(Conversation::Group("g1".into()).chat_type(), ChatType::Group);
        assert_eq!(Conversation::Private("p1".into()).chat_type(), ChatType::Private);
    }

    #[test]
    fn role_round_trips_through_storage_strings() {
        for role in [Role::Admin, Role::Teacher, Role::Tutor, Role::Student] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("janitor"), None);
    }
}
