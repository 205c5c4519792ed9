use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ContentType;

/// Account record held by the persistence layer. Never serialized to
/// the wire; the password hash must not leave the server.
#[derive(Clone, Debug)]
pub struct User {
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub created_at: i64,
}

/// Room-scoped message. `author` is None for system notices. Ordering
/// key is `(created_at, message_id)`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub message_id: Uuid,
    pub author: Option<String>,
    pub content_type: ContentType,
    pub content: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub created_at: i64,
}

impl Message {
    pub fn text(author: &str, content: &str) -> Self {
        Message {
            message_id: Uuid::new_v4(),
            author: Some(author.to_string()),
            content_type: ContentType::Text,
            content: content.to_string(),
            file_url: None,
            file_name: None,
            file_size: None,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn system(content: &str) -> Self {
        Message {
            message_id: Uuid::new_v4(),
            author: None,
            content_type: ContentType::System,
            content: content.to_string(),
            file_url: None,
            file_name: None,
            file_size: None,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn file(
        author: &str,
        content_type: ContentType,
        file_name: &str,
        file_url: &str,
        file_size: i64,
    ) -> Self {
        Message {
            message_id: Uuid::new_v4(),
            author: Some(author.to_string()),
            content_type,
            content: file_name.to_string(),
            file_url: Some(file_url.to_string()),
            file_name: Some(file_name.to_string()),
            file_size: Some(file_size),
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Durable identity of a two-party thread. The invariant
/// `user_a < user_b` (string order) means both participants resolve
/// the same row no matter who asks first.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversation {
    pub conversation_id: Uuid,
    pub user_a: String,
    pub user_b: String,
    pub last_message_id: Option<Uuid>,
    pub last_message_at: Option<i64>,
    pub unread_a: i64,
    pub unread_b: i64,
    pub created_at: i64,
}

/// Message owned by a conversation; read state is per-receiver.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PrivateMessage {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub content_type: ContentType,
    pub content: String,
    pub is_read: bool,
    pub created_at: i64,
}

impl PrivateMessage {
    pub fn new(
        conversation_id: Uuid,
        sender: &str,
        receiver: &str,
        content_type: ContentType,
        content: &str,
    ) -> Self {
        PrivateMessage {
            message_id: Uuid::new_v4(),
            conversation_id,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            content_type,
            content: content.to_string(),
            is_read: false,
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Stored file registered by the relay before any message references it.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileObject {
    pub file_id: Uuid,
    pub owner: String,
    pub file_name: String,
    pub file_path: String,
    pub file_url: String,
    pub file_type: ContentType,
    pub file_size: i64,
    pub created_at: i64,
}
