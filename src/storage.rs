use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

use crate::models::{Conversation, FileObject, Message, PrivateMessage, User};
use crate::protocol::ContentType;

/// Narrow persistence surface the managers depend on. One connection,
/// guarded by an async mutex at the composition root; SQLite's
/// uniqueness constraints back the register and get-or-create races.
pub struct Storage {
    conn: Connection,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  username TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  email TEXT,
  password_hash TEXT NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  message_id TEXT PRIMARY KEY,
  author TEXT,
  content_type TEXT NOT NULL
    CHECK (content_type IN ('text','image','video','file','audio','system')),
  content TEXT NOT NULL,
  file_url TEXT,
  file_name TEXT,
  file_size INTEGER,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_created
  ON messages (created_at, message_id);

CREATE TABLE IF NOT EXISTS conversations (
  conversation_id TEXT PRIMARY KEY,
  user_a TEXT NOT NULL,
  user_b TEXT NOT NULL,
  last_message_id TEXT,
  last_message_at INTEGER,
  unread_a INTEGER NOT NULL DEFAULT 0,
  unread_b INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL,
  UNIQUE (user_a, user_b),
  CHECK (user_a < user_b)
);

CREATE TABLE IF NOT EXISTS private_messages (
  message_id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL
    REFERENCES conversations(conversation_id) ON DELETE CASCADE,
  sender TEXT NOT NULL,
  receiver TEXT NOT NULL,
  content_type TEXT NOT NULL
    CHECK (content_type IN ('text','image','video','file','audio','system')),
  content TEXT NOT NULL,
  is_read INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_private_conversation
  ON private_messages (conversation_id, created_at);

CREATE TABLE IF NOT EXISTS files (
  file_id TEXT PRIMARY KEY,
  owner TEXT NOT NULL,
  file_name TEXT NOT NULL,
  file_path TEXT NOT NULL,
  file_url TEXT NOT NULL,
  file_type TEXT NOT NULL,
  file_size INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);
"#;

fn parse_uuid(idx: usize, s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_content_type(idx: usize, s: String) -> rusqlite::Result<ContentType> {
    s.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl Storage {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Storage { conn })
    }

    // --- users ---

    /// Insert a user; returns false when the username is already taken.
    pub fn create_user(&self, user: &User) -> Result<bool> {
        let result = self.conn.execute(
            "INSERT INTO users (username, display_name, email, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.username,
                user.display_name,
                user.email,
                user.password_hash,
                user.created_at
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        let mut stmt = self.conn.prepare(
            "SELECT username, display_name, email, password_hash, created_at
             FROM users WHERE username = ?1",
        )?;
        let user = stmt
            .query_row([username], |row| {
                Ok(User {
                    username: row.get(0)?,
                    display_name: row.get(1)?,
                    email: row.get(2)?,
                    password_hash: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .optional()?;
        Ok(user)
    }

    // --- room messages ---

    pub fn insert_message(&self, msg: &Message) -> Result<()> {
        self.conn.execute(
            "INSERT INTO messages
               (message_id, author, content_type, content, file_url, file_name, file_size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.message_id.to_string(),
                msg.author,
                msg.content_type.as_str(),
                msg.content,
                msg.file_url,
                msg.file_name,
                msg.file_size,
                msg.created_at
            ],
        )?;
        Ok(())
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        Ok(Message {
            message_id: parse_uuid(0, row.get(0)?)?,
            author: row.get(1)?,
            content_type: parse_content_type(2, row.get(2)?)?,
            content: row.get(3)?,
            file_url: row.get(4)?,
            file_name: row.get(5)?,
            file_size: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    /// Newest `limit` room messages, returned oldest-first.
    pub fn latest_messages(&self, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, author, content_type, content, file_url, file_name, file_size, created_at
             FROM messages ORDER BY created_at DESC, message_id DESC LIMIT ?1",
        )?;
        let mut messages: Vec<Message> = stmt
            .query_map([limit], Self::row_to_message)?
            .collect::<rusqlite::Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Up to `limit` messages strictly older than the cursor message,
    /// oldest-first. An unknown cursor degrades to the newest page.
    pub fn messages_before(&self, cursor: &Uuid, limit: u32) -> Result<Vec<Message>> {
        let anchor: Option<i64> = self
            .conn
            .query_row(
                "SELECT created_at FROM messages WHERE message_id = ?1",
                [cursor.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(anchor) = anchor else {
            return self.latest_messages(limit);
        };

        let mut stmt = self.conn.prepare(
            "SELECT message_id, author, content_type, content, file_url, file_name, file_size, created_at
             FROM messages
             WHERE created_at < ?1 OR (created_at = ?1 AND message_id < ?2)
             ORDER BY created_at DESC, message_id DESC LIMIT ?3",
        )?;
        let mut messages: Vec<Message> = stmt
            .query_map(params![anchor, cursor.to_string(), limit], Self::row_to_message)?
            .collect::<rusqlite::Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    // --- conversations ---

    fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
        let last: Option<String> = row.get(3)?;
        Ok(Conversation {
            conversation_id: parse_uuid(0, row.get(0)?)?,
            user_a: row.get(1)?,
            user_b: row.get(2)?,
            last_message_id: last.map(|s| parse_uuid(3, s)).transpose()?,
            last_message_at: row.get(4)?,
            unread_a: row.get(5)?,
            unread_b: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn conversation_by_pair(&self, user_a: &str, user_b: &str) -> Result<Option<Conversation>> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_id, user_a, user_b, last_message_id, last_message_at,
                    unread_a, unread_b, created_at
             FROM conversations WHERE user_a = ?1 AND user_b = ?2",
        )?;
        Ok(stmt
            .query_row([user_a, user_b], Self::row_to_conversation)
            .optional()?)
    }

    pub fn conversation_by_id(&self, conversation_id: &Uuid) -> Result<Option<Conversation>> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_id, user_a, user_b, last_message_id, last_message_at,
                    unread_a, unread_b, created_at
             FROM conversations WHERE conversation_id = ?1",
        )?;
        Ok(stmt
            .query_row([conversation_id.to_string()], Self::row_to_conversation)
            .optional()?)
    }

    /// Resolve the conversation for an unordered user pair, creating it
    /// lazily. The pair is canonicalized to `user_a < user_b` first, so
    /// both participants converge on one row; a uniqueness violation on
    /// the insert means the peer just created it, and we re-fetch.
    pub fn get_or_create_conversation(&self, user1: &str, user2: &str) -> Result<Conversation> {
        let (user_a, user_b) = if user1 <= user2 {
            (user1, user2)
        } else {
            (user2, user1)
        };

        if let Some(existing) = self.conversation_by_pair(user_a, user_b)? {
            return Ok(existing);
        }

        let conversation = Conversation {
            conversation_id: Uuid::new_v4(),
            user_a: user_a.to_string(),
            user_b: user_b.to_string(),
            last_message_id: None,
            last_message_at: None,
            unread_a: 0,
            unread_b: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let inserted = self.conn.execute(
            "INSERT INTO conversations (conversation_id, user_a, user_b, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation.conversation_id.to_string(),
                conversation.user_a,
                conversation.user_b,
                conversation.created_at
            ],
        );
        match inserted {
            Ok(_) => Ok(conversation),
            Err(e) if is_unique_violation(&e) => self
                .conversation_by_pair(user_a, user_b)?
                .ok_or_else(|| anyhow::anyhow!("conversation vanished after unique violation")),
            Err(e) => Err(e.into()),
        }
    }

    // --- private messages ---

    /// Persist a private message and advance its conversation's
    /// last-message pointer and the receiver's unread counter, as one
    /// transaction.
    pub fn record_private_message(&mut self, msg: &PrivateMessage) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO private_messages
               (message_id, conversation_id, sender, receiver, content_type, content, is_read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.message_id.to_string(),
                msg.conversation_id.to_string(),
                msg.sender,
                msg.receiver,
                msg.content_type.as_str(),
                msg.content,
                msg.is_read,
                msg.created_at
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET
               last_message_id = ?2,
               last_message_at = ?3,
               unread_a = unread_a + (CASE WHEN user_a = ?4 THEN 1 ELSE 0 END),
               unread_b = unread_b + (CASE WHEN user_b = ?4 THEN 1 ELSE 0 END)
             WHERE conversation_id = ?1",
            params![
                msg.conversation_id.to_string(),
                msg.message_id.to_string(),
                msg.created_at,
                msg.receiver
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Newest `limit` messages of a conversation, oldest-first. No
    /// cursor: room history paginates, private history does not (the
    /// client protocol depends on this asymmetry).
    pub fn private_messages(&self, conversation_id: &Uuid, limit: u32) -> Result<Vec<PrivateMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, conversation_id, sender, receiver, content_type, content, is_read, created_at
             FROM private_messages WHERE conversation_id = ?1
             ORDER BY created_at DESC, message_id DESC LIMIT ?2",
        )?;
        let mut messages: Vec<PrivateMessage> = stmt
            .query_map(params![conversation_id.to_string(), limit], |row| {
                Ok(PrivateMessage {
                    message_id: parse_uuid(0, row.get(0)?)?,
                    conversation_id: parse_uuid(1, row.get(1)?)?,
                    sender: row.get(2)?,
                    receiver: row.get(3)?,
                    content_type: parse_content_type(4, row.get(4)?)?,
                    content: row.get(5)?,
                    is_read: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub fn mark_private_read(&self, message_id: &Uuid) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE private_messages SET is_read = 1 WHERE message_id = ?1",
            [message_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    // --- files ---

    pub fn insert_file(&self, file: &FileObject) -> Result<()> {
        self.conn.execute(
            "INSERT INTO files
               (file_id, owner, file_name, file_path, file_url, file_type, file_size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                file.file_id.to_string(),
                file.owner,
                file.file_name,
                file.file_path,
                file.file_url,
                file.file_type.as_str(),
                file.file_size,
                file.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get_file(&self, file_id: &Uuid) -> Result<Option<FileObject>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id, owner, file_name, file_path, file_url, file_type, file_size, created_at
             FROM files WHERE file_id = ?1",
        )?;
        Ok(stmt
            .query_row([file_id.to_string()], |row| {
                Ok(FileObject {
                    file_id: parse_uuid(0, row.get(0)?)?,
                    owner: row.get(1)?,
                    file_name: row.get(2)?,
                    file_path: row.get(3)?,
                    file_url: row.get(4)?,
                    file_type: parse_content_type(5, row.get(5)?)?,
                    file_size: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .optional()?)
    }
}
