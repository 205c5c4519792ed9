use std::sync::Arc;

use anyhow::{bail, Result};
use log::{error, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::connections::ConnectionManager;
use crate::files::StoredFile;
use crate::models::{Conversation, Message, PrivateMessage};
use crate::protocol::{ContentType, Response};
use crate::storage::Storage;

/// Largest page a history query will serve regardless of the
/// requested limit.
const MAX_HISTORY_LIMIT: u32 = 200;

/// Room broadcast, private delivery, conversation identity and history
/// pagination. Stateless itself; everything lives in the registry and
/// the store.
pub struct MessageManager {
    storage: Arc<Mutex<Storage>>,
    connections: Arc<ConnectionManager>,
}

impl MessageManager {
    pub fn new(storage: Arc<Mutex<Storage>>, connections: Arc<ConnectionManager>) -> Self {
        MessageManager {
            storage,
            connections,
        }
    }

    /// Persist a room text message and relay it to everyone except the
    /// author, who already rendered their own copy locally.
    pub async fn broadcast_text(&self, author: &str, content: &str) -> Result<()> {
        let msg = Message::text(author, content);
        self.storage.lock().await.insert_message(&msg)?;
        self.fan_out(
            Response::Text {
                username: author.to_string(),
                content: content.to_string(),
                timestamp: msg.created_at,
            },
            Some(author),
        )
        .await;
        Ok(())
    }

    /// Persist a file message referencing an already-stored payload and
    /// relay the payload to every other session.
    pub async fn broadcast_file(
        &self,
        author: &str,
        content_type: ContentType,
        stored: &StoredFile,
        data_b64: String,
    ) -> Result<()> {
        let msg = Message::file(author, content_type, &stored.file_name, &stored.url, stored.size);
        self.storage.lock().await.insert_message(&msg)?;

        let username = author.to_string();
        let filename = stored.file_name.clone();
        let size = stored.size;
        let timestamp = msg.created_at;
        let envelope = match content_type {
            ContentType::Image => Response::Image {
                username,
                filename,
                data: data_b64,
                size,
                timestamp,
            },
            ContentType::Video => Response::Video {
                username,
                filename,
                data: data_b64,
                size,
                timestamp,
            },
            ContentType::Audio => Response::Audio {
                username,
                filename,
                data: data_b64,
                size,
                timestamp,
            },
            _ => Response::File {
                username,
                filename,
                data: data_b64,
                size,
                timestamp,
            },
        };
        self.fan_out(envelope, Some(author)).await;
        Ok(())
    }

    /// Persist a system notice (no author) and tell everyone.
    pub async fn broadcast_system(&self, text: &str) -> Result<()> {
        let msg = Message::system(text);
        self.storage.lock().await.insert_message(&msg)?;
        self.fan_out(
            Response::System {
                message: text.to_string(),
                timestamp: msg.created_at,
            },
            None,
        )
        .await;
        Ok(())
    }

    pub async fn user_list(&self) -> Response {
        Response::UserList {
            users: self.connections.list_usernames().await,
        }
    }

    /// Push the current online-user list to every session.
    pub async fn push_user_list(&self) {
        let list = self.user_list().await;
        self.fan_out(list, None).await;
    }

    /// Route a private message: canonical conversation, durable record,
    /// then best-effort live delivery iff the receiver is online. The
    /// sender is never echoed a server copy. Returns the conversation
    /// the message landed in.
    pub async fn send_private(
        &self,
        sender: &str,
        receiver: &str,
        content: &str,
        content_type: ContentType,
    ) -> Result<Uuid> {
        if sender.is_empty() || receiver.is_empty() {
            bail!("sender and receiver are required");
        }
        if sender == receiver {
            bail!("cannot send a private message to yourself");
        }
        if content.trim().is_empty() {
            bail!("message content cannot be empty");
        }
        // Media payloads travel through the file relay on the room
        // path; the private path carries no file reference to honor.
        if content_type != ContentType::Text {
            bail!("private messages support text content only");
        }

        let msg = {
            let mut storage = self.storage.lock().await;
            if storage.get_user(receiver)?.is_none() {
                bail!("no such user: {}", receiver);
            }
            let conversation = storage.get_or_create_conversation(sender, receiver)?;
            let msg = PrivateMessage::new(
                conversation.conversation_id,
                sender,
                receiver,
                content_type,
                content,
            );
            storage.record_private_message(&msg)?;
            msg
        };

        if let Some(tx) = self.connections.sender_for(receiver).await {
            let push = Response::Private {
                username: sender.to_string(),
                receiver: receiver.to_string(),
                content: content.to_string(),
                content_type,
                conversation_id: msg.conversation_id,
                timestamp: msg.created_at,
            };
            if tx.try_send(push).is_err() {
                warn!("private delivery to {} failed, dropping session", receiver);
                self.connections.unregister(receiver).await;
            }
        }

        Ok(msg.conversation_id)
    }

    pub async fn get_history(&self, cursor: Option<Uuid>, limit: u32) -> Result<Vec<Message>> {
        let limit = limit.min(MAX_HISTORY_LIMIT);
        let storage = self.storage.lock().await;
        match cursor {
            Some(cursor) => storage.messages_before(&cursor, limit),
            None => storage.latest_messages(limit),
        }
    }

    pub async fn get_private_history(
        &self,
        conversation_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<PrivateMessage>> {
        let limit = limit.min(MAX_HISTORY_LIMIT);
        let storage = self.storage.lock().await;
        if storage.conversation_by_id(conversation_id)?.is_none() {
            bail!("no such conversation");
        }
        storage.private_messages(conversation_id, limit)
    }

    /// Flip a private message's read flag; false when the id is unknown.
    pub async fn mark_read(&self, message_id: &Uuid) -> Result<bool> {
        self.storage.lock().await.mark_private_read(message_id)
    }

    pub async fn get_or_create_conversation(&self, a: &str, b: &str) -> Result<Conversation> {
        if a.is_empty() || b.is_empty() {
            bail!("both usernames are required");
        }
        if a == b {
            bail!("cannot start a conversation with yourself");
        }
        let storage = self.storage.lock().await;
        if storage.get_user(a)?.is_none() {
            bail!("no such user: {}", a);
        }
        if storage.get_user(b)?.is_none() {
            bail!("no such user: {}", b);
        }
        storage.get_or_create_conversation(a, b)
    }

    /// Deliver one envelope to every registered session except
    /// `exclude`. Failed sends are collected and those sessions are
    /// dropped after the loop; one bad peer never blocks the rest.
    async fn fan_out(&self, envelope: Response, exclude: Option<&str>) {
        let sessions = self.connections.snapshot().await;
        let mut failed = Vec::new();

        for (username, tx) in sessions {
            if Some(username.as_str()) == exclude {
                continue;
            }
            if let Err(e) = tx.try_send(envelope.clone()) {
                error!("delivery to {} failed: {}", username, e);
                failed.push(username);
            }
        }

        for username in failed {
            self.connections.unregister(&username).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::Session;
    use tokio::sync::{mpsc, watch};

    struct Fixture {
        manager: MessageManager,
        connections: Arc<ConnectionManager>,
        storage: Arc<Mutex<Storage>>,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(Mutex::new(Storage::new(":memory:").unwrap()));
        let connections = Arc::new(ConnectionManager::new());
        let manager = MessageManager::new(storage.clone(), connections.clone());
        Fixture {
            manager,
            connections,
            storage,
        }
    }

    async fn add_user(fx: &Fixture, name: &str) {
        let user = crate::models::User {
            username: name.to_string(),
            display_name: name.to_string(),
            email: None,
            password_hash: "x".to_string(),
            created_at: 0,
        };
        assert!(fx.storage.lock().await.create_user(&user).unwrap());
    }

    async fn connect(fx: &Fixture, name: &str) -> mpsc::Receiver<Response> {
        let (tx, rx) = mpsc::channel(16);
        let (shutdown, _) = watch::channel(());
        assert!(fx.connections.register(name, Session::new(tx, shutdown)).await);
        rx
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let fx = fixture().await;
        let mut alice_rx = connect(&fx, "alice").await;
        let mut bob_rx = connect(&fx, "bob").await;

        fx.manager.broadcast_text("alice", "hello room").await.unwrap();

        match bob_rx.try_recv().unwrap() {
            Response::Text { username, content, .. } => {
                assert_eq!(username, "alice");
                assert_eq!(content, "hello room");
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_delivery_drops_only_that_session() {
        let fx = fixture().await;
        let mut bob_rx = connect(&fx, "bob").await;
        let carol_rx = connect(&fx, "carol").await;
        drop(carol_rx); // carol's writer is gone

        fx.manager.broadcast_text("alice", "still here?").await.unwrap();

        assert!(bob_rx.try_recv().is_ok());
        assert!(!fx.connections.is_online("carol").await);
        assert!(fx.connections.is_online("bob").await);
    }

    #[tokio::test]
    async fn backlogged_session_is_shut_down_not_orphaned() {
        let fx = fixture().await;
        let (tx, _rx) = mpsc::channel(1);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        assert!(fx
            .connections
            .register("carol", Session::new(tx.clone(), shutdown_tx))
            .await);
        // Fill carol's queue so the next delivery cannot be enqueued.
        tx.try_send(Response::error("filler")).unwrap();

        fx.manager.broadcast_text("alice", "over capacity").await.unwrap();

        assert!(!fx.connections.is_online("carol").await);
        // Her connection is told to close, not left serving requests.
        assert!(shutdown_rx.changed().await.is_ok());
    }

    #[tokio::test]
    async fn system_notice_reaches_everyone_and_persists() {
        let fx = fixture().await;
        let mut alice_rx = connect(&fx, "alice").await;

        fx.manager.broadcast_system("alice joined the chat room").await.unwrap();

        assert!(matches!(
            alice_rx.try_recv().unwrap(),
            Response::System { .. }
        ));
        let history = fx.manager.get_history(None, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].author.is_none());
        assert_eq!(history[0].content_type, ContentType::System);
    }

    #[tokio::test]
    async fn private_message_round_trip_when_online() {
        let fx = fixture().await;
        add_user(&fx, "alice").await;
        add_user(&fx, "bob").await;
        let mut bob_rx = connect(&fx, "bob").await;

        let conv_id = fx
            .manager
            .send_private("alice", "bob", "hi", ContentType::Text)
            .await
            .unwrap();

        match bob_rx.try_recv().unwrap() {
            Response::Private {
                username,
                content,
                conversation_id,
                ..
            } => {
                assert_eq!(username, "alice");
                assert_eq!(content, "hi");
                assert_eq!(conversation_id, conv_id);
            }
            other => panic!("unexpected envelope: {:?}", other),
        }

        let history = fx.manager.get_private_history(&conv_id, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn offline_receiver_still_gets_durable_history() {
        let fx = fixture().await;
        add_user(&fx, "alice").await;
        add_user(&fx, "bob").await;
        // bob never connects

        let conv_id = fx
            .manager
            .send_private("alice", "bob", "read me later", ContentType::Text)
            .await
            .unwrap();

        let history = fx.manager.get_private_history(&conv_id, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].receiver, "bob");
        assert!(!history[0].is_read);
    }

    #[tokio::test]
    async fn blank_private_content_is_rejected() {
        let fx = fixture().await;
        add_user(&fx, "alice").await;
        add_user(&fx, "bob").await;
        let err = fx
            .manager
            .send_private("alice", "bob", "   \n ", ContentType::Text)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn private_media_content_is_rejected() {
        let fx = fixture().await;
        add_user(&fx, "alice").await;
        add_user(&fx, "bob").await;
        let err = fx
            .manager
            .send_private("alice", "bob", "cGF5bG9hZA==", ContentType::Image)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("text content only"));

        let conv = fx
            .manager
            .get_or_create_conversation("alice", "bob")
            .await
            .unwrap();
        assert!(fx
            .manager
            .get_private_history(&conv.conversation_id, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn conversation_identity_ignores_call_order() {
        let fx = fixture().await;
        add_user(&fx, "alice").await;
        add_user(&fx, "bob").await;

        let ab = fx
            .manager
            .get_or_create_conversation("alice", "bob")
            .await
            .unwrap();
        let ba = fx
            .manager
            .get_or_create_conversation("bob", "alice")
            .await
            .unwrap();
        assert_eq!(ab.conversation_id, ba.conversation_id);
    }

    #[tokio::test]
    async fn history_pages_with_cursor() {
        let fx = fixture().await;
        for i in 1..=5i64 {
            let mut msg = Message::text("alice", &format!("m{}", i));
            msg.created_at = i;
            fx.storage.lock().await.insert_message(&msg).unwrap();
        }
        let latest = fx.manager.get_history(None, 2).await.unwrap();
        assert_eq!(latest[0].content, "m4");
        assert_eq!(latest[1].content, "m5");

        let older = fx
            .manager
            .get_history(Some(latest[0].message_id), 2)
            .await
            .unwrap();
        assert_eq!(older[0].content, "m2");
        assert_eq!(older[1].content, "m3");
    }
}
