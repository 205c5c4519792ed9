use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::auth::AuthManager;
use crate::config::Config;
use crate::connections::ConnectionManager;
use crate::files::FileRelay;
use crate::messages::MessageManager;
use crate::session;
use crate::storage::Storage;

/// Everything a session needs, wired once at startup and shared
/// behind one Arc.
pub struct ServerState {
    pub config: Config,
    pub storage: Arc<Mutex<Storage>>,
    pub connections: Arc<ConnectionManager>,
    pub auth: AuthManager,
    pub messages: MessageManager,
    pub files: FileRelay,
}

pub struct Server {
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let storage = Arc::new(Mutex::new(
            Storage::new(&config.database_path)
                .with_context(|| format!("opening database {}", config.database_path))?,
        ));
        let connections = Arc::new(ConnectionManager::new());
        let state = ServerState {
            auth: AuthManager::new(storage.clone()),
            messages: MessageManager::new(storage.clone(), connections.clone()),
            files: FileRelay::new(config.storage_root.clone(), storage.clone()),
            storage,
            connections,
            config,
        };
        Ok(Server {
            state: Arc::new(state),
        })
    }

    /// Bind the configured address and serve until the task is
    /// cancelled.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.state.config.bind_addr)
            .await
            .with_context(|| format!("binding {}", self.state.config.bind_addr))?;
        info!("listening on {}", self.state.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. One task per
    /// connection; a session's failure never touches its neighbours.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        session::handle_connection(state, stream, peer).await;
                    });
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameDecoder;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct TestServer {
        addr: std::net::SocketAddr,
        // Held so the temp dirs outlive the server.
        _dir: tempfile::TempDir,
    }

    async fn start_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            bind_addr: "127.0.0.1:0".to_string(),
            database_path: dir.path().join("chat.db").display().to_string(),
            storage_root: dir.path().join("uploads"),
            max_file_bytes: 1024,
            session_queue: 64,
        };
        let server = Server::new(config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        TestServer { addr, _dir: dir }
    }

    struct Client {
        stream: TcpStream,
        decoder: FrameDecoder,
        queued: Vec<Value>,
    }

    impl Client {
        async fn connect(server: &TestServer) -> Client {
            Client {
                stream: TcpStream::connect(server.addr).await.unwrap(),
                decoder: FrameDecoder::new(),
                queued: Vec::new(),
            }
        }

        async fn send(&mut self, request: Value) {
            let bytes = serde_json::to_vec(&request).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn next(&mut self) -> Value {
            loop {
                if !self.queued.is_empty() {
                    return self.queued.remove(0);
                }
                let mut buf = [0u8; 4096];
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "server closed the connection");
                self.queued.extend(self.decoder.feed(&buf[..n]).unwrap());
            }
        }

        /// Read envelopes until one with the given type tag arrives,
        /// discarding unrelated pushes along the way.
        async fn expect(&mut self, tag: &str) -> Value {
            self.expect_any(&[tag]).await
        }

        async fn expect_any(&mut self, tags: &[&str]) -> Value {
            for _ in 0..32 {
                let frame = self.next().await;
                if tags.iter().any(|t| frame["type"] == *t) {
                    return frame;
                }
            }
            panic!("none of {:?} within 32 frames", tags);
        }

        async fn register_and_login(&mut self, username: &str) {
            self.send(json!({
                "type": "register", "username": username, "password": "pw"
            }))
            .await;
            self.expect("register_success").await;
            self.send(json!({
                "type": "login", "username": username, "password": "pw"
            }))
            .await;
            self.expect("login_success").await;
        }
    }

    #[tokio::test]
    async fn register_does_not_authenticate() {
        let server = start_server().await;
        let mut client = Client::connect(&server).await;
        client
            .send(json!({"type": "register", "username": "alice", "password": "pw"}))
            .await;
        client.expect("register_success").await;

        client.send(json!({"type": "text", "content": "hi"})).await;
        let err = client.expect("error").await;
        assert_eq!(err["message"], "please authenticate first");
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let server = start_server().await;
        let mut client = Client::connect(&server).await;
        client
            .send(json!({"type": "register", "username": "alice", "password": "pw"}))
            .await;
        client.expect("register_success").await;
        client
            .send(json!({"type": "login", "username": "alice", "password": "nope"}))
            .await;
        client.expect("login_failed").await;
    }

    #[tokio::test]
    async fn second_login_for_same_user_is_rejected() {
        let server = start_server().await;
        let mut first = Client::connect(&server).await;
        first.register_and_login("alice").await;

        let mut second = Client::connect(&server).await;
        second
            .send(json!({"type": "login", "username": "alice", "password": "pw"}))
            .await;
        let failed = second.expect("login_failed").await;
        assert_eq!(failed["message"], "user already online");
    }

    #[tokio::test]
    async fn concurrent_logins_yield_exactly_one_session() {
        let server = start_server().await;
        let mut setup = Client::connect(&server).await;
        setup
            .send(json!({"type": "register", "username": "alice", "password": "pw"}))
            .await;
        setup.expect("register_success").await;

        let mut first = Client::connect(&server).await;
        let mut second = Client::connect(&server).await;
        let login = json!({"type": "login", "username": "alice", "password": "pw"});
        first.send(login.clone()).await;
        second.send(login).await;

        let outcomes = [
            first.expect_any(&["login_success", "login_failed"]).await,
            second.expect_any(&["login_success", "login_failed"]).await,
        ];
        let successes = outcomes
            .iter()
            .filter(|o| o["type"] == "login_success")
            .count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_peers_but_not_the_sender() {
        let server = start_server().await;
        let mut alice = Client::connect(&server).await;
        alice.register_and_login("alice").await;
        let mut bob = Client::connect(&server).await;
        bob.register_and_login("bob").await;

        alice
            .send(json!({"type": "text", "content": "hello everyone"}))
            .await;
        alice.expect("message_sent").await;

        let push = bob.expect("text").await;
        assert_eq!(push["username"], "alice");
        assert_eq!(push["content"], "hello everyone");
    }

    #[tokio::test]
    async fn private_message_round_trip_with_history() {
        let server = start_server().await;
        let mut alice = Client::connect(&server).await;
        alice.register_and_login("alice").await;
        let mut bob = Client::connect(&server).await;
        bob.register_and_login("bob").await;

        alice
            .send(json!({"type": "private", "receiver": "bob", "content": "psst"}))
            .await;
        let sent = alice.expect("private_message_sent").await;
        let conversation_id = sent["conversation_id"].as_str().unwrap().to_string();

        let push = bob.expect("private").await;
        assert_eq!(push["username"], "alice");
        assert_eq!(push["content"], "psst");
        assert_eq!(push["conversation_id"], conversation_id.as_str());

        bob.send(json!({
            "type": "get_private_history",
            "conversation_id": conversation_id,
        }))
        .await;
        let history = bob.expect("private_history").await;
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"], "psst");
    }

    #[tokio::test]
    async fn outsider_cannot_read_a_conversation() {
        let server = start_server().await;
        let mut alice = Client::connect(&server).await;
        alice.register_and_login("alice").await;
        let mut bob = Client::connect(&server).await;
        bob.register_and_login("bob").await;
        let mut eve = Client::connect(&server).await;
        eve.register_and_login("eve").await;

        alice
            .send(json!({"type": "private", "receiver": "bob", "content": "secret"}))
            .await;
        let sent = alice.expect("private_message_sent").await;
        let conversation_id = sent["conversation_id"].as_str().unwrap().to_string();

        eve.send(json!({
            "type": "get_private_history",
            "conversation_id": conversation_id,
        }))
        .await;
        let err = eve.expect("error").await;
        assert_eq!(err["message"], "no such conversation");
    }

    #[tokio::test]
    async fn file_payload_is_relayed_and_stored() {
        let server = start_server().await;
        let mut alice = Client::connect(&server).await;
        alice.register_and_login("alice").await;
        let mut bob = Client::connect(&server).await;
        bob.register_and_login("bob").await;

        let payload = STANDARD.encode(b"attachment bytes");
        alice
            .send(json!({
                "type": "file",
                "filename": "notes.txt",
                "data": payload,
                "size": 16,
            }))
            .await;
        alice.expect("message_sent").await;

        let push = bob.expect("file").await;
        assert_eq!(push["username"], "alice");
        assert_eq!(push["filename"], "notes.txt");
        assert_eq!(push["data"].as_str().unwrap(), payload);
        assert_eq!(push["size"], 16);

        // The history entry's file reference resolves to the original bytes.
        bob.send(json!({"type": "get_history", "limit": 50})).await;
        let history = bob.expect("get_history").await;
        let entry = history["messages"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["content_type"] == "file")
            .expect("file message in history");
        let file_url = entry["file_url"].as_str().unwrap();
        let on_disk = std::fs::read(server._dir.path().join("uploads").join(file_url)).unwrap();
        assert_eq!(on_disk, b"attachment bytes");
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let server = start_server().await;
        let mut alice = Client::connect(&server).await;
        alice.register_and_login("alice").await;

        // Cap in start_server is 1024 bytes.
        let payload = STANDARD.encode(vec![0u8; 4096]);
        alice
            .send(json!({
                "type": "file",
                "filename": "big.bin",
                "data": payload,
                "size": 4096,
            }))
            .await;
        let err = alice.expect("error").await;
        assert!(err["message"].as_str().unwrap().contains("byte limit"));
    }

    #[tokio::test]
    async fn history_spans_sessions() {
        let server = start_server().await;
        {
            let mut alice = Client::connect(&server).await;
            alice.register_and_login("alice").await;
            alice
                .send(json!({"type": "text", "content": "for the record"}))
                .await;
            alice.expect("message_sent").await;
            alice.send(json!({"type": "logout"})).await;
        }

        let mut bob = Client::connect(&server).await;
        bob.register_and_login("bob").await;
        bob.send(json!({"type": "get_history", "limit": 50})).await;
        let history = bob.expect("get_history").await;
        let contents: Vec<&str> = history["messages"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|m| m["content_type"] == "text")
            .map(|m| m["content"].as_str().unwrap())
            .collect();
        assert!(contents.contains(&"for the record"));
    }

    #[tokio::test]
    async fn disconnect_announces_departure_and_updates_list() {
        let server = start_server().await;
        let mut alice = Client::connect(&server).await;
        alice.register_and_login("alice").await;
        let mut bob = Client::connect(&server).await;
        bob.register_and_login("bob").await;
        // Drain alice's own join notice and bob's.
        alice.expect("system").await;
        alice.expect("system").await;

        bob.send(json!({"type": "logout"})).await;

        let notice = alice.expect("system").await;
        assert_eq!(notice["message"], "bob left the chat room");
        let list = alice.expect("user_list").await;
        assert_eq!(list["users"], json!(["alice"]));
    }

    #[tokio::test]
    async fn garbage_frames_get_protocol_errors() {
        let server = start_server().await;
        let mut client = Client::connect(&server).await;
        client.stream.write_all(b"this is not json").await.unwrap();
        let err = client.expect("error").await;
        assert!(err["message"].as_str().unwrap().contains("protocol error"));

        // The stream recovers; a valid frame still works.
        client
            .send(json!({"type": "register", "username": "zed", "password": "pw"}))
            .await;
        client.expect("register_success").await;
    }
}
