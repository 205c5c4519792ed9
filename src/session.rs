use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::codec::{self, FrameDecoder};
use crate::connections::Session;
use crate::protocol::{ContentType, Request, Response};
use crate::server::ServerState;

/// How many unparseable frames a connection may produce before the
/// server gives up on the stream.
const MAX_PROTOCOL_STRIKES: u32 = 5;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Whether to keep serving this connection after a request.
enum Flow {
    Continue,
    Close,
}

/// Own one client connection from accept to teardown: split the
/// socket, spawn the writer task, and pump decoded frames through the
/// request dispatcher until the peer hangs up or misbehaves.
pub async fn handle_connection(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    debug!("connection from {}", peer);

    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Response>(state.config.session_queue);

    // All outbound traffic funnels through this task so that pushes
    // from other sessions and direct responses never interleave bytes.
    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let bytes = match codec::encode(&envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("failed to encode envelope: {}", e);
                    continue;
                }
            };
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    // Fired by the registry when this session is torn down remotely
    // (delivery failure); without it the task would keep serving
    // requests as a user whose name has been freed.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    let mut session = SessionLoop::new(state, tx, shutdown_tx, peer);
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut strikes = 0u32;

    'serve: loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = shutdown_rx.changed() => {
                debug!("session from {} shut down by the registry", peer);
                break;
            }
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("read error from {}: {}", peer, e);
                break;
            }
        };

        match decoder.feed(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    match serde_json::from_value::<Request>(frame) {
                        Ok(request) => match session.handle(request).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Close) => break 'serve,
                            Err(e) => {
                                // Routing errors are reported on the
                                // stream; the connection survives.
                                session.send(Response::error(e.to_string())).await;
                            }
                        },
                        Err(_) => {
                            session.send(Response::error("unknown request")).await;
                        }
                    }
                }
            }
            Err(e) => {
                strikes += 1;
                warn!("protocol error from {} ({}/{}): {}", peer, strikes, MAX_PROTOCOL_STRIKES, e);
                session
                    .send(Response::error(format!("protocol error: {}", e)))
                    .await;
                if strikes >= MAX_PROTOCOL_STRIKES {
                    break;
                }
            }
        }
    }

    session.finish().await;
    // Dropping the session drops the last sender, which ends the
    // writer task once its queue drains.
    drop(session);
    let _ = writer_task.await;
    debug!("connection from {} closed", peer);
}

/// Per-connection request dispatcher. Holds the only mutable session
/// state there is: whether (and as whom) the connection authenticated.
struct SessionLoop {
    state: Arc<ServerState>,
    tx: mpsc::Sender<Response>,
    shutdown: watch::Sender<()>,
    peer: SocketAddr,
    username: Option<String>,
}

impl SessionLoop {
    fn new(
        state: Arc<ServerState>,
        tx: mpsc::Sender<Response>,
        shutdown: watch::Sender<()>,
        peer: SocketAddr,
    ) -> Self {
        SessionLoop {
            state,
            tx,
            shutdown,
            peer,
            username: None,
        }
    }

    /// Queue one envelope for this connection. A send only fails when
    /// the writer task is gone, at which point the read loop is about
    /// to find out anyway.
    async fn send(&self, envelope: Response) {
        let _ = self.tx.send(envelope).await;
    }

    async fn handle(&mut self, request: Request) -> Result<Flow> {
        match request {
            Request::Login { username, password } => self.handle_login(username, password).await,
            Request::Register {
                username,
                password,
                email,
                display_name,
            } => self.handle_register(username, password, email, display_name).await,
            Request::Logout => Ok(Flow::Close),
            authenticated => {
                let Some(username) = self.username.clone() else {
                    self.send(Response::error("please authenticate first")).await;
                    return Ok(Flow::Continue);
                };
                self.handle_authenticated(&username, authenticated).await
            }
        }
    }

    async fn handle_login(&mut self, username: String, password: String) -> Result<Flow> {
        if self.username.is_some() {
            self.send(Response::error("already authenticated")).await;
            return Ok(Flow::Continue);
        }

        if !self.state.auth.authenticate(&username, &password).await? {
            self.send(Response::LoginFailed {
                message: "invalid username or password".to_string(),
            })
            .await;
            return Ok(Flow::Continue);
        }

        // Registration is the atomic one-session-per-user gate; the
        // credential check above holds no lock.
        let session = Session::new(self.tx.clone(), self.shutdown.clone());
        if !self.state.connections.register(&username, session).await {
            self.send(Response::LoginFailed {
                message: "user already online".to_string(),
            })
            .await;
            return Ok(Flow::Continue);
        }

        info!("{} logged in from {}", username, self.peer);
        self.username = Some(username.clone());
        self.send(Response::LoginSuccess {
            username: username.clone(),
            message: format!("welcome, {}", username),
        })
        .await;

        self.state
            .messages
            .broadcast_system(&format!("{} joined the chat room", username))
            .await?;
        self.state.messages.push_user_list().await;
        Ok(Flow::Continue)
    }

    /// Creating an account never authenticates the connection; the
    /// client logs in afterwards like anyone else.
    async fn handle_register(
        &mut self,
        username: String,
        password: String,
        email: Option<String>,
        display_name: Option<String>,
    ) -> Result<Flow> {
        let created = self
            .state
            .auth
            .register(&username, &password, email, display_name)
            .await?;
        if created {
            info!("registered account {} from {}", username, self.peer);
            self.send(Response::RegisterSuccess {
                message: "account created, please log in".to_string(),
            })
            .await;
        } else {
            self.send(Response::RegisterFailed {
                message: "username may already exist".to_string(),
            })
            .await;
        }
        Ok(Flow::Continue)
    }

    async fn handle_authenticated(&mut self, username: &str, request: Request) -> Result<Flow> {
        match request {
            Request::Text { content, receiver } => match receiver {
                Some(receiver) => {
                    let conversation_id = self
                        .state
                        .messages
                        .send_private(username, &receiver, &content, ContentType::Text)
                        .await?;
                    self.send(Response::PrivateMessageSent {
                        conversation_id,
                        message: "private message sent".to_string(),
                    })
                    .await;
                }
                None => {
                    if content.trim().is_empty() {
                        self.send(Response::error("message content cannot be empty")).await;
                        return Ok(Flow::Continue);
                    }
                    self.state.messages.broadcast_text(username, &content).await?;
                    self.send(Response::MessageSent {
                        message: "message sent".to_string(),
                    })
                    .await;
                }
            },

            Request::Image { filename, data, size } => {
                self.relay_file(username, ContentType::Image, filename, data, size).await?;
            }
            Request::Video { filename, data, size } => {
                self.relay_file(username, ContentType::Video, filename, data, size).await?;
            }
            Request::Audio { filename, data, size } => {
                self.relay_file(username, ContentType::Audio, filename, data, size).await?;
            }
            Request::File { filename, data, size } => {
                self.relay_file(username, ContentType::File, filename, data, size).await?;
            }

            Request::Private {
                receiver,
                content,
                content_type,
            } => {
                let conversation_id = self
                    .state
                    .messages
                    .send_private(username, &receiver, &content, content_type)
                    .await?;
                self.send(Response::PrivateMessageSent {
                    conversation_id,
                    message: "private message sent".to_string(),
                })
                .await;
            }

            Request::RefreshUsers => {
                let list = self.state.messages.user_list().await;
                self.send(list).await;
            }

            Request::GetHistory { message_id, limit } => {
                let messages = self.state.messages.get_history(message_id, limit).await?;
                self.send(Response::GetHistory { messages }).await;
            }

            Request::GetPrivateHistory {
                conversation_id,
                limit,
            } => {
                // Only a participant may read a conversation.
                let conversation = self
                    .state
                    .storage
                    .lock()
                    .await
                    .conversation_by_id(&conversation_id)?;
                match conversation {
                    Some(c) if c.user_a == username || c.user_b == username => {
                        let messages = self
                            .state
                            .messages
                            .get_private_history(&conversation_id, limit)
                            .await?;
                        self.send(Response::PrivateHistory { messages }).await;
                    }
                    _ => {
                        self.send(Response::error("no such conversation")).await;
                    }
                }
            }

            Request::GetConversation {
                username1,
                username2,
            } => {
                if username1 != username && username2 != username {
                    self.send(Response::error("not a participant of that conversation")).await;
                    return Ok(Flow::Continue);
                }
                let conversation = self
                    .state
                    .messages
                    .get_or_create_conversation(&username1, &username2)
                    .await?;
                self.send(Response::ConversationInfo { conversation }).await;
            }

            Request::MarkRead { message_id } => {
                if self.state.messages.mark_read(&message_id).await? {
                    self.send(Response::MessageSent {
                        message: "marked as read".to_string(),
                    })
                    .await;
                } else {
                    self.send(Response::error("no such message")).await;
                }
            }

            // Handled before dispatch reaches here.
            Request::Login { .. } | Request::Register { .. } | Request::Logout => {}
        }
        Ok(Flow::Continue)
    }

    /// Decode-limit check, store, persist, broadcast. The declared size
    /// is advisory; the cap is enforced against the actual payload.
    async fn relay_file(
        &mut self,
        username: &str,
        content_type: ContentType,
        filename: String,
        data: String,
        declared_size: i64,
    ) -> Result<()> {
        let max = self.state.config.max_file_bytes;
        if declared_size > max as i64 || estimated_decoded_len(&data) > max {
            self.send(Response::error(format!(
                "file exceeds the {} byte limit",
                max
            )))
            .await;
            return Ok(());
        }

        let stored = self
            .state
            .files
            .store(username, &filename, &data, content_type)
            .await?;
        self.state
            .messages
            .broadcast_file(username, content_type, &stored, data)
            .await?;
        self.send(Response::MessageSent {
            message: format!("{} sent", content_type.as_str()),
        })
        .await;
        Ok(())
    }

    /// Unregister, announce, refresh lists. Runs at most once even if
    /// both the read loop and a logout path get here.
    async fn finish(&mut self) {
        let Some(username) = self.username.take() else {
            return;
        };
        self.state.connections.unregister(&username).await;
        info!("{} disconnected", username);
        if let Err(e) = self
            .state
            .messages
            .broadcast_system(&format!("{} left the chat room", username))
            .await
        {
            error!("failed to announce departure of {}: {}", username, e);
        }
        self.state.messages.push_user_list().await;
    }
}

/// Upper bound on the decoded size of a base64 string, without
/// decoding it.
fn estimated_decoded_len(data_b64: &str) -> usize {
    data_b64.len() / 4 * 3 + 3
}
