use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::{mpsc, watch, Mutex};

use crate::protocol::Response;

/// Live, authenticated binding between a username and one connection.
/// The sender feeds the connection's writer task; the shutdown handle
/// reaches the connection's read loop, so unregistering closes the
/// socket instead of leaving an orphaned task serving requests.
#[derive(Clone)]
pub struct Session {
    pub sender: mpsc::Sender<Response>,
    shutdown: watch::Sender<()>,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    pub fn new(sender: mpsc::Sender<Response>, shutdown: watch::Sender<()>) -> Self {
        Session {
            sender,
            shutdown,
            connected_at: Utc::now(),
        }
    }
}

/// The authoritative registry of who is online: username -> Session.
/// A BTreeMap keeps user-list ordering deterministic, and the single
/// mutex makes check-and-insert atomic, which is what enforces one
/// session per username.
pub struct ConnectionManager {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager {
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a session; false when the username is already online.
    /// The existing session is never evicted.
    pub async fn register(&self, username: &str, session: Session) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(username) {
            return false;
        }
        debug!(
            "registered session for {} (connected {})",
            username, session.connected_at
        );
        sessions.insert(username.to_string(), session);
        true
    }

    /// Remove a session and signal its connection to close; no-op when
    /// already absent. The signal is what keeps a torn-down session
    /// from living on as an authenticated task after its name is freed.
    pub async fn unregister(&self, username: &str) -> bool {
        match self.sessions.lock().await.remove(username) {
            Some(session) => {
                let _ = session.shutdown.send(());
                debug!("unregistered session for {}", username);
                true
            }
            None => false,
        }
    }

    pub async fn is_online(&self, username: &str) -> bool {
        self.sessions.lock().await.contains_key(username)
    }

    pub async fn list_usernames(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn sender_for(&self, username: &str) -> Option<mpsc::Sender<Response>> {
        self.sessions
            .lock()
            .await
            .get(username)
            .map(|s| s.sender.clone())
    }

    /// Snapshot of every session's sender, for fan-out loops that must
    /// not hold the registry lock while delivering.
    pub async fn snapshot(&self) -> Vec<(String, mpsc::Sender<Response>)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(name, session)| (name.clone(), session.sender.clone()))
            .collect()
    }
}
