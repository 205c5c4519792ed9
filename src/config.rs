use std::env;
use std::path::PathBuf;

/// Runtime configuration, resolved from environment variables with
/// defaults suitable for local development. `.env` files are loaded
/// by `main` before this runs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the TCP listener binds to.
    pub bind_addr: String,
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Root directory for relayed file payloads.
    pub storage_root: PathBuf,
    /// Hard cap on a single decoded file payload, in bytes.
    pub max_file_bytes: usize,
    /// Capacity of each session's outbound response queue.
    pub session_queue: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            bind_addr: env::var("SERVER_ADDR").unwrap_or("127.0.0.1:8080".to_string()),
            database_path: env::var("DATABASE_URL").unwrap_or("./chat.db".to_string()),
            storage_root: env::var("FILE_STORAGE_ROOT")
                .unwrap_or("./uploads".to_string())
                .into(),
            max_file_bytes: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10 * 1024 * 1024),
            session_queue: env::var("SESSION_QUEUE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
        }
    }
}
