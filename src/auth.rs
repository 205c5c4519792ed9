use std::num::NonZeroU32;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tokio::sync::Mutex;

use crate::models::User;
use crate::storage::Storage;

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => unreachable!(),
};
const SALT_LEN: usize = 16;
const CREDENTIAL_LEN: usize = ring::digest::SHA256_OUTPUT_LEN;

/// Derive a storable hash for a password: PBKDF2-HMAC-SHA256 with a
/// fresh random salt, encoded as `base64(salt)$base64(key)`.
pub fn hash_password(password: &str) -> Result<String> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| anyhow!("failed to generate salt"))?;

    let mut derived = [0u8; CREDENTIAL_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        &salt,
        password.as_bytes(),
        &mut derived,
    );

    Ok(format!(
        "{}${}",
        STANDARD.encode(salt),
        STANDARD.encode(derived)
    ))
}

/// Recompute the hash with the stored salt and compare in constant
/// time. Any malformed stored value verifies as false.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_b64, key_b64)) = stored.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(key)) = (STANDARD.decode(salt_b64), STANDARD.decode(key_b64)) else {
        return false;
    };
    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        &salt,
        password.as_bytes(),
        &key,
    )
    .is_ok()
}

/// Credential checks and account creation against the persistence
/// collaborator. Pure request/response; no session or socket state.
pub struct AuthManager {
    storage: Arc<Mutex<Storage>>,
}

impl AuthManager {
    pub fn new(storage: Arc<Mutex<Storage>>) -> Self {
        AuthManager { storage }
    }

    /// True only for a known user with a matching password. An unknown
    /// user returns false through the same path as a wrong password, so
    /// the response does not leak account existence.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        if username.is_empty() || password.is_empty() {
            return Ok(false);
        }
        let storage = self.storage.lock().await;
        match storage.get_user(username)? {
            Some(user) => Ok(verify_password(password, &user.password_hash)),
            None => Ok(false),
        }
    }

    /// Create an account; false when the username is taken. The
    /// pre-check is best effort, the users table's uniqueness
    /// constraint is what actually settles a race.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<String>,
        display_name: Option<String>,
    ) -> Result<bool> {
        if username.is_empty() || password.is_empty() {
            return Ok(false);
        }
        let storage = self.storage.lock().await;
        if storage.get_user(username)?.is_some() {
            return Ok(false);
        }
        let user = User {
            username: username.to_string(),
            display_name: display_name.unwrap_or_else(|| username.to_string()),
            email,
            password_hash: hash_password(password)?,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        storage.create_user(&user)
    }
}
