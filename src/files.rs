use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use log::info;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::FileObject;
use crate::protocol::ContentType;
use crate::storage::Storage;

/// Decodes transferred payloads and persists them under
/// `<root>/<owner>/<year>/<month>/<day>/<filename>`, registering a
/// FileObject row before any message embeds the reference.
pub struct FileRelay {
    root: PathBuf,
    storage: Arc<Mutex<Storage>>,
}

/// Result of a successful store, ready to be embedded in a message.
#[derive(Clone, Debug)]
pub struct StoredFile {
    pub file_id: Uuid,
    pub file_name: String,
    pub path: PathBuf,
    /// Reference relative to the storage root; what history queries
    /// hand back to clients.
    pub url: String,
    pub size: i64,
}

impl FileRelay {
    pub fn new(root: PathBuf, storage: Arc<Mutex<Storage>>) -> Self {
        FileRelay { root, storage }
    }

    /// Decode and persist one payload. Size limits are the caller's
    /// job; a corrupt payload fails before anything touches the disk.
    pub async fn store(
        &self,
        owner: &str,
        filename: &str,
        data_b64: &str,
        declared_type: ContentType,
    ) -> Result<StoredFile> {
        let bytes = STANDARD
            .decode(data_b64)
            .map_err(|e| anyhow!("invalid base64 payload: {}", e))?;

        let safe_name = sanitize_filename(filename);
        let now = Utc::now();
        let day_dir = self
            .root
            .join(owner)
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string());
        fs::create_dir_all(&day_dir)
            .await
            .with_context(|| format!("creating {}", day_dir.display()))?;

        let path = free_path(&day_dir, &safe_name).await?;
        fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        let stored_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&safe_name)
            .to_string();
        let url = format!(
            "{}/{}/{}",
            owner,
            now.format("%Y/%m/%d"),
            stored_name
        );

        let file = FileObject {
            file_id: Uuid::new_v4(),
            owner: owner.to_string(),
            file_name: safe_name.clone(),
            file_path: path.display().to_string(),
            file_url: url.clone(),
            file_type: declared_type,
            file_size: bytes.len() as i64,
            created_at: now.timestamp_millis(),
        };
        self.storage.lock().await.insert_file(&file)?;
        info!(
            "stored {} byte payload from {} at {}",
            file.file_size,
            owner,
            path.display()
        );

        Ok(StoredFile {
            file_id: file.file_id,
            file_name: safe_name,
            path,
            url,
            size: file.file_size,
        })
    }
}

/// Keep only the final path component so a filename cannot escape the
/// owner's directory.
fn sanitize_filename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or("upload")
        .to_string()
}

/// First non-existing path for the name in the directory: the name
/// itself, then `stem_1.ext`, `stem_2.ext`, ... Existing files are
/// never overwritten.
async fn free_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let candidate = dir.join(name);
    if !fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (name.to_string(), None),
    };
    for n in 1u32.. {
        let suffixed = match &ext {
            Some(ext) => format!("{}_{}.{}", stem, n, ext),
            None => format!("{}_{}", stem, n),
        };
        let candidate = dir.join(suffixed);
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    unreachable!("u32 suffix space exhausted")
}
