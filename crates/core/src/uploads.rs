use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::UploadError;

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Detect the format from the file signature.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&PNG_MAGIC) {
            Some(Self::Png)
        } else if bytes.starts_with(&JPEG_MAGIC) {
            Some(Self::Jpeg)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Upload {
    pub upload_ref: String,
    pub session_id: String,
    pub filename: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size: u64,
    pub format: ImageFormat,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Transient storage for reference images. Files live on disk under `dir`;
/// the index lives in memory and is the only way to reach them.
pub struct UploadStore {
    dir: PathBuf,
    max_bytes: u64,
    expiry: chrono::Duration,
    uploads: DashMap<String, Upload>,
    clock: Arc<dyn Clock>,
}

impl UploadStore {
    pub fn new(dir: PathBuf, max_bytes: u64, expiry: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir,
            max_bytes,
            expiry,
            uploads: DashMap::new(),
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Validate and persist one image for `session_id`.
    pub async fn store(
        &self,
        session_id: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<Upload, UploadError> {
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            return Err(UploadError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }

        if let Some(declared) = mime_guess::from_path(filename).first() {
            if declared.type_() != mime_guess::mime::IMAGE {
                return Err(UploadError::UnsupportedFormat(format!(
                    "{filename} is declared as {declared}"
                )));
            }
        }
        let format = ImageFormat::sniff(bytes).ok_or_else(|| {
            UploadError::UnsupportedFormat(format!("{filename} is not a JPEG or PNG image"))
        })?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let upload_ref = Uuid::new_v4().to_string();
        let path = self.dir.join(format!("{upload_ref}.{}", format.extension()));
        tokio::fs::write(&path, bytes).await?;

        let now = self.clock.now();
        let upload = Upload {
            upload_ref: upload_ref.clone(),
            session_id: session_id.to_string(),
            filename: filename.to_string(),
            path,
            size,
            format,
            created_at: now,
            expires_at: now + self.expiry,
        };
        self.uploads.insert(upload_ref.clone(), upload.clone());

        info!(upload_ref = %upload_ref, session_id, size, format = format.mime(), "Stored upload");
        Ok(upload)
    }

    pub fn get(&self, upload_ref: &str) -> Result<Upload, UploadError> {
        let now = self.clock.now();
        self.uploads
            .get(upload_ref)
            .filter(|upload| upload.expires_at > now)
            .map(|upload| upload.clone())
            .ok_or_else(|| UploadError::NotFound(upload_ref.to_string()))
    }

    pub fn resolve(&self, upload_ref: &str) -> Result<PathBuf, UploadError> {
        self.get(upload_ref).map(|upload| upload.path)
    }

    /// Read an upload back as a `data:` URL suitable for the remote API.
    pub async fn read_data_url(&self, upload_ref: &str) -> Result<String, UploadError> {
        let upload = self.get(upload_ref)?;
        let bytes = tokio::fs::read(&upload.path).await?;
        Ok(format!(
            "data:{};base64,{}",
            upload.format.mime(),
            BASE64.encode(bytes)
        ))
    }

    /// Delete an upload. Idempotent.
    pub async fn purge(&self, upload_ref: &str) {
        let Some((_, upload)) = self.uploads.remove(upload_ref) else {
            return;
        };
        remove_file_quietly(&upload.path).await;
        debug!(upload_ref, "Purged upload");
    }

    pub async fn purge_session(&self, session_id: &str) -> usize {
        let refs: Vec<String> = self
            .uploads
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();
        for upload_ref in &refs {
            self.purge(upload_ref).await;
        }
        refs.len()
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let refs: Vec<String> = self
            .uploads
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();
        for upload_ref in &refs {
            self.purge(upload_ref).await;
        }
        refs.len()
    }

    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }
}

async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Failed to delete upload file"),
    }
}
