//! On-disk storage for post attachments.
//!
//! Files live flat in one directory as `{file_id}.{ext}`, extension derived
//! from the mime type. Rows and files are kept consistent by ordering:
//! writes happen before the owning transaction commits and are compensated
//! on failure; deletes happen only after a successful commit.

use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

pub const MAX_ATTACHMENT_BYTES: usize = 2 * 1024 * 1024;
pub const MAX_ATTACHMENTS_PER_POST: usize = 32;

pub const SUPPORTED_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/svg+xml",
    "image/avi",
    "image/webp",
    "image/gif",
];

pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpeg"),
        "image/svg+xml" => Some("svg"),
        "image/avi" => Some("avi"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

pub fn attachment_filename(file_id: Uuid, mime: &str) -> String {
    format!("{}.{}", file_id, extension_for_mime(mime).unwrap_or("bin"))
}

/// Public URL served by the static file route.
pub fn attachment_url(file_id: Uuid, mime: &str) -> String {
    format!("/static/attachments/{}", attachment_filename(file_id, mime))
}

/// A file written to disk during the current request, pending its database
/// row. Kept around so a failed request can delete everything it wrote.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_id: Uuid,
    pub mime_type: String,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
}

impl AttachmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_env() -> Self {
        let dir = std::env::var("ATTACHMENTS_DIR").unwrap_or_else(|_| "data/attachments".to_string());
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, file_id: Uuid, mime: &str) -> PathBuf {
        self.dir.join(attachment_filename(file_id, mime))
    }

    pub async fn ensure_dir(&self) -> AppResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| AppError::internal(format!("cannot create attachments dir: {err}")))
    }

    /// Write bytes under a fresh file id and hand back the record the caller
    /// needs for both the database row and failure cleanup.
    pub async fn save(&self, mime_type: &str, data: &[u8]) -> AppResult<StoredFile> {
        let file_id = Uuid::new_v4();
        let path = self.path_for(file_id, mime_type);

        fs::write(&path, data)
            .await
            .map_err(|err| AppError::internal(format!("failed to store attachment: {err}")))?;

        Ok(StoredFile {
            file_id,
            mime_type: mime_type.to_string(),
            size: data.len(),
        })
    }

    /// Best-effort delete. A failure is logged and swallowed; the database
    /// has already committed and must not be rolled back over a file.
    pub async fn remove(&self, file_id: Uuid, mime_type: &str) {
        let path = self.path_for(file_id, mime_type);
        if let Err(err) = fs::remove_file(&path).await {
            tracing::error!(path = %path.display(), error = %err, "unable to delete attachment file");
        }
    }

    /// Compensating cleanup for a request that failed before its transaction
    /// committed: every file written during the request is removed.
    pub async fn remove_all(&self, files: &[StoredFile]) {
        for file in files {
            self.remove(file.file_id, &file.mime_type).await;
        }
    }
}

/// Per-file upload validation, applied before anything touches the
/// attachment lifecycle.
pub fn validate_upload(mime_type: &str, size: usize) -> AppResult<()> {
    if !SUPPORTED_MIME_TYPES.contains(&mime_type) {
        return Err(AppError::validation(
            "attachments",
            format!(
                "unsupported attachment type {mime_type}; allowed: {}",
                SUPPORTED_MIME_TYPES.join(", ")
            ),
        ));
    }
    if size > MAX_ATTACHMENT_BYTES {
        return Err(AppError::validation(
            "attachments",
            format!("attachments must be at most {MAX_ATTACHMENT_BYTES} bytes"),
        ));
    }
    Ok(())
}
