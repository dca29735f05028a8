//! Chunked upload reassembly.
//!
//! Clients initiate an upload, stream base64 chunks, then a consumer
//! (launch-with-file, send-to-session, upload-to-storage) reassembles the
//! chunks into a single temp file. The upload directory is consumed exactly
//! once: reassembly removes it on success and on failure alike.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

use crate::core::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct UploadMetadata {
    filename: String,
    size: u64,
    started: f64,
}

/// Manager for the chunked upload scratch area.
#[derive(Debug, Clone)]
pub struct UploadManager {
    upload_root: PathBuf,
}

impl UploadManager {
    /// Build a manager rooted at the upload scratch directory.
    #[must_use]
    pub fn new(upload_root: PathBuf) -> Self {
        Self { upload_root }
    }

    /// Ensure the upload root exists (called once at startup).
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created.
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(&self.upload_root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.upload_root, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    fn upload_dir(&self, upload_id: Uuid) -> PathBuf {
        self.upload_root.join(upload_id.to_string())
    }

    /// Start a new upload, allocating its directory and metadata file.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created.
    pub fn initiate(&self, filename: &str, total_size: u64) -> Result<Uuid> {
        let upload_id = Uuid::new_v4();
        let dir = self.upload_dir(upload_id);
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let metadata = UploadMetadata {
            filename: filename.to_owned(),
            size: total_size,
            started: Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        let json = serde_json::to_string(&metadata)
            .map_err(|e| Error::Internal(anyhow::anyhow!("metadata encode failed: {e}")))?;
        std::fs::write(dir.join("metadata.json"), json)?;
        Ok(upload_id)
    }

    /// Persist one base64-encoded chunk.
    ///
    /// # Errors
    /// `NotFound` for unknown uploads, `BadRequest` for invalid base64.
    pub fn store_chunk(&self, upload_id: Uuid, chunk_index: u32, chunk_b64: &str) -> Result<()> {
        let dir = self.upload_dir(upload_id);
        if !dir.is_dir() {
            return Err(Error::not_found("Upload session not found."));
        }
        let bytes = B64
            .decode(chunk_b64)
            .map_err(|e| Error::bad_request(format!("Invalid Base64 chunk data: {e}")))?;
        std::fs::write(dir.join(format!("chunk_{chunk_index}")), bytes)?;
        Ok(())
    }

    /// Reassemble `chunk_0..chunk_{n-1}` into a temp file under the upload
    /// root and consume the upload directory.
    ///
    /// Returns the temp file path; the caller owns it and must move or
    /// delete it.
    ///
    /// # Errors
    /// `NotFound` for unknown uploads, `BadRequest` for missing chunks.
    /// Any failure removes both the temp file and the upload directory.
    pub fn reassemble(&self, upload_id: Uuid, total_chunks: u32) -> Result<PathBuf> {
        let dir = self.upload_dir(upload_id);
        if !dir.is_dir() {
            return Err(Error::not_found("Upload session not found."));
        }

        for i in 0..total_chunks {
            if !dir.join(format!("chunk_{i}")).exists() {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(Error::bad_request(format!("Missing chunk {i} for upload.")));
            }
        }

        let temp = tempfile::Builder::new()
            .prefix(&format!("{upload_id}-"))
            .tempfile_in(&self.upload_root)
            .map_err(|e| {
                let _ = std::fs::remove_dir_all(&dir);
                Error::Internal(anyhow::anyhow!("failed to create temp file: {e}"))
            })?;

        let result: Result<()> = (|| {
            let mut file = temp.as_file();
            for i in 0..total_chunks {
                let chunk = std::fs::read(dir.join(format!("chunk_{i}")))?;
                file.write_all(&chunk)?;
            }
            file.flush()?;
            Ok(())
        })();

        // The upload directory is consumed either way.
        let _ = std::fs::remove_dir_all(&dir);

        match result {
            Ok(()) => {
                let (_, path) = temp.keep().map_err(|e| {
                    Error::Internal(anyhow::anyhow!("failed to persist temp file: {e}"))
                })?;
                Ok(path)
            }
            Err(e) => {
                tracing::error!(upload = %upload_id, error = %e, "failed to reassemble upload");
                Err(Error::Internal(anyhow::anyhow!(
                    "Failed to reassemble file."
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> UploadManager {
        let m = UploadManager::new(tmp.path().join("uploads"));
        m.ensure_layout().unwrap();
        m
    }

    #[test]
    fn initiate_chunk_reassemble_round_trip() {
        let tmp = TempDir::new().unwrap();
        let uploads = manager(&tmp);

        let id = uploads.initiate("report.pdf", 11).unwrap();
        uploads.store_chunk(id, 0, &B64.encode(b"hello ")).unwrap();
        uploads.store_chunk(id, 1, &B64.encode(b"world")).unwrap();

        let path = uploads.reassemble(id, 2).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        // Upload directory is consumed
        assert!(!tmp.path().join("uploads").join(id.to_string()).exists());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_chunk_fails_and_consumes_upload() {
        let tmp = TempDir::new().unwrap();
        let uploads = manager(&tmp);

        let id = uploads.initiate("x", 2).unwrap();
        uploads.store_chunk(id, 0, &B64.encode(b"a")).unwrap();

        let err = uploads.reassemble(id, 2).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert!(!tmp.path().join("uploads").join(id.to_string()).exists());
        // A second attempt sees the upload as gone
        let err = uploads.reassemble(id, 2).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let uploads = manager(&tmp);
        let id = uploads.initiate("x", 1).unwrap();
        let err = uploads.store_chunk(id, 0, "!!!not-base64!!!").unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn unknown_upload_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let uploads = manager(&tmp);
        let err = uploads
            .store_chunk(Uuid::new_v4(), 0, &B64.encode(b"a"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
