//! Public file shares.
//!
//! A share copies a file out of a user's home into the public storage
//! directory under its share id. Metadata lives in one YAML map with its own
//! lock. Password-protected shares hand out one-shot download tokens valid
//! for sixty seconds.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::{Error, Result};
use crate::util::urlsafe_token;

/// Lifetime of a one-shot download token.
const DOWNLOAD_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Persisted metadata of one share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareMetadata {
    /// User who created the share.
    pub owner_username: String,
    /// Filename presented on download.
    pub original_filename: String,
    /// Creation time, unix seconds.
    pub created_at: f64,
    /// Size of the shared blob.
    pub size_bytes: u64,
    /// SHA-256 hex of the password, `None` for open shares.
    pub password_hash: Option<String>,
    /// Expiry, unix seconds, `None` for no expiry.
    pub expiry_timestamp: Option<f64>,
}

impl ShareMetadata {
    /// Whether the share is past its expiry.
    #[must_use]
    pub fn is_expired(&self, now: f64) -> bool {
        self.expiry_timestamp.is_some_and(|exp| exp < now)
    }
}

/// A share as presented to its owner.
#[derive(Debug, Clone, Serialize)]
pub struct ShareInfo {
    pub share_id: Uuid,
    pub original_filename: String,
    pub size_bytes: u64,
    pub created_at: f64,
    pub expiry_timestamp: Option<f64>,
    pub has_password: bool,
    pub url: String,
}

#[derive(Debug, Clone)]
struct DownloadGrant {
    share_id: Uuid,
    expires_at: Instant,
}

/// Store of public shares: blobs on disk, metadata in YAML.
pub struct PublicShares {
    metadata_path: PathBuf,
    storage_dir: PathBuf,
    shares: RwLock<HashMap<Uuid, ShareMetadata>>,
    download_tokens: DashMap<String, DownloadGrant>,
}

impl std::fmt::Debug for PublicShares {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicShares")
            .field("storage_dir", &self.storage_dir)
            .finish_non_exhaustive()
    }
}

fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl PublicShares {
    /// Build a share store over the given paths.
    #[must_use]
    pub fn new(metadata_path: PathBuf, storage_dir: PathBuf) -> Self {
        Self {
            metadata_path,
            storage_dir,
            shares: RwLock::new(HashMap::new()),
            download_tokens: DashMap::new(),
        }
    }

    /// Load metadata from disk and ensure the blob directory exists.
    ///
    /// # Errors
    /// Returns an error when the blob directory cannot be created; a corrupt
    /// metadata file is logged and treated as empty.
    pub async fn load(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage_dir)?;
        if let Some(parent) = self.metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let loaded = if self.metadata_path.exists() {
            match std::fs::read_to_string(&self.metadata_path)
                .map_err(anyhow::Error::from)
                .and_then(|c| {
                    serde_yaml::from_str::<HashMap<Uuid, ShareMetadata>>(&c).map_err(Into::into)
                }) {
                Ok(map) => map,
                Err(e) => {
                    tracing::error!(error = %e, "failed to load public shares metadata");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        tracing::info!(count = loaded.len(), "loaded public shares");
        *self.shares.write().await = loaded;
        Ok(())
    }

    fn persist_locked(&self, shares: &HashMap<Uuid, ShareMetadata>) -> Result<()> {
        let yaml = serde_yaml::to_string(shares)
            .map_err(|e| Error::Internal(anyhow::anyhow!("shares encode failed: {e}")))?;
        let parent = self
            .metadata_path
            .parent()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("shares path has no parent")))?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::Internal(anyhow::anyhow!("temp file creation failed: {e}")))?;
        temp.write_all(yaml.as_bytes())?;
        temp.persist(&self.metadata_path)
            .map_err(|e| Error::Internal(anyhow::anyhow!("shares rename failed: {e}")))?;
        Ok(())
    }

    /// Path of a share's blob.
    #[must_use]
    pub fn blob_path(&self, share_id: Uuid) -> PathBuf {
        self.storage_dir.join(share_id.to_string())
    }

    /// Create a share by copying `source` into public storage.
    ///
    /// # Errors
    /// Returns an error when the source cannot be read or the blob cannot
    /// be written.
    pub async fn create(
        &self,
        owner_username: &str,
        source: &Path,
        original_filename: &str,
        password: Option<&str>,
        expiry_hours: Option<u64>,
    ) -> Result<ShareInfo> {
        let share_id = Uuid::new_v4();
        let blob = self.blob_path(share_id);
        std::fs::copy(source, &blob)?;
        let size_bytes = std::fs::metadata(&blob)?.len();

        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let metadata = ShareMetadata {
            owner_username: owner_username.to_owned(),
            original_filename: original_filename.to_owned(),
            created_at: now,
            size_bytes,
            password_hash: password.map(hash_password),
            expiry_timestamp: expiry_hours.map(|h| now + (h as f64) * 3600.0),
        };

        let mut shares = self.shares.write().await;
        shares.insert(share_id, metadata.clone());
        self.persist_locked(&shares)?;
        drop(shares);

        tracing::info!(share = %share_id, owner = owner_username, "created public share");
        Ok(self.info(share_id, &metadata))
    }

    fn info(&self, share_id: Uuid, metadata: &ShareMetadata) -> ShareInfo {
        ShareInfo {
            share_id,
            original_filename: metadata.original_filename.clone(),
            size_bytes: metadata.size_bytes,
            created_at: metadata.created_at,
            expiry_timestamp: metadata.expiry_timestamp,
            has_password: metadata.password_hash.is_some(),
            url: format!("/public/{share_id}"),
        }
    }

    /// Get a live (non-expired) share.
    pub async fn get(&self, share_id: Uuid) -> Option<ShareMetadata> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let shares = self.shares.read().await;
        shares
            .get(&share_id)
            .filter(|m| !m.is_expired(now))
            .cloned()
    }

    /// Shares owned by a user, newest first.
    pub async fn list_for_owner(&self, owner_username: &str) -> Vec<ShareInfo> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let shares = self.shares.read().await;
        let mut infos: Vec<ShareInfo> = shares
            .iter()
            .filter(|(_, m)| m.owner_username == owner_username && !m.is_expired(now))
            .map(|(id, m)| self.info(*id, m))
            .collect();
        infos.sort_by(|a, b| b.created_at.partial_cmp(&a.created_at).unwrap_or(std::cmp::Ordering::Equal));
        infos
    }

    /// Check a password attempt and mint a one-shot download token.
    ///
    /// # Errors
    /// `NotFound` for unknown/expired shares, `Unauthorized` on mismatch or
    /// when the share has no password at all.
    pub async fn verify_password(&self, share_id: Uuid, password: &str) -> Result<String> {
        let metadata = self
            .get(share_id)
            .await
            .ok_or_else(|| Error::not_found("Share not found."))?;
        let Some(expected) = metadata.password_hash else {
            return Err(Error::unauthorized("This share has no password."));
        };
        if !crate::util::constant_time_eq(&hash_password(password), &expected) {
            return Err(Error::unauthorized("Incorrect password."));
        }
        Ok(self.mint_download_token(share_id))
    }

    /// Mint a one-shot, sixty-second download token for a share.
    #[must_use]
    pub fn mint_download_token(&self, share_id: Uuid) -> String {
        let token = urlsafe_token(32);
        self.download_tokens.insert(
            token.clone(),
            DownloadGrant {
                share_id,
                expires_at: Instant::now() + DOWNLOAD_TOKEN_TTL,
            },
        );
        token
    }

    /// Consume a download token, returning the share it grants.
    ///
    /// Each token works exactly once; reuse and expiry are both `Forbidden`.
    ///
    /// # Errors
    /// `Forbidden` for unknown, reused or expired tokens; `NotFound` when
    /// the share disappeared in the meantime.
    pub async fn consume_download_token(&self, token: &str) -> Result<(Uuid, ShareMetadata)> {
        let (_, grant) = self
            .download_tokens
            .remove(token)
            .ok_or_else(|| Error::forbidden("Download link is invalid or already used."))?;
        if Instant::now() > grant.expires_at {
            return Err(Error::forbidden("Download link has expired."));
        }
        let metadata = self
            .get(grant.share_id)
            .await
            .ok_or_else(|| Error::not_found("Share not found."))?;
        Ok((grant.share_id, metadata))
    }

    /// Delete a share. When `owner` is given, only that owner may delete.
    ///
    /// # Errors
    /// `NotFound` for unknown shares or foreign owners.
    pub async fn delete(&self, share_id: Uuid, owner: Option<&str>) -> Result<()> {
        let mut shares = self.shares.write().await;
        let matches_owner = shares
            .get(&share_id)
            .is_some_and(|m| owner.is_none_or(|o| m.owner_username == o));
        if !matches_owner {
            return Err(Error::not_found("Share not found."));
        }
        shares.remove(&share_id);
        self.persist_locked(&shares)?;
        drop(shares);

        let blob = self.blob_path(share_id);
        if blob.exists() {
            if let Err(e) = std::fs::remove_file(&blob) {
                tracing::error!(share = %share_id, error = %e, "failed to delete share blob");
            }
        }
        tracing::info!(share = %share_id, "deleted public share");
        Ok(())
    }

    /// Remove every expired share, returning how many were swept.
    ///
    /// # Errors
    /// Returns an error when the pruned metadata cannot be persisted.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut shares = self.shares.write().await;
        let expired: Vec<Uuid> = shares
            .iter()
            .filter(|(_, m)| m.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        for id in &expired {
            shares.remove(id);
        }
        self.persist_locked(&shares)?;
        drop(shares);

        for id in &expired {
            let blob = self.blob_path(*id);
            if blob.exists() {
                if let Err(e) = std::fs::remove_file(&blob) {
                    tracing::error!(share = %id, error = %e, "failed to delete expired share blob");
                }
            }
        }
        tracing::info!(count = expired.len(), "swept expired public shares");
        Ok(expired.len())
    }
}
