//! Per-image metadata cache and pull coordination.
//!
//! Tracks the locally-available digest set and last pull time per image, and
//! uses an in-process "pulling" marker as a per-image mutex so concurrent
//! pull requests collapse into one runtime call.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::{Error, Result};
use crate::runtime::ContainerRuntime;

/// Cached metadata for one image.
#[derive(Debug, Clone, Default)]
pub struct ImageEntry {
    /// Short id of the local image, `None` when not present locally.
    pub short_id: Option<String>,
    /// Repo digests of the local image.
    pub digests: Vec<String>,
    /// When the image was last successfully pulled.
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Outcome of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// This call performed the pull.
    Pulled,
    /// Another pull for the same image was already running.
    AlreadyInProgress,
}

/// Image metadata cache over the container runtime.
pub struct ImageMetadataCache {
    runtime: Arc<dyn ContainerRuntime>,
    entries: RwLock<HashMap<String, ImageEntry>>,
    pulling: DashMap<String, ()>,
}

impl std::fmt::Debug for ImageMetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageMetadataCache").finish_non_exhaustive()
    }
}

impl ImageMetadataCache {
    /// Build a cache over the given runtime.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            entries: RwLock::new(HashMap::new()),
            pulling: DashMap::new(),
        }
    }

    /// Cached entry for an image, if any.
    pub async fn entry(&self, image: &str) -> Option<ImageEntry> {
        self.entries.read().await.get(image).cloned()
    }

    /// `Some("pulling")` while a pull for this image is in flight.
    #[must_use]
    pub fn pull_status(&self, image: &str) -> Option<&'static str> {
        self.pulling.contains_key(image).then_some("pulling")
    }

    /// Refresh local metadata for an image.
    ///
    /// With `force` false, an entry that already has a short id is left
    /// untouched.
    ///
    /// # Errors
    /// Returns an error when the runtime cannot be queried.
    pub async fn refresh_metadata(&self, image: &str, force: bool) -> Result<()> {
        if !force {
            let entries = self.entries.read().await;
            if entries.get(image).is_some_and(|e| e.short_id.is_some()) {
                return Ok(());
            }
        }

        let info = self.runtime.local_info(image).await?;
        let mut entries = self.entries.write().await;
        let entry = entries.entry(image.to_owned()).or_default();
        match info {
            Some(info) => {
                entry.short_id = Some(info.short_id);
                entry.digests = info.digests;
            }
            None => {
                entry.short_id = None;
                entry.digests = Vec::new();
            }
        }
        Ok(())
    }

    /// Pull an image and refresh its metadata.
    ///
    /// Returns [`PullOutcome::AlreadyInProgress`] immediately when another
    /// pull of the same image is running; exactly one caller reaches the
    /// runtime.
    ///
    /// # Errors
    /// Returns an error when the pull itself fails; the pulling marker is
    /// always cleared.
    pub async fn pull_and_cache(&self, image: &str) -> Result<PullOutcome> {
        if self.pulling.insert(image.to_owned(), ()).is_some() {
            tracing::info!(image, "pull already in progress");
            return Ok(PullOutcome::AlreadyInProgress);
        }

        let result = async {
            self.runtime.pull(image).await?;
            self.refresh_metadata(image, true).await?;
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(image) {
                entry.last_checked_at = Some(Utc::now());
            }
            Ok(PullOutcome::Pulled)
        }
        .await;

        self.pulling.remove(image);
        result
    }

    /// Check whether the registry serves a digest we do not have locally.
    ///
    /// Returns the current local short id and the availability flag.
    ///
    /// # Errors
    /// `BadGateway` when the registry does not answer for this image.
    pub async fn update_available(&self, image: &str) -> Result<(Option<String>, bool)> {
        let local = self.runtime.local_info(image).await?;
        let remote = self.runtime.remote_digest(image).await?;
        let Some(remote_digest) = remote else {
            return Err(Error::bad_gateway(format!(
                "Could not retrieve update information for {image} from its registry."
            )));
        };

        let local_digests = local.as_ref().map(|i| i.digests.clone()).unwrap_or_default();
        let update_available = !local_digests
            .iter()
            .any(|d| d.contains(&remote_digest));
        Ok((local.map(|i| i.short_id), update_available))
    }
}
