//! On-disk cache of per-app autostart scripts.
//!
//! Scripts live at `<cache_root>/<store_name>/<source_app_id>` with a sibling
//! `<source_app_id>.meta` JSON file holding the last ETag. Refreshes are
//! conditional GETs; a 404 is cached as an empty file so the store is not
//! re-asked every round.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::apps::{AppStore, InstalledApp};
use crate::core::Result;

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    etag: String,
}

/// ETag-aware cache of autostart scripts fetched from app stores.
#[derive(Debug, Clone)]
pub struct AutostartCache {
    cache_root: PathBuf,
    client: reqwest::Client,
}

impl AutostartCache {
    /// Build a cache rooted at the given directory.
    #[must_use]
    pub fn new(cache_root: PathBuf) -> Self {
        Self {
            cache_root,
            client: reqwest::Client::new(),
        }
    }

    /// Path of the cached script for an app.
    #[must_use]
    pub fn script_path(&self, store_name: &str, source_app_id: &str) -> PathBuf {
        self.cache_root.join(store_name).join(source_app_id)
    }

    fn meta_path(&self, store_name: &str, source_app_id: &str) -> PathBuf {
        self.cache_root
            .join(store_name)
            .join(format!("{source_app_id}.meta"))
    }

    /// The cached script bytes, `None` when absent or cached-empty (404).
    #[must_use]
    pub fn cached_script(&self, store_name: &str, source_app_id: &str) -> Option<Vec<u8>> {
        let path = self.script_path(store_name, source_app_id);
        match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            _ => None,
        }
    }

    /// Remove the cached script and meta for an app, if present.
    pub fn evict(&self, store_name: &str, source_app_id: &str) {
        for path in [
            self.script_path(store_name, source_app_id),
            self.meta_path(store_name, source_app_id),
        ] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::error!(path = %path.display(), error = %e, "failed to delete autostart cache file");
                }
            }
        }
    }

    fn autostart_url(store: &AppStore, source_app_id: &str) -> Option<String> {
        if !(store.url.ends_with(".yml") || store.url.ends_with(".yaml")) {
            tracing::error!(
                url = %store.url,
                "app store URL is not a YAML file, cannot derive autostart path"
            );
            return None;
        }
        let base = store.url.rsplit_once('/').map_or("", |(base, _)| base);
        Some(format!("{base}/autostart/{source_app_id}"))
    }

    /// Refresh the cached script for one app, conditionally.
    ///
    /// Network failures are logged and swallowed; the caller never crashes
    /// because a store was unreachable.
    pub async fn refresh_app(&self, app: &InstalledApp, store: &AppStore) {
        if !app.provider_config.autostart {
            return;
        }
        let Some(url) = Self::autostart_url(store, &app.source_app_id) else {
            return;
        };

        let script_path = self.script_path(&store.name, &app.source_app_id);
        let meta_path = self.meta_path(&store.name, &app.source_app_id);
        if let Some(parent) = script_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!(error = %e, "failed to create autostart cache directory");
                return;
            }
        }

        let prior_etag = std::fs::read_to_string(&meta_path)
            .ok()
            .and_then(|c| serde_json::from_str::<CacheMeta>(&c).ok())
            .map(|m| m.etag);

        let mut request = self.client.get(&url);
        if let Some(etag) = &prior_etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(app = %app.source_app_id, error = %e, "failed to fetch autostart script");
                return;
            }
        };

        match response.status() {
            reqwest::StatusCode::NOT_MODIFIED => {
                tracing::debug!(app = %app.source_app_id, "autostart script unchanged");
            }
            reqwest::StatusCode::NOT_FOUND => {
                tracing::warn!(
                    app = %app.source_app_id,
                    "no autostart script in store, caching negative result"
                );
                if let Err(e) = std::fs::write(&script_path, b"") {
                    tracing::error!(error = %e, "failed to write empty autostart cache");
                }
                let _ = std::fs::remove_file(&meta_path);
            }
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(reqwest::header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                match response.text().await {
                    Ok(body) => {
                        if let Err(e) = std::fs::write(&script_path, body) {
                            tracing::error!(error = %e, "failed to write autostart cache");
                            return;
                        }
                        match etag {
                            Some(etag) => {
                                let meta = CacheMeta { etag };
                                if let Ok(json) = serde_json::to_string(&meta) {
                                    let _ = std::fs::write(&meta_path, json);
                                }
                            }
                            None => {
                                let _ = std::fs::remove_file(&meta_path);
                            }
                        }
                        tracing::info!(app = %app.source_app_id, "cached autostart script");
                    }
                    Err(e) => {
                        tracing::error!(app = %app.source_app_id, error = %e, "failed to read autostart response");
                    }
                }
            }
            status => {
                tracing::error!(
                    app = %app.source_app_id,
                    status = %status,
                    "unexpected status fetching autostart script"
                );
            }
        }
    }

    /// Refresh every autostart-enabled app, concurrently within the round.
    ///
    /// # Errors
    /// Returns an error only when the cache root cannot be created.
    pub async fn refresh_all(
        &self,
        apps: &[InstalledApp],
        stores: &[AppStore],
    ) -> Result<()> {
        std::fs::create_dir_all(&self.cache_root)?;
        let tasks = apps
            .iter()
            .filter(|app| app.provider_config.autostart)
            .filter_map(|app| {
                let store = stores.iter().find(|s| s.name == app.source);
                if store.is_none() {
                    tracing::error!(
                        app = %app.name,
                        store = %app.source,
                        "app store not found, cannot fetch autostart script"
                    );
                }
                store.map(|store| self.refresh_app(app, store))
            });
        join_all(tasks).await;
        Ok(())
    }
}
