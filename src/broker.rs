//! The broker: every engine wired together behind one value.
//!
//! Constructed once in `main` (or a test harness) and threaded through the
//! HTTP layers; components talk to each other through capability interfaces
//! rather than globals.

use std::sync::Arc;

use crate::apps::AppCatalog;
use crate::autostart::AutostartCache;
use crate::collab::{CollabService, ControlPlaneClient};
use crate::config::Settings;
use crate::core::{AvailableGpu, Result};
use crate::crypto::CryptoChannel;
use crate::directory::Directory;
use crate::identity::Identity;
use crate::images::ImageMetadataCache;
use crate::launch::LaunchEngine;
use crate::paths::PathTranslator;
use crate::runtime::ContainerRuntime;
use crate::shares::PublicShares;
use crate::storage::StorageManager;
use crate::storage::uploads::UploadManager;
use crate::store::SessionStore;

/// Fully-wired broker state shared by both listeners and the background jobs.
pub struct Broker {
    pub settings: Settings,
    pub crypto: CryptoChannel,
    pub directory: Arc<Directory>,
    pub identity: Identity,
    pub catalog: Arc<AppCatalog>,
    pub autostart: Arc<AutostartCache>,
    pub images: Arc<ImageMetadataCache>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub translator: Arc<PathTranslator>,
    pub storage: Arc<StorageManager>,
    pub uploads: Arc<UploadManager>,
    pub shares: Arc<PublicShares>,
    pub store: Arc<SessionStore>,
    pub engine: Arc<LaunchEngine>,
    pub collab: Arc<CollabService>,
    pub gpus: Vec<AvailableGpu>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

impl Broker {
    /// Load state from disk, reconcile with the runtime, and wire the
    /// engines together.
    ///
    /// # Errors
    /// Fatal startup problems: missing server key, unreadable state files,
    /// uncreatable directories.
    pub async fn bootstrap(
        settings: Settings,
        runtime: Arc<dyn ContainerRuntime>,
        control_plane: Arc<dyn ControlPlaneClient>,
        gpus: Vec<AvailableGpu>,
    ) -> Result<Arc<Self>> {
        let crypto = CryptoChannel::load(&settings.server_private_key_path)?;

        let storage = Arc::new(StorageManager::new(settings.storage_path.clone()));
        storage.ensure_layout()?;
        let uploads = Arc::new(UploadManager::new(settings.upload_dir.clone()));
        uploads.ensure_layout()?;

        let directory = Arc::new(Directory::new(
            settings.keys_base_path.clone(),
            settings.groups_base_path.clone(),
            settings.storage_path.clone(),
        ));
        directory.reload().await?;
        let identity = Identity::new(Arc::clone(&directory));

        let catalog = Arc::new(AppCatalog::new(
            settings.installed_apps_path.clone(),
            settings.app_stores_path.clone(),
            settings.app_templates_path.clone(),
            settings.app_resource_path.clone(),
        ));
        catalog.load().await?;

        let autostart = Arc::new(AutostartCache::new(settings.autostart_cache_path.clone()));
        std::fs::create_dir_all(&settings.autostart_cache_path)?;

        let shares = Arc::new(PublicShares::new(
            settings.public_shares_metadata_path.clone(),
            settings.public_storage_path.clone(),
        ));
        shares.load().await?;

        let translator = Arc::new(
            PathTranslator::detect(&runtime, settings.api_port, settings.session_port).await,
        );

        let store = Arc::new(SessionStore::new(settings.sessions_db_path.clone()));
        store.load_and_reconcile(&runtime).await?;

        let images = Arc::new(ImageMetadataCache::new(Arc::clone(&runtime)));
        tracing::info!("populating initial image metadata cache");
        for app in catalog.all().await {
            if let Err(e) = images.refresh_metadata(&app.provider_config.image, false).await {
                tracing::warn!(image = %app.provider_config.image, error = %e, "metadata refresh failed");
            }
        }

        let engine = Arc::new(LaunchEngine::new(
            settings.clone(),
            Arc::clone(&catalog),
            Arc::clone(&autostart),
            Arc::clone(&storage),
            Arc::clone(&runtime),
            Arc::clone(&translator),
            Arc::clone(&store),
            gpus.clone(),
        ));
        let collab = Arc::new(CollabService::new(Arc::clone(&store), control_plane));

        Ok(Arc::new(Self {
            settings,
            crypto,
            directory,
            identity,
            catalog,
            autostart,
            images,
            runtime,
            translator,
            storage,
            uploads,
            shares,
            store,
            engine,
            collab,
            gpus,
        }))
    }

    /// Pull an image, refresh its metadata and autostart scripts.
    ///
    /// Shared by the admin pull endpoint and the background update job.
    pub async fn pull_and_cache(&self, image: &str) -> Result<()> {
        self.images.pull_and_cache(image).await?;

        let apps = self.catalog.apps_using_image(image).await;
        if !apps.is_empty() {
            tracing::info!(
                image,
                apps = apps.len(),
                "image updated, refreshing autostart scripts"
            );
            let stores = self.catalog.stores().await;
            for app in &apps {
                if let Some(store) = stores.iter().find(|s| s.name == app.source) {
                    self.autostart.refresh_app(app, store).await;
                }
            }
        }
        Ok(())
    }
}
