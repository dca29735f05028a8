//! Installed applications, app stores and application templates.
//!
//! All three are YAML-backed: installed apps and stores as single list files,
//! templates as one file per template in a directory. The catalog keeps an
//! in-memory view and rewrites the files on mutation.

pub mod env;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::{Error, Result};

/// A remote application store: a named URL pointing at an apps YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStore {
    /// Unique store name, also the autostart cache subdirectory.
    pub name: String,
    /// URL of the store's apps YAML file.
    pub url: String,
}

/// A single environment override carried by an app configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Container-level configuration of an installed application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Container image reference.
    pub image: String,
    /// Application port inside the container.
    pub port: u16,
    /// Whether the app can use Nvidia GPUs.
    pub nvidia_support: bool,
    /// Whether the app can use DRI3 render nodes.
    pub dri3_support: bool,
    /// Whether the app accepts a launch URL.
    pub url_support: bool,
    /// File extensions the app can open.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Whether the app ships an autostart script in its store.
    #[serde(default)]
    pub autostart: bool,
    /// Inline autostart script (base64), taking precedence over the cache.
    #[serde(default)]
    pub custom_autostart_script_b64: Option<String>,
    /// Environment overrides applied last during composition.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Shared-memory size passed to the runtime, defaults to `1g`.
    #[serde(default)]
    pub shm_size: Option<String>,
}

/// An application installed on this broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledApp {
    /// Unique id, minted on install.
    #[serde(default = "new_app_id")]
    pub id: String,
    /// Display name.
    pub name: String,
    /// Logo reference shown in listings.
    pub logo: String,
    /// Name of the store this app was installed from.
    pub source: String,
    /// App id inside the source store, used for autostart lookups.
    pub source_app_id: String,
    /// Runtime kind, e.g. `docker`.
    pub provider: String,
    /// Whether the app supports persistent home directories.
    pub home_directories: bool,
    /// Allowed usernames, or `["all"]`.
    pub users: Vec<String>,
    /// Allowed groups, or `["all"]`.
    pub groups: Vec<String>,
    /// Container configuration.
    pub provider_config: ProviderConfig,
    /// Whether the background job keeps the image fresh.
    #[serde(default = "default_true")]
    pub auto_update: bool,
    /// Name of the template whose settings seed the environment.
    pub app_template: String,
}

fn new_app_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_true() -> bool {
    true
}

impl InstalledApp {
    /// Whether this app is visible to the given user.
    ///
    /// An app is visible iff `"all"` appears in its users or groups, the
    /// username is listed, or the user's group is listed.
    #[must_use]
    pub fn visible_to(&self, username: &str, group: &str) -> bool {
        self.users.iter().any(|u| u == "all" || u == username)
            || self.groups.iter().any(|g| g == "all" || g == group)
    }
}

/// A named bundle of environment settings applied at launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppTemplate {
    /// Template name; letters, digits, space, underscore and hyphen.
    pub name: String,
    /// Key/value settings, string-coerced into the environment.
    #[serde(default)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

/// Validate a template name: letters, digits, space, underscore, hyphen.
#[must_use]
pub fn is_valid_template_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ')
}

fn template_filename(name: &str) -> String {
    format!("{}.yml", name.to_lowercase().replace(' ', "_"))
}

/// In-memory catalog of installed apps, stores and templates.
pub struct AppCatalog {
    installed_apps_path: PathBuf,
    app_stores_path: PathBuf,
    app_templates_path: PathBuf,
    default_store: AppStore,
    apps: RwLock<HashMap<String, InstalledApp>>,
    stores: RwLock<Vec<AppStore>>,
    templates: RwLock<HashMap<String, AppTemplate>>,
}

impl std::fmt::Debug for AppCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCatalog")
            .field("installed_apps_path", &self.installed_apps_path)
            .finish_non_exhaustive()
    }
}

impl AppCatalog {
    /// Build a catalog over the configured file locations.
    #[must_use]
    pub fn new(
        installed_apps_path: PathBuf,
        app_stores_path: PathBuf,
        app_templates_path: PathBuf,
        default_store_url: String,
    ) -> Self {
        Self {
            installed_apps_path,
            app_stores_path,
            app_templates_path,
            default_store: AppStore {
                name: "SealSkin Apps".to_owned(),
                url: default_store_url,
            },
            apps: RwLock::new(HashMap::new()),
            stores: RwLock::new(Vec::new()),
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Load apps, stores and templates from disk.
    ///
    /// A missing stores file is seeded with the default store. Corrupt files
    /// are logged and treated as empty. A missing template directory gets a
    /// blank `Default` template.
    ///
    /// # Errors
    /// Returns an error when the config directories cannot be created.
    pub async fn load(&self) -> Result<()> {
        if let Some(parent) = self.installed_apps_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&self.app_templates_path)?;

        let apps = if self.installed_apps_path.exists() {
            match std::fs::read_to_string(&self.installed_apps_path)
                .map_err(anyhow::Error::from)
                .and_then(|c| {
                    serde_yaml::from_str::<Vec<InstalledApp>>(&c).map_err(Into::into)
                }) {
                Ok(list) => list.into_iter().map(|a| (a.id.clone(), a)).collect(),
                Err(e) => {
                    tracing::error!(error = %e, "error loading installed apps config");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        tracing::info!(count = apps.len(), "loaded installed applications");
        *self.apps.write().await = apps;

        let stores = if self.app_stores_path.exists() {
            match std::fs::read_to_string(&self.app_stores_path)
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_yaml::from_str::<Vec<AppStore>>(&c).map_err(Into::into))
            {
                Ok(list) => list,
                Err(e) => {
                    tracing::error!(error = %e, "error loading app stores config");
                    Vec::new()
                }
            }
        } else {
            let seeded = vec![self.default_store.clone()];
            *self.stores.write().await = seeded.clone();
            self.save_stores().await?;
            seeded
        };
        tracing::info!(count = stores.len(), "loaded app stores");
        *self.stores.write().await = stores;

        self.load_templates().await?;
        Ok(())
    }

    /// Reload templates from the template directory.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be read.
    pub async fn load_templates(&self) -> Result<()> {
        let mut templates = HashMap::new();
        for entry in std::fs::read_dir(&self.app_templates_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.ends_with(".yml") || name.ends_with(".yaml")) {
                continue;
            }
            match std::fs::read_to_string(entry.path())
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_yaml::from_str::<AppTemplate>(&c).map_err(Into::into))
            {
                Ok(template) => {
                    templates.insert(template.name.clone(), template);
                }
                Err(e) => tracing::error!(file = name, error = %e, "error loading template"),
            }
        }

        if templates.is_empty() {
            tracing::warn!("no app templates found, creating a blank 'Default' template");
            let default = AppTemplate {
                name: "Default".to_owned(),
                settings: BTreeMap::new(),
            };
            let path = self.app_templates_path.join("default.yml");
            if let Ok(yaml) = serde_yaml::to_string(&default) {
                if let Err(e) = std::fs::write(&path, yaml) {
                    tracing::error!(error = %e, "could not write default template file");
                }
            }
            templates.insert(default.name.clone(), default);
        }

        tracing::info!(count = templates.len(), "loaded application templates");
        *self.templates.write().await = templates;
        Ok(())
    }

    async fn save_apps(&self) -> Result<()> {
        let apps = self.apps.read().await;
        let mut list: Vec<&InstalledApp> = apps.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        let yaml = serde_yaml::to_string(&list)
            .map_err(|e| Error::Internal(anyhow::anyhow!("apps encode failed: {e}")))?;
        std::fs::write(&self.installed_apps_path, yaml)?;
        Ok(())
    }

    async fn save_stores(&self) -> Result<()> {
        let stores = self.stores.read().await;
        let yaml = serde_yaml::to_string(&*stores)
            .map_err(|e| Error::Internal(anyhow::anyhow!("stores encode failed: {e}")))?;
        std::fs::write(&self.app_stores_path, yaml)?;
        Ok(())
    }

    /// Get an installed app by id.
    pub async fn get(&self, app_id: &str) -> Option<InstalledApp> {
        self.apps.read().await.get(app_id).cloned()
    }

    /// All installed apps.
    pub async fn all(&self) -> Vec<InstalledApp> {
        self.apps.read().await.values().cloned().collect()
    }

    /// Apps visible to a user, sorted case-insensitively by name.
    pub async fn visible_to(&self, username: &str, group: &str) -> Vec<InstalledApp> {
        let mut apps: Vec<InstalledApp> = self
            .apps
            .read()
            .await
            .values()
            .filter(|a| a.visible_to(username, group))
            .cloned()
            .collect();
        apps.sort_by_key(|a| a.name.to_lowercase());
        apps
    }

    /// Install an app.
    ///
    /// # Errors
    /// `Conflict` when an app with the same id exists.
    pub async fn install(&self, app: InstalledApp) -> Result<InstalledApp> {
        {
            let mut apps = self.apps.write().await;
            if apps.contains_key(&app.id) {
                return Err(Error::conflict("App with this ID already exists."));
            }
            apps.insert(app.id.clone(), app.clone());
        }
        self.save_apps().await?;
        Ok(app)
    }

    /// Replace an installed app. Returns the previous image reference.
    ///
    /// # Errors
    /// `NotFound` for unknown apps, `BadRequest` on id mismatch.
    pub async fn update(&self, app_id: &str, app: InstalledApp) -> Result<String> {
        if app_id != app.id {
            return Err(Error::bad_request("App ID in path does not match body."));
        }
        let old_image = {
            let mut apps = self.apps.write().await;
            let old = apps
                .get(app_id)
                .ok_or_else(|| Error::not_found("Installed app not found."))?;
            let old_image = old.provider_config.image.clone();
            apps.insert(app_id.to_owned(), app);
            old_image
        };
        self.save_apps().await?;
        Ok(old_image)
    }

    /// Remove an installed app, returning it.
    ///
    /// # Errors
    /// `NotFound` for unknown apps.
    pub async fn remove(&self, app_id: &str) -> Result<InstalledApp> {
        let app = {
            let mut apps = self.apps.write().await;
            apps.remove(app_id)
                .ok_or_else(|| Error::not_found("Installed app not found."))?
        };
        self.save_apps().await?;
        Ok(app)
    }

    /// All configured stores.
    pub async fn stores(&self) -> Vec<AppStore> {
        self.stores.read().await.clone()
    }

    /// Find a store by name.
    pub async fn store(&self, name: &str) -> Option<AppStore> {
        self.stores.read().await.iter().find(|s| s.name == name).cloned()
    }

    /// Add a store.
    ///
    /// # Errors
    /// `Conflict` when the name is taken.
    pub async fn add_store(&self, store: AppStore) -> Result<AppStore> {
        {
            let mut stores = self.stores.write().await;
            if stores.iter().any(|s| s.name == store.name) {
                return Err(Error::conflict(format!(
                    "App store with name '{}' already exists.",
                    store.name
                )));
            }
            stores.push(store.clone());
        }
        self.save_stores().await?;
        Ok(store)
    }

    /// Remove a store by name.
    ///
    /// # Errors
    /// `NotFound` for unknown stores.
    pub async fn remove_store(&self, name: &str) -> Result<()> {
        {
            let mut stores = self.stores.write().await;
            let before = stores.len();
            stores.retain(|s| s.name != name);
            if stores.len() == before {
                return Err(Error::not_found("App store not found."));
            }
        }
        self.save_stores().await
    }

    /// Get a template by name.
    pub async fn template(&self, name: &str) -> Option<AppTemplate> {
        self.templates.read().await.get(name).cloned()
    }

    /// All templates, sorted by name.
    pub async fn templates(&self) -> Vec<AppTemplate> {
        let mut templates: Vec<AppTemplate> =
            self.templates.read().await.values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    /// Create or replace a template file and reload the template set.
    ///
    /// # Errors
    /// `BadRequest` for invalid names.
    pub async fn save_template(&self, template: AppTemplate) -> Result<AppTemplate> {
        if !is_valid_template_name(&template.name) {
            return Err(Error::bad_request("Invalid template name."));
        }
        let path = self
            .app_templates_path
            .join(template_filename(&template.name));
        let yaml = serde_yaml::to_string(&template)
            .map_err(|e| Error::Internal(anyhow::anyhow!("template encode failed: {e}")))?;
        std::fs::write(&path, yaml)?;
        self.load_templates().await?;
        Ok(template)
    }

    /// Delete a template file and reload the template set.
    ///
    /// # Errors
    /// `NotFound` for unknown templates.
    pub async fn delete_template(&self, name: &str) -> Result<()> {
        let path = self.app_templates_path.join(template_filename(name));
        if !path.exists() {
            return Err(Error::not_found(format!("Template '{name}' not found.")));
        }
        std::fs::remove_file(&path)?;
        self.load_templates().await
    }

    /// Distinct images across apps with auto-update enabled.
    pub async fn auto_update_images(&self) -> Vec<String> {
        let apps = self.apps.read().await;
        let mut images: Vec<String> = apps
            .values()
            .filter(|a| a.auto_update)
            .map(|a| a.provider_config.image.clone())
            .collect();
        images.sort();
        images.dedup();
        images
    }

    /// All apps using the given image.
    pub async fn apps_using_image(&self, image: &str) -> Vec<InstalledApp> {
        self.apps
            .read()
            .await
            .values()
            .filter(|a| a.provider_config.image == image)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_app(id: &str, name: &str) -> InstalledApp {
        InstalledApp {
            id: id.to_owned(),
            name: name.to_owned(),
            logo: "logo.png".to_owned(),
            source: "SealSkin Apps".to_owned(),
            source_app_id: "firefox".to_owned(),
            provider: "docker".to_owned(),
            home_directories: true,
            users: vec!["all".to_owned()],
            groups: vec![],
            provider_config: ProviderConfig {
                image: "lscr.io/linuxserver/firefox:latest".to_owned(),
                port: 3000,
                nvidia_support: false,
                dri3_support: true,
                url_support: true,
                extensions: vec![".html".to_owned()],
                autostart: false,
                custom_autostart_script_b64: None,
                env: vec![],
                shm_size: None,
            },
            auto_update: true,
            app_template: "Default".to_owned(),
        }
    }

    fn catalog(tmp: &TempDir) -> AppCatalog {
        AppCatalog::new(
            tmp.path().join("installed_apps.yml"),
            tmp.path().join("app_stores.yml"),
            tmp.path().join("templates"),
            "https://example.com/apps.yml".to_owned(),
        )
    }

    #[test]
    fn visibility_rules() {
        let mut app = sample_app("a", "Firefox");
        assert!(app.visible_to("alice", "none"));

        app.users = vec!["bob".to_owned()];
        assert!(!app.visible_to("alice", "none"));
        assert!(app.visible_to("bob", "none"));

        app.groups = vec!["staff".to_owned()];
        assert!(app.visible_to("alice", "staff"));

        app.groups = vec!["all".to_owned()];
        assert!(app.visible_to("alice", "none"));
    }

    #[test]
    fn template_name_validation() {
        assert!(is_valid_template_name("Default"));
        assert!(is_valid_template_name("KasmVNC Apps"));
        assert!(!is_valid_template_name("bad/name"));
        assert!(!is_valid_template_name(""));
    }

    #[tokio::test]
    async fn load_seeds_default_store_and_template() {
        let tmp = TempDir::new().unwrap();
        let catalog = catalog(&tmp);
        catalog.load().await.unwrap();

        let stores = catalog.stores().await;
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].name, "SealSkin Apps");
        assert!(tmp.path().join("app_stores.yml").exists());

        assert!(catalog.template("Default").await.is_some());
    }

    #[tokio::test]
    async fn install_update_remove_round_trip() {
        let tmp = TempDir::new().unwrap();
        let catalog = catalog(&tmp);
        catalog.load().await.unwrap();

        catalog.install(sample_app("a", "Firefox")).await.unwrap();
        let err = catalog.install(sample_app("a", "Firefox")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let mut updated = sample_app("a", "Firefox ESR");
        updated.provider_config.image = "lscr.io/linuxserver/firefox:esr".to_owned();
        let old_image = catalog.update("a", updated).await.unwrap();
        assert!(old_image.ends_with(":latest"));

        // Persisted state survives a reload
        let catalog2 = AppCatalog::new(
            tmp.path().join("installed_apps.yml"),
            tmp.path().join("app_stores.yml"),
            tmp.path().join("templates"),
            "https://example.com/apps.yml".to_owned(),
        );
        catalog2.load().await.unwrap();
        assert_eq!(catalog2.get("a").await.unwrap().name, "Firefox ESR");

        catalog.remove("a").await.unwrap();
        assert!(catalog.get("a").await.is_none());
    }

    #[tokio::test]
    async fn visible_listing_is_sorted() {
        let tmp = TempDir::new().unwrap();
        let catalog = catalog(&tmp);
        catalog.load().await.unwrap();
        catalog.install(sample_app("1", "vlc")).await.unwrap();
        catalog.install(sample_app("2", "Blender")).await.unwrap();

        let apps = catalog.visible_to("alice", "none").await;
        assert_eq!(apps[0].name, "Blender");
        assert_eq!(apps[1].name, "vlc");
    }

    #[tokio::test]
    async fn auto_update_images_deduplicate() {
        let tmp = TempDir::new().unwrap();
        let catalog = catalog(&tmp);
        catalog.load().await.unwrap();
        catalog.install(sample_app("1", "A")).await.unwrap();
        catalog.install(sample_app("2", "B")).await.unwrap();
        let mut off = sample_app("3", "C");
        off.auto_update = false;
        off.provider_config.image = "other:latest".to_owned();
        catalog.install(off).await.unwrap();

        let images = catalog.auto_update_images().await;
        assert_eq!(images.len(), 1);
    }
}
