//! User, admin and group storage backed by per-entity files on disk.
//!
//! Users live in `<keys>/users/<username>` as a settings block followed by a
//! public key PEM; admins live in `<keys>/admins/<username>` as a bare PEM.
//! Groups are one YAML file each under the groups directory.

use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::core::{Error, Result};

const SETTINGS_MARKER: &str = "--- Settings ---";
const PUBLIC_KEY_MARKER: &str = "--- Public Key ---";

/// Validate a username, group name or home-directory name.
///
/// Accepts only letters, digits, underscore and hyphen; rejects empty input.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Per-user feature gates and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Whether the account may authenticate at all.
    pub active: bool,
    /// Group name, `"none"` when the user is ungrouped.
    pub group: String,
    /// Whether the user may use persistent home directories.
    pub persistent_storage: bool,
    /// Whether the user may create public file shares.
    pub public_sharing: bool,
    /// Request extra container hardening.
    pub harden_container: bool,
    /// Request openbox hardening inside the container.
    pub harden_openbox: bool,
    /// Whether the user may select a GPU.
    pub gpu: bool,
    /// Storage quota in bytes, -1 for unlimited.
    pub storage_limit: i64,
    /// Maximum concurrent sessions, -1 for unlimited.
    pub session_limit: i64,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            active: true,
            group: "none".to_owned(),
            persistent_storage: true,
            public_sharing: false,
            harden_container: false,
            harden_openbox: false,
            gpu: true,
            storage_limit: -1,
            session_limit: -1,
        }
    }
}

/// A partial settings document as stored on disk.
///
/// Both the user settings block and group files may carry only a subset of
/// fields; absent fields keep the value they are layered on top of.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_storage: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_sharing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harden_container: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harden_openbox: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_limit: Option<i64>,
}

impl UserSettingsPatch {
    /// Layer this patch over `base`, field by field.
    #[must_use]
    pub fn apply(&self, base: &UserSettings) -> UserSettings {
        UserSettings {
            active: self.active.unwrap_or(base.active),
            group: self.group.clone().unwrap_or_else(|| base.group.clone()),
            persistent_storage: self.persistent_storage.unwrap_or(base.persistent_storage),
            public_sharing: self.public_sharing.unwrap_or(base.public_sharing),
            harden_container: self.harden_container.unwrap_or(base.harden_container),
            harden_openbox: self.harden_openbox.unwrap_or(base.harden_openbox),
            gpu: self.gpu.unwrap_or(base.gpu),
            storage_limit: self.storage_limit.unwrap_or(base.storage_limit),
            session_limit: self.session_limit.unwrap_or(base.session_limit),
        }
    }
}

/// A registered user or admin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique account name.
    pub username: String,
    /// RSA public key PEM used to verify this user's JWTs.
    pub public_key: String,
    /// Admins bypass all settings gates except persistent storage.
    pub is_admin: bool,
    /// Stored settings; `None` for admins.
    pub settings: Option<UserSettings>,
}

/// A named settings bundle applied on top of member users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Group name, referenced by `UserSettings::group`.
    pub name: String,
    /// Settings overriding each member's own, field by field.
    pub settings: UserSettingsPatch,
}

/// In-memory view of the key and group directories.
pub struct Directory {
    keys_base_path: PathBuf,
    groups_base_path: PathBuf,
    storage_path: PathBuf,
    users: RwLock<HashMap<String, User>>,
    groups: RwLock<HashMap<String, Group>>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("keys_base_path", &self.keys_base_path)
            .field("groups_base_path", &self.groups_base_path)
            .finish_non_exhaustive()
    }
}

fn set_file_private(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Generate a fresh RSA keypair, returning `(private_pem, public_pem)`.
fn generate_keypair(bits: usize) -> Result<(String, String)> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| Error::Internal(anyhow::anyhow!("key generation failed: {e}")))?;
    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Internal(anyhow::anyhow!("private key encoding failed: {e}")))?
        .to_string();
    let public_pem = private_key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Internal(anyhow::anyhow!("public key encoding failed: {e}")))?;
    Ok((private_pem, public_pem))
}

/// Parse a user key file into its settings patch and public key PEM.
fn parse_key_file(content: &str) -> Option<(UserSettingsPatch, String)> {
    let (settings_part, key_part) = content.split_once(PUBLIC_KEY_MARKER)?;
    let settings_yaml = settings_part.replace(SETTINGS_MARKER, "");
    let settings_yaml = settings_yaml.trim();
    let patch = if settings_yaml.is_empty() {
        UserSettingsPatch::default()
    } else {
        serde_yaml::from_str(settings_yaml).ok()?
    };
    let pem = key_part.trim().to_owned();
    if pem.is_empty() {
        return None;
    }
    Some((patch, pem))
}

fn render_key_file(settings: &UserSettings, public_key_pem: &str) -> String {
    let settings_yaml =
        serde_yaml::to_string(settings).unwrap_or_else(|_| String::from("{}\n"));
    format!(
        "{SETTINGS_MARKER}\n{}\n{PUBLIC_KEY_MARKER}\n{}\n",
        settings_yaml.trim(),
        public_key_pem.trim()
    )
}

impl Directory {
    /// Create an empty directory view over the given base paths.
    #[must_use]
    pub fn new(keys_base_path: PathBuf, groups_base_path: PathBuf, storage_path: PathBuf) -> Self {
        Self {
            keys_base_path,
            groups_base_path,
            storage_path,
            users: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
        }
    }

    fn admins_dir(&self) -> PathBuf {
        self.keys_base_path.join("admins")
    }

    fn users_dir(&self) -> PathBuf {
        self.keys_base_path.join("users")
    }

    /// Rescan the key and group directories, replacing the in-memory view.
    ///
    /// Creates the directory layout on first run and bootstraps a default
    /// `admin` account (logging its private key once) when no admins exist.
    ///
    /// # Errors
    /// Returns an error if the directories cannot be created or scanned.
    pub async fn reload(&self) -> Result<()> {
        std::fs::create_dir_all(self.admins_dir())?;
        std::fs::create_dir_all(self.users_dir())?;
        std::fs::create_dir_all(&self.groups_base_path)?;

        self.bootstrap_default_admin()?;

        let mut users = HashMap::new();
        for entry in std::fs::read_dir(self.admins_dir())? {
            let entry = entry?;
            let username = entry.file_name().to_string_lossy().to_string();
            match std::fs::read_to_string(entry.path()) {
                Ok(pem) if !pem.trim().is_empty() => {
                    users.insert(
                        username.clone(),
                        User {
                            username,
                            public_key: pem.trim().to_owned(),
                            is_admin: true,
                            settings: None,
                        },
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(username, error = %e, "failed to load admin key"),
            }
        }

        for entry in std::fs::read_dir(self.users_dir())? {
            let entry = entry?;
            let username = entry.file_name().to_string_lossy().to_string();
            if users.contains_key(&username) {
                continue;
            }
            match std::fs::read_to_string(entry.path()) {
                Ok(content) => {
                    if let Some((patch, pem)) = parse_key_file(&content) {
                        users.insert(
                            username.clone(),
                            User {
                                username,
                                public_key: pem,
                                is_admin: false,
                                settings: Some(patch.apply(&UserSettings::default())),
                            },
                        );
                    } else {
                        tracing::error!(username, "failed to parse user key file");
                    }
                }
                Err(e) => tracing::error!(username, error = %e, "failed to read user key file"),
            }
        }

        let mut groups = HashMap::new();
        for entry in std::fs::read_dir(&self.groups_base_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            match std::fs::read_to_string(entry.path())
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_yaml::from_str::<UserSettingsPatch>(&c).map_err(Into::into))
            {
                Ok(settings) => {
                    groups.insert(
                        name.clone(),
                        Group {
                            name,
                            settings,
                        },
                    );
                }
                Err(e) => tracing::error!(group = name, error = %e, "failed to load group"),
            }
        }

        tracing::info!(
            users = users.len(),
            groups = groups.len(),
            "reloaded users, admins and groups"
        );
        *self.users.write().await = users;
        *self.groups.write().await = groups;
        Ok(())
    }

    fn bootstrap_default_admin(&self) -> Result<()> {
        let admins_dir = self.admins_dir();
        let has_admins = std::fs::read_dir(&admins_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if has_admins {
            return Ok(());
        }

        tracing::warn!("no admin users found, creating a default 'admin' account");
        let (private_pem, public_pem) = generate_keypair(4096)?;
        let admin_path = admins_dir.join("admin");
        std::fs::write(&admin_path, &public_pem)?;
        set_file_private(&admin_path)?;

        tracing::error!(
            "DEFAULT ADMIN CREDENTIALS (save this private key, it is not stored)\nUsername: admin\n{private_pem}"
        );
        Ok(())
    }

    /// Look up a user or admin by name.
    pub async fn get_user(&self, username: &str) -> Option<User> {
        self.users.read().await.get(username).cloned()
    }

    /// Final calculated settings for a user, including group overrides.
    ///
    /// Admins and unknown users get the default (all-permissive) settings.
    pub async fn effective_settings(&self, username: &str) -> UserSettings {
        let users = self.users.read().await;
        let Some(user) = users.get(username) else {
            return UserSettings::default();
        };
        if user.is_admin {
            return UserSettings::default();
        }
        let base = user.settings.clone().unwrap_or_default();
        if base.group != "none" {
            if let Some(group) = self.groups.read().await.get(&base.group) {
                return group.settings.apply(&base);
            }
        }
        base
    }

    /// All non-admin users.
    pub async fn all_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .read()
            .await
            .values()
            .filter(|u| !u.is_admin)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// All admins.
    pub async fn all_admins(&self) -> Vec<User> {
        let mut admins: Vec<User> = self
            .users
            .read()
            .await
            .values()
            .filter(|u| u.is_admin)
            .cloned()
            .collect();
        admins.sort_by(|a, b| a.username.cmp(&b.username));
        admins
    }

    /// All groups.
    pub async fn all_groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.groups.read().await.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    /// Whether a group with this name exists.
    pub async fn group_exists(&self, name: &str) -> bool {
        self.groups.read().await.contains_key(name)
    }

    /// Create a regular user.
    ///
    /// When no public key is supplied a fresh 2048-bit keypair is generated
    /// and the private PEM is returned exactly once.
    ///
    /// # Errors
    /// `BadRequest` for an invalid username, `Conflict` for a duplicate.
    pub async fn create_user(
        &self,
        username: &str,
        public_key: Option<String>,
        settings: UserSettings,
    ) -> Result<(User, Option<String>)> {
        if !is_valid_name(username) {
            return Err(Error::bad_request(
                "Invalid username. Use only letters, numbers, underscore, or hyphen.",
            ));
        }
        if self.users.read().await.contains_key(username) {
            return Err(Error::conflict(format!(
                "User or admin '{username}' already exists."
            )));
        }

        let (private_pem, public_pem) = match public_key {
            Some(pem) => (None, pem),
            None => {
                let (private_pem, public_pem) = generate_keypair(2048)?;
                (Some(private_pem), public_pem)
            }
        };

        let file_path = self.users_dir().join(username);
        std::fs::create_dir_all(self.users_dir())?;
        std::fs::write(&file_path, render_key_file(&settings, &public_pem))?;
        set_file_private(&file_path)?;
        tracing::info!(username, "created user");

        self.reload().await?;
        let user = self
            .get_user(username)
            .await
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("user missing after create")))?;
        Ok((user, private_pem))
    }

    /// Create an admin. Same key handling as [`Self::create_user`].
    ///
    /// # Errors
    /// `BadRequest` for an invalid username, `Conflict` for a duplicate.
    pub async fn create_admin(
        &self,
        username: &str,
        public_key: Option<String>,
    ) -> Result<(User, Option<String>)> {
        if !is_valid_name(username) {
            return Err(Error::bad_request(
                "Invalid username. Use only letters, numbers, underscore, or hyphen.",
            ));
        }
        if self.users.read().await.contains_key(username) {
            return Err(Error::conflict(format!(
                "User or admin '{username}' already exists."
            )));
        }

        let (private_pem, public_pem) = match public_key {
            Some(pem) => (None, pem),
            None => {
                let (private_pem, public_pem) = generate_keypair(2048)?;
                (Some(private_pem), public_pem)
            }
        };

        let file_path = self.admins_dir().join(username);
        std::fs::write(&file_path, public_pem.trim())?;
        set_file_private(&file_path)?;
        tracing::info!(username, "created admin");

        self.reload().await?;
        let user = self
            .get_user(username)
            .await
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("admin missing after create")))?;
        Ok((user, private_pem))
    }

    /// Delete a regular user, including all of their home directories.
    ///
    /// # Errors
    /// `NotFound` for unknown users, `Forbidden` when targeting an admin.
    pub async fn delete_user(&self, username: &str) -> Result<()> {
        let user = self
            .get_user(username)
            .await
            .ok_or_else(|| Error::not_found(format!("User '{username}' not found.")))?;
        if user.is_admin {
            return Err(Error::forbidden("Cannot delete an admin user."));
        }

        let user_storage = self.storage_path.join(username);
        if user_storage.is_dir() {
            std::fs::remove_dir_all(&user_storage)?;
            tracing::info!(username, "deleted user storage");
        }

        let file_path = self.users_dir().join(username);
        if !file_path.exists() {
            return Err(Error::not_found(format!(
                "User file for '{username}' not found."
            )));
        }
        std::fs::remove_file(&file_path)?;
        tracing::info!(username, "deleted user");
        self.reload().await
    }

    /// Delete an admin, including all of their home directories.
    ///
    /// The root `admin` account is protected.
    ///
    /// # Errors
    /// `Forbidden` for the root admin, `NotFound` otherwise.
    pub async fn delete_admin(&self, username: &str) -> Result<()> {
        if username == "admin" {
            return Err(Error::forbidden("The root 'admin' account cannot be deleted."));
        }
        let user = self.get_user(username).await;
        if user.as_ref().is_none_or(|u| !u.is_admin) {
            return Err(Error::not_found(format!("Admin '{username}' not found.")));
        }

        let user_storage = self.storage_path.join(username);
        if user_storage.is_dir() {
            std::fs::remove_dir_all(&user_storage)?;
        }

        let file_path = self.admins_dir().join(username);
        if !file_path.exists() {
            return Err(Error::not_found(format!(
                "Admin file for '{username}' not found."
            )));
        }
        std::fs::remove_file(&file_path)?;
        tracing::info!(username, "deleted admin");
        self.reload().await
    }

    /// Replace a user's stored settings.
    ///
    /// # Errors
    /// `NotFound` for unknown users, `Forbidden` when targeting an admin.
    pub async fn update_user_settings(
        &self,
        username: &str,
        settings: UserSettings,
    ) -> Result<()> {
        let user = self
            .get_user(username)
            .await
            .ok_or_else(|| Error::not_found(format!("User '{username}' not found.")))?;
        if user.is_admin {
            return Err(Error::forbidden("Cannot update settings for an admin user."));
        }

        let file_path = self.users_dir().join(username);
        std::fs::write(&file_path, render_key_file(&settings, &user.public_key))?;
        set_file_private(&file_path)?;
        self.reload().await
    }

    /// Create or replace a group definition file.
    ///
    /// # Errors
    /// `BadRequest` for an invalid group name.
    pub async fn write_group(&self, name: &str, settings: &UserSettingsPatch) -> Result<()> {
        if !is_valid_name(name) {
            return Err(Error::bad_request(
                "Invalid group name. Use only letters, numbers, underscore, or hyphen.",
            ));
        }
        let file_path = self.groups_base_path.join(name);
        let yaml = serde_yaml::to_string(settings)
            .map_err(|e| Error::Internal(anyhow::anyhow!("group encode failed: {e}")))?;
        std::fs::write(&file_path, yaml)?;
        set_file_private(&file_path)?;
        tracing::info!(group = name, "wrote group file");
        self.reload().await
    }

    /// Delete a group definition.
    ///
    /// # Errors
    /// `NotFound` when the group does not exist.
    pub async fn delete_group(&self, name: &str) -> Result<()> {
        if !self.groups.read().await.contains_key(name) {
            return Err(Error::not_found(format!("Group '{name}' not found.")));
        }
        let file_path = self.groups_base_path.join(name);
        if !file_path.exists() {
            return Err(Error::not_found(format!(
                "Group file for '{name}' not found."
            )));
        }
        std::fs::remove_file(&file_path)?;
        tracing::info!(group = name, "deleted group");
        self.reload().await
    }
}
