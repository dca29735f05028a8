//! Application settings loaded from `SEALSKIN_`-prefixed environment variables.

use std::path::PathBuf;

/// Directory name under the storage root that holds per-session ephemeral mounts.
pub const EPHEMERAL_DIR_NAME: &str = "sealskin_ephemeral";

/// Directory name under a user's storage root that is bind-mounted into every
/// persistent session at `Desktop/files`.
pub const SHARED_FILES_DIR_NAME: &str = "_sealskin_shared_files";

/// Runtime configuration for the broker.
///
/// Every field maps to a `SEALSKIN_<NAME>` environment variable. Missing or
/// unparsable values fall back to the documented default; a parse failure is
/// logged rather than fatal.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Logging level (e.g. `debug`, `info`, `warn`).
    pub log_level: String,
    /// Port for the main API listener.
    pub api_port: u16,
    /// Port for the session proxy listener.
    pub session_port: u16,
    /// URL of the default app store YAML.
    pub app_resource_path: String,
    /// YAML file holding installed application configurations.
    pub installed_apps_path: PathBuf,
    /// YAML file listing configured app stores.
    pub app_stores_path: PathBuf,
    /// Directory holding one YAML file per application template.
    pub app_templates_path: PathBuf,
    /// Directory for in-flight chunked uploads.
    pub upload_dir: PathBuf,
    /// Name of the session access cookie set by the proxy.
    pub session_cookie_name: String,
    /// Directory caching per-app autostart scripts.
    pub autostart_cache_path: PathBuf,
    /// Whether the background image update job runs.
    pub auto_update_apps: bool,
    /// Interval between background image update rounds, in seconds.
    pub auto_update_interval_seconds: u64,
    /// User id containers run as.
    pub puid: u32,
    /// Group id containers run as.
    pub pgid: u32,
    /// Base directory for admin and user public keys.
    pub keys_base_path: PathBuf,
    /// Base directory for group definition files.
    pub groups_base_path: PathBuf,
    /// Base directory for user home directories.
    pub storage_path: PathBuf,
    /// Mount point for home directories inside application containers.
    pub container_config_path: PathBuf,
    /// Server RSA private key (PEM). Missing file is fatal at startup.
    pub server_private_key_path: PathBuf,
    /// Session listener TLS private key. Missing file downgrades to cleartext.
    pub proxy_key_path: PathBuf,
    /// Session listener TLS certificate. Missing file downgrades to cleartext.
    pub proxy_cert_path: PathBuf,
    /// Directory holding publicly shared file blobs.
    pub public_storage_path: PathBuf,
    /// YAML file for public share metadata.
    pub public_shares_metadata_path: PathBuf,
    /// Interval between expired-share sweeps, in seconds.
    pub share_cleanup_interval_seconds: u64,
    /// YAML file persisting the session store.
    pub sessions_db_path: PathBuf,
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(format!("SEALSKIN_{name}")).unwrap_or_else(|_| default.to_owned())
}

fn env_path(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name, default))
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    let var = format!("SEALSKIN_{name}");
    match std::env::var(&var) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::error!(var, value = %raw, "could not parse setting, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(format!("SEALSKIN_{name}")) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

impl Settings {
    /// Load settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            log_level: env_string("LOG_LEVEL", "info"),
            api_port: env_parse("API_PORT", 8000),
            session_port: env_parse("SESSION_PORT", 8443),
            app_resource_path: env_string(
                "APP_RESOURCE_PATH",
                "https://raw.githubusercontent.com/linuxserver/sealskin-apps/refs/heads/master/apps.yml",
            ),
            installed_apps_path: env_path(
                "INSTALLED_APPS_PATH",
                "/config/.config/sealskin/installed_apps.yml",
            ),
            app_stores_path: env_path(
                "APP_STORES_PATH",
                "/config/.config/sealskin/app_stores.yml",
            ),
            app_templates_path: env_path(
                "APP_TEMPLATES_PATH",
                "/config/.config/sealskin/app_templates",
            ),
            upload_dir: env_path("UPLOAD_DIR", "/storage/sealskin_uploads"),
            session_cookie_name: env_string("SESSION_COOKIE_NAME", "sealskin_session_token"),
            autostart_cache_path: env_path(
                "AUTOSTART_CACHE_PATH",
                "/config/.config/sealskin/autostart_cache",
            ),
            auto_update_apps: env_bool("AUTO_UPDATE_APPS", true),
            auto_update_interval_seconds: env_parse("AUTO_UPDATE_INTERVAL_SECONDS", 3600),
            puid: env_parse("PUID", 1000),
            pgid: env_parse("PGID", 1000),
            keys_base_path: env_path("KEYS_BASE_PATH", "/config/.config/sealskin/keys"),
            groups_base_path: env_path("GROUPS_BASE_PATH", "/config/.config/sealskin/groups"),
            storage_path: env_path("STORAGE_PATH", "/storage"),
            container_config_path: env_path("CONTAINER_CONFIG_PATH", "/config"),
            server_private_key_path: env_path(
                "SERVER_PRIVATE_KEY_PATH",
                "/config/ssl/server_key.pem",
            ),
            proxy_key_path: env_path("PROXY_KEY_PATH", "/config/ssl/proxy_key.pem"),
            proxy_cert_path: env_path("PROXY_CERT_PATH", "/config/ssl/proxy_cert.pem"),
            public_storage_path: env_path("PUBLIC_STORAGE_PATH", "/storage/sealskin_public"),
            public_shares_metadata_path: env_path(
                "PUBLIC_SHARES_METADATA_PATH",
                "/config/.config/sealskin/public_shares.yml",
            ),
            share_cleanup_interval_seconds: env_parse("SHARE_CLEANUP_INTERVAL_SECONDS", 600),
            sessions_db_path: env_path(
                "SESSIONS_DB_PATH",
                "/config/.config/sealskin/sessions.yml",
            ),
        }
    }

    /// Root directory for ephemeral session mounts.
    #[must_use]
    pub fn ephemeral_root(&self) -> PathBuf {
        self.storage_path.join(EPHEMERAL_DIR_NAME)
    }

    /// Storage root for a single user.
    #[must_use]
    pub fn user_storage_path(&self, username: &str) -> PathBuf {
        self.storage_path.join(username)
    }

    /// Shared-files sidecar directory for a single user.
    #[must_use]
    pub fn shared_files_path(&self, username: &str) -> PathBuf {
        self.user_storage_path(username).join(SHARED_FILES_DIR_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        let settings = Settings::from_env();
        assert_eq!(settings.api_port, 8000);
        assert_eq!(settings.session_port, 8443);
        assert_eq!(settings.session_cookie_name, "sealskin_session_token");
        assert!(settings.auto_update_apps);
        assert_eq!(settings.auto_update_interval_seconds, 3600);
    }

    #[test]
    fn ephemeral_root_is_under_storage() {
        let settings = Settings::from_env();
        assert!(settings.ephemeral_root().starts_with(&settings.storage_path));
        assert!(
            settings
                .ephemeral_root()
                .to_string_lossy()
                .ends_with(EPHEMERAL_DIR_NAME)
        );
    }

    #[test]
    fn shared_files_path_includes_username() {
        let settings = Settings::from_env();
        let path = settings.shared_files_path("alice");
        assert!(path.to_string_lossy().contains("alice"));
        assert!(path.to_string_lossy().ends_with(SHARED_FILES_DIR_NAME));
    }
}
