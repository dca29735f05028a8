//! The launch engine: turns an authenticated launch request into a live,
//! proxied session.
//!
//! Resolution order is fixed: identifiers are minted first, then the
//! environment is composed, the GPU selection validated, the mount mode
//! decided, autostart content written, mounts assembled, the container
//! started, and readiness gated on the app answering its own URL. Failures
//! after an ephemeral mount was created remove it; failures during the
//! readiness wait stop the container.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::apps::env::{FILE_VAR, StaticEnv, URL_VAR};
use crate::apps::{AppCatalog, InstalledApp};
use crate::autostart::AutostartCache;
use crate::config::Settings;
use crate::core::{AvailableGpu, Error, Gpu, LaunchContext, Result, Session, Viewer};
use crate::paths::PathTranslator;
use crate::runtime::{ContainerRuntime, LaunchSpec, Mount};
use crate::storage::StorageManager;
use crate::store::SessionStore;
use crate::util::urlsafe_token;

/// Home name that forces an ephemeral (throwaway) session.
pub const CLEANROOM: &str = "cleanroom";

/// Timing knobs for the readiness gate.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Per-attempt HTTP timeout.
    pub attempt_timeout: Duration,
    /// Pause between attempts.
    pub poll_interval: Duration,
    /// Overall deadline before the launch is abandoned.
    pub deadline: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            deadline: Duration::from_secs(60),
        }
    }
}

/// A file payload attached to a launch.
#[derive(Debug, Clone)]
pub struct LaunchFile {
    /// Reassembled file contents.
    pub bytes: Vec<u8>,
    /// Original client-supplied filename.
    pub filename: String,
    /// Whether the app should open the file on start.
    pub open_on_launch: bool,
}

/// One launch request, already authenticated.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Installed application to start.
    pub application_id: String,
    /// Persistent home to mount, `None` or `"cleanroom"` for ephemeral.
    pub home_name: Option<String>,
    /// Caller-supplied environment (e.g. the launch URL).
    pub extra_env: BTreeMap<String, String>,
    /// Locale, e.g. `de_DE.UTF-8`.
    pub language: Option<String>,
    /// Selected GPU device path.
    pub selected_gpu: Option<String>,
    /// Optional file payload.
    pub file: Option<LaunchFile>,
    /// Launch as a collaboration room.
    pub room_mode: bool,
}

/// Result of a successful launch.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchResponse {
    /// Proxied entry URL carrying the access token.
    pub session_url: String,
    /// The new session id.
    pub session_id: Uuid,
}

/// Composes storage, images, autostart, runtime and store into sessions.
pub struct LaunchEngine {
    settings: Settings,
    catalog: Arc<AppCatalog>,
    autostart: Arc<AutostartCache>,
    storage: Arc<StorageManager>,
    runtime: Arc<dyn ContainerRuntime>,
    translator: Arc<PathTranslator>,
    store: Arc<SessionStore>,
    gpus: Vec<AvailableGpu>,
    readiness: ReadinessConfig,
    http: reqwest::Client,
}

impl std::fmt::Debug for LaunchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchEngine")
            .field("gpus", &self.gpus)
            .finish_non_exhaustive()
    }
}

impl LaunchEngine {
    /// Wire up the engine.
    #[must_use]
    pub fn new(
        settings: Settings,
        catalog: Arc<AppCatalog>,
        autostart: Arc<AutostartCache>,
        storage: Arc<StorageManager>,
        runtime: Arc<dyn ContainerRuntime>,
        translator: Arc<PathTranslator>,
        store: Arc<SessionStore>,
        gpus: Vec<AvailableGpu>,
    ) -> Self {
        Self {
            settings,
            catalog,
            autostart,
            storage,
            runtime,
            translator,
            store,
            gpus,
            readiness: ReadinessConfig::default(),
            http: reqwest::Client::new(),
        }
    }

    /// Override readiness timings (tests).
    #[must_use]
    pub fn with_readiness(mut self, readiness: ReadinessConfig) -> Self {
        self.readiness = readiness;
        self
    }

    /// GPUs available on this host.
    #[must_use]
    pub fn gpus(&self) -> &[AvailableGpu] {
        &self.gpus
    }

    fn resolve_gpu(
        &self,
        selected: Option<&str>,
        gpu_allowed: bool,
        app: &InstalledApp,
    ) -> Result<Option<Gpu>> {
        let Some(device) = selected else {
            return Ok(None);
        };
        if !gpu_allowed {
            return Ok(None);
        }
        let gpu_info = self
            .gpus
            .iter()
            .find(|g| g.device == device)
            .ok_or_else(|| {
                Error::bad_request(format!("Selected GPU '{device}' is not available."))
            })?;
        match &gpu_info.gpu {
            Gpu::Nvidia { .. } if !app.provider_config.nvidia_support => {
                Err(Error::bad_request(format!(
                    "App '{}' does not support Nvidia GPUs.",
                    app.name
                )))
            }
            Gpu::Dri3 { .. } if !app.provider_config.dri3_support => {
                Err(Error::bad_request(format!(
                    "App '{}' does not support DRI3 GPUs.",
                    app.name
                )))
            }
            gpu => Ok(Some(gpu.clone())),
        }
    }

    /// Launch a session for `username` with the given effective settings.
    ///
    /// # Errors
    /// `NotFound` for unknown apps and homes, `BadRequest` for GPU
    /// mismatches, `GatewayTimeout` when the container never becomes ready,
    /// and `Internal` for runtime failures. Ephemeral storage created along
    /// the way is removed on every error path.
    pub async fn launch(
        &self,
        username: &str,
        settings: &crate::directory::UserSettings,
        request: LaunchRequest,
    ) -> Result<LaunchResponse> {
        let app = self
            .catalog
            .get(&request.application_id)
            .await
            .ok_or_else(|| {
                Error::not_found(format!(
                    "Application with ID '{}' not found.",
                    request.application_id
                ))
            })?;

        let session_id = Uuid::new_v4();
        let access_token = urlsafe_token(32);
        let custom_user = Uuid::new_v4().to_string();
        let password = Uuid::new_v4().to_string();
        let session_id_str = session_id.to_string();

        let template = self.catalog.template(&app.app_template).await;
        if template.is_none() {
            tracing::warn!(
                session = %session_id,
                template = %app.app_template,
                app = %app.name,
                "template not found, using container defaults"
            );
        }

        let gpu = self.resolve_gpu(request.selected_gpu.as_deref(), settings.gpu, &app)?;

        let mut env = crate::apps::env::compose(
            &StaticEnv {
                session_id: &session_id_str,
                puid: self.settings.puid,
                pgid: self.settings.pgid,
                custom_user: &custom_user,
                password: &password,
            },
            template.as_ref(),
            &request.extra_env,
            request.language.as_deref(),
            &app,
            gpu.as_ref(),
        );

        let mut launch_context = env.get(URL_VAR).map(|url| LaunchContext::Url(url.clone()));

        // Everything past this point must clean up ephemeral storage on error.
        let mut ephemeral_created: Option<PathBuf> = None;
        let result = self
            .launch_inner(
                username,
                settings,
                &request,
                &app,
                session_id,
                &access_token,
                &custom_user,
                &password,
                gpu,
                &mut env,
                &mut launch_context,
                &mut ephemeral_created,
            )
            .await;

        if result.is_err() {
            if let Some(path) = &ephemeral_created {
                self.storage.remove_ephemeral(path);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch_inner(
        &self,
        username: &str,
        settings: &crate::directory::UserSettings,
        request: &LaunchRequest,
        app: &InstalledApp,
        session_id: Uuid,
        access_token: &str,
        custom_user: &str,
        password: &str,
        gpu: Option<Gpu>,
        env: &mut BTreeMap<String, String>,
        launch_context: &mut Option<LaunchContext>,
        ephemeral_created: &mut Option<PathBuf>,
    ) -> Result<LaunchResponse> {
        // Decide the mount mode.
        let use_persistent = settings.persistent_storage && app.home_directories;
        let home_name = if use_persistent {
            request.home_name.clone()
        } else {
            Some(CLEANROOM.to_owned())
        };

        let mut host_mount_path: Option<PathBuf> = None;
        let mut persistent = false;
        match &home_name {
            Some(home) if !home.eq_ignore_ascii_case(CLEANROOM) => {
                let path = self.storage.home_path(username, home);
                if !path.is_dir() {
                    return Err(Error::not_found(format!(
                        "Home directory '{home}' not found."
                    )));
                }
                host_mount_path = Some(path);
                persistent = true;
            }
            _ => {
                if request.file.is_some() {
                    let path = self.storage.create_ephemeral()?;
                    *ephemeral_created = Some(path.clone());
                    host_mount_path = Some(path);
                }
            }
        }

        // Resolve autostart content: inline script wins over the cache.
        let autostart_content = match &app.provider_config.custom_autostart_script_b64 {
            Some(inline) if !inline.is_empty() => Some(
                B64.decode(inline)
                    .map_err(|e| Error::bad_request(format!("Invalid autostart script: {e}")))?,
            ),
            _ if app.provider_config.autostart => self
                .autostart
                .cached_script(&app.source, &app.source_app_id),
            _ => None,
        };
        if let Some(content) = autostart_content {
            if host_mount_path.is_none() {
                let path = self.storage.create_ephemeral()?;
                tracing::info!(session = %session_id, "created ephemeral storage for autostart script");
                *ephemeral_created = Some(path.clone());
                host_mount_path = Some(path);
            }
            if let Some(mount) = &host_mount_path {
                write_autostart(mount, &content)?;
                tracing::info!(session = %session_id, app = %app.name, "wrote autostart script");
            }
        }

        // Assemble mounts and place the file payload.
        let container_config = self.settings.container_config_path.clone();
        let mut mounts = Vec::new();
        if let Some(mount) = &host_mount_path {
            mounts.push(Mount::rw(self.translator.translate(mount), &container_config));

            if persistent {
                let shared = self.storage.ensure_shared_files(username)?;
                mounts.push(Mount::rw(
                    self.translator.translate(&shared),
                    container_config.join("Desktop").join("files"),
                ));
            }

            if let Some(file) = &request.file {
                let dest_dir = if persistent {
                    self.storage.ensure_shared_files(username)?
                } else {
                    mount.join("Desktop").join("files")
                };
                let stored = self
                    .storage
                    .place_file(&dest_dir, &file.filename, &file.bytes)?;
                if file.open_on_launch {
                    let container_file = container_config
                        .join("Desktop")
                        .join("files")
                        .join(&stored);
                    env.insert(
                        FILE_VAR.to_owned(),
                        container_file.to_string_lossy().to_string(),
                    );
                    *launch_context = Some(LaunchContext::File(file.filename.clone()));
                }
            }
        }

        // Start the container; the runtime pulls the image on demand.
        let spec = LaunchSpec {
            image: app.provider_config.image.clone(),
            env: env.clone(),
            mounts,
            gpu,
            shm_size: app.provider_config.shm_size.clone(),
        };
        let launched = self
            .runtime
            .launch(&spec)
            .await
            .map_err(|e| Error::bad_gateway(format!("Failed to start container: {e}")))?;

        // Readiness gate; a dead launch stops the container before failing.
        if let Err(e) = self
            .wait_until_ready(&launched.ip, app.provider_config.port, session_id)
            .await
        {
            if let Err(stop_err) = self.runtime.stop(&launched.instance_id).await {
                tracing::error!(session = %session_id, error = %stop_err, "failed to stop unready container");
            }
            return Err(e);
        }

        let mut session = Session {
            session_id,
            access_token: access_token.to_owned(),
            instance_id: launched.instance_id,
            ip: launched.ip,
            port: app.provider_config.port,
            created_at: chrono::Utc::now(),
            provider_app_id: app.id.clone(),
            username: username.to_owned(),
            app_name: app.name.clone(),
            app_logo: app.logo.clone(),
            host_mount_path: host_mount_path.clone(),
            launch_context: launch_context.clone(),
            custom_user: custom_user.to_owned(),
            password: password.to_owned(),
            is_collaboration: false,
            master_token: None,
            controller_token: None,
            participant_invite_token: None,
            readonly_invite_token: None,
            viewers: Vec::new(),
            controller_slot: None,
            mk_owner_token: None,
            designated_speaker: None,
            container_registry: BTreeMap::new(),
        };
        if request.room_mode {
            session.is_collaboration = true;
            session.master_token = Some(urlsafe_token(32));
            session.controller_token = Some(urlsafe_token(16));
            session.participant_invite_token = Some(urlsafe_token(16));
            session.readonly_invite_token = Some(urlsafe_token(16));
        }
        self.store.insert(session).await?;

        tracing::info!(
            session = %session_id,
            username,
            app = %app.name,
            "session ready"
        );
        Ok(LaunchResponse {
            session_url: format!("/{session_id}/?access_token={access_token}"),
            session_id,
        })
    }

    async fn wait_until_ready(&self, ip: &str, port: u16, session_id: Uuid) -> Result<()> {
        let url = format!("http://{ip}:{port}/{session_id}/");
        let deadline = tokio::time::Instant::now() + self.readiness.deadline;

        loop {
            let attempt = self
                .http
                .get(&url)
                .timeout(self.readiness.attempt_timeout)
                .send()
                .await;
            match attempt {
                Ok(response) if response.status() == reqwest::StatusCode::OK => {
                    tracing::info!(session = %session_id, url, "health check passed");
                    return Ok(());
                }
                Ok(response) => {
                    tracing::debug!(session = %session_id, status = %response.status(), "health check pending");
                }
                Err(e) => {
                    tracing::debug!(session = %session_id, error = %e, "health check pending");
                }
            }
            if tokio::time::Instant::now() + self.readiness.poll_interval > deadline {
                tracing::error!(session = %session_id, "container failed to become ready in time");
                return Err(Error::GatewayTimeout(
                    "Container failed to become ready in time.".to_owned(),
                ));
            }
            tokio::time::sleep(self.readiness.poll_interval).await;
        }
    }

    /// Stop a session: remove it from the store, stop its containers, and
    /// release ephemeral storage.
    ///
    /// # Errors
    /// `NotFound` when the session does not exist.
    pub async fn stop(&self, session_id: Uuid) -> Result<()> {
        tracing::info!(session = %session_id, "stopping session");
        let Some(session) = self.store.remove(session_id).await? else {
            tracing::warn!(session = %session_id, "attempted to stop unknown session");
            return Err(Error::not_found("Session not found."));
        };

        if self.catalog.get(&session.provider_app_id).await.is_some() {
            if let Err(e) = self.runtime.stop(&session.instance_id).await {
                tracing::error!(session = %session_id, error = %e, "error stopping container");
            }
        }
        for endpoint in session.container_registry.values() {
            if let Err(e) = self.runtime.stop(&endpoint.instance_id).await {
                tracing::error!(session = %session_id, error = %e, "error stopping registry container");
            }
        }

        if let Some(mount) = &session.host_mount_path {
            self.storage.remove_ephemeral(mount);
        }
        tracing::info!(session = %session_id, "session stopped and cleaned up");
        Ok(())
    }
}

fn write_autostart(mount: &Path, content: &[u8]) -> Result<()> {
    let dir = mount.join(".config").join("openbox");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("autostart");
    std::fs::write(&path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Detect render nodes and their drivers from `/sys/class/drm`.
///
/// Nvidia devices are numbered in discovery order; everything else is
/// exposed as a DRI3 passthrough device. Detection failures yield an empty
/// list rather than an error.
#[must_use]
pub fn detect_gpus() -> Vec<AvailableGpu> {
    let Ok(entries) = std::fs::read_dir("/sys/class/drm") else {
        tracing::info!("GPU detection unavailable, no render nodes found");
        return Vec::new();
    };

    let mut nodes: Vec<String> = entries
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("renderD"))
        .collect();
    nodes.sort_by_key(|n| {
        n.trim_start_matches("renderD")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut gpus = Vec::new();
    let mut nvidia_index = 0u32;
    for node in nodes {
        let driver_link = PathBuf::from("/sys/class/drm")
            .join(&node)
            .join("device")
            .join("driver");
        let Ok(target) = std::fs::read_link(&driver_link) else {
            continue;
        };
        let Some(driver) = target.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let device = format!("/dev/dri/{node}");
        let gpu = if driver == "nvidia" {
            let gpu = Gpu::Nvidia {
                index: nvidia_index,
            };
            nvidia_index += 1;
            gpu
        } else {
            Gpu::Dri3 {
                device: device.clone(),
            }
        };
        gpus.push(AvailableGpu {
            device,
            driver,
            gpu,
        });
    }
    tracing::info!(count = gpus.len(), "detected GPUs");
    gpus
}

/// Viewer factory used when invite tokens are redeemed.
#[must_use]
pub fn new_viewer(permission: crate::core::ViewerPermission) -> Viewer {
    use rand::Rng;
    let n: u16 = rand::thread_rng().gen_range(100..1000);
    Viewer {
        token: urlsafe_token(16),
        slot: None,
        username: format!("User-{n}"),
        permission,
    }
}
