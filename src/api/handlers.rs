//! Control-plane endpoint handlers.
//!
//! Bodies of authenticated endpoints arrive as encrypted envelopes (see
//! `envelope`); responses are sealed by the router-level layer.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::ApiState;
use super::envelope::open_request;
use crate::apps::{AppStore, AppTemplate, InstalledApp};
use crate::core::{Error, LaunchContext, Result, Session};
use crate::directory::{User, UserSettings, UserSettingsPatch};
use crate::identity::{require_persistent_storage, require_public_sharing};
use crate::launch::{LaunchFile, LaunchRequest, LaunchResponse};

// ---------------------------------------------------------------------------
// Wire types

#[derive(Debug, Deserialize)]
pub struct HandshakeExchangeRequest {
    encrypted_session_key: String,
}

#[derive(Debug, Serialize)]
pub struct ApplicationSummary {
    id: String,
    name: String,
    logo: String,
    home_directories: bool,
    nvidia_support: bool,
    dri3_support: bool,
    url_support: bool,
    extensions: Vec<String>,
}

impl From<&InstalledApp> for ApplicationSummary {
    fn from(app: &InstalledApp) -> Self {
        Self {
            id: app.id.clone(),
            name: app.name.clone(),
            logo: app.logo.clone(),
            home_directories: app.home_directories,
            nvidia_support: app.provider_config.nvidia_support,
            dri3_support: app.provider_config.dri3_support,
            url_support: app.provider_config.url_support,
            extensions: app.provider_config.extensions.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LaunchRequestSimple {
    application_id: String,
    #[serde(default)]
    home_name: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    selected_gpu: Option<String>,
    #[serde(default)]
    launch_in_room_mode: bool,
}

#[derive(Debug, Deserialize)]
pub struct LaunchRequestUrl {
    url: String,
    application_id: String,
    #[serde(default)]
    home_name: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    selected_gpu: Option<String>,
    #[serde(default)]
    launch_in_room_mode: bool,
}

#[derive(Debug, Deserialize)]
pub struct LaunchRequestFile {
    application_id: String,
    filename: String,
    upload_id: Uuid,
    total_chunks: u32,
    #[serde(default = "default_true")]
    open_file_on_launch: bool,
    #[serde(default)]
    home_name: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    selected_gpu: Option<String>,
    #[serde(default)]
    launch_in_room_mode: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ActiveSessionInfo {
    session_id: Uuid,
    app_id: String,
    app_name: String,
    app_logo: String,
    created_at: f64,
    session_url: String,
    launch_context: Option<LaunchContext>,
    is_collaboration: bool,
}

impl From<&Session> for ActiveSessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id,
            app_id: session.provider_app_id.clone(),
            app_name: session.app_name.clone(),
            app_logo: session.app_logo.clone(),
            created_at: session.created_at.timestamp_millis() as f64 / 1000.0,
            session_url: session.session_url(),
            launch_context: session.launch_context.clone(),
            is_collaboration: session.is_collaboration,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendFileToSessionRequest {
    filename: String,
    upload_id: Uuid,
    total_chunks: u32,
}

#[derive(Debug, Deserialize)]
pub struct HomeDirectoryCreate {
    home_name: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadInitiateRequest {
    filename: String,
    total_size: u64,
}

#[derive(Debug, Deserialize)]
pub struct UploadChunkRequest {
    upload_id: Uuid,
    chunk_index: u32,
    chunk_data_b64: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadToStorageRequest {
    filename: String,
    upload_id: Uuid,
    total_chunks: u32,
    home_name: String,
}

#[derive(Debug, Deserialize)]
pub struct FilesListRequest {
    home_dir: String,
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderRequest {
    home_dir: String,
    #[serde(default)]
    path: String,
    folder_name: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteItemsRequest {
    home_dir: String,
    paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ShareFileRequest {
    home_dir: String,
    path: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    expiry_hours: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct GpuInfo {
    device: String,
    driver: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAdminRequest {
    username: String,
    #[serde(default)]
    public_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    username: String,
    #[serde(default)]
    public_key: Option<String>,
    settings: UserSettings,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    settings: UserSettings,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    name: String,
    settings: UserSettingsPatch,
}

#[derive(Debug, Deserialize)]
pub struct UpdateGroupRequest {
    settings: UserSettingsPatch,
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    user: User,
    private_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AvailableAppsQuery {
    url: String,
}

// ---------------------------------------------------------------------------
// Handshake

pub async fn handshake_initiate(State(state): State<ApiState>) -> Result<Json<Value>> {
    let initiate = state.broker.crypto.handshake_initiate()?;
    Ok(Json(json!({
        "nonce": initiate.nonce,
        "signature": initiate.signature,
    })))
}

pub async fn handshake_exchange(
    State(state): State<ApiState>,
    Json(request): Json<HandshakeExchangeRequest>,
) -> Result<Json<Value>> {
    let session_id = state
        .broker
        .crypto
        .handshake_exchange(&request.encrypted_session_key)?;
    Ok(Json(json!({ "session_id": session_id })))
}

// ---------------------------------------------------------------------------
// Applications and launches

pub async fn get_applications(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ApplicationSummary>>> {
    let user = state.user(&headers).await?;
    let apps = state
        .broker
        .catalog
        .visible_to(&user.username, user.group())
        .await;
    Ok(Json(apps.iter().map(ApplicationSummary::from).collect()))
}

pub async fn launch_simple(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LaunchResponse>> {
    let user = state.user(&headers).await?;
    let req: LaunchRequestSimple = open_request(&state, &headers, &body)?;
    let response = state
        .broker
        .engine
        .launch(
            &user.username,
            &user.settings,
            LaunchRequest {
                application_id: req.application_id,
                home_name: req.home_name,
                extra_env: BTreeMap::new(),
                language: req.language,
                selected_gpu: req.selected_gpu,
                file: None,
                room_mode: req.launch_in_room_mode,
            },
        )
        .await?;
    Ok(Json(response))
}

pub async fn launch_url(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LaunchResponse>> {
    let user = state.user(&headers).await?;
    let req: LaunchRequestUrl = open_request(&state, &headers, &body)?;
    let mut extra_env = BTreeMap::new();
    extra_env.insert(crate::apps::env::URL_VAR.to_owned(), req.url);
    let response = state
        .broker
        .engine
        .launch(
            &user.username,
            &user.settings,
            LaunchRequest {
                application_id: req.application_id,
                home_name: req.home_name,
                extra_env,
                language: req.language,
                selected_gpu: req.selected_gpu,
                file: None,
                room_mode: req.launch_in_room_mode,
            },
        )
        .await?;
    Ok(Json(response))
}

pub async fn launch_file(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LaunchResponse>> {
    let user = state.user(&headers).await?;
    let req: LaunchRequestFile = open_request(&state, &headers, &body)?;

    let uploads = state.broker.uploads.clone();
    let upload_id = req.upload_id;
    let total_chunks = req.total_chunks;
    let temp_path = tokio::task::spawn_blocking(move || uploads.reassemble(upload_id, total_chunks))
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("reassembly task failed: {e}")))??;

    let bytes = std::fs::read(&temp_path);
    let _ = std::fs::remove_file(&temp_path);
    let bytes = bytes?;

    let filename = std::path::Path::new(&req.filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::bad_request("Invalid filename."))?;

    let response = state
        .broker
        .engine
        .launch(
            &user.username,
            &user.settings,
            LaunchRequest {
                application_id: req.application_id,
                home_name: req.home_name,
                extra_env: BTreeMap::new(),
                language: req.language,
                selected_gpu: req.selected_gpu,
                file: Some(LaunchFile {
                    bytes,
                    filename,
                    open_on_launch: req.open_file_on_launch,
                }),
                room_mode: req.launch_in_room_mode,
            },
        )
        .await?;
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Sessions

pub async fn get_my_sessions(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ActiveSessionInfo>>> {
    let user = state.user(&headers).await?;
    let sessions = state.broker.store.list_for_user(&user.username).await;
    Ok(Json(sessions.iter().map(ActiveSessionInfo::from).collect()))
}

pub async fn stop_my_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let user = state.user(&headers).await?;
    let owned = state
        .broker
        .store
        .get(session_id)
        .await
        .is_some_and(|s| s.username == user.username);
    if !owned {
        return Err(Error::not_found("Session not found or permission denied."));
    }
    state.broker.engine.stop(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn send_file_to_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let user = state.user(&headers).await?;
    let req: SendFileToSessionRequest = open_request(&state, &headers, &body)?;

    let session = state
        .broker
        .store
        .get(session_id)
        .await
        .filter(|s| s.username == user.username)
        .ok_or_else(|| Error::not_found("Session not found or permission denied."))?;
    let mount = session.host_mount_path.clone().ok_or_else(|| {
        Error::bad_request("Cannot send files to this session as it has no mounted storage.")
    })?;

    let uploads = state.broker.uploads.clone();
    let (upload_id, total_chunks) = (req.upload_id, req.total_chunks);
    let temp_path =
        tokio::task::spawn_blocking(move || uploads.reassemble(upload_id, total_chunks))
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("reassembly task failed: {e}")))??;

    // Persistent sessions see Desktop/files through the shared sidecar.
    let dest_dir = if state.broker.storage.is_ephemeral(&mount) {
        mount.join("Desktop").join("files")
    } else {
        state.broker.storage.ensure_shared_files(&user.username)?
    };
    let stored =
        state
            .broker
            .storage
            .move_file_into(&temp_path, &dest_dir, &req.filename)?;

    tracing::info!(
        session = %session_id,
        username = %user.username,
        file = %stored,
        "wrote file to session via chunked upload"
    );
    let original = std::path::Path::new(&req.filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or(req.filename.clone());
    Ok(Json(json!({
        "status": "success",
        "message": format!("File '{original}' written to session."),
    })))
}

// ---------------------------------------------------------------------------
// Home directories (self-service)

pub async fn list_my_home_dirs(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user = state.user(&headers).await?;
    require_persistent_storage(&user)?;
    Ok(Json(
        json!({ "home_dirs": state.broker.storage.home_dirs(&user.username) }),
    ))
}

pub async fn create_my_home_dir(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    let user = state.user(&headers).await?;
    require_persistent_storage(&user)?;
    let req: HomeDirectoryCreate = open_request(&state, &headers, &body)?;
    state.broker.storage.create_home(&user.username, &req.home_name)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "home_name": req.home_name })),
    ))
}

pub async fn delete_my_home_dir(
    State(state): State<ApiState>,
    Path(home_name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let user = state.user(&headers).await?;
    require_persistent_storage(&user)?;
    state.broker.storage.delete_home(&user.username, &home_name)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Chunked uploads

pub async fn upload_initiate(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    state.user(&headers).await?;
    let req: UploadInitiateRequest = open_request(&state, &headers, &body)?;
    let upload_id = state.broker.uploads.initiate(&req.filename, req.total_size)?;
    Ok(Json(json!({ "upload_id": upload_id })))
}

pub async fn upload_chunk(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    state.user(&headers).await?;
    let req: UploadChunkRequest = open_request(&state, &headers, &body)?;
    state
        .broker
        .uploads
        .store_chunk(req.upload_id, req.chunk_index, &req.chunk_data_b64)?;
    Ok(Json(json!({ "status": "ok", "chunk_index": req.chunk_index })))
}

pub async fn upload_to_storage(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let user = state.user(&headers).await?;
    require_persistent_storage(&user)?;
    let req: UploadToStorageRequest = open_request(&state, &headers, &body)?;

    if !state
        .broker
        .storage
        .home_dirs(&user.username)
        .iter()
        .any(|h| h == &req.home_name)
    {
        return Err(Error::not_found(format!(
            "Home directory '{}' not found for user.",
            req.home_name
        )));
    }

    let uploads = state.broker.uploads.clone();
    let (upload_id, total_chunks) = (req.upload_id, req.total_chunks);
    let temp_path =
        tokio::task::spawn_blocking(move || uploads.reassemble(upload_id, total_chunks))
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("reassembly task failed: {e}")))??;

    let dest_dir = state
        .broker
        .storage
        .home_path(&user.username, &req.home_name)
        .join("Desktop")
        .join("files");
    let stored = state
        .broker
        .storage
        .move_file_into(&temp_path, &dest_dir, &req.filename)?;

    tracing::info!(
        username = %user.username,
        home = %req.home_name,
        file = %stored,
        "uploaded file to home directory"
    );
    Ok(Json(json!({
        "status": "success",
        "message": format!("File '{stored}' uploaded successfully to '{}'.", req.home_name),
    })))
}

// ---------------------------------------------------------------------------
// File browser

pub async fn list_files(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let user = state.user(&headers).await?;
    require_persistent_storage(&user)?;
    let req: FilesListRequest = open_request(&state, &headers, &body)?;
    let items = state
        .broker
        .storage
        .list_dir(&user.username, &req.home_dir, &req.path)?;
    Ok(Json(json!({ "items": items, "path": req.path })))
}

pub async fn create_folder(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    let user = state.user(&headers).await?;
    require_persistent_storage(&user)?;
    let req: CreateFolderRequest = open_request(&state, &headers, &body)?;
    state
        .broker
        .storage
        .create_folder(&user.username, &req.home_dir, &req.path, &req.folder_name)?;
    Ok((StatusCode::CREATED, Json(json!({ "status": "success" }))))
}

pub async fn delete_files(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let user = state.user(&headers).await?;
    require_persistent_storage(&user)?;
    let req: DeleteItemsRequest = open_request(&state, &headers, &body)?;
    state
        .broker
        .storage
        .delete_items(&user.username, &req.home_dir, &req.paths)?;
    Ok(Json(json!({ "status": "success" })))
}

// ---------------------------------------------------------------------------
// Public shares (authenticated management side)

pub async fn create_share(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<crate::shares::ShareInfo>)> {
    let user = state.user(&headers).await?;
    require_public_sharing(&user)?;
    let req: ShareFileRequest = open_request(&state, &headers, &body)?;

    let source = state
        .broker
        .storage
        .validated_path(&user.username, &req.home_dir, &req.path, true)?;
    if !source.is_file() {
        return Err(Error::bad_request("Only files can be shared."));
    }
    let filename = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::bad_request("Invalid file path."))?;

    let info = state
        .broker
        .shares
        .create(
            &user.username,
            &source,
            &filename,
            req.password.as_deref(),
            req.expiry_hours,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn list_my_shares(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::shares::ShareInfo>>> {
    let user = state.user(&headers).await?;
    require_public_sharing(&user)?;
    Ok(Json(state.broker.shares.list_for_owner(&user.username).await))
}

pub async fn delete_share(
    State(state): State<ApiState>,
    Path(share_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let user = state.user(&headers).await?;
    let owner = if user.is_admin {
        None
    } else {
        Some(user.username.as_str())
    };
    state.broker.shares.delete(share_id, owner).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Status and admin data

fn cpu_model() -> Option<String> {
    let content = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    content
        .lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, model)| model.trim().to_owned())
}

pub async fn admin_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user = state.user(&headers).await?;
    let gpus: Vec<GpuInfo> = if user.settings.gpu {
        state
            .broker
            .gpus
            .iter()
            .map(|g| GpuInfo {
                device: g.device.clone(),
                driver: g.driver.clone(),
            })
            .collect()
    } else {
        Vec::new()
    };
    Ok(Json(json!({
        "is_admin": user.is_admin,
        "username": user.username,
        "settings": user.settings,
        "gpus": gpus,
        "cpu_model": cpu_model(),
    })))
}

pub async fn get_management_data(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    state.admin(&headers).await?;
    let broker = &state.broker;
    let gpus: Vec<GpuInfo> = broker
        .gpus
        .iter()
        .map(|g| GpuInfo {
            device: g.device.clone(),
            driver: g.driver.clone(),
        })
        .collect();
    Ok(Json(json!({
        "admins": broker.directory.all_admins().await,
        "users": broker.directory.all_users().await,
        "groups": broker.directory.all_groups().await,
        "server_public_key": broker.crypto.public_key_pem(),
        "api_port": broker.translator.api_port(broker.settings.api_port),
        "session_port": broker.translator.session_port(broker.settings.session_port),
        "gpus": gpus,
    })))
}

// ---------------------------------------------------------------------------
// App stores

pub async fn get_app_stores(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<AppStore>>> {
    state.admin(&headers).await?;
    Ok(Json(state.broker.catalog.stores().await))
}

pub async fn add_app_store(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AppStore>)> {
    state.admin(&headers).await?;
    let store: AppStore = open_request(&state, &headers, &body)?;
    let store = state.broker.catalog.add_store(store).await?;
    Ok((StatusCode::CREATED, Json(store)))
}

pub async fn delete_app_store(
    State(state): State<ApiState>,
    Path(store_name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    state.admin(&headers).await?;
    state.broker.catalog.remove_store(&store_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_available_apps(
    State(state): State<ApiState>,
    Query(query): Query<AvailableAppsQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    state.admin(&headers).await?;

    let response = reqwest::Client::new()
        .get(&query.url)
        .timeout(std::time::Duration::from_secs(15))
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| {
            Error::bad_request(format!(
                "Failed to fetch app store from URL '{}': {e}",
                query.url
            ))
        })?;
    let text = response.text().await.map_err(|e| {
        Error::bad_request(format!("Failed to read app store response: {e}"))
    })?;

    let data: Value = serde_yaml::from_str(&text)
        .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to parse app store YAML: {e}")))?;
    let mut apps = match data {
        Value::Object(ref obj) if obj.contains_key("apps") => obj["apps"].clone(),
        Value::Array(_) => data,
        _ => {
            return Err(Error::Internal(anyhow::anyhow!(
                "App store YAML has an invalid format."
            )));
        }
    };

    // Stores may nest extension lists; flatten one level.
    if let Some(list) = apps.as_array_mut() {
        for app in list {
            let Some(extensions) = app
                .get_mut("provider_config")
                .and_then(|c| c.get_mut("extensions"))
                .and_then(Value::as_array_mut)
            else {
                continue;
            };
            let flattened: Vec<Value> = extensions
                .iter()
                .flat_map(|item| match item {
                    Value::Array(inner) => inner.clone(),
                    other => vec![other.clone()],
                })
                .collect();
            *extensions = flattened;
        }
    }

    Ok(Json(apps))
}

// ---------------------------------------------------------------------------
// Installed apps

pub async fn list_installed_apps(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>> {
    state.admin(&headers).await?;
    let mut apps = state.broker.catalog.all().await;
    apps.sort_by_key(|a| a.name.to_lowercase());

    let mut result = Vec::with_capacity(apps.len());
    for app in apps {
        let image = &app.provider_config.image;
        let entry = state.broker.images.entry(image).await;
        let mut value = serde_json::to_value(&app)
            .map_err(|e| Error::Internal(anyhow::anyhow!("app encode failed: {e}")))?;
        value["image_sha"] = json!(entry.as_ref().and_then(|e| e.short_id.clone()));
        value["last_checked_at"] = json!(
            entry
                .as_ref()
                .and_then(|e| e.last_checked_at)
                .map(|t| t.timestamp_millis() as f64 / 1000.0)
        );
        value["pull_status"] = json!(state.broker.images.pull_status(image));
        result.push(value);
    }
    Ok(Json(result))
}

pub async fn install_app(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<InstalledApp>)> {
    state.admin(&headers).await?;
    let app: InstalledApp = open_request(&state, &headers, &body)?;
    let app = state.broker.catalog.install(app).await?;

    let broker = state.broker.clone();
    let image = app.provider_config.image.clone();
    tokio::spawn(async move {
        if let Err(e) = broker.pull_and_cache(&image).await {
            tracing::error!(image, error = %e, "background pull after install failed");
        }
    });
    Ok((StatusCode::CREATED, Json(app)))
}

pub async fn update_installed_app(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<InstalledApp>> {
    state.admin(&headers).await?;
    let app: InstalledApp = open_request(&state, &headers, &body)?;
    let old_image = state.broker.catalog.update(&app_id, app.clone()).await?;

    if old_image != app.provider_config.image {
        let broker = state.broker.clone();
        let image = app.provider_config.image.clone();
        tokio::spawn(async move {
            if let Err(e) = broker.pull_and_cache(&image).await {
                tracing::error!(image, error = %e, "background pull after update failed");
            }
        });
    }
    Ok(Json(app))
}

pub async fn delete_installed_app(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    state.admin(&headers).await?;
    let app = state.broker.catalog.remove(&app_id).await?;
    state.broker.autostart.evict(&app.source, &app.source_app_id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn check_app_update(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    state.admin(&headers).await?;
    let app = state
        .broker
        .catalog
        .get(&app_id)
        .await
        .ok_or_else(|| Error::not_found("Installed app not found."))?;
    let (current_sha, update_available) = state
        .broker
        .images
        .update_available(&app.provider_config.image)
        .await?;
    Ok(Json(json!({
        "current_sha": current_sha,
        "update_available": update_available,
    })))
}

pub async fn pull_latest_app_image(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    state.admin(&headers).await?;
    let app = state
        .broker
        .catalog
        .get(&app_id)
        .await
        .ok_or_else(|| Error::not_found("Installed app not found."))?;
    let image = app.provider_config.image.clone();
    state.broker.pull_and_cache(&image).await?;
    let new_sha = state
        .broker
        .images
        .entry(&image)
        .await
        .and_then(|e| e.short_id);
    Ok(Json(json!({ "status": "success", "new_sha": new_sha })))
}

// ---------------------------------------------------------------------------
// Templates

pub async fn get_app_templates(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<AppTemplate>>> {
    state.admin(&headers).await?;
    Ok(Json(state.broker.catalog.templates().await))
}

pub async fn save_app_template(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AppTemplate>)> {
    state.admin(&headers).await?;
    let template: AppTemplate = open_request(&state, &headers, &body)?;
    let template = state.broker.catalog.save_template(template).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn delete_app_template(
    State(state): State<ApiState>,
    Path(template_name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    state.admin(&headers).await?;
    state.broker.catalog.delete_template(&template_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Admin session management

pub async fn get_all_sessions(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>> {
    state.admin(&headers).await?;
    let sessions = state.broker.store.list().await;

    let mut by_user: BTreeMap<String, Vec<ActiveSessionInfo>> = BTreeMap::new();
    for session in &sessions {
        by_user
            .entry(session.username.clone())
            .or_default()
            .push(ActiveSessionInfo::from(session));
    }
    let result = by_user
        .into_iter()
        .map(|(username, mut sessions)| {
            sessions.sort_by(|a, b| {
                b.created_at
                    .partial_cmp(&a.created_at)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            json!({ "username": username, "sessions": sessions })
        })
        .collect();
    Ok(Json(result))
}

pub async fn stop_any_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    state.admin(&headers).await?;
    state.broker.engine.stop(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// User and admin management

pub async fn create_admin(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateUserResponse>)> {
    state.admin(&headers).await?;
    let req: CreateAdminRequest = open_request(&state, &headers, &body)?;
    let (user, private_key) = state
        .broker
        .directory
        .create_admin(&req.username, req.public_key)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse { user, private_key }),
    ))
}

pub async fn delete_admin(
    State(state): State<ApiState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    state.admin(&headers).await?;
    state.broker.directory.delete_admin(&username).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateUserResponse>)> {
    state.admin(&headers).await?;
    let req: CreateUserRequest = open_request(&state, &headers, &body)?;
    let (user, private_key) = state
        .broker
        .directory
        .create_user(&req.username, req.public_key, req.settings)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse { user, private_key }),
    ))
}

pub async fn update_user(
    State(state): State<ApiState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<User>> {
    state.admin(&headers).await?;
    let req: UpdateUserRequest = open_request(&state, &headers, &body)?;
    state
        .broker
        .directory
        .update_user_settings(&username, req.settings)
        .await?;
    let user = state
        .broker
        .directory
        .get_user(&username)
        .await
        .ok_or_else(|| Error::not_found(format!("User '{username}' not found.")))?;
    Ok(Json(user))
}

pub async fn delete_user(
    State(state): State<ApiState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    state.admin(&headers).await?;
    state.broker.directory.delete_user(&username).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn require_target_user(
    state: &ApiState,
    username: &str,
    want_admin: bool,
) -> Result<()> {
    let user = state
        .broker
        .directory
        .get_user(username)
        .await
        .ok_or_else(|| Error::not_found(format!("User '{username}' not found.")))?;
    if want_admin != user.is_admin {
        return Err(Error::not_found(format!(
            "{} '{username}' not found.",
            if want_admin { "Admin" } else { "User" }
        )));
    }
    if !user.is_admin {
        let settings = state.broker.directory.effective_settings(username).await;
        if !settings.persistent_storage {
            return Err(Error::forbidden(
                "Persistent storage is disabled for this user.",
            ));
        }
    }
    Ok(())
}

pub async fn list_user_home_dirs(
    State(state): State<ApiState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    state.admin(&headers).await?;
    require_target_user(&state, &username, false).await?;
    Ok(Json(
        json!({ "home_dirs": state.broker.storage.home_dirs(&username) }),
    ))
}

pub async fn create_user_home_dir(
    State(state): State<ApiState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    state.admin(&headers).await?;
    require_target_user(&state, &username, false).await?;
    let req: HomeDirectoryCreate = open_request(&state, &headers, &body)?;
    state.broker.storage.create_home(&username, &req.home_name)?;
    Ok((StatusCode::CREATED, Json(json!({ "status": "success" }))))
}

pub async fn delete_user_home_dir(
    State(state): State<ApiState>,
    Path((username, home_name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    state.admin(&headers).await?;
    require_target_user(&state, &username, false).await?;
    state.broker.storage.delete_home(&username, &home_name)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_admin_home_dirs(
    State(state): State<ApiState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    state.admin(&headers).await?;
    require_target_user(&state, &username, true).await?;
    Ok(Json(
        json!({ "home_dirs": state.broker.storage.home_dirs(&username) }),
    ))
}

pub async fn create_admin_home_dir(
    State(state): State<ApiState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    state.admin(&headers).await?;
    require_target_user(&state, &username, true).await?;
    let req: HomeDirectoryCreate = open_request(&state, &headers, &body)?;
    state.broker.storage.create_home(&username, &req.home_name)?;
    Ok((StatusCode::CREATED, Json(json!({ "status": "success" }))))
}

pub async fn delete_admin_home_dir(
    State(state): State<ApiState>,
    Path((username, home_name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    state.admin(&headers).await?;
    require_target_user(&state, &username, true).await?;
    state.broker.storage.delete_home(&username, &home_name)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Groups

pub async fn create_group(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    state.admin(&headers).await?;
    let req: CreateGroupRequest = open_request(&state, &headers, &body)?;
    if state.broker.directory.group_exists(&req.name).await {
        return Err(Error::conflict(format!(
            "Group '{}' already exists.",
            req.name
        )));
    }
    state.broker.directory.write_group(&req.name, &req.settings).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "name": req.name, "settings": req.settings })),
    ))
}

pub async fn update_group(
    State(state): State<ApiState>,
    Path(group_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    state.admin(&headers).await?;
    let req: UpdateGroupRequest = open_request(&state, &headers, &body)?;
    if !state.broker.directory.group_exists(&group_name).await {
        return Err(Error::not_found(format!("Group '{group_name}' not found.")));
    }
    state
        .broker
        .directory
        .write_group(&group_name, &req.settings)
        .await?;
    Ok(Json(json!({ "name": group_name, "settings": req.settings })))
}

pub async fn delete_group(
    State(state): State<ApiState>,
    Path(group_name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    state.admin(&headers).await?;
    state.broker.directory.delete_group(&group_name).await?;
    Ok(StatusCode::NO_CONTENT)
}
