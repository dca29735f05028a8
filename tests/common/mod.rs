//! Shared test harness: a fully-wired broker over temp directories, a mock
//! container runtime, and a recording control plane.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use tempfile::TempDir;

use sealskin::apps::{EnvVar, InstalledApp, ProviderConfig};
use sealskin::broker::Broker;
use sealskin::collab::RecordingControlPlane;
use sealskin::config::Settings;
use sealskin::directory::UserSettings;
use sealskin::launch::ReadinessConfig;
use sealskin::runtime::{ContainerRuntime, MockRuntime};

/// A broker over temp storage plus handles to its doubles.
pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub runtime: Arc<MockRuntime>,
    pub control_plane: Arc<RecordingControlPlane>,
    pub settings: Settings,
    pub tmp: TempDir,
}

/// Settings rooted inside a temp directory.
pub fn test_settings(tmp: &TempDir) -> Settings {
    let root = tmp.path();
    let mut settings = Settings::from_env();
    settings.api_port = 8000;
    settings.session_port = 8443;
    settings.installed_apps_path = root.join("config/installed_apps.yml");
    settings.app_stores_path = root.join("config/app_stores.yml");
    settings.app_templates_path = root.join("config/app_templates");
    settings.upload_dir = root.join("storage/sealskin_uploads");
    settings.autostart_cache_path = root.join("config/autostart_cache");
    settings.keys_base_path = root.join("config/keys");
    settings.groups_base_path = root.join("config/groups");
    settings.storage_path = root.join("storage");
    settings.container_config_path = PathBuf::from("/config");
    settings.server_private_key_path = root.join("config/server_key.pem");
    settings.proxy_key_path = root.join("config/proxy_key.pem");
    settings.proxy_cert_path = root.join("config/proxy_cert.pem");
    settings.public_storage_path = root.join("storage/sealskin_public");
    settings.public_shares_metadata_path = root.join("config/public_shares.yml");
    settings.sessions_db_path = root.join("config/sessions.yml");
    settings
}

fn write_server_key(settings: &Settings) {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
    std::fs::create_dir_all(settings.server_private_key_path.parent().unwrap()).unwrap();
    std::fs::write(&settings.server_private_key_path, pem.as_bytes()).unwrap();
}

fn write_placeholder_admin(settings: &Settings) {
    // A pre-seeded admin key skips the slow default-admin bootstrap.
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    let pem = key.to_public_key().to_public_key_pem(LineEnding::LF).unwrap();
    let admins = settings.keys_base_path.join("admins");
    std::fs::create_dir_all(&admins).unwrap();
    std::fs::write(admins.join("admin"), pem).unwrap();
}

/// Bootstrap a broker over temp directories and test doubles.
pub async fn test_broker() -> TestBroker {
    let tmp = TempDir::new().unwrap();
    let settings = test_settings(&tmp);
    write_server_key(&settings);
    write_placeholder_admin(&settings);

    let runtime = Arc::new(MockRuntime::new());
    let control_plane = Arc::new(RecordingControlPlane::new());
    let broker = Broker::bootstrap(
        settings.clone(),
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        control_plane.clone(),
        Vec::new(),
    )
    .await
    .unwrap();

    TestBroker {
        broker,
        runtime,
        control_plane,
        settings,
        tmp,
    }
}

/// Readiness timings tuned for tests.
pub fn fast_readiness() -> ReadinessConfig {
    ReadinessConfig {
        attempt_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(50),
        deadline: Duration::from_millis(500),
    }
}

/// A user with a keypair able to mint its own tokens.
pub struct TestUser {
    pub username: String,
    private_pem: String,
}

impl TestUser {
    /// Sign an RS256 token with `sub = username`.
    pub fn token(&self) -> String {
        let key = EncodingKey::from_rsa_pem(self.private_pem.as_bytes()).unwrap();
        let claims = serde_json::json!({ "sub": self.username });
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).unwrap()
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token())
    }
}

/// Register a user in the broker's directory with the given settings.
pub async fn create_user(broker: &Arc<Broker>, username: &str, settings: UserSettings) -> TestUser {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    let private_pem = key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
    let public_pem = key.to_public_key().to_public_key_pem(LineEnding::LF).unwrap();
    broker
        .directory
        .create_user(username, Some(public_pem), settings)
        .await
        .unwrap();
    TestUser {
        username: username.to_owned(),
        private_pem,
    }
}

/// An installed app pointing at the given port (usually a stub upstream).
pub fn sample_app(id: &str, name: &str, port: u16) -> InstalledApp {
    InstalledApp {
        id: id.to_owned(),
        name: name.to_owned(),
        logo: "firefox.png".to_owned(),
        source: "SealSkin Apps".to_owned(),
        source_app_id: "firefox".to_owned(),
        provider: "docker".to_owned(),
        home_directories: true,
        users: vec!["all".to_owned()],
        groups: vec![],
        provider_config: ProviderConfig {
            image: "lscr.io/linuxserver/firefox:latest".to_owned(),
            port,
            nvidia_support: false,
            dri3_support: true,
            url_support: true,
            extensions: vec![".html".to_owned()],
            autostart: false,
            custom_autostart_script_b64: None,
            env: Vec::<EnvVar>::new(),
            shm_size: None,
        },
        auto_update: true,
        app_template: "Default".to_owned(),
    }
}

/// Spawn a stub application container: answers every request with `status`.
/// Returns its bound address.
pub async fn stub_upstream(status: u16) -> SocketAddr {
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::any;

    let code = StatusCode::from_u16(status).unwrap();
    let app = Router::new().fallback(any(move || async move { code }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

/// Launch-ready environment: stub upstream wired into an installed app.
pub async fn install_stub_app(env: &TestBroker, app_id: &str, ready: bool) -> u16 {
    let upstream = stub_upstream(if ready { 200 } else { 503 }).await;
    env.runtime.set_launch_ip("127.0.0.1").await;
    env.broker
        .catalog
        .install(sample_app(app_id, "Firefox", upstream.port()))
        .await
        .unwrap();
    upstream.port()
}

/// Extra env map helper.
pub fn env_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

/// A hand-built session record pointing at an upstream address.
pub fn make_session(username: &str, addr: SocketAddr, access_token: &str) -> sealskin::core::Session {
    sealskin::core::Session {
        session_id: uuid::Uuid::new_v4(),
        access_token: access_token.to_owned(),
        instance_id: "stub-container".to_owned(),
        ip: addr.ip().to_string(),
        port: addr.port(),
        created_at: chrono::Utc::now(),
        provider_app_id: "app-1".to_owned(),
        username: username.to_owned(),
        app_name: "Firefox".to_owned(),
        app_logo: "firefox.png".to_owned(),
        host_mount_path: None,
        launch_context: None,
        custom_user: "cu-user".to_owned(),
        password: "cu-pass".to_owned(),
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
    }
}

/// Serve a router on an ephemeral port, returning its base URL.
pub async fn serve_router(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}
