use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// What the session was launched to open, if anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum LaunchContext {
    /// The session opened a URL (`SEALSKIN_URL`).
    Url(String),

    /// The session opened an uploaded file; the value is the original filename.
    File(String),
}

/// A GPU selection passed to the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Gpu {
    /// Nvidia GPU addressed by runtime device index.
    Nvidia {
        /// Index among the host's Nvidia devices.
        index: u32,
    },

    /// Non-Nvidia render node passed through as a device.
    Dri3 {
        /// Device path, e.g. `/dev/dri/renderD128`.
        device: String,
    },
}

/// One GPU detected on (or configured for) the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableGpu {
    /// Render node path, e.g. `/dev/dri/renderD128`.
    pub device: String,
    /// Kernel driver name, e.g. `nvidia` or `i915`.
    pub driver: String,
    /// Runtime configuration for this device.
    pub gpu: Gpu,
}

/// Permission level of a collaboration viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerPermission {
    /// May send input and binary streams.
    Participant,
    /// May watch and chat only.
    ReadOnly,
}

impl std::fmt::Display for ViewerPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Participant => write!(f, "participant"),
            Self::ReadOnly => write!(f, "readonly"),
        }
    }
}

/// A secondary participant admitted to a collaboration room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Viewer {
    /// Per-viewer access token, also the identity key in room state.
    pub token: String,
    /// Gamepad slot currently held, if any.
    pub slot: Option<u32>,
    /// Display name, mutable by the viewer.
    pub username: String,
    /// Permission level assigned at join time.
    pub permission: ViewerPermission,
}

/// A downstream container reachable through one session.
///
/// A session normally routes to a single container, but app switching can
/// register additional ones; the token push addresses all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerEndpoint {
    /// Runtime handle of the container.
    pub instance_id: String,
    /// Container IP on the runtime network.
    pub ip: String,
    /// Application port inside the container.
    pub port: u16,
}

/// A live, proxied application session.
///
/// This is the durable record: the full session map is persisted to YAML
/// after every mutation and reconciled against the container runtime at
/// startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier, also the URL prefix the proxy routes on.
    pub session_id: Uuid,

    /// Bearer token for the session proxy (URL-safe, at least 256 bits).
    pub access_token: String,

    /// Container handle reported by the runtime.
    pub instance_id: String,

    /// Container IP on the runtime network.
    pub ip: String,

    /// Application port inside the container.
    pub port: u16,

    /// When the session was launched.
    pub created_at: DateTime<Utc>,

    /// Installed application this session runs.
    pub provider_app_id: String,

    /// Owner of the session.
    pub username: String,

    /// Display name of the application at launch time.
    pub app_name: String,

    /// Logo reference of the application at launch time.
    pub app_logo: String,

    /// Host directory mounted at the container config path, if any.
    /// Paths under the ephemeral root are deleted when the session stops.
    pub host_mount_path: Option<PathBuf>,

    /// What the session was launched to open.
    #[serde(default)]
    pub launch_context: Option<LaunchContext>,

    /// Per-session username for the container's built-in basic auth.
    pub custom_user: String,

    /// Per-session password for the container's built-in basic auth.
    pub password: String,

    /// Whether this session was launched in room mode.
    #[serde(default)]
    pub is_collaboration: bool,

    /// Bearer token used by the broker to push token state downstream.
    #[serde(default)]
    pub master_token: Option<String>,

    /// Token identifying the controller inside the room.
    #[serde(default)]
    pub controller_token: Option<String>,

    /// Invite token minting participant viewers.
    #[serde(default)]
    pub participant_invite_token: Option<String>,

    /// Invite token minting read-only viewers.
    #[serde(default)]
    pub readonly_invite_token: Option<String>,

    /// Admitted secondary participants.
    #[serde(default)]
    pub viewers: Vec<Viewer>,

    /// Gamepad slot held by the controller, if any.
    #[serde(default)]
    pub controller_slot: Option<u32>,

    /// Token owning mouse/keyboard input. `None` means the controller.
    #[serde(default)]
    pub mk_owner_token: Option<String>,

    /// Token whose audio frames are forwarded. `None` forwards everyone.
    #[serde(default)]
    pub designated_speaker: Option<String>,

    /// Additional downstream containers keyed by app id.
    #[serde(default)]
    pub container_registry: BTreeMap<String, ContainerEndpoint>,
}

impl Session {
    /// The proxied URL a browser uses to enter this session.
    #[must_use]
    pub fn session_url(&self) -> String {
        format!("/{}/?access_token={}", self.session_id, self.access_token)
    }

    /// Look up a viewer by token.
    #[must_use]
    pub fn viewer(&self, token: &str) -> Option<&Viewer> {
        self.viewers.iter().find(|v| v.token == token)
    }

    /// Look up a viewer by token, mutably.
    pub fn viewer_mut(&mut self, token: &str) -> Option<&mut Viewer> {
        self.viewers.iter_mut().find(|v| v.token == token)
    }

    /// All distinct container IPs this session routes to.
    #[must_use]
    pub fn downstream_ips(&self) -> Vec<String> {
        let mut ips = vec![self.ip.clone()];
        for endpoint in self.container_registry.values() {
            if !ips.contains(&endpoint.ip) {
                ips.push(endpoint.ip.clone());
            }
        }
        ips
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session {
            session_id: Uuid::new_v4(),
            access_token: "tok".to_owned(),
            instance_id: "abc123".to_owned(),
            ip: "172.17.0.2".to_owned(),
            port: 3000,
            created_at: Utc::now(),
            provider_app_id: "app-1".to_owned(),
            username: "alice".to_owned(),
            app_name: "Firefox".to_owned(),
            app_logo: "firefox.png".to_owned(),
            host_mount_path: None,
            launch_context: None,
            custom_user: "u".to_owned(),
            password: "p".to_owned(),
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

    #[test]
    fn session_url_carries_token() {
        let session = sample_session();
        let url = session.session_url();
        assert!(url.starts_with(&format!("/{}/", session.session_id)));
        assert!(url.ends_with("?access_token=tok"));
    }

    #[test]
    fn launch_context_serializes_tagged() {
        let ctx = LaunchContext::Url("https://example.com".to_owned());
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["type"], "url");
        assert_eq!(json["value"], "https://example.com");

        let ctx = LaunchContext::File("report.pdf".to_owned());
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["value"], "report.pdf");
    }

    #[test]
    fn minimal_yaml_loads_with_collab_defaults() {
        let session = sample_session();
        let yaml = serde_yaml::to_string(&session).unwrap();
        let restored: Session = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(restored.session_id, session.session_id);
        assert!(restored.viewers.is_empty());
        assert!(restored.mk_owner_token.is_none());
    }

    #[test]
    fn downstream_ips_deduplicate() {
        let mut session = sample_session();
        session.container_registry.insert(
            "app-2".to_owned(),
            ContainerEndpoint {
                instance_id: "def".to_owned(),
                ip: "172.17.0.2".to_owned(),
                port: 3001,
            },
        );
        session.container_registry.insert(
            "app-3".to_owned(),
            ContainerEndpoint {
                instance_id: "ghi".to_owned(),
                ip: "172.17.0.9".to_owned(),
                port: 3002,
            },
        );
        let ips = session.downstream_ips();
        assert_eq!(ips.len(), 2);
    }
}
