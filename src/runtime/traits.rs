use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::core::Gpu;

/// One bind mount handed to the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host-side path (already translated to the host's view).
    pub host_path: PathBuf,
    /// Mount point inside the container.
    pub container_path: PathBuf,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl Mount {
    /// A read-write bind mount.
    #[must_use]
    pub fn rw(host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }
}

/// Everything needed to start one application container.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Image reference to run.
    pub image: String,
    /// Full environment, already composed.
    pub env: BTreeMap<String, String>,
    /// Bind mounts.
    pub mounts: Vec<Mount>,
    /// Optional GPU passthrough.
    pub gpu: Option<Gpu>,
    /// Shared-memory size, runtime default `1g` when unset.
    pub shm_size: Option<String>,
}

/// A started container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedContainer {
    /// Runtime handle used for stop/exists.
    pub instance_id: String,
    /// Container IP on the runtime network.
    pub ip: String,
}

/// Locally-available image metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImageInfo {
    /// Short content id of the image.
    pub short_id: String,
    /// Repo digests attached to the local image.
    pub digests: Vec<String>,
}

/// Mounts and published ports of the broker's own container.
#[derive(Debug, Clone, Default)]
pub struct SelfInspection {
    /// Container path to host path, one entry per bind mount.
    pub mounts: Vec<(PathBuf, PathBuf)>,
    /// Container port to host-published port.
    pub port_bindings: BTreeMap<u16, u16>,
}

/// Capability interface over the container runtime.
///
/// The broker talks to containers exclusively through this trait, which keeps
/// the runtime swappable and lets tests substitute an in-memory double.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image from its registry.
    async fn pull(&self, image: &str) -> anyhow::Result<()>;

    /// Inspect a locally-available image, `None` when absent.
    async fn local_info(&self, image: &str) -> anyhow::Result<Option<LocalImageInfo>>;

    /// Digest of the image currently served by the remote registry,
    /// `None` when the registry does not know the image.
    async fn remote_digest(&self, image: &str) -> anyhow::Result<Option<String>>;

    /// Start a container. The image MUST be pulled on demand when missing
    /// locally. Returns once the container has an IP.
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<LaunchedContainer>;

    /// Stop a container. Stopping an unknown container is not an error.
    async fn stop(&self, instance_id: &str) -> anyhow::Result<()>;

    /// Whether a container with this handle still exists.
    ///
    /// Errors mean "could not determine", not "missing"; callers that prune
    /// state must only act on a definite `false`.
    async fn exists(&self, instance_id: &str) -> anyhow::Result<bool>;

    /// Inspect the broker's own container, `None` when not containerised.
    async fn inspect_self(&self) -> anyhow::Result<Option<SelfInspection>>;
}
