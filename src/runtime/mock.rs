//! In-memory [`ContainerRuntime`] double for tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::traits::{
    ContainerRuntime, LaunchSpec, LaunchedContainer, LocalImageInfo, SelfInspection,
};

/// Records every call and serves configurable canned answers.
pub struct MockRuntime {
    containers: RwLock<HashSet<String>>,
    launches: Mutex<Vec<LaunchSpec>>,
    stopped: Mutex<Vec<String>>,
    pulls: Mutex<Vec<String>>,
    pull_delay_ms: AtomicU64,
    launch_ip: RwLock<String>,
    local_images: RwLock<HashMap<String, LocalImageInfo>>,
    remote_digests: RwLock<HashMap<String, String>>,
    self_inspection: RwLock<Option<SelfInspection>>,
    fail_launch: AtomicBool,
    fail_exists: AtomicBool,
    next_instance: AtomicU64,
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRuntime").finish_non_exhaustive()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Fresh mock: launches succeed and return `127.0.0.1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashSet::new()),
            launches: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            pull_delay_ms: AtomicU64::new(0),
            launch_ip: RwLock::new("127.0.0.1".to_owned()),
            local_images: RwLock::new(HashMap::new()),
            remote_digests: RwLock::new(HashMap::new()),
            self_inspection: RwLock::new(None),
            fail_launch: AtomicBool::new(false),
            fail_exists: AtomicBool::new(false),
            next_instance: AtomicU64::new(1),
        }
    }

    /// Make every launch fail.
    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Make every existence probe error (not report missing).
    pub fn set_fail_exists(&self, fail: bool) {
        self.fail_exists.store(fail, Ordering::SeqCst);
    }

    /// IP reported for launched containers.
    pub async fn set_launch_ip(&self, ip: impl Into<String>) {
        *self.launch_ip.write().await = ip.into();
    }

    /// Delay applied inside every pull, to widen race windows in tests.
    pub fn set_pull_delay(&self, delay: Duration) {
        self.pull_delay_ms
            .store(delay.as_millis().try_into().unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Register a local image.
    pub async fn add_local_image(&self, image: &str, info: LocalImageInfo) {
        self.local_images.write().await.insert(image.to_owned(), info);
    }

    /// Set the digest the "registry" reports for an image.
    pub async fn set_remote_digest(&self, image: &str, digest: &str) {
        self.remote_digests
            .write()
            .await
            .insert(image.to_owned(), digest.to_owned());
    }

    /// Set what `inspect_self` returns.
    pub async fn set_self_inspection(&self, inspection: Option<SelfInspection>) {
        *self.self_inspection.write().await = inspection;
    }

    /// Register a container as existing without launching it.
    pub async fn add_container(&self, instance_id: impl Into<String>) {
        self.containers.write().await.insert(instance_id.into());
    }

    /// Every launch spec seen so far.
    pub async fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().await.clone()
    }

    /// Every instance id stopped so far.
    pub async fn stopped(&self) -> Vec<String> {
        self.stopped.lock().await.clone()
    }

    /// Every image pulled so far.
    pub async fn pulls(&self) -> Vec<String> {
        self.pulls.lock().await.clone()
    }

    /// Whether a container is currently registered.
    pub async fn has_container(&self, instance_id: &str) -> bool {
        self.containers.read().await.contains(instance_id)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull(&self, image: &str) -> anyhow::Result<()> {
        self.pulls.lock().await.push(image.to_owned());
        let delay = self.pull_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.local_images.write().await.insert(
            image.to_owned(),
            LocalImageInfo {
                short_id: format!("sha{:08x}", image.len()),
                digests: vec![format!("{image}@sha256:pulled")],
            },
        );
        Ok(())
    }

    async fn local_info(&self, image: &str) -> anyhow::Result<Option<LocalImageInfo>> {
        Ok(self.local_images.read().await.get(image).cloned())
    }

    async fn remote_digest(&self, image: &str) -> anyhow::Result<Option<String>> {
        Ok(self.remote_digests.read().await.get(image).cloned())
    }

    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<LaunchedContainer> {
        if self.fail_launch.load(Ordering::SeqCst) {
            anyhow::bail!("mock launch failure");
        }
        if self.local_info(&spec.image).await?.is_none() {
            self.pull(&spec.image).await?;
        }
        self.launches.lock().await.push(spec.clone());

        let n = self.next_instance.fetch_add(1, Ordering::SeqCst);
        let instance_id = format!("mock-container-{n}");
        self.containers.write().await.insert(instance_id.clone());
        Ok(LaunchedContainer {
            instance_id,
            ip: self.launch_ip.read().await.clone(),
        })
    }

    async fn stop(&self, instance_id: &str) -> anyhow::Result<()> {
        self.stopped.lock().await.push(instance_id.to_owned());
        self.containers.write().await.remove(instance_id);
        Ok(())
    }

    async fn exists(&self, instance_id: &str) -> anyhow::Result<bool> {
        if self.fail_exists.load(Ordering::SeqCst) {
            anyhow::bail!("mock runtime unreachable");
        }
        Ok(self.containers.read().await.contains(instance_id))
    }

    async fn inspect_self(&self) -> anyhow::Result<Option<SelfInspection>> {
        Ok(self.self_inspection.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(image: &str) -> LaunchSpec {
        LaunchSpec {
            image: image.to_owned(),
            env: BTreeMap::new(),
            mounts: vec![],
            gpu: None,
            shm_size: None,
        }
    }

    #[tokio::test]
    async fn launch_pulls_missing_images() {
        let runtime = MockRuntime::new();
        let launched = runtime.launch(&spec("img:latest")).await.unwrap();
        assert!(runtime.has_container(&launched.instance_id).await);
        assert_eq!(runtime.pulls().await, vec!["img:latest"]);

        // Second launch of the same image skips the pull
        runtime.launch(&spec("img:latest")).await.unwrap();
        assert_eq!(runtime.pulls().await.len(), 1);
    }

    #[tokio::test]
    async fn stop_removes_container() {
        let runtime = MockRuntime::new();
        let launched = runtime.launch(&spec("img")).await.unwrap();
        runtime.stop(&launched.instance_id).await.unwrap();
        assert!(!runtime.has_container(&launched.instance_id).await);
        assert!(!runtime.exists(&launched.instance_id).await.unwrap());
    }

    #[tokio::test]
    async fn failing_exists_is_an_error_not_missing() {
        let runtime = MockRuntime::new();
        runtime.add_container("c1").await;
        runtime.set_fail_exists(true);
        assert!(runtime.exists("c1").await.is_err());
    }
}
