//! Translation of broker-internal paths to host paths.
//!
//! When the broker itself runs in a container, the directories it writes
//! (homes, ephemeral mounts) live at container paths, but the runtime needs
//! host paths for bind mounts. At startup the broker inspects its own
//! container, records container-prefix to host-prefix pairs, and rewrites
//! paths by longest matching prefix. Outside a container everything passes
//! through unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::runtime::ContainerRuntime;

/// Prefix map plus host-published ports discovered from self-inspection.
#[derive(Debug, Clone, Default)]
pub struct PathTranslator {
    /// Container prefix to host prefix, longest container prefix first.
    prefixes: Vec<(String, String)>,
    /// Host-published port for the API listener, when containerised.
    api_host_port: Option<u16>,
    /// Host-published port for the session listener, when containerised.
    session_host_port: Option<u16>,
}

impl PathTranslator {
    /// A translator that passes every path through unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// Inspect the current container (if any) and build the prefix map.
    ///
    /// Inspection failures disable remapping rather than failing startup.
    pub async fn detect(
        runtime: &Arc<dyn ContainerRuntime>,
        api_port: u16,
        session_port: u16,
    ) -> Self {
        match runtime.inspect_self().await {
            Ok(Some(inspection)) => {
                let mut prefixes: Vec<(String, String)> = inspection
                    .mounts
                    .iter()
                    .map(|(container, host)| {
                        (
                            container.to_string_lossy().to_string(),
                            host.to_string_lossy().to_string(),
                        )
                    })
                    .collect();
                prefixes.sort_by_key(|(container, _)| std::cmp::Reverse(container.len()));
                if prefixes.is_empty() {
                    tracing::warn!("no usable mount points found on the current container");
                } else {
                    tracing::info!(?prefixes, "detected container mount prefixes");
                }
                Self {
                    prefixes,
                    api_host_port: inspection.port_bindings.get(&api_port).copied(),
                    session_host_port: inspection.port_bindings.get(&session_port).copied(),
                }
            }
            Ok(None) => Self::identity(),
            Err(e) => {
                tracing::warn!(error = %e, "could not inspect own container, path mapping disabled");
                Self::identity()
            }
        }
    }

    /// Build a translator from explicit prefix pairs (tests, fixed setups).
    #[must_use]
    pub fn with_prefixes(pairs: Vec<(String, String)>) -> Self {
        let mut prefixes = pairs;
        prefixes.sort_by_key(|(container, _)| std::cmp::Reverse(container.len()));
        Self {
            prefixes,
            api_host_port: None,
            session_host_port: None,
        }
    }

    /// Translate a broker-internal path to the host's view of it.
    ///
    /// Selects the longest container prefix `X` with `P == X` or `P`
    /// starting with `X + "/"`; unmatched paths pass through unchanged.
    #[must_use]
    pub fn translate(&self, path: &Path) -> PathBuf {
        let internal = path.to_string_lossy();
        if internal.is_empty() {
            return path.to_path_buf();
        }
        for (container_prefix, host_prefix) in &self.prefixes {
            if internal.as_ref() == container_prefix {
                return PathBuf::from(host_prefix);
            }
            if let Some(rest) = internal.strip_prefix(&format!("{container_prefix}/")) {
                let translated = PathBuf::from(host_prefix).join(rest);
                tracing::debug!(from = %internal, to = %translated.display(), "translated path");
                return translated;
            }
        }
        path.to_path_buf()
    }

    /// Host-published API port, falling back to the configured one.
    #[must_use]
    pub fn api_port(&self, configured: u16) -> u16 {
        self.api_host_port.unwrap_or(configured)
    }

    /// Host-published session port, falling back to the configured one.
    #[must_use]
    pub fn session_port(&self, configured: u16) -> u16 {
        self.session_host_port.unwrap_or(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, SelfInspection};

    fn translator() -> PathTranslator {
        PathTranslator::with_prefixes(vec![
            ("/storage".to_owned(), "/mnt/user/storage".to_owned()),
            ("/storage/deep".to_owned(), "/mnt/special".to_owned()),
            ("/config".to_owned(), "/mnt/user/appdata/sealskin".to_owned()),
        ])
    }

    #[test]
    fn exact_prefix_translates() {
        let t = translator();
        assert_eq!(
            t.translate(Path::new("/storage")),
            PathBuf::from("/mnt/user/storage")
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let t = translator();
        assert_eq!(
            t.translate(Path::new("/storage/deep/x")),
            PathBuf::from("/mnt/special/x")
        );
        assert_eq!(
            t.translate(Path::new("/storage/alice/work")),
            PathBuf::from("/mnt/user/storage/alice/work")
        );
    }

    #[test]
    fn partial_component_does_not_match() {
        let t = translator();
        // "/storages" shares a string prefix but not a path prefix
        assert_eq!(
            t.translate(Path::new("/storages/x")),
            PathBuf::from("/storages/x")
        );
    }

    #[test]
    fn unmatched_paths_pass_through() {
        let t = translator();
        assert_eq!(t.translate(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
    }

    #[tokio::test]
    async fn detect_outside_container_is_identity() {
        let runtime: Arc<dyn crate::runtime::ContainerRuntime> = Arc::new(MockRuntime::new());
        let t = PathTranslator::detect(&runtime, 8000, 8443).await;
        assert_eq!(t.translate(Path::new("/storage/x")), PathBuf::from("/storage/x"));
        assert_eq!(t.api_port(8000), 8000);
    }

    #[tokio::test]
    async fn detect_reads_mounts_and_ports() {
        let mock = Arc::new(MockRuntime::new());
        let mut inspection = SelfInspection::default();
        inspection
            .mounts
            .push((PathBuf::from("/storage"), PathBuf::from("/mnt/user/storage")));
        inspection.port_bindings.insert(8000, 18000);
        inspection.port_bindings.insert(8443, 18443);
        mock.set_self_inspection(Some(inspection)).await;

        let runtime: Arc<dyn crate::runtime::ContainerRuntime> = mock;
        let t = PathTranslator::detect(&runtime, 8000, 8443).await;
        assert_eq!(
            t.translate(Path::new("/storage/alice")),
            PathBuf::from("/mnt/user/storage/alice")
        );
        assert_eq!(t.api_port(8000), 18000);
        assert_eq!(t.session_port(8443), 18443);
    }
}
