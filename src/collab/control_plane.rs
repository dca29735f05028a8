//! Downstream token push.
//!
//! Containers expose a `/tokens` endpoint on port 8083 that receives the
//! authoritative role/slot/input-ownership state from the broker. Pushes are
//! best-effort with a short timeout; a container that misses one converges
//! on the next push.

use async_trait::async_trait;
use std::time::Duration;

/// Port of the token-ingest endpoint inside application containers.
pub const CONTROL_PLANE_PORT: u16 = 8083;

/// Client capability for the downstream token endpoint.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// POST the token map to one container, authenticated by the session's
    /// master token. Failures are the caller's to ignore.
    async fn push_tokens(
        &self,
        ip: &str,
        master_token: &str,
        tokens: &serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// HTTP implementation with a one-second timeout per push.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
}

impl HttpControlPlane {
    /// Build the client.
    ///
    /// # Panics
    /// Panics only if the TLS backend cannot initialise, which is fatal at
    /// startup anyway.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(1))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlane {
    async fn push_tokens(
        &self,
        ip: &str,
        master_token: &str,
        tokens: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.client
            .post(format!("http://{ip}:{CONTROL_PLANE_PORT}/tokens"))
            .bearer_auth(master_token)
            .json(tokens)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Records pushes instead of sending them (tests).
#[derive(Debug, Default)]
pub struct RecordingControlPlane {
    pushes: tokio::sync::Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingControlPlane {
    /// Fresh recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(ip, tokens)` push seen so far.
    pub async fn pushes(&self) -> Vec<(String, serde_json::Value)> {
        self.pushes.lock().await.clone()
    }

    /// The most recent push, if any.
    pub async fn last_push(&self) -> Option<(String, serde_json::Value)> {
        self.pushes.lock().await.last().cloned()
    }
}

#[async_trait]
impl ControlPlaneClient for RecordingControlPlane {
    async fn push_tokens(
        &self,
        ip: &str,
        _master_token: &str,
        tokens: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.pushes
            .lock()
            .await
            .push((ip.to_owned(), tokens.clone()));
        Ok(())
    }
}
