//! Periodic background jobs: image auto-update and expired-share sweeping.
//!
//! Both jobs are cancellable through a shared token and joined on teardown;
//! their errors are logged, never propagated.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;

/// Pause between image pulls within one update round.
const PULL_SPACING: Duration = Duration::from_secs(2);

/// Spawn the periodic jobs. The returned handles are joined at shutdown.
#[must_use]
pub fn spawn(broker: Arc<Broker>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if broker.settings.auto_update_apps {
        let broker = Arc::clone(&broker);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let interval = Duration::from_secs(broker.settings.auto_update_interval_seconds);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                update_images_round(&broker, &shutdown).await;
            }
            tracing::info!("image update job stopped");
        }));
    }

    {
        let broker = Arc::clone(&broker);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let interval = Duration::from_secs(broker.settings.share_cleanup_interval_seconds);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                match broker.shares.sweep_expired().await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "expired shares removed"),
                    Err(e) => tracing::error!(error = %e, "share cleanup failed"),
                }
            }
            tracing::info!("share cleanup job stopped");
        }));
    }

    handles
}

async fn update_images_round(broker: &Arc<Broker>, shutdown: &CancellationToken) {
    tracing::info!("starting scheduled app image update check");

    let apps = broker.catalog.all().await;
    let stores = broker.catalog.stores().await;
    if let Err(e) = broker.autostart.refresh_all(&apps, &stores).await {
        tracing::error!(error = %e, "autostart refresh failed");
    }

    for image in broker.catalog.auto_update_images().await {
        if shutdown.is_cancelled() {
            return;
        }
        if let Err(e) = broker.pull_and_cache(&image).await {
            tracing::error!(image, error = %e, "background pull failed");
        }
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(PULL_SPACING) => {}
        }
    }
}
