use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sealskin::broker::Broker;
use sealskin::collab::HttpControlPlane;
use sealskin::config::Settings;
use sealskin::launch::detect_gpus;
use sealskin::runtime::{ContainerRuntime, DockerRuntime};
use sealskin::{api, jobs, proxy, server};

#[derive(Parser)]
#[command(name = "sealskin")]
#[command(version)]
#[command(about = "Multi-tenant application session broker")]
#[command(long_about = "\
sealskin launches packaged GUI applications in isolated containers and
proxies each user's browser traffic to their session.

All configuration comes from SEALSKIN_-prefixed environment variables
(ports, storage paths, key locations, cookie name, update intervals).
The flags below override the corresponding variable for this run.")]
struct Cli {
    /// Override SEALSKIN_API_PORT for this run.
    #[arg(long)]
    api_port: Option<u16>,

    /// Override SEALSKIN_SESSION_PORT for this run.
    #[arg(long)]
    session_port: Option<u16>,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sealskin={log_level},info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(port) = cli.api_port {
        settings.api_port = port;
    }
    if let Some(port) = cli.session_port {
        settings.session_port = port;
    }
    init_tracing(&settings.log_level);
    tracing::info!("API server starting up");

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new());
    let control_plane = Arc::new(HttpControlPlane::new());
    let gpus = detect_gpus();

    let broker = Broker::bootstrap(settings.clone(), runtime, control_plane, gpus)
        .await
        .map_err(|e| anyhow::anyhow!("startup failed: {e}"))?;

    let shutdown = CancellationToken::new();
    let job_handles = jobs::spawn(Arc::clone(&broker), shutdown.clone());

    let api_addr = SocketAddr::from(([0, 0, 0, 0], settings.api_port));
    let api_task = tokio::spawn(server::serve_plain(
        api_addr,
        api::router(Arc::clone(&broker)),
        shutdown.clone(),
    ));

    let session_addr = SocketAddr::from(([0, 0, 0, 0], settings.session_port));
    let proxy_cert = settings.proxy_cert_path.clone();
    let proxy_key = settings.proxy_key_path.clone();
    let proxy_router = proxy::router(Arc::clone(&broker));
    let session_shutdown = shutdown.clone();
    let session_task = tokio::spawn(async move {
        server::serve_session_port(
            session_addr,
            proxy_router,
            &proxy_cert,
            &proxy_key,
            session_shutdown,
        )
        .await
    });

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    for handle in job_handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background job did not join cleanly");
        }
    }
    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "API server error"),
        Err(e) => tracing::error!(error = %e, "API server task failed"),
    }
    match session_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "session server error"),
        Err(e) => tracing::error!(error = %e, "session server task failed"),
    }

    tracing::info!("all services shut down");
    Ok(())
}
