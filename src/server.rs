//! Listener plumbing for the two HTTP servers.
//!
//! The API listener is cleartext (operators usually front it with their own
//! TLS). The session listener terminates TLS itself when a certificate and
//! key are configured; if either is missing it logs a warning and serves
//! cleartext instead of refusing to start.

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_util::sync::CancellationToken;

use crate::core::Result;

/// Serve a router over cleartext HTTP until the token is cancelled.
///
/// # Errors
/// Returns an error when the listener cannot bind.
pub async fn serve_plain(
    addr: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| crate::core::Error::Internal(anyhow::anyhow!("bind {addr} failed: {e}")))?;
    tracing::info!(%addr, "listening (http)");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| crate::core::Error::Internal(anyhow::anyhow!("server error: {e}")))?;
    Ok(())
}

/// Load a rustls server config from PEM certificate and key files.
fn load_tls_config(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
            .collect::<std::io::Result<_>>()?;

    let key_file = std::fs::File::open(key_path)?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))?
            .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Serve a router over TLS when configured, falling back to cleartext.
///
/// # Errors
/// Returns an error when the listener cannot bind.
pub async fn serve_session_port(
    addr: SocketAddr,
    router: Router,
    cert_path: &Path,
    key_path: &Path,
    shutdown: CancellationToken,
) -> Result<()> {
    if !(cert_path.exists() && key_path.exists()) {
        tracing::warn!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "session TLS certificate or key missing, serving cleartext"
        );
        return serve_plain(addr, router, shutdown).await;
    }

    let tls_config = match load_tls_config(cert_path, key_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load session TLS material, serving cleartext");
            return serve_plain(addr, router, shutdown).await;
        }
    };
    let acceptor = TlsAcceptor::from(tls_config);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| crate::core::Error::Internal(anyhow::anyhow!("bind {addr} failed: {e}")))?;
    tracing::info!(%addr, "listening (https)");

    let service = TowerToHyperService::new(router);
    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let conn_builder = ConnBuilder::new(TokioExecutor::new());
            let connection =
                conn_builder.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
            tokio::select! {
                () = shutdown.cancelled() => {}
                result = connection => {
                    if let Err(e) = result {
                        tracing::debug!(%peer, error = %e, "connection error");
                    }
                }
            }
        });
    }
    Ok(())
}
