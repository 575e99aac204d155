//! TLS listener support.
//!
//! Certificates are loaded once at start-up; each accepted connection is
//! handshaked and then served through hyper's connection builder with the
//! shared router.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("cannot read TLS material: {0}")]
    Io(#[from] std::io::Error),

    #[error("no private key found in key file")]
    NoPrivateKey,

    #[error("invalid TLS material: {0}")]
    Tls(#[from] rustls::Error),
}

/// Build a server config from PEM certificate and key files.
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<rustls::ServerConfig>, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or(Error::NoPrivateKey)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Accept-and-serve loop; exits when `shutdown` resolves. In-flight
/// connections run on their own tasks and finish independently.
pub(super) async fn serve_tls(
    listener: TcpListener,
    app: Router,
    config: Arc<rustls::ServerConfig>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let acceptor = TlsAcceptor::from(config);
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, %peer, "TLS handshake failed");
                    return;
                }
            };

            let service = TowerToHyperService::new(app);
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                debug!(%err, %peer, "connection closed with error");
            }
        });
    }
}
