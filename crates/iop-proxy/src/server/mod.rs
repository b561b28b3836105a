//! Public listeners.
//!
//! One task per accepted connection; TLS handshakes and request
//! handling never block the accept loops. Shutdown stops accepting,
//! lets in-flight requests drain for up to 30 seconds, then returns so
//! the caller can flush state and exit.

mod forward;
mod handler;

pub use forward::{ProxyBody, upstream_client};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::acme::ChallengeMap;
use crate::errors::ProxyError;
use crate::state::StateStore;
use crate::tls::CertStore;

const HTTP_ADDR: &str = "0.0.0.0:80";
const HTTPS_ADDR: &str = "0.0.0.0:443";
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything request handling needs, shared across connections.
pub struct ProxyContext {
    pub store: StateStore,
    pub certs: Arc<CertStore>,
    pub challenges: Arc<ChallengeMap>,
    pub client: forward::UpstreamClient,
    pub default_timeout: Duration,
}

impl ProxyContext {
    pub fn new(
        store: StateStore,
        certs: Arc<CertStore>,
        challenges: Arc<ChallengeMap>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            certs,
            challenges,
            client: forward::upstream_client(),
            default_timeout,
        })
    }
}

/// Bind both listeners and serve until `shutdown` flips.
pub async fn run(
    ctx: Arc<ProxyContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let http = bind(HTTP_ADDR).await?;
    let https = bind(HTTPS_ADDR).await?;
    let tls_config = crate::tls::server_config(ctx.certs.clone())?;
    let tls_acceptor = tokio_rustls::TlsAcceptor::from(tls_config);

    info!("[PROXY] listening on {HTTP_ADDR} (http) and {HTTPS_ADDR} (https)");

    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            accepted = http.accept() => match accepted {
                Ok((stream, peer)) => serve_http(&ctx, &graceful, stream, peer),
                Err(e) => warn!("[PROXY] http accept failed: {e}"),
            },
            accepted = https.accept() => match accepted {
                Ok((stream, peer)) => serve_https(&ctx, &graceful, &tls_acceptor, stream, peer),
                Err(e) => warn!("[PROXY] https accept failed: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }

    drop(http);
    drop(https);
    info!("[PROXY] draining in-flight connections");
    tokio::select! {
        _ = graceful.shutdown() => {}
        _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
            warn!("[PROXY] drain timed out, closing remaining connections");
        }
    }
    Ok(())
}

async fn bind(addr: &str) -> Result<TcpListener, ProxyError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyError::Listener {
            addr: addr.to_string(),
            source,
        })
}

fn serve_http(
    ctx: &Arc<ProxyContext>,
    graceful: &GracefulShutdown,
    stream: tokio::net::TcpStream,
    _peer: SocketAddr,
) {
    let ctx = ctx.clone();
    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move { Ok::<_, std::convert::Infallible>(handler::handle_http(ctx, req).await) }
    });
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder
        .serve_connection(TokioIo::new(stream), service)
        .into_owned();
    let watched = graceful.watch(conn);
    tokio::spawn(async move {
        if let Err(e) = watched.await {
            debug!("[PROXY] http connection ended: {e}");
        }
    });
}

fn serve_https(
    ctx: &Arc<ProxyContext>,
    graceful: &GracefulShutdown,
    acceptor: &tokio_rustls::TlsAcceptor,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) {
    let ctx = ctx.clone();
    let acceptor = acceptor.clone();
    let watcher = graceful.watcher();

    tokio::spawn(async move {
        let handshake = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream));
        let tls_stream = match handshake.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                // Includes SNI misses: no certificate, no connection.
                debug!(peer = %peer, "[PROXY] tls handshake failed: {e}");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "[PROXY] tls handshake timed out");
                return;
            }
        };

        let sni = tls_stream
            .get_ref()
            .1
            .server_name()
            .map(|name| name.to_ascii_lowercase());

        let service = service_fn(move |req| {
            let ctx = ctx.clone();
            let sni = sni.clone();
            async move {
                Ok::<_, std::convert::Infallible>(
                    handler::handle_https(ctx, sni, peer.ip(), req).await,
                )
            }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder
            .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
            .into_owned();
        if let Err(e) = watcher.watch(conn).await {
            debug!("[PROXY] https connection ended: {e}");
        }
    });
}
