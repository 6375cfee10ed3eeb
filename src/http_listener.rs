//! Single-port listener carrying both TLS and plaintext HTTP
//!
//! Each accepted socket is classified by peeking its first byte without
//! consuming it: a TLS handshake record (0x16) goes through rustls, anything
//! else is served as plaintext HTTP/1.1 or h2c. Plaintext requests are
//! redirected to HTTPS while a certificate is installed.
//!
//! Every connection task watches the certificate slot. On any rotation it
//! asks hyper for a graceful shutdown, which closes idle keep-alive
//! connections at once and lets in-flight requests complete.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::CODE_BAD_REQUEST;
use crate::pages;
use crate::proxy::ProxyCore;
use crate::tls::server_config;

/// First byte of a TLS handshake record
const TLS_HANDSHAKE_RECORD: u8 = 0x16;
/// Bound on waiting for the first byte of a new connection
pub const PEEK_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How a freshly accepted connection should be served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Tls,
    Plaintext,
}

/// Classify by the leading byte
pub fn classify(first: u8) -> ConnectionKind {
    if first == TLS_HANDSHAKE_RECORD {
        ConnectionKind::Tls
    } else {
        ConnectionKind::Plaintext
    }
}

/// Accept loop for the proxy port; returns once `shutdown` flips to true
pub async fn run_proxy_listener(
    listener: TcpListener,
    core: Arc<ProxyCore>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let acceptor = TlsAcceptor::from(server_config(core.cert_slot().clone())?);
    info!("Reverse proxy listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("Reverse proxy listener stopping");
                return Ok(());
            }
        };

        let core = core.clone();
        let acceptor = acceptor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, core, acceptor, shutdown).await;
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    core: Arc<ProxyCore>,
    acceptor: TlsAcceptor,
    shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);

    let mut first = [0u8; 1];
    let kind = match tokio::time::timeout(PEEK_TIMEOUT, stream.peek(&mut first)).await {
        Ok(Ok(0)) => return,
        Ok(Ok(_)) => classify(first[0]),
        Ok(Err(e)) => {
            debug!("Peek failed for {}: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("No data from {} within {:?}", peer, PEEK_TIMEOUT);
            return;
        }
    };

    match kind {
        ConnectionKind::Tls => {
            let tls_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => tls_stream,
                Ok(Err(e)) => {
                    debug!("TLS handshake failed for {}: {}", peer, e);
                    return;
                }
                Err(_) => {
                    debug!("TLS handshake timed out for {}", peer);
                    return;
                }
            };
            serve(tls_stream, peer, core, true, shutdown).await;
        }
        ConnectionKind::Plaintext => serve(stream, peer, core, false, shutdown).await,
    }
}

/// Drive one HTTP connection until it closes, draining on rotation or shutdown
async fn serve<I>(io: I, peer: SocketAddr, core: Arc<ProxyCore>, is_tls: bool, mut shutdown: watch::Receiver<bool>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut rotations = core.cert_slot().subscribe();

    let service = service_fn(move |request: Request<Incoming>| {
        let core = core.clone();
        async move { Ok::<_, Infallible>(dispatch(&core, request.map(Body::new), peer, is_tls).await) }
    });

    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("Connection from {} ended with error: {}", peer, e);
                }
                break;
            }
            changed = rotations.changed(), if !draining => {
                if changed.is_ok() {
                    debug!("Certificate rotated, draining connection from {}", peer);
                }
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = shutdown.wait_for(|stop| *stop), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Per-request entry: HTTPS upgrade for plaintext, then the proxy core, then an access log line
async fn dispatch(core: &ProxyCore, request: Request<Body>, peer: SocketAddr, is_tls: bool) -> Response<Body> {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = if !is_tls && core.has_certificate() {
        https_redirect(&request)
    } else {
        core.handle(request, peer, is_tls).await
    };

    info!(
        "{} {} {} {} {:?}",
        peer.ip(),
        method,
        path,
        response.status().as_u16(),
        started.elapsed()
    );
    response
}

/// 307 to the same host and request target over https
fn https_redirect(request: &Request<Body>) -> Response<Body> {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()));

    let Some(host) = host else {
        return pages::error_page(CODE_BAD_REQUEST, "Missing Host header", &[]);
    };

    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}{}", host, target);

    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap_or_else(|_| pages::error_page(CODE_BAD_REQUEST, "Invalid Host header", &[]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(0x16), ConnectionKind::Tls);
        assert_eq!(classify(b'G'), ConnectionKind::Plaintext);
        assert_eq!(classify(b'P'), ConnectionKind::Plaintext);
    }

    #[test]
    fn test_https_redirect_keeps_target() {
        let request = Request::builder()
            .uri("/app/page?x=1")
            .header("host", "example.com:9090")
            .body(Body::empty())
            .unwrap();
        let response = https_redirect(&request);
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()["location"],
            "https://example.com:9090/app/page?x=1"
        );
    }

    #[test]
    fn test_https_redirect_without_host() {
        let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
        assert_eq!(https_redirect(&request).status(), StatusCode::BAD_REQUEST);
    }
}
