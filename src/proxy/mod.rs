//! Proxy engine: listeners, connection serving and graceful shutdown.
//!
//! A `Proxy` wraps either the MITM forward engine or the routing reverse
//! engine behind the `RequestHandler` trait and serves it on exactly one of
//! three listener kinds: unix-domain socket, TLS, or plain TCP. `stop`
//! triggers a graceful drain bounded by the configured shutdown timeout and
//! then force-closes whatever is still open.

pub mod ca;
pub mod forward;
pub mod reverse;

use std::io::BufReader;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub use ca::SigningCa;
pub use forward::ForwardProxy;
pub use reverse::{ReverseProxy, Router};

/// Response body type shared by every handler branch.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A complete in-memory body.
pub fn full_body<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("invalid TLS configuration: {0}")]
    Tls(String),

    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    #[error("invalid upstream {0}")]
    InvalidUpstream(String),

    #[error("upstream unreachable: {0}")]
    Upstream(String),
}

/// A proxy role: one request transform serving every connection.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody>;

    /// Release the sub-resources owned by this handler.
    async fn stop(&self);
}

/// Where and how to listen. The three kinds are mutually exclusive: a
/// `unix:`-prefixed address is a unix-domain socket, a certificate/key pair
/// upgrades TCP to TLS, otherwise the listener is plain TCP.
#[derive(Debug, Clone, Default)]
pub struct ListenerConfig {
    pub addr: String,
    pub crt_file: Option<String>,
    pub key_file: Option<String>,
}

pub enum Listener {
    Tcp(TcpListener),
    Tls(TcpListener, TlsAcceptor),
    Unix(UnixListener),
}

enum Accepted {
    Tcp(TcpStream),
    Tls(TcpStream, TlsAcceptor),
    Unix(UnixStream),
}

impl Listener {
    pub async fn bind(cfg: &ListenerConfig) -> Result<Self, ProxyError> {
        if let Some(path) = cfg.addr.strip_prefix("unix:") {
            // A stale socket file from a previous run would fail the bind.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path).map_err(|source| ProxyError::Bind {
                addr: cfg.addr.clone(),
                source,
            })?;
            return Ok(Self::Unix(listener));
        }

        let tcp = TcpListener::bind(&cfg.addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: cfg.addr.clone(),
                source,
            })?;

        match (&cfg.crt_file, &cfg.key_file) {
            (Some(crt), Some(key)) => Ok(Self::Tls(tcp, tls_acceptor(crt, key)?)),
            (None, None) => Ok(Self::Tcp(tcp)),
            _ => Err(ProxyError::Tls(
                "certificate and key files must be configured together".to_string(),
            )),
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Self::Tcp(l) | Self::Tls(l, _) => l.local_addr().ok(),
            Self::Unix(_) => None,
        }
    }

    async fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            Self::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                debug!(%peer, "accepted connection");
                Ok(Accepted::Tcp(stream))
            }
            Self::Tls(l, acceptor) => {
                let (stream, peer) = l.accept().await?;
                debug!(%peer, "accepted TLS connection");
                Ok(Accepted::Tls(stream, acceptor.clone()))
            }
            Self::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Accepted::Unix(stream))
            }
        }
    }
}

fn tls_acceptor(crt_file: &str, key_file: &str) -> Result<TlsAcceptor, ProxyError> {
    let crt = std::fs::File::open(crt_file)
        .map_err(|e| ProxyError::Tls(format!("unable to read {crt_file}: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(crt))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("unable to parse {crt_file}: {e}")))?;

    let key = std::fs::File::open(key_file)
        .map_err(|e| ProxyError::Tls(format!("unable to read {key_file}: {e}")))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key))
        .map_err(|e| ProxyError::Tls(format!("unable to parse {key_file}: {e}")))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {key_file}")))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// One proxy instance. Serving blocks until the listener closes; `stop` is
/// idempotent and a no-op when the proxy was never started.
pub struct Proxy {
    handler: Arc<dyn RequestHandler>,
    shutdown_timeout: Duration,
    shutdown: StdMutex<Option<watch::Sender<bool>>>,
}

impl Proxy {
    pub fn new(handler: Arc<dyn RequestHandler>, shutdown_timeout: Duration) -> Self {
        Self {
            handler,
            shutdown_timeout,
            shutdown: StdMutex::new(None),
        }
    }

    pub async fn serve(&self, cfg: &ListenerConfig) -> Result<(), ProxyError> {
        let listener = Listener::bind(cfg).await?;
        info!(addr = %cfg.addr, "proxy listening");
        self.serve_on(listener).await
    }

    /// Serve an already-bound listener. Used directly by tests that bind an
    /// ephemeral port first.
    pub async fn serve_on(&self, listener: Listener) -> Result<(), ProxyError> {
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(tx);

        let mut connections: JoinSet<()> = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = rx.changed() => {
                    info!("listener closing");
                    break Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok(conn) => {
                            let handler = Arc::clone(&self.handler);
                            connections.spawn(async move {
                                match conn {
                                    Accepted::Tcp(stream) => serve_connection(stream, handler).await,
                                    Accepted::Unix(stream) => serve_connection(stream, handler).await,
                                    Accepted::Tls(stream, acceptor) => {
                                        match acceptor.accept(stream).await {
                                            Ok(tls) => serve_connection(tls, handler).await,
                                            Err(e) => debug!(error = %e, "TLS handshake failed"),
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => break Err(ProxyError::Accept(e)),
                    }
                }
            }
        };
        drop(listener);

        // Graceful drain, bounded by the shutdown timeout.
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.shutdown_timeout,
                "shutdown timeout reached, force-closing open connections"
            );
            connections.abort_all();
        }

        result
    }

    pub async fn stop(&self) {
        let tx = self.shutdown.lock().unwrap().take();
        match tx {
            Some(tx) => {
                let _ = tx.send(true);
                self.handler.stop().await;
            }
            None => debug!("stop on a proxy that is not running"),
        }
    }
}

async fn serve_connection<I>(io: I, handler: Arc<dyn RequestHandler>)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, std::convert::Infallible>(handler.handle(req).await) }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();

    if let Err(e) = conn.await {
        debug!(error = %e, "connection closed with error");
    }
}
