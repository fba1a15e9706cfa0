//! Routing reverse proxy with the exclude/auth/verify rule chain.
//!
//! Requests are routed through an ordered rule chain: CORS preflights and
//! exclude-list matches bypass verification entirely, requests under the
//! auth-service path hit the cookie-exchange handler, and everything else
//! must pass the verifier before it reaches the upstream.

use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use regex::Regex;
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error};
use url::Url;

use crate::handlers::{CookieHandler, VerifierHandler};
use crate::jwt::single_joining_slash;
use crate::proxy::{full_body, ProxyBody, ProxyError, RequestHandler};

/// Rewrites requests onto the configured upstream and dials it.
pub struct Router {
    upstream: Upstream,
    tls: Option<TlsConnector>,
}

enum Upstream {
    Unix {
        socket: String,
    },
    Net {
        host: String,
        port: u16,
        https: bool,
        base_path: String,
        base_query: Option<String>,
    },
}

impl Router {
    /// `unix:`-prefixed upstreams are dialed over a unix socket with the
    /// scheme rewritten to http; anything else must be an absolute http(s)
    /// URL.
    pub fn new(upstream: &str) -> Result<Self, ProxyError> {
        if let Some(socket) = upstream.strip_prefix("unix:") {
            return Ok(Self {
                upstream: Upstream::Unix {
                    socket: socket.to_string(),
                },
                tls: None,
            });
        }

        let url = Url::parse(upstream)
            .map_err(|e| ProxyError::InvalidUpstream(format!("{upstream}: {e}")))?;
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ProxyError::InvalidUpstream(format!(
                    "{upstream}: unsupported scheme {other}"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidUpstream(format!("{upstream}: missing host")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::InvalidUpstream(format!("{upstream}: missing port")))?;

        let tls = https.then(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        });

        Ok(Self {
            upstream: Upstream::Net {
                host,
                port,
                https,
                base_path: url.path().to_string(),
                base_query: url.query().map(str::to_string),
            },
            tls,
        })
    }

    /// The rewritten request target: upstream base path joined with the
    /// request path, upstream query concatenated before the request query.
    /// The query concatenation is plain text glueing, not a multi-value
    /// merge.
    fn target(&self, uri: &http::Uri) -> String {
        match &self.upstream {
            Upstream::Unix { .. } => uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            Upstream::Net {
                base_path,
                base_query,
                ..
            } => {
                let mut target = single_joining_slash(base_path, uri.path());
                let query = match (base_query.as_deref(), uri.query()) {
                    (Some(a), Some(b)) => Some(format!("{a}&{b}")),
                    (Some(a), None) => Some(a.to_string()),
                    (None, Some(b)) => Some(b.to_string()),
                    (None, None) => None,
                };
                if let Some(query) = query {
                    target.push('?');
                    target.push_str(&query);
                }
                target
            }
        }
    }

    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match self.try_forward(req).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(error = %e, "upstream request failed");
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(full_body(format!("jwtproxy: {e}")))
                    .unwrap()
            }
        }
    }

    async fn try_forward(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let (mut parts, body) = req.into_parts();
        let target = self.target(&parts.uri);
        parts.uri = target
            .parse()
            .map_err(|e| ProxyError::Upstream(format!("invalid rewritten target: {e}")))?;
        let req = Request::from_parts(parts, body);

        match &self.upstream {
            Upstream::Unix { socket } => {
                let stream = UnixStream::connect(socket)
                    .await
                    .map_err(|e| ProxyError::Upstream(format!("unix:{socket}: {e}")))?;
                send_upstream(req, stream).await
            }
            Upstream::Net {
                host, port, https, ..
            } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| ProxyError::Upstream(format!("{host}:{port}: {e}")))?;
                if *https {
                    let Some(connector) = self.tls.as_ref() else {
                        return Err(ProxyError::Upstream(
                            "https upstream without a TLS connector".to_string(),
                        ));
                    };
                    let name = ServerName::try_from(host.clone())
                        .map_err(|e| ProxyError::Upstream(format!("{host}: {e}")))?;
                    let tls = connector
                        .connect(name, stream)
                        .await
                        .map_err(|e| ProxyError::Upstream(format!("{host}: TLS: {e}")))?;
                    send_upstream(req, tls).await
                } else {
                    send_upstream(req, stream).await
                }
            }
        }
    }
}

async fn send_upstream<I>(
    req: Request<Incoming>,
    io: I,
) -> Result<Response<ProxyBody>, ProxyError>
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "upstream connection closed with error");
        }
    });

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;
    Ok(resp.map(|body| body.boxed()))
}

/// Which sub-handler a request is routed to.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Bypass,
    CookieAuth,
    Verify,
}

pub struct ReverseProxy {
    verifier: Arc<VerifierHandler>,
    cookie: Arc<CookieHandler>,
    router: Router,
    excludes: Vec<Regex>,
    auth_path: String,
}

impl ReverseProxy {
    pub fn new(
        verifier: Arc<VerifierHandler>,
        cookie: Arc<CookieHandler>,
        router: Router,
        excludes: Vec<Regex>,
        auth_path: String,
    ) -> Self {
        Self {
            verifier,
            cookie,
            router,
            excludes,
            auth_path,
        }
    }

    /// The rule chain, in order: excluded traffic bypasses verification even
    /// under the auth path, then the cookie exchange, then the verifier.
    fn route(&self, method: &Method, headers: &HeaderMap, path: &str) -> Route {
        if is_cors_preflight(method, headers) || self.excludes.iter().any(|re| re.is_match(path)) {
            return Route::Bypass;
        }
        if !self.auth_path.is_empty() && path.starts_with(self.auth_path.as_str()) {
            return Route::CookieAuth;
        }
        Route::Verify
    }
}

#[async_trait]
impl RequestHandler for ReverseProxy {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match self.route(req.method(), req.headers(), req.uri().path()) {
            Route::Bypass => {
                debug!(path = req.uri().path(), "bypassing verification");
                self.router.forward(req).await
            }
            Route::CookieAuth => self.cookie.handle(&req),
            Route::Verify => match self.verifier.verify(req).await {
                Ok(req) => self.router.forward(req).await,
                Err(resp) => resp,
            },
        }
    }

    async fn stop(&self) {
        self.verifier.stop().await;
        self.cookie.stop().await;
    }
}

fn is_cors_preflight(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::OPTIONS
        && headers
            .keys()
            .any(|name| name.as_str().starts_with("access-control-request-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::VerifierOptions;
    use crate::nonce::LocalNonceStorage;
    use crate::{backends::KeyServerReader, keys::PublicKey, keyserver::RegistryError};

    #[test]
    fn test_target_joins_paths_and_concatenates_queries() {
        let router = Router::new("http://backend.svc:8080/base?fixed=1").unwrap();

        let uri: http::Uri = "/api/list?page=2".parse().unwrap();
        assert_eq!(router.target(&uri), "/base/api/list?fixed=1&page=2");

        let uri: http::Uri = "/api".parse().unwrap();
        assert_eq!(router.target(&uri), "/base/api?fixed=1");
    }

    #[test]
    fn test_target_without_base() {
        let router = Router::new("http://backend.svc:8080").unwrap();

        let uri: http::Uri = "/api?x=1".parse().unwrap();
        assert_eq!(router.target(&uri), "/api?x=1");
    }

    #[test]
    fn test_target_avoids_duplicate_slash() {
        let router = Router::new("http://backend.svc:8080/base/").unwrap();
        let uri: http::Uri = "/api".parse().unwrap();
        assert_eq!(router.target(&uri), "/base/api");
    }

    #[test]
    fn test_unix_upstream_passes_target_through() {
        let router = Router::new("unix:/var/run/backend.sock").unwrap();
        let uri: http::Uri = "/api?x=1".parse().unwrap();
        assert_eq!(router.target(&uri), "/api?x=1");
    }

    #[test]
    fn test_router_rejects_bad_upstreams() {
        assert!(Router::new("ftp://backend").is_err());
        assert!(Router::new("not a url").is_err());
    }

    struct NoKeys;

    #[async_trait]
    impl KeyServerReader for NoKeys {
        async fn get_public_key(
            &self,
            issuer: &str,
            kid: &str,
        ) -> Result<PublicKey, RegistryError> {
            Err(RegistryError::UnknownKey {
                issuer: issuer.to_string(),
                kid: kid.to_string(),
            })
        }
    }

    fn test_proxy(excludes: Vec<Regex>, auth_path: &str) -> ReverseProxy {
        let verifier = Arc::new(VerifierHandler::new(
            VerifierOptions {
                audience: String::new(),
                cookies_enabled: true,
                max_skew: chrono::Duration::minutes(1),
                max_ttl: chrono::Duration::minutes(10),
                public_base_path: String::new(),
                auth_redirect: String::new(),
            },
            Arc::new(NoKeys),
            Arc::new(LocalNonceStorage::new()),
            Vec::new(),
            Vec::new(),
        ));
        let cookie = Arc::new(CookieHandler::new(
            true,
            auth_path.to_string(),
            String::new(),
        ));
        ReverseProxy::new(
            verifier,
            cookie,
            Router::new("http://backend.svc:8080").unwrap(),
            excludes,
            auth_path.to_string(),
        )
    }

    #[test]
    fn test_rule_chain_ordering() {
        let proxy = test_proxy(vec![Regex::new("^/healthz$").unwrap()], "/jwt/auth");
        let plain = HeaderMap::new();

        // Excluded paths bypass, even when nested under the auth path.
        assert_eq!(proxy.route(&Method::GET, &plain, "/healthz"), Route::Bypass);
        let proxy_overlap =
            test_proxy(vec![Regex::new("^/jwt/auth/public").unwrap()], "/jwt/auth");
        assert_eq!(
            proxy_overlap.route(&Method::GET, &plain, "/jwt/auth/public"),
            Route::Bypass
        );

        // Auth path goes to the cookie handler.
        assert_eq!(
            proxy.route(&Method::POST, &plain, "/jwt/auth"),
            Route::CookieAuth
        );

        // Everything else is verified.
        assert_eq!(proxy.route(&Method::GET, &plain, "/api"), Route::Verify);
    }

    #[test]
    fn test_cors_preflight_bypasses() {
        let proxy = test_proxy(Vec::new(), "");

        let mut preflight = HeaderMap::new();
        preflight.insert(
            "access-control-request-method",
            http::HeaderValue::from_static("POST"),
        );
        assert_eq!(
            proxy.route(&Method::OPTIONS, &preflight, "/api"),
            Route::Bypass
        );

        // A plain OPTIONS request is not a preflight.
        let plain = HeaderMap::new();
        assert_eq!(proxy.route(&Method::OPTIONS, &plain, "/api"), Route::Verify);
    }
}
