//! MITM-capable forward proxy.
//!
//! Plain absolute-form requests are signed and forwarded. CONNECT requests
//! are terminated with a per-host certificate from the signing CA and the
//! decrypted requests inside the tunnel are signed and forwarded the same
//! way. Without a configured CA every CONNECT is rejected; the proxy never
//! tunnels traffic it cannot stamp.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::handlers::SignerHandler;
use crate::proxy::{full_body, ProxyBody, ProxyError, RequestHandler, SigningCa};

pub struct ForwardProxy {
    signer: Arc<SignerHandler>,
    ca: Option<Arc<SigningCa>>,
    client: reqwest::Client,
}

impl ForwardProxy {
    /// `trusted_certificates` and `insecure_skip_verify` shape the upstream
    /// TLS trust of the outbound leg.
    pub fn new(
        signer: Arc<SignerHandler>,
        ca: Option<Arc<SigningCa>>,
        trusted_certificates: &[String],
        insecure_skip_verify: bool,
    ) -> Result<Self, ProxyError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(30));

        for path in trusted_certificates {
            let pem = std::fs::read(path)
                .map_err(|e| ProxyError::Tls(format!("unable to read {path}: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ProxyError::Tls(format!("unable to parse {path}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if insecure_skip_verify {
            warn!("upstream certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        Ok(Self { signer, ca, client })
    }

    async fn connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        // Fail closed: without a CA the tunnel cannot be intercepted, and
        // passing it through would defeat signing entirely.
        let Some(ca) = &self.ca else {
            warn!("CONNECT rejected: no signing CA configured");
            return respond(
                StatusCode::NOT_IMPLEMENTED,
                "jwtproxy: CONNECT requires a configured signing CA",
            );
        };

        let authority = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                return respond(
                    StatusCode::BAD_REQUEST,
                    "CONNECT requires a host:port authority",
                );
            }
        };
        let (host, _port) = match parse_authority(&authority) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(authority, reason, "invalid CONNECT authority");
                return respond(StatusCode::BAD_REQUEST, &reason);
            }
        };

        info!(%authority, "intercepting CONNECT");

        let ca = Arc::clone(ca);
        let signer = Arc::clone(&self.signer);
        let client = self.client.clone();
        let mut req = req;
        tokio::spawn(async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => {
                    intercept_tunnel(upgraded, ca, signer, client, host, authority).await;
                }
                Err(e) => error!(error = %e, "CONNECT upgrade failed"),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(full_body(""))
            .unwrap()
    }
}

#[async_trait]
impl RequestHandler for ForwardProxy {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            self.connect(req).await
        } else {
            sign_and_forward(&self.signer, &self.client, req, None).await
        }
    }

    async fn stop(&self) {
        self.signer.stop().await;
    }
}

/// Terminate the tunnel with a forged certificate and serve the decrypted
/// requests through the signing transform.
async fn intercept_tunnel(
    upgraded: hyper::upgrade::Upgraded,
    ca: Arc<SigningCa>,
    signer: Arc<SignerHandler>,
    client: reqwest::Client,
    host: String,
    authority: String,
) {
    let config = match ca.server_config_for(&host).await {
        Ok(config) => config,
        Err(e) => {
            error!(host, error = %e, "certificate generation failed");
            return;
        }
    };

    let acceptor = TlsAcceptor::from(config);
    let tls = match acceptor.accept(TokioIo::new(upgraded)).await {
        Ok(tls) => tls,
        Err(e) => {
            debug!(host, error = %e, "client TLS handshake failed");
            return;
        }
    };

    let origin = format!("https://{authority}");
    let service = service_fn(move |inner: Request<Incoming>| {
        let signer = Arc::clone(&signer);
        let client = client.clone();
        let origin = origin.clone();
        async move {
            Ok::<_, std::convert::Infallible>(
                sign_and_forward(&signer, &client, inner, Some(&origin)).await,
            )
        }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service);
    if let Err(e) = conn.await {
        debug!(host, error = %e, "intercepted connection closed with error");
    }
}

/// Stamp the request with a fresh token and forward it upstream. `origin` is
/// set for intercepted requests, whose origin-form URIs must be rebuilt into
/// absolute ones first.
async fn sign_and_forward(
    signer: &SignerHandler,
    client: &reqwest::Client,
    req: Request<Incoming>,
    origin: Option<&str>,
) -> Response<ProxyBody> {
    let (mut parts, body) = req.into_parts();

    if let Some(origin) = origin {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = match format!("{origin}{path}").parse() {
            Ok(uri) => uri,
            Err(_) => return respond(StatusCode::BAD_REQUEST, "invalid request target"),
        };
    } else if parts.uri.scheme().is_none() || parts.uri.authority().is_none() {
        return respond(
            StatusCode::BAD_REQUEST,
            "proxy requests must use absolute-form URIs",
        );
    }

    let mut req = Request::from_parts(parts, body);
    if let Err(resp) = signer.sign(&mut req).await {
        return resp;
    }

    forward_upstream(client, req).await
}

async fn forward_upstream(client: &reqwest::Client, req: Request<Incoming>) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();
    let url = parts.uri.to_string();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return respond(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return respond(StatusCode::BAD_REQUEST, "invalid request method"),
    };

    let mut upstream = client.request(method, &url);
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        upstream = upstream.header(name.as_str(), value.as_bytes());
    }
    if !body.is_empty() {
        upstream = upstream.body(body);
    }

    match upstream.send().await {
        Ok(resp) => into_response(resp).await,
        Err(e) => {
            error!(url, error = %e, "upstream request failed");
            respond(StatusCode::BAD_GATEWAY, "failed to reach upstream")
        }
    }
}

async fn into_response(resp: reqwest::Response) -> Response<ProxyBody> {
    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in resp.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    match resp.bytes().await {
        Ok(bytes) => builder.body(full_body(bytes)).unwrap(),
        Err(e) => {
            warn!(error = %e, "failed to read upstream response body");
            respond(StatusCode::BAD_GATEWAY, "failed to read upstream response")
        }
    }
}

/// Hop-by-hop headers are not forwarded; Host and Content-Length are
/// re-derived for the upstream request.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "transfer-encoding"
            | "upgrade"
            | "te"
            | "trailer"
            | "host"
            | "content-length"
    )
}

/// Split a CONNECT authority into host and port, with IPv6 literals kept
/// intact.
fn parse_authority(authority: &str) -> Result<(String, u16), String> {
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| "authority must be in host:port form".to_string())?;

    if host.is_empty() {
        return Err("authority host cannot be empty".to_string());
    }

    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port '{port}'"))?;
    if port == 0 {
        return Err("invalid port '0'".to_string());
    }

    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

fn respond(status: StatusCode, msg: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full_body(msg.to_string()))
        .unwrap()
}
