//! Per-role request handlers wiring the codec, the registry client, and the
//! pluggable backends into single request transforms.
//!
//! Handlers never panic on per-request failures: every validation or signing
//! problem becomes an HTTP response (302, 403 or 502) and the request is not
//! forwarded.

use http::header::{AUTHORIZATION, LOCATION, SET_COOKIE};
use http::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::backends::{
    ClaimsVerifier, KeyServerReader, NonceStorage, PrivateKeyProvider, StopHandle,
};
use crate::jwt::{self, Signer, SignerParams, ValidationError, ACCESS_TOKEN_COOKIE};
use crate::proxy::{full_body, ProxyBody};

/// Signs outbound requests with the provider's current private key.
pub struct SignerHandler {
    signer: Signer,
    provider: Arc<dyn PrivateKeyProvider>,
}

impl SignerHandler {
    pub fn new(params: SignerParams, provider: Arc<dyn PrivateKeyProvider>) -> Self {
        Self {
            signer: Signer::new(params),
            provider,
        }
    }

    /// Stamp the request, or produce the 502 that replaces forwarding.
    pub async fn sign<B>(&self, req: &mut Request<B>) -> Result<(), Response<ProxyBody>> {
        let key = match self.provider.private_key().await {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "unable to fetch signing key");
                return Err(bad_gateway("jwtproxy: unable to sign request"));
            }
        };

        self.signer.sign(req, &key).map_err(|e| {
            warn!(error = %e, "unable to sign request");
            bad_gateway("jwtproxy: unable to sign request")
        })
    }

    pub async fn stop(&self) {
        self.provider.stop().await;
    }
}

#[derive(Debug, Clone)]
pub struct VerifierOptions {
    pub audience: String,
    pub cookies_enabled: bool,
    pub max_skew: chrono::Duration,
    pub max_ttl: chrono::Duration,
    pub public_base_path: String,
    pub auth_redirect: String,
}

/// Validates inbound requests and gates them behind the claims-verifier
/// chain.
pub struct VerifierHandler {
    opts: VerifierOptions,
    key_server: Arc<dyn KeyServerReader>,
    nonces: Arc<dyn NonceStorage>,
    claims_verifiers: Vec<Arc<dyn ClaimsVerifier>>,
    stoppers: Vec<Arc<dyn StopHandle>>,
}

impl VerifierHandler {
    pub fn new(
        opts: VerifierOptions,
        key_server: Arc<dyn KeyServerReader>,
        nonces: Arc<dyn NonceStorage>,
        claims_verifiers: Vec<Arc<dyn ClaimsVerifier>>,
        stoppers: Vec<Arc<dyn StopHandle>>,
    ) -> Self {
        Self {
            opts,
            key_server,
            nonces,
            claims_verifiers,
            stoppers,
        }
    }

    /// Verify the request. On success the request is handed back for
    /// forwarding; on failure the caller gets the response to return.
    pub async fn verify<B>(&self, req: Request<B>) -> Result<Request<B>, Response<ProxyBody>> {
        let (parts, body) = req.into_parts();

        let claims = match jwt::verify(
            &parts,
            &*self.key_server,
            &*self.nonces,
            self.opts.cookies_enabled,
            &self.opts.audience,
            self.opts.max_skew,
            self.opts.max_ttl,
            &self.opts.public_base_path,
        )
        .await
        {
            Ok(claims) => claims,
            Err(ValidationError::AuthRequired { redirect })
                if !self.opts.auth_redirect.is_empty() =>
            {
                debug!(redirect, "no credential, redirecting to authentication");
                return Err(self.auth_redirect_response(&redirect));
            }
            Err(e) => {
                debug!(error = %e, "request verification failed");
                return Err(forbidden(&e));
            }
        };

        for verifier in &self.claims_verifiers {
            if let Err(e) = verifier.handle(&parts, &claims).await {
                warn!(error = %e, iss = claims.iss, "claims verifier rejected request");
                return Err(forbidden(&e));
            }
        }

        Ok(Request::from_parts(parts, body))
    }

    fn auth_redirect_response(&self, original: &str) -> Response<ProxyBody> {
        let target = Url::parse_with_params(
            &self.opts.auth_redirect,
            &[
                ("workspaceId", self.opts.audience.as_str()),
                ("redirectUrl", original),
            ],
        );
        match target {
            Ok(target) => Response::builder()
                .status(StatusCode::FOUND)
                .header(LOCATION, target.as_str())
                .body(full_body(""))
                .unwrap(),
            Err(e) => {
                warn!(error = %e, "invalid authentication redirect target");
                forbidden(&ValidationError::AuthRequired {
                    redirect: original.to_string(),
                })
            }
        }
    }

    pub async fn stop(&self) {
        self.nonces.stop().await;
        for verifier in &self.claims_verifiers {
            verifier.stop().await;
        }
        for stopper in &self.stoppers {
            stopper.stop().await;
        }
    }
}

/// Exchanges a Bearer token for the access-token cookie, with CORS reflected
/// from the authentication redirect target.
pub struct CookieHandler {
    cookies_enabled: bool,
    cookie_path: String,
    auth_redirect: String,
}

impl CookieHandler {
    pub fn new(cookies_enabled: bool, cookie_path: String, auth_redirect: String) -> Self {
        Self {
            cookies_enabled,
            cookie_path,
            auth_redirect,
        }
    }

    pub fn handle<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        if req.method() == Method::OPTIONS {
            return self
                .with_cors(Response::builder().status(StatusCode::NO_CONTENT), true)
                .body(full_body(""))
                .unwrap();
        }

        if !self.cookies_enabled {
            return self
                .with_cors(Response::builder().status(StatusCode::FORBIDDEN), false)
                .body(full_body("jwtproxy: cookies are disabled"))
                .unwrap();
        }

        let token = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token);
        let Some(token) = token else {
            return self
                .with_cors(Response::builder().status(StatusCode::FORBIDDEN), false)
                .body(full_body("jwtproxy: missing bearer token"))
                .unwrap();
        };

        let attributes = if self.auth_redirect.starts_with("https://") {
            "Secure; SameSite=None"
        } else {
            "SameSite=Lax"
        };
        let cookie = format!(
            "{ACCESS_TOKEN_COOKIE}={token}; Path={}; HttpOnly; {attributes}",
            self.cookie_path
        );

        self.with_cors(Response::builder().status(StatusCode::NO_CONTENT), false)
            .header(SET_COOKIE, cookie)
            .body(full_body(""))
            .unwrap()
    }

    fn with_cors(
        &self,
        mut builder: http::response::Builder,
        preflight: bool,
    ) -> http::response::Builder {
        let origin = Url::parse(&self.auth_redirect)
            .map(|u| u.origin().ascii_serialization())
            .unwrap_or_else(|_| "*".to_string());

        builder = builder
            .header("Access-Control-Allow-Origin", origin)
            .header("Access-Control-Allow-Credentials", "true");
        if preflight {
            builder = builder
                .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
                .header("Access-Control-Allow-Headers", "Authorization, Content-Type");
        }
        builder
    }

    pub async fn stop(&self) {}
}

fn bearer_token(value: &str) -> Option<String> {
    let mut parts = value.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(token))
            if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() =>
        {
            Some(token.trim().to_string())
        }
        _ => None,
    }
}

/// The opaque body every API client sees on verification failure.
fn forbidden(err: &ValidationError) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .body(full_body(format!(
            "jwtproxy: unable to verify request: {err}"
        )))
        .unwrap()
}

fn bad_gateway(msg: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(full_body(msg.to_string()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyError, PrivateKey, PublicKey};
    use crate::keyserver::RegistryError;
    use crate::nonce::LocalNonceStorage;
    use async_trait::async_trait;
    use http_body_util::BodyExt;

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

    struct BrokenProvider;

    #[async_trait]
    impl PrivateKeyProvider for BrokenProvider {
        async fn private_key(&self) -> Result<PrivateKey, KeyError> {
            Err(KeyError::Generation("provider offline".to_string()))
        }

        async fn stop(&self) {}
    }

    fn verifier(auth_redirect: &str) -> VerifierHandler {
        VerifierHandler::new(
            VerifierOptions {
                audience: "workspace-1".to_string(),
                cookies_enabled: false,
                max_skew: chrono::Duration::minutes(1),
                max_ttl: chrono::Duration::minutes(10),
                public_base_path: String::new(),
                auth_redirect: auth_redirect.to_string(),
            },
            Arc::new(NoKeys),
            Arc::new(LocalNonceStorage::new()),
            Vec::new(),
            Vec::new(),
        )
    }

    async fn body_text(resp: Response<ProxyBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    async fn test_missing_token_without_redirect_is_403() {
        let handler = verifier("");
        let req = Request::builder()
            .uri("/api")
            .header(http::header::HOST, "svc.example")
            .body(())
            .unwrap();

        let resp = handler.verify(req).await.unwrap_err();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_text(resp).await;
        assert!(body.starts_with("jwtproxy: unable to verify request"));
    }

    #[tokio::test]
    async fn test_missing_token_with_redirect_is_302() {
        let handler = verifier("https://auth.example/login");
        let req = Request::builder()
            .uri("/ide")
            .header(http::header::HOST, "ws.example")
            .header("x-forwarded-proto", "https")
            .body(())
            .unwrap();

        let resp = handler.verify(req).await.unwrap_err();
        assert_eq!(resp.status(), StatusCode::FOUND);

        let location = resp.headers().get(LOCATION).unwrap().to_str().unwrap();
        let location = Url::parse(location).unwrap();
        assert_eq!(location.host_str(), Some("auth.example"));
        let params: std::collections::HashMap<_, _> = location.query_pairs().collect();
        assert_eq!(params.get("workspaceId").map(|v| v.as_ref()), Some("workspace-1"));
        assert_eq!(
            params.get("redirectUrl").map(|v| v.as_ref()),
            Some("https://ws.example/ide")
        );
    }

    #[tokio::test]
    async fn test_signer_handler_maps_provider_failure_to_502() {
        let handler = SignerHandler::new(
            SignerParams {
                issuer: "svc".to_string(),
                expiration: chrono::Duration::minutes(5),
                max_skew: chrono::Duration::minutes(1),
                nonce_length: 32,
            },
            Arc::new(BrokenProvider),
        );

        let mut req = Request::builder()
            .uri("https://backend.svc/api")
            .body(())
            .unwrap();
        let resp = handler.sign(&mut req).await.unwrap_err();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_cookie_handler_preflight() {
        let handler = CookieHandler::new(
            true,
            "/jwt/auth".to_string(),
            "https://auth.example/login".to_string(),
        );
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/jwt/auth")
            .body(())
            .unwrap();

        let resp = handler.handle(&req);
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers().get("Access-Control-Allow-Origin").unwrap(),
            "https://auth.example"
        );
        assert_eq!(
            resp.headers()
                .get("Access-Control-Allow-Credentials")
                .unwrap(),
            "true"
        );
        assert!(resp.headers().contains_key("Access-Control-Allow-Methods"));
    }

    #[tokio::test]
    async fn test_cookie_handler_sets_secure_cookie_for_https_target() {
        let handler = CookieHandler::new(
            true,
            "/jwt/auth".to_string(),
            "https://auth.example/login".to_string(),
        );
        let req = Request::builder()
            .method(Method::POST)
            .uri("/jwt/auth")
            .header(AUTHORIZATION, "Bearer tok-123")
            .body(())
            .unwrap();

        let resp = handler.handle(&req);
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let cookie = resp.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.starts_with("access_token=tok-123"));
        assert!(cookie.contains("Path=/jwt/auth"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure; SameSite=None"));
    }

    #[tokio::test]
    async fn test_cookie_handler_lax_for_http_target() {
        let handler = CookieHandler::new(
            true,
            "/jwt/auth".to_string(),
            "http://auth.example/login".to_string(),
        );
        let req = Request::builder()
            .method(Method::POST)
            .uri("/jwt/auth")
            .header(AUTHORIZATION, "Bearer tok-123")
            .body(())
            .unwrap();

        let resp = handler.handle(&req);
        let cookie = resp.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.contains("SameSite=Lax"));
        assert!(!cookie.contains("Secure"));
    }

    #[tokio::test]
    async fn test_cookie_handler_rejections() {
        // Cookies disabled.
        let handler = CookieHandler::new(
            false,
            "/jwt/auth".to_string(),
            "https://auth.example/login".to_string(),
        );
        let req = Request::builder()
            .method(Method::POST)
            .uri("/jwt/auth")
            .header(AUTHORIZATION, "Bearer tok")
            .body(())
            .unwrap();
        assert_eq!(handler.handle(&req).status(), StatusCode::FORBIDDEN);

        // Missing bearer token.
        let handler = CookieHandler::new(
            true,
            "/jwt/auth".to_string(),
            "https://auth.example/login".to_string(),
        );
        let req = Request::builder()
            .method(Method::POST)
            .uri("/jwt/auth")
            .body(())
            .unwrap();
        assert_eq!(handler.handle(&req).status(), StatusCode::FORBIDDEN);
    }
}
