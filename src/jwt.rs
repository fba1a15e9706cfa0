//! JWT protocol codec: token minting and strictly-ordered validation.
//!
//! `Signer::sign` stamps an outbound request with a freshly minted ES256 JWT
//! bound to the request destination. `verify` extracts a token from exactly
//! one credential slot (query parameter, then Authorization header, then
//! cookie), runs the claim checks in a fixed order with first-failure
//! short-circuit, and verifies the signature last against the public key
//! fetched from the key server.

use chrono::{DateTime, Duration, Utc};
use http::header::{AUTHORIZATION, COOKIE, HOST};
use http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::backends::{KeyServerReader, NonceStorage};
use crate::keys::{KeyError, PrivateKey};
use crate::keyserver::RegistryError;
use crate::nonce::NonceGenerator;

/// Query parameter consulted first during token extraction.
const TOKEN_QUERY_PARAM: &str = "token";

/// Cookie consulted last, only when cookies are enabled.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// The claim set minted and validated by this codec. No other fields are
/// added or accepted as meaningful.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
}

/// Parameters of a signer instance.
#[derive(Debug, Clone)]
pub struct SignerParams {
    pub issuer: String,
    pub expiration: Duration,
    pub max_skew: Duration,
    pub nonce_length: usize,
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("failed to sign token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("request has no destination host to bind the token to")]
    MissingAudience,

    #[error("signed token is not a valid header value")]
    HeaderValue,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    /// No credential was found; carries the URL clients should be sent to.
    #[error("authentication required")]
    AuthRequired { redirect: String },

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token header is missing a key id")]
    MissingKeyId,

    #[error("token is missing the {0} claim")]
    MissingClaim(&'static str),

    #[error("token has an invalid {0} claim")]
    InvalidClaim(&'static str),

    #[error("token audience does not match the expected audience")]
    AudienceMismatch,

    #[error("token is expired")]
    Expired,

    #[error("token is not valid yet")]
    NotYetValid,

    #[error("token was issued in the future")]
    IssuedInFuture,

    #[error("token lifetime exceeds the maximum allowed")]
    LifetimeTooLong,

    #[error("token id has already been used")]
    NonceReused,

    #[error("{0}")]
    UnknownKey(String),

    #[error("token signature is invalid")]
    BadSignature,

    #[error("unable to reach the key server")]
    KeyServerUnavailable,

    #[error("issuer {0} is not allowed")]
    IssuerNotAllowed(String),
}

/// Mints tokens bound to request destinations. One nonce generator per
/// signer, seeded at construction.
pub struct Signer {
    params: SignerParams,
    nonces: NonceGenerator,
}

impl Signer {
    pub fn new(params: SignerParams) -> Self {
        let nonces = NonceGenerator::new(params.nonce_length);
        Self { params, nonces }
    }

    pub fn params(&self) -> &SignerParams {
        &self.params
    }

    /// Produce a compact JWS for the given audience.
    pub fn mint(&self, audience: &str, key: &PrivateKey) -> Result<String, SignError> {
        let now = Utc::now();
        let claims = Claims {
            iss: self.params.issuer.clone(),
            aud: audience.to_string(),
            iat: now.timestamp(),
            nbf: (now - self.params.max_skew).timestamp(),
            exp: (now + self.params.expiration).timestamp(),
            jti: self.nonces.generate(),
        };

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(key.kid().to_string());

        Ok(jsonwebtoken::encode(&header, &claims, &key.encoding_key()?)?)
    }

    /// Sign a request in place: mint a token for `scheme://host(request)` and
    /// inject it as a Bearer Authorization header.
    pub fn sign<B>(&self, req: &mut http::Request<B>, key: &PrivateKey) -> Result<(), SignError> {
        let audience = request_audience(req).ok_or(SignError::MissingAudience)?;
        let token = self.mint(&audience, key)?;
        let value = http::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| SignError::HeaderValue)?;
        req.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}

/// The audience a signed request is bound to: `scheme://authority`.
fn request_audience<B>(req: &http::Request<B>) -> Option<String> {
    let scheme = req.uri().scheme_str().unwrap_or("http");
    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| header_str(req.headers(), HOST.as_str()).map(str::to_string))?;
    Some(format!("{scheme}://{authority}"))
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verify the token carried by a request.
///
/// Validation is strictly sequential and stops at the first failure; the
/// signature is checked last, against the key named by the token's own
/// `iss`/`kid` pair.
#[allow(clippy::too_many_arguments)]
pub async fn verify(
    req: &Parts,
    key_server: &dyn KeyServerReader,
    nonce_storage: &dyn NonceStorage,
    cookies_enabled: bool,
    expected_audience: &str,
    max_skew: Duration,
    max_ttl: Duration,
    public_base_path: &str,
) -> Result<Claims, ValidationError> {
    let token = match extract_token(req, cookies_enabled) {
        Some(token) => token,
        None => {
            return Err(ValidationError::AuthRequired {
                redirect: redirect_url(req, public_base_path),
            });
        }
    };

    // 1. The header must name the verification key.
    let header = jsonwebtoken::decode_header(&token)
        .map_err(|e| ValidationError::Malformed(e.to_string()))?;
    let kid = header.kid.ok_or(ValidationError::MissingKeyId)?;

    // Claim checks run on the raw claim set; the signature comes last.
    let claims = decode_unverified_claims(&token)?;
    let now = Utc::now().timestamp();

    // 2. Issuer.
    let iss = match claims.get("iss") {
        None => return Err(ValidationError::MissingClaim("iss")),
        Some(Value::String(iss)) => iss.clone(),
        Some(_) => return Err(ValidationError::InvalidClaim("iss")),
    };

    // 3. Audience.
    if !expected_audience.is_empty() {
        let aud = match claims.get("aud") {
            None => return Err(ValidationError::MissingClaim("aud")),
            Some(Value::String(aud)) => aud,
            Some(_) => return Err(ValidationError::InvalidClaim("aud")),
        };
        if !audience_matches(aud, expected_audience) {
            return Err(ValidationError::AudienceMismatch);
        }
    }

    // 4. Expiration.
    let exp = int_claim(&claims, "exp")?;
    if now > exp {
        return Err(ValidationError::Expired);
    }

    // 5. Not-before.
    let nbf = int_claim(&claims, "nbf")?;
    if nbf > now {
        return Err(ValidationError::NotYetValid);
    }

    // 6. Issued-at, shifted by the tolerated clock skew.
    let iat = int_claim(&claims, "iat")?;
    if iat - max_skew.num_seconds() > now {
        return Err(ValidationError::IssuedInFuture);
    }

    // 7. Bounded lifetime.
    if exp - iat > max_ttl.num_seconds() {
        return Err(ValidationError::LifetimeTooLong);
    }

    // 8. Single-use nonce.
    let jti = match claims.get("jti") {
        None => return Err(ValidationError::MissingClaim("jti")),
        Some(Value::String(jti)) => jti.clone(),
        Some(_) => return Err(ValidationError::InvalidClaim("jti")),
    };
    let expiry = DateTime::<Utc>::from_timestamp(exp, 0)
        .ok_or(ValidationError::InvalidClaim("exp"))?;
    if !nonce_storage.verify(&jti, expiry).await {
        return Err(ValidationError::NonceReused);
    }

    // 9. Signature, with the public key resolved through the key server.
    // Unknown keys surface as-is; every other key-server failure is masked.
    let public_key = key_server.get_public_key(&iss, &kid).await.map_err(|e| match e {
        RegistryError::UnknownKey { .. } => ValidationError::UnknownKey(e.to_string()),
        other => {
            debug!(error = %other, "key server lookup failed");
            ValidationError::KeyServerUnavailable
        }
    })?;
    let decoding_key = public_key
        .decoding_key()
        .map_err(|_| ValidationError::KeyServerUnavailable)?;
    verify_signature(&token, &decoding_key)?;

    Ok(Claims {
        iss,
        aud: claims
            .get("aud")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        iat,
        nbf,
        exp,
        jti,
    })
}

/// Token extraction, in fixed precedence order: `token` query parameter,
/// `Authorization: Bearer` header, then the access-token cookie if enabled.
/// Exactly one slot is consulted.
fn extract_token(req: &Parts, cookies_enabled: bool) -> Option<String> {
    if let Some(query) = req.uri.query() {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key == TOKEN_QUERY_PARAM && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    if let Some(auth) = header_str(&req.headers, AUTHORIZATION.as_str()) {
        let mut parts = auth.splitn(2, ' ');
        if let (Some(scheme), Some(token)) = (parts.next(), parts.next()) {
            if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
                return Some(token.trim().to_string());
            }
        }
    }

    if cookies_enabled {
        for value in req.headers.get_all(COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            for cookie in value.split(';') {
                if let Some(token) = cookie.trim().strip_prefix(ACCESS_TOKEN_COOKIE) {
                    if let Some(token) = token.strip_prefix('=') {
                        if !token.is_empty() {
                            return Some(token.to_string());
                        }
                    }
                }
            }
        }
    }

    None
}

/// The URL an unauthenticated browser client should be redirected back to:
/// forwarded protocol (else `http`), original host, public base path joined
/// with the original path.
fn redirect_url(req: &Parts, public_base_path: &str) -> String {
    let proto = header_str(&req.headers, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(&req.headers, HOST.as_str())
        .map(str::to_string)
        .or_else(|| req.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let path = single_joining_slash(public_base_path, req.uri.path());
    format!("{proto}://{host}{path}")
}

/// Join two path segments without doubling the slash between them.
pub(crate) fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) if !a.is_empty() && !b.is_empty() => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

fn decode_unverified_claims(
    token: &str,
) -> Result<serde_json::Map<String, Value>, ValidationError> {
    let mut validation = Validation::new(Algorithm::ES256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = jsonwebtoken::decode::<serde_json::Map<String, Value>>(
        token,
        &DecodingKey::from_secret(&[]),
        &validation,
    )
    .map_err(|e| ValidationError::Malformed(e.to_string()))?;
    Ok(data.claims)
}

fn verify_signature(token: &str, key: &DecodingKey) -> Result<(), ValidationError> {
    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<serde_json::Map<String, Value>>(token, key, &validation)
        .map(|_| ())
        .map_err(|_| ValidationError::BadSignature)
}

fn int_claim(
    claims: &serde_json::Map<String, Value>,
    name: &'static str,
) -> Result<i64, ValidationError> {
    match claims.get(name) {
        None => Err(ValidationError::MissingClaim(name)),
        Some(value) => value.as_i64().ok_or(ValidationError::InvalidClaim(name)),
    }
}

/// Audience comparison: when both sides parse as absolute URLs, scheme and
/// host are compared case-insensitively and nothing else; when neither does,
/// they are compared as opaque strings; a mix never matches.
fn audience_matches(token_aud: &str, expected: &str) -> bool {
    match (Url::parse(token_aud), Url::parse(expected)) {
        (Ok(a), Ok(b)) => {
            a.scheme().eq_ignore_ascii_case(b.scheme())
                && match (a.host_str(), b.host_str()) {
                    (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
                    (None, None) => true,
                    _ => false,
                }
        }
        (Err(_), Err(_)) => token_aud == expected,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::LocalNonceStorage;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StaticKeyServer {
        keys: HashMap<(String, String), crate::keys::PublicKey>,
    }

    impl StaticKeyServer {
        fn with(issuer: &str, key: &PrivateKey) -> Self {
            let mut keys = HashMap::new();
            keys.insert(
                (issuer.to_string(), key.kid().to_string()),
                key.public_key(),
            );
            Self { keys }
        }
    }

    #[async_trait]
    impl KeyServerReader for StaticKeyServer {
        async fn get_public_key(
            &self,
            issuer: &str,
            kid: &str,
        ) -> Result<crate::keys::PublicKey, RegistryError> {
            self.keys
                .get(&(issuer.to_string(), kid.to_string()))
                .cloned()
                .ok_or_else(|| RegistryError::UnknownKey {
                    issuer: issuer.to_string(),
                    kid: kid.to_string(),
                })
        }
    }

    fn signer_params() -> SignerParams {
        SignerParams {
            issuer: "signer.example".to_string(),
            expiration: Duration::minutes(5),
            max_skew: Duration::minutes(1),
            nonce_length: 32,
        }
    }

    fn signed_request(params: SignerParams, key: &PrivateKey, uri: &str) -> Parts {
        let signer = Signer::new(params);
        let mut req = http::Request::builder().uri(uri).body(()).unwrap();
        signer.sign(&mut req, key).unwrap();
        req.into_parts().0
    }

    async fn verify_with(
        parts: &Parts,
        key_server: &StaticKeyServer,
        storage: &LocalNonceStorage,
        audience: &str,
        max_skew: Duration,
        max_ttl: Duration,
    ) -> Result<Claims, ValidationError> {
        verify(
            parts, key_server, storage, true, audience, max_skew, max_ttl, "",
        )
        .await
    }

    #[tokio::test]
    async fn test_sign_verify_round_trip() {
        let key = PrivateKey::generate().unwrap();
        let key_server = StaticKeyServer::with("signer.example", &key);
        let storage = LocalNonceStorage::new();

        let parts = signed_request(signer_params(), &key, "https://backend.svc:8080/api/list");
        let claims = verify_with(
            &parts,
            &key_server,
            &storage,
            "https://backend.svc:8080",
            Duration::minutes(1),
            Duration::minutes(10),
        )
        .await
        .unwrap();

        assert_eq!(claims.iss, "signer.example");
        assert_eq!(claims.aud, "https://backend.svc:8080");
        assert_eq!(claims.jti.len(), 32);
    }

    #[tokio::test]
    async fn test_replay_rejected_by_shared_nonce_storage() {
        let key = PrivateKey::generate().unwrap();
        let key_server = StaticKeyServer::with("signer.example", &key);
        let storage = LocalNonceStorage::new();

        let parts = signed_request(signer_params(), &key, "https://backend.svc/api");

        let first = verify_with(
            &parts,
            &key_server,
            &storage,
            "",
            Duration::minutes(1),
            Duration::minutes(10),
        )
        .await;
        assert!(first.is_ok());

        let second = verify_with(
            &parts,
            &key_server,
            &storage,
            "",
            Duration::minutes(1),
            Duration::minutes(10),
        )
        .await;
        assert!(matches!(second, Err(ValidationError::NonceReused)));
    }

    #[tokio::test]
    async fn test_negative_expiration_is_expired() {
        let key = PrivateKey::generate().unwrap();
        let key_server = StaticKeyServer::with("signer.example", &key);
        let storage = LocalNonceStorage::new();

        let mut params = signer_params();
        params.expiration = Duration::seconds(-1);
        let parts = signed_request(params, &key, "https://backend.svc/api");

        let result = verify_with(
            &parts,
            &key_server,
            &storage,
            "",
            Duration::minutes(1),
            Duration::minutes(10),
        )
        .await;
        assert!(matches!(result, Err(ValidationError::Expired)));
    }

    #[tokio::test]
    async fn test_negative_signer_skew_is_not_yet_valid() {
        // A negative signer skew puts nbf in the future.
        let key = PrivateKey::generate().unwrap();
        let key_server = StaticKeyServer::with("signer.example", &key);
        let storage = LocalNonceStorage::new();

        let mut params = signer_params();
        params.max_skew = Duration::minutes(-1);
        let parts = signed_request(params, &key, "https://backend.svc/api");

        let result = verify_with(
            &parts,
            &key_server,
            &storage,
            "",
            Duration::minutes(1),
            Duration::minutes(10),
        )
        .await;
        assert!(matches!(result, Err(ValidationError::NotYetValid)));
    }

    #[tokio::test]
    async fn test_negative_verifier_skew_rejects_fresh_token() {
        let key = PrivateKey::generate().unwrap();
        let key_server = StaticKeyServer::with("signer.example", &key);
        let storage = LocalNonceStorage::new();

        let mut params = signer_params();
        params.max_skew = Duration::zero();
        let parts = signed_request(params, &key, "https://backend.svc/api");

        let result = verify_with(
            &parts,
            &key_server,
            &storage,
            "",
            Duration::minutes(-1),
            Duration::minutes(10),
        )
        .await;
        assert!(matches!(result, Err(ValidationError::IssuedInFuture)));
    }

    #[tokio::test]
    async fn test_lifetime_bounded_by_max_ttl() {
        let key = PrivateKey::generate().unwrap();
        let key_server = StaticKeyServer::with("signer.example", &key);
        let storage = LocalNonceStorage::new();

        let parts = signed_request(signer_params(), &key, "https://backend.svc/api");

        let result = verify_with(
            &parts,
            &key_server,
            &storage,
            "",
            Duration::minutes(1),
            Duration::minutes(1),
        )
        .await;
        assert!(matches!(result, Err(ValidationError::LifetimeTooLong)));
    }

    #[test]
    fn test_audience_matching_rules() {
        // Absolute URLs compare scheme and host only.
        assert!(audience_matches("https://a.io/x", "https://a.io/y"));
        assert!(audience_matches("https://A.IO", "https://a.io"));
        assert!(!audience_matches("http://a.io", "https://a.io"));

        // Opaque strings compare exactly.
        assert!(audience_matches("workspace-1", "workspace-1"));
        assert!(!audience_matches("workspace-1", "workspace-2"));

        // A URL never matches a non-URL.
        assert!(!audience_matches("workspace-1", "https://a.io"));
        assert!(!audience_matches("https://a.io", "workspace-1"));
    }

    #[tokio::test]
    async fn test_empty_expected_audience_disables_check() {
        let key = PrivateKey::generate().unwrap();
        let key_server = StaticKeyServer::with("signer.example", &key);
        let storage = LocalNonceStorage::new();

        let parts = signed_request(signer_params(), &key, "https://anything.example/api");
        let result = verify_with(
            &parts,
            &key_server,
            &storage,
            "",
            Duration::minutes(1),
            Duration::minutes(10),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_audience_mismatch_rejected() {
        let key = PrivateKey::generate().unwrap();
        let key_server = StaticKeyServer::with("signer.example", &key);
        let storage = LocalNonceStorage::new();

        let parts = signed_request(signer_params(), &key, "https://other.example/api");
        let result = verify_with(
            &parts,
            &key_server,
            &storage,
            "https://backend.svc",
            Duration::minutes(1),
            Duration::minutes(10),
        )
        .await;
        assert!(matches!(result, Err(ValidationError::AudienceMismatch)));
    }

    #[test]
    fn test_extraction_precedence_query_over_header() {
        let req = http::Request::builder()
            .uri("http://svc/api?token=from-query")
            .header(AUTHORIZATION, "Bearer from-header")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        assert_eq!(
            extract_token(&parts, true).as_deref(),
            Some("from-query")
        );
    }

    #[test]
    fn test_extraction_falls_back_to_cookie() {
        let req = http::Request::builder()
            .uri("http://svc/api")
            .header(COOKIE, "theme=dark; access_token=from-cookie")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        assert_eq!(
            extract_token(&parts, true).as_deref(),
            Some("from-cookie")
        );

        // Cookies disabled: the same request carries no usable credential.
        let req = http::Request::builder()
            .uri("http://svc/api")
            .header(COOKIE, "access_token=from-cookie")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        assert_eq!(extract_token(&parts, false), None);
    }

    #[tokio::test]
    async fn test_missing_token_yields_auth_required_redirect() {
        let key = PrivateKey::generate().unwrap();
        let key_server = StaticKeyServer::with("signer.example", &key);
        let storage = LocalNonceStorage::new();

        let req = http::Request::builder()
            .uri("/workspace/ide")
            .header(HOST, "proxy.example")
            .header("x-forwarded-proto", "https")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();

        let result = verify(
            &parts,
            &key_server,
            &storage,
            false,
            "",
            Duration::minutes(1),
            Duration::minutes(10),
            "/base",
        )
        .await;

        match result {
            Err(ValidationError::AuthRequired { redirect }) => {
                assert_eq!(redirect, "https://proxy.example/base/workspace/ide");
            }
            other => panic!("expected AuthRequired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_key_propagates_and_wrong_key_fails_signature() {
        let key = PrivateKey::generate().unwrap();
        let other = PrivateKey::generate().unwrap();
        let storage = LocalNonceStorage::new();

        // No key registered at all: the not-found error is surfaced.
        let empty = StaticKeyServer {
            keys: HashMap::new(),
        };
        let parts = signed_request(signer_params(), &key, "https://backend.svc/api");
        let result = verify_with(
            &parts,
            &empty,
            &storage,
            "",
            Duration::minutes(1),
            Duration::minutes(10),
        )
        .await;
        assert!(matches!(result, Err(ValidationError::UnknownKey(_))));

        // A different key under the same id: signature check fails.
        let mut keys = HashMap::new();
        keys.insert(
            ("signer.example".to_string(), key.kid().to_string()),
            other.public_key(),
        );
        let mismatched = StaticKeyServer { keys };
        let parts = signed_request(signer_params(), &key, "https://backend.svc/api");
        let result = verify_with(
            &parts,
            &mismatched,
            &storage,
            "",
            Duration::minutes(1),
            Duration::minutes(10),
        )
        .await;
        assert!(matches!(result, Err(ValidationError::BadSignature)));
    }

    #[test]
    fn test_single_joining_slash() {
        assert_eq!(single_joining_slash("/base/", "/path"), "/base/path");
        assert_eq!(single_joining_slash("/base", "/path"), "/base/path");
        assert_eq!(single_joining_slash("/base", "path"), "/base/path");
        assert_eq!(single_joining_slash("", "/path"), "/path");
    }
}
