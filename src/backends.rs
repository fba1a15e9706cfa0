//! Pluggable backend contracts.
//!
//! Every external collaborator of the proxy is consumed through one of these
//! traits, and concrete backends are selected by explicit factory tables in
//! the configuration rather than any global registry. Implementations must be
//! safe to share across concurrent requests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::jwt::{Claims, ValidationError};
use crate::keys::{KeyError, PrivateKey, PublicKey};
use crate::keyserver::{KeyPolicy, PublishResult, RegistryError};

/// Source of the signer's current private key. A provider may rotate or cache
/// keys internally; callers fetch a key per signed request.
#[async_trait]
pub trait PrivateKeyProvider: Send + Sync {
    async fn private_key(&self) -> Result<PrivateKey, KeyError>;
    async fn stop(&self);
}

/// Read side of the key registry: public key lookup by issuer and key ID.
#[async_trait]
pub trait KeyServerReader: Send + Sync {
    async fn get_public_key(&self, issuer: &str, kid: &str) -> Result<PublicKey, RegistryError>;
}

/// Write side of the key registry: publication, approval probing, deletion.
#[async_trait]
pub trait KeyServerManager: Send + Sync {
    async fn publish_public_key(
        &self,
        key: &PublicKey,
        policy: &KeyPolicy,
        signing_key: &PrivateKey,
    ) -> PublishResult;

    async fn verify_public_key(&self, issuer: &str, kid: &str) -> Result<(), RegistryError>;

    async fn delete_public_key(&self, signing_key: &PrivateKey) -> Result<(), RegistryError>;

    async fn stop(&self);
}

/// Single-use nonce storage. `verify` reports whether the nonce is seen for
/// the first time; the storage must remember it until `expiry`.
#[async_trait]
pub trait NonceStorage: Send + Sync {
    async fn verify(&self, nonce: &str, expiry: DateTime<Utc>) -> bool;
    async fn stop(&self);
}

/// Post-validation claims check, run in configured order after the codec
/// accepts a token. The first failure rejects the request.
#[async_trait]
pub trait ClaimsVerifier: Send + Sync {
    async fn handle(
        &self,
        req: &http::request::Parts,
        claims: &Claims,
    ) -> Result<(), ValidationError>;

    async fn stop(&self);
}

/// Lifecycle hook for components owned by a handler.
#[async_trait]
pub trait StopHandle: Send + Sync {
    async fn stop(&self);
}

/// Claims verifier accepting only issuers on a fixed allow-list.
pub struct StaticIssuerVerifier {
    issuers: Vec<String>,
}

impl StaticIssuerVerifier {
    pub fn new(issuers: Vec<String>) -> Self {
        Self { issuers }
    }
}

#[async_trait]
impl ClaimsVerifier for StaticIssuerVerifier {
    async fn handle(
        &self,
        _req: &http::request::Parts,
        claims: &Claims,
    ) -> Result<(), ValidationError> {
        if self.issuers.iter().any(|i| i == &claims.iss) {
            Ok(())
        } else {
            Err(ValidationError::IssuerNotAllowed(claims.iss.clone()))
        }
    }

    async fn stop(&self) {}
}
