//! Key material for token signing and verification.
//!
//! Keys are ES256 (P-256) pairs. The private side is held as PKCS#8 PEM and
//! yields a `jsonwebtoken::EncodingKey`; the public side is carried as a JWK
//! and yields a `DecodingKey`. Key IDs are derived from the public point so a
//! key reloaded from disk keeps the identity it was published under.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rcgen::{KeyPair, PKCS_ECDSA_P256_SHA256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::backends::PrivateKeyProvider;

/// Uncompressed SEC1 point length for P-256: tag byte + two 32-byte coordinates.
const P256_POINT_LEN: usize = 65;

/// Characters of the derived key ID.
const KEY_ID_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to generate key pair: {0}")]
    Generation(String),

    #[error("failed to parse key material: {0}")]
    Parse(String),

    #[error("unsupported key type: expected an EC P-256 key")]
    UnsupportedKeyType,

    #[error("key has no key id")]
    MissingKeyId,

    #[error("failed to read key file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// JSON Web Key for an EC P-256 public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

/// Public verification key, addressable by key ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    kid: String,
    jwk: Jwk,
}

impl PublicKey {
    pub fn from_jwk(jwk: Jwk) -> Result<Self, KeyError> {
        if jwk.kty != "EC" || jwk.crv != "P-256" {
            return Err(KeyError::UnsupportedKeyType);
        }
        let kid = jwk.kid.clone().ok_or(KeyError::MissingKeyId)?;
        Ok(Self { kid, jwk })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    pub fn decoding_key(&self) -> Result<DecodingKey, KeyError> {
        DecodingKey::from_ec_components(&self.jwk.x, &self.jwk.y)
            .map_err(|e| KeyError::Parse(e.to_string()))
    }
}

/// Private signing key with its public JWK attached.
#[derive(Debug, Clone)]
pub struct PrivateKey {
    kid: String,
    pkcs8_pem: String,
    public: Jwk,
}

impl PrivateKey {
    /// Generate a fresh P-256 key pair.
    pub fn generate() -> Result<Self, KeyError> {
        let pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        Self::from_key_pair(pair)
    }

    /// Parse a PKCS#8 PEM private key. The key ID is re-derived from the
    /// public point, so a persisted key keeps its identity across restarts.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let pair = KeyPair::from_pem(pem).map_err(|e| KeyError::Parse(e.to_string()))?;
        Self::from_key_pair(pair)
    }

    fn from_key_pair(pair: KeyPair) -> Result<Self, KeyError> {
        let point = pair.public_key_raw();
        if point.len() != P256_POINT_LEN || point[0] != 0x04 {
            return Err(KeyError::UnsupportedKeyType);
        }

        let x = URL_SAFE_NO_PAD.encode(&point[1..33]);
        let y = URL_SAFE_NO_PAD.encode(&point[33..65]);
        let mut kid = URL_SAFE_NO_PAD.encode(&point[1..]);
        kid.truncate(KEY_ID_LEN);

        let public = Jwk {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x,
            y,
            kid: Some(kid.clone()),
            key_use: Some("sig".to_string()),
            alg: Some("ES256".to_string()),
        };

        Ok(Self {
            kid,
            pkcs8_pem: pair.serialize_pem(),
            public,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn pem(&self) -> &str {
        &self.pkcs8_pem
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            kid: self.kid.clone(),
            jwk: self.public.clone(),
        }
    }

    pub fn encoding_key(&self) -> Result<EncodingKey, KeyError> {
        EncodingKey::from_ec_pem(self.pkcs8_pem.as_bytes())
            .map_err(|e| KeyError::Parse(e.to_string()))
    }
}

/// Private-key provider backed by a single key file.
///
/// Loads the key from disk when present, otherwise generates one and persists
/// it so the same identity is served after a restart.
pub struct PresharedKeyProvider {
    key: PrivateKey,
}

impl PresharedKeyProvider {
    pub fn load_or_generate(key_file: &Path) -> Result<Self, KeyError> {
        let key = if key_file.exists() {
            let pem = fs::read_to_string(key_file).map_err(|source| KeyError::Io {
                path: key_file.display().to_string(),
                source,
            })?;
            let key = PrivateKey::from_pem(&pem)?;
            info!(path = %key_file.display(), kid = key.kid(), "Loaded signing key");
            key
        } else {
            let key = PrivateKey::generate()?;
            fs::write(key_file, key.pem()).map_err(|source| KeyError::Io {
                path: key_file.display().to_string(),
                source,
            })?;
            info!(path = %key_file.display(), kid = key.kid(), "Generated new signing key");
            key
        };

        Ok(Self { key })
    }

    pub fn from_key(key: PrivateKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl PrivateKeyProvider for PresharedKeyProvider {
    async fn private_key(&self) -> Result<PrivateKey, KeyError> {
        Ok(self.key.clone())
    }

    async fn stop(&self) {}
}
