//! Signing CA for MITM interception.
//!
//! Terminating a CONNECT tunnel requires presenting a certificate for the
//! requested host. The CA signs a fresh leaf per host on demand and caches
//! the resulting rustls server config; the CA certificate itself is loaded
//! from the configured files (clients must trust it) or generated for tests
//! and first-run setups.

use std::fs;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Generated per-host configs kept around for connection churn.
const CERT_CACHE_SIZE: usize = 1024;

/// Leaf validity window in days.
const LEAF_VALIDITY_DAYS: i64 = 90;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("failed to load CA material: {0}")]
    Load(String),

    #[error("failed to generate certificate for {host}: {reason}")]
    Generation { host: String, reason: String },

    #[error("TLS configuration failed: {0}")]
    Tls(String),
}

pub struct SigningCa {
    issuer_cert: rcgen::Certificate,
    issuer_key: KeyPair,
    ca_der: CertificateDer<'static>,
    configs: Mutex<LruCache<String, Arc<ServerConfig>>>,
}

impl SigningCa {
    /// Load the CA certificate and private key from PEM files.
    pub fn load(crt_file: &str, key_file: &str) -> Result<Self, CaError> {
        let cert_pem = fs::read_to_string(crt_file)
            .map_err(|e| CaError::Load(format!("unable to read {crt_file}: {e}")))?;
        let key_pem = fs::read_to_string(key_file)
            .map_err(|e| CaError::Load(format!("unable to read {key_file}: {e}")))?;
        let ca = Self::from_pem(&cert_pem, &key_pem)?;
        info!(crt_file, key_file, "loaded signing CA");
        Ok(ca)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let issuer_key =
            KeyPair::from_pem(key_pem).map_err(|e| CaError::Load(format!("CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| CaError::Load(format!("CA certificate: {e}")))?;
        // Re-signing with the CA's own key yields the same subject and key
        // identity, which is all leaf signing needs. The chain presented to
        // clients carries the on-disk certificate.
        let issuer_cert = params
            .self_signed(&issuer_key)
            .map_err(|e| CaError::Load(format!("CA certificate: {e}")))?;

        let ca_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::Load("no certificate found in CA file".to_string()))?
            .map_err(|e| CaError::Load(format!("CA certificate: {e}")))?;

        Ok(Self {
            issuer_cert,
            issuer_key,
            ca_der,
            configs: Mutex::new(LruCache::new(NonZeroUsize::new(CERT_CACHE_SIZE).unwrap())),
        })
    }

    /// Generate a fresh self-signed CA.
    pub fn generate() -> Result<Self, CaError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::Load(format!("CA key generation: {e}")))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CaError::Load(e.to_string()))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "jwtproxy signing CA");
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);

        let cert = params
            .self_signed(&key)
            .map_err(|e| CaError::Load(format!("CA self-sign: {e}")))?;
        let ca_der = cert.der().clone();

        Ok(Self {
            issuer_cert: cert,
            issuer_key: key,
            ca_der,
            configs: Mutex::new(LruCache::new(NonZeroUsize::new(CERT_CACHE_SIZE).unwrap())),
        })
    }

    /// Persist the CA pair, so clients can be provisioned with the
    /// certificate and later runs reuse the same root.
    pub fn save(&self, crt_file: &str, key_file: &str) -> Result<(), CaError> {
        fs::write(crt_file, self.issuer_cert.pem())
            .map_err(|e| CaError::Load(format!("unable to write {crt_file}: {e}")))?;
        fs::write(key_file, self.issuer_key.serialize_pem())
            .map_err(|e| CaError::Load(format!("unable to write {key_file}: {e}")))?;
        Ok(())
    }

    pub fn ca_pem(&self) -> String {
        self.issuer_cert.pem()
    }

    /// TLS server config presenting a leaf for `host`, generating and
    /// caching it on first use.
    pub async fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        {
            let mut configs = self.configs.lock().await;
            if let Some(config) = configs.get(host) {
                debug!(host, "certificate cache hit");
                return Ok(Arc::clone(config));
            }
        }

        debug!(host, "generating certificate");
        let config = Arc::new(self.leaf_config(host)?);

        let mut configs = self.configs.lock().await;
        configs.put(host.to_string(), Arc::clone(&config));
        Ok(config)
    }

    fn leaf_config(&self, host: &str) -> Result<ServerConfig, CaError> {
        let generation = |e: &dyn std::fmt::Display| CaError::Generation {
            host: host.to_string(),
            reason: e.to_string(),
        };

        let leaf_key =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| generation(&e))?;

        let mut params =
            CertificateParams::new(vec![host.to_string()]).map_err(|e| generation(&e))?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after =
            time::OffsetDateTime::now_utc() + time::Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&leaf_key, &self.issuer_cert, &self.issuer_key)
            .map_err(|e| generation(&e))?;

        let chain = vec![cert.der().clone(), self.ca_der.clone()];
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key_der)
            .map_err(|e| CaError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }
}
