//! Configuration surface.
//!
//! The structures mirror the deployment file: one optional signer proxy and
//! any number of verifier proxies, each carrying its backend selections as
//! explicit tagged factory tables. Validation is eager: a bad configuration
//! fails at startup, never at request time.

use std::fs;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::jwt::SignerParams;
use crate::proxy::ListenerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub signer_proxy: Option<SignerProxyConfig>,
    pub verifier_proxies: Vec<VerifierProxyConfig>,
}

impl Config {
    pub fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(signer) = &self.signer_proxy {
            signer.validate()?;
        }
        for verifier in &self.verifier_proxies {
            verifier.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerProxyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub listen_addr: String,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub ca_key_file: Option<String>,
    #[serde(default)]
    pub ca_crt_file: Option<String>,
    #[serde(default)]
    pub trusted_certificates: Vec<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    pub signer: SignerConfig,
}

impl SignerProxyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.is_empty() {
            return Err(ConfigError::Invalid(
                "signer_proxy.listen_addr must not be empty".to_string(),
            ));
        }
        if self.ca_crt_file.is_some() != self.ca_key_file.is_some() {
            return Err(ConfigError::Invalid(
                "ca_crt_file and ca_key_file must be configured together".to_string(),
            ));
        }
        if self.signer.issuer.is_empty() {
            return Err(ConfigError::Invalid(
                "signer.issuer must not be empty".to_string(),
            ));
        }
        if let Some(key_server) = &self.signer.key_server {
            key_server.validate()?;
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            addr: self.listen_addr.clone(),
            crt_file: None,
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub issuer: String,
    #[serde(default = "default_expiration")]
    pub expiration_secs: i64,
    #[serde(default = "default_max_skew")]
    pub max_skew_secs: i64,
    #[serde(default = "default_nonce_length")]
    pub nonce_length: usize,
    pub private_key: PrivateKeyProviderConfig,
    #[serde(default)]
    pub key_server: Option<KeyServerConfig>,
}

impl SignerConfig {
    pub fn params(&self) -> SignerParams {
        SignerParams {
            issuer: self.issuer.clone(),
            expiration: chrono::Duration::seconds(self.expiration_secs),
            max_skew: chrono::Duration::seconds(self.max_skew_secs),
            nonce_length: self.nonce_length,
        }
    }
}

/// Private-key provider factory table.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrivateKeyProviderConfig {
    Preshared { key_file: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifierProxyConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub listen_addr: String,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub crt_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    pub verifier: VerifierConfig,
}

impl VerifierProxyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.is_empty() {
            return Err(ConfigError::Invalid(
                "verifier_proxies[].listen_addr must not be empty".to_string(),
            ));
        }
        if self.crt_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::Invalid(
                "crt_file and key_file must be configured together".to_string(),
            ));
        }
        if self.verifier.upstream.is_empty() {
            return Err(ConfigError::Invalid(
                "verifier.upstream must not be empty".to_string(),
            ));
        }
        for exclude in &self.verifier.excludes {
            regex::Regex::new(exclude).map_err(|e| {
                ConfigError::Invalid(format!("invalid exclude pattern {exclude:?}: {e}"))
            })?;
        }
        if !self.verifier.auth_redirect.is_empty() {
            Url::parse(&self.verifier.auth_redirect)
                .map_err(|e| ConfigError::Invalid(format!("invalid auth_redirect: {e}")))?;
        }
        self.verifier.key_server.validate()?;
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            addr: self.listen_addr.clone(),
            crt_file: self.crt_file.clone(),
            key_file: self.key_file.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifierConfig {
    pub upstream: String,
    #[serde(default)]
    pub audience: String,
    #[serde(default)]
    pub cookies_enabled: bool,
    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,
    #[serde(default)]
    pub auth_redirect: String,
    #[serde(default = "default_max_skew")]
    pub max_skew_secs: i64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_secs: i64,
    pub key_server: KeyServerConfig,
    #[serde(default)]
    pub nonce_storage: NonceStorageConfig,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub claims_verifiers: Vec<ClaimsVerifierConfig>,
    #[serde(default)]
    pub public_base_path: String,
}

/// Key-server factory table.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyServerConfig {
    Registry {
        registry: String,
        #[serde(default)]
        cache: CacheConfig,
    },
}

impl KeyServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Registry { registry, .. } => {
                Url::parse(registry)
                    .map_err(|e| ConfigError::Invalid(format!("invalid registry URL: {e}")))?;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            ttl_secs: 300,
        }
    }
}

/// Nonce-storage factory table.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NonceStorageConfig {
    #[default]
    Local,
}

/// Claims-verifier factory table.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaimsVerifierConfig {
    StaticIssuers { issuers: Vec<String> },
}

fn default_enabled() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    60
}

fn default_expiration() -> i64 {
    300
}

fn default_max_skew() -> i64 {
    60
}

fn default_max_ttl() -> i64 {
    300
}

fn default_nonce_length() -> usize {
    32
}

fn default_cookie_path() -> String {
    "/jwt/auth".to_string()
}
