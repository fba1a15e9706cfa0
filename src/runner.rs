//! Orchestrator: builds one proxy instance per configured role and
//! coordinates startup, error propagation and shutdown.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use url::Url;

use crate::backends::{
    ClaimsVerifier, KeyServerManager, KeyServerReader, NonceStorage, PrivateKeyProvider,
    StaticIssuerVerifier, StopHandle,
};
use crate::config::{
    ClaimsVerifierConfig, Config, KeyServerConfig, NonceStorageConfig, PrivateKeyProviderConfig,
    SignerProxyConfig, VerifierProxyConfig,
};
use crate::handlers::{CookieHandler, SignerHandler, VerifierHandler, VerifierOptions};
use crate::jwt::SignerParams;
use crate::keys::PresharedKeyProvider;
use crate::keyserver::{InMemoryKeyCache, KeyPolicy, KeyRegistryClient};
use crate::nonce::LocalNonceStorage;
use crate::proxy::{ForwardProxy, ListenerConfig, Proxy, ReverseProxy, Router, SigningCa};

struct ProxyInstance {
    name: String,
    proxy: Arc<Proxy>,
    listener: ListenerConfig,
    stoppers: Vec<Arc<dyn StopHandle>>,
}

/// The whole application: every enabled proxy role from one configuration.
pub struct JwtProxy {
    instances: Vec<ProxyInstance>,
}

impl JwtProxy {
    pub async fn build(config: Config) -> Result<Self> {
        config.validate()?;

        let mut instances = Vec::new();
        if let Some(signer) = &config.signer_proxy {
            if signer.enabled {
                instances.push(build_signer(signer).await?);
            }
        }
        for (idx, verifier) in config.verifier_proxies.iter().enumerate() {
            if verifier.enabled {
                instances.push(build_verifier(verifier, idx)?);
            }
        }

        if instances.is_empty() {
            bail!("no proxy is enabled in the configuration");
        }
        Ok(Self { instances })
    }

    /// Run every proxy until the first failure or until `stop` is called.
    /// A failing instance stops all the others.
    pub async fn run(&self) -> Result<()> {
        let mut serving = JoinSet::new();
        for instance in &self.instances {
            let proxy = Arc::clone(&instance.proxy);
            let listener = instance.listener.clone();
            let name = instance.name.clone();
            serving.spawn(async move {
                let result = proxy.serve(&listener).await;
                (name, result)
            });
        }

        let mut failure = None;
        while let Some(joined) = serving.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(name, "proxy stopped"),
                Ok((name, Err(e))) => {
                    error!(name, error = %e, "proxy failed");
                    if failure.is_none() {
                        failure = Some(anyhow::anyhow!("{name}: {e}"));
                        self.stop().await;
                    }
                }
                Err(e) => warn!(error = %e, "proxy task aborted"),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn stop(&self) {
        for instance in &self.instances {
            instance.proxy.stop().await;
            for stopper in &instance.stoppers {
                stopper.stop().await;
            }
        }
    }
}

async fn build_signer(cfg: &SignerProxyConfig) -> Result<ProxyInstance> {
    let params = cfg.signer.params();

    let provider = match &cfg.signer.private_key {
        PrivateKeyProviderConfig::Preshared { key_file } => Arc::new(
            PresharedKeyProvider::load_or_generate(Path::new(key_file))
                .context("signer private key")?,
        ),
    };

    let mut stoppers: Vec<Arc<dyn StopHandle>> = Vec::new();
    if let Some(key_server) = &cfg.signer.key_server {
        let client = registry_client(key_server, params.clone())?;
        publish_signing_key(Arc::clone(&client), &*provider, &cfg.signer.issuer).await?;
        stoppers.push(client);
    }

    let ca = match (&cfg.ca_crt_file, &cfg.ca_key_file) {
        (Some(crt), Some(key)) => {
            Some(Arc::new(SigningCa::load(crt, key).context("signing CA")?))
        }
        _ => {
            warn!("no signing CA configured, CONNECT requests will be rejected");
            None
        }
    };

    let handler = Arc::new(SignerHandler::new(params, provider));
    let forward = Arc::new(ForwardProxy::new(
        handler,
        ca,
        &cfg.trusted_certificates,
        cfg.insecure_skip_verify,
    )?);

    Ok(ProxyInstance {
        name: "signer".to_string(),
        proxy: Arc::new(Proxy::new(forward, cfg.shutdown_timeout())),
        listener: cfg.listener(),
        stoppers,
    })
}

/// Publish the signer's public key and log the asynchronous outcome. The
/// approval may take a while, so the proxy starts serving while the result
/// is still pending.
async fn publish_signing_key(
    client: Arc<KeyRegistryClient>,
    provider: &PresharedKeyProvider,
    issuer: &str,
) -> Result<()> {
    let key = provider.private_key().await.context("signing key")?;
    let result = client
        .publish_public_key(&key.public_key(), &KeyPolicy::default(), &key)
        .await;

    let issuer = issuer.to_string();
    let kid = key.kid().to_string();
    tokio::spawn(async move {
        match result.wait().await {
            Ok(()) => info!(issuer, kid, "signing key published"),
            Err(e) => warn!(issuer, kid, error = %e, "signing key publication failed"),
        }
        // The client must outlive its publish worker.
        drop(client);
    });

    Ok(())
}

fn build_verifier(cfg: &VerifierProxyConfig, idx: usize) -> Result<ProxyInstance> {
    let vcfg = &cfg.verifier;

    // The verifier's registry client only reads keys; its self-signing
    // parameters are never exercised.
    let reader_params = SignerParams {
        issuer: String::new(),
        expiration: chrono::Duration::minutes(5),
        max_skew: chrono::Duration::minutes(1),
        nonce_length: 32,
    };
    let client = registry_client(&vcfg.key_server, reader_params)?;

    let nonces: Arc<dyn NonceStorage> = match vcfg.nonce_storage {
        NonceStorageConfig::Local => Arc::new(LocalNonceStorage::new()),
    };

    let claims_verifiers: Vec<Arc<dyn ClaimsVerifier>> = vcfg
        .claims_verifiers
        .iter()
        .map(|verifier| match verifier {
            ClaimsVerifierConfig::StaticIssuers { issuers } => {
                Arc::new(StaticIssuerVerifier::new(issuers.clone())) as Arc<dyn ClaimsVerifier>
            }
        })
        .collect();

    let excludes = vcfg
        .excludes
        .iter()
        .map(|pattern| Regex::new(pattern))
        .collect::<Result<Vec<_>, _>>()
        .context("exclude patterns")?;

    let reader: Arc<dyn KeyServerReader> = client.clone();
    let stopper: Arc<dyn StopHandle> = client;
    let verifier = Arc::new(VerifierHandler::new(
        VerifierOptions {
            audience: vcfg.audience.clone(),
            cookies_enabled: vcfg.cookies_enabled,
            max_skew: chrono::Duration::seconds(vcfg.max_skew_secs),
            max_ttl: chrono::Duration::seconds(vcfg.max_ttl_secs),
            public_base_path: vcfg.public_base_path.clone(),
            auth_redirect: vcfg.auth_redirect.clone(),
        },
        reader,
        nonces,
        claims_verifiers,
        vec![stopper],
    ));
    let cookie = Arc::new(CookieHandler::new(
        vcfg.cookies_enabled,
        vcfg.cookie_path.clone(),
        vcfg.auth_redirect.clone(),
    ));
    let router = Router::new(&vcfg.upstream)?;
    let reverse = Arc::new(ReverseProxy::new(
        verifier,
        cookie,
        router,
        excludes,
        vcfg.cookie_path.clone(),
    ));

    Ok(ProxyInstance {
        name: format!("verifier-{idx}"),
        proxy: Arc::new(Proxy::new(reverse, cfg.shutdown_timeout())),
        listener: cfg.listener(),
        stoppers: Vec::new(),
    })
}

fn registry_client(
    cfg: &KeyServerConfig,
    params: SignerParams,
) -> Result<Arc<KeyRegistryClient>> {
    match cfg {
        KeyServerConfig::Registry { registry, cache } => {
            let url = Url::parse(registry).context("registry URL")?;
            let cache = Arc::new(InMemoryKeyCache::new(
                cache.capacity,
                std::time::Duration::from_secs(cache.ttl_secs),
            ));
            Ok(Arc::new(KeyRegistryClient::new(&url, params, cache)?))
        }
    }
}
