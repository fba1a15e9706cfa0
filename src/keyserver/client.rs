//! HTTP client for the remote key registry.
//!
//! The client is both a reader (public key lookup, cached) and a manager
//! (publication with approval polling, deletion). Mutating calls authenticate
//! themselves with a JWT minted for the registry, so the client is a consumer
//! of the same codec it distributes keys for.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::backends::{KeyServerManager, KeyServerReader, StopHandle};
use crate::jwt::{Signer, SignerParams};
use crate::keys::{Jwk, PrivateKey, PublicKey};
use crate::keyserver::{KeyCache, KeyPolicy, PublishResult, RegistryError};

/// Cadence of the approval poll after a 202 response.
const APPROVAL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on any single registry round trip, so shutdown and
/// cancellation are never starved by a hung request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KeyRegistryClient {
    base: String,
    audience: String,
    issuer: String,
    http: reqwest::Client,
    cache: Arc<dyn KeyCache>,
    signer: Arc<Signer>,
    shutdown: watch::Sender<bool>,
    tracker: StdMutex<Option<mpsc::Sender<()>>>,
    drained: StdMutex<Option<mpsc::Receiver<()>>>,
}

impl KeyRegistryClient {
    /// `registry` is the base URL of the trust service; `params` drive the
    /// self-signed tokens attached to mutating calls.
    pub fn new(
        registry: &Url,
        params: SignerParams,
        cache: Arc<dyn KeyCache>,
    ) -> Result<Self, RegistryError> {
        let mut audience = format!(
            "{}://{}",
            registry.scheme(),
            registry.host_str().unwrap_or_default()
        );
        if let Some(port) = registry.port() {
            audience.push_str(&format!(":{port}"));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let (shutdown, _) = watch::channel(false);
        let (track_tx, track_rx) = mpsc::channel(1);

        Ok(Self {
            base: registry.as_str().trim_end_matches('/').to_string(),
            audience,
            issuer: params.issuer.clone(),
            http,
            cache,
            signer: Arc::new(Signer::new(params)),
            shutdown,
            tracker: StdMutex::new(Some(track_tx)),
            drained: StdMutex::new(Some(track_rx)),
        })
    }

    fn key_url(&self, issuer: &str, kid: &str) -> String {
        format!("{}/services/{}/keys/{}", self.base, issuer, kid)
    }

    /// A clone of the in-flight tracker, or `None` once shutdown started.
    fn track(&self) -> Option<mpsc::Sender<()>> {
        self.tracker.lock().unwrap().clone()
    }

    async fn fetch_public_key(&self, issuer: &str, kid: &str) -> Result<PublicKey, RegistryError> {
        let resp = self.http.get(self.key_url(issuer, kid)).send().await?;
        match resp.status().as_u16() {
            200 => {
                let jwk: Jwk = resp.json().await?;
                Ok(PublicKey::from_jwk(jwk)?)
            }
            404 => Err(RegistryError::UnknownKey {
                issuer: issuer.to_string(),
                kid: kid.to_string(),
            }),
            403 => Err(RegistryError::ExpiredKey {
                issuer: issuer.to_string(),
                kid: kid.to_string(),
            }),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(RegistryError::Unexpected { status, body })
            }
        }
    }
}

/// Query parameters announcing the requested key policy.
fn publish_query(policy: &KeyPolicy) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(expiration) = policy.expiration {
        query.push(("expiration", expiration.timestamp().to_string()));
    }
    if let Some(rotation) = policy.rotation {
        query.push(("rotation", rotation.num_seconds().to_string()));
    }
    query
}

/// PUT the key, then poll for approval while the registry answers 202/409.
/// Runs inside a select race, so every await point here is a cancellation
/// point for the caller and for process shutdown.
async fn publish_and_poll(
    http: reqwest::Client,
    put_url: String,
    poll_url: String,
    query: Vec<(&'static str, String)>,
    token: String,
    jwk: Jwk,
) -> Result<(), RegistryError> {
    let resp = http
        .put(&put_url)
        .query(&query)
        .bearer_auth(&token)
        .json(&jwk)
        .send()
        .await?;

    match resp.status().as_u16() {
        200 => Ok(()),
        202 => {
            debug!(url = %put_url, "key accepted, polling for approval");
            let mut ticker = tokio::time::interval(APPROVAL_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                match approval_status(&http, &poll_url).await {
                    Ok(()) => return Ok(()),
                    Err(RegistryError::PendingApproval) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        status => {
            let body = resp.text().await.unwrap_or_default();
            Err(RegistryError::Unexpected { status, body })
        }
    }
}

async fn approval_status(http: &reqwest::Client, url: &str) -> Result<(), RegistryError> {
    let resp = http.get(url).send().await?;
    match resp.status().as_u16() {
        200 => Ok(()),
        409 => Err(RegistryError::PendingApproval),
        404 => {
            let (issuer, kid) = issuer_kid_of(url);
            Err(RegistryError::UnknownKey { issuer, kid })
        }
        status => {
            let body = resp.text().await.unwrap_or_default();
            Err(RegistryError::Unexpected { status, body })
        }
    }
}

fn issuer_kid_of(url: &str) -> (String, String) {
    let mut segments = url.rsplit('/');
    let kid = segments.next().unwrap_or_default().to_string();
    segments.next();
    let issuer = segments.next().unwrap_or_default().to_string();
    (issuer, kid)
}

#[async_trait]
impl KeyServerReader for KeyRegistryClient {
    async fn get_public_key(&self, issuer: &str, kid: &str) -> Result<PublicKey, RegistryError> {
        if let Some(key) = self.cache.get(issuer, kid).await {
            debug!(issuer, kid, "public key cache hit");
            return Ok(key);
        }

        let key = self.fetch_public_key(issuer, kid).await?;
        self.cache.set(issuer, kid, key.clone()).await;
        Ok(key)
    }
}

#[async_trait]
impl KeyServerManager for KeyRegistryClient {
    async fn publish_public_key(
        &self,
        key: &PublicKey,
        policy: &KeyPolicy,
        signing_key: &PrivateKey,
    ) -> PublishResult {
        let Some(permit) = self.track() else {
            return PublishResult::resolved(Err(RegistryError::Aborted));
        };
        if *self.shutdown.borrow() {
            return PublishResult::resolved(Err(RegistryError::Aborted));
        }

        let token = match self.signer.mint(&self.audience, signing_key) {
            Ok(token) => token,
            Err(e) => return PublishResult::resolved(Err(e.into())),
        };

        let url = self.key_url(&self.issuer, key.kid());
        let query = publish_query(policy);
        let jwk = key.jwk().clone();
        let http = self.http.clone();
        let mut shutdown = self.shutdown.subscribe();

        let (out_tx, out_rx) = oneshot::channel();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let result = PublishResult::new(out_rx, cancel_tx);

        let kid = key.kid().to_string();
        tokio::spawn(async move {
            let _permit = permit;

            // Three-way race: the publish workflow itself, caller
            // cancellation, and process-wide shutdown. First ready wins.
            let outcome = tokio::select! {
                res = publish_and_poll(http, url.clone(), url.clone(), query, token, jwk) => res,
                _ = &mut cancel_rx => Err(RegistryError::Canceled),
                _ = shutdown.wait_for(|stopped| *stopped) => Err(RegistryError::Aborted),
            };

            match &outcome {
                Ok(()) => info!(kid, "published public key"),
                Err(e) => warn!(kid, error = %e, "key publication did not complete"),
            }
            let _ = out_tx.send(outcome);
        });

        result
    }

    async fn verify_public_key(&self, issuer: &str, kid: &str) -> Result<(), RegistryError> {
        approval_status(&self.http, &self.key_url(issuer, kid)).await
    }

    async fn delete_public_key(&self, signing_key: &PrivateKey) -> Result<(), RegistryError> {
        let Some(_permit) = self.track() else {
            return Err(RegistryError::Aborted);
        };

        let token = self.signer.mint(&self.audience, signing_key)?;
        let url = self.key_url(&self.issuer, signing_key.kid());
        let resp = self.http.delete(&url).bearer_auth(&token).send().await?;

        match resp.status().as_u16() {
            204 => {
                info!(kid = signing_key.kid(), "deleted public key");
                Ok(())
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(RegistryError::Unexpected { status, body })
            }
        }
    }

    /// Signal shutdown, wait for in-flight publish/delete tasks, then stop
    /// the cache. Idempotent; pending approval polls unblock within one poll
    /// interval.
    async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let tracker = self.tracker.lock().unwrap().take();
        drop(tracker);

        let drained = self.drained.lock().unwrap().take();
        if let Some(mut drained) = drained {
            // Resolves once every task clone of the tracker is dropped.
            let _ = drained.recv().await;
        }

        self.cache.stop().await;
    }
}

#[async_trait]
impl StopHandle for KeyRegistryClient {
    async fn stop(&self) {
        KeyServerManager::stop(self).await;
    }
}
