//! Nonce generation and local single-use nonce storage.
//!
//! Every minted token carries a `jti` claim that the verifying side accepts
//! at most once before the token expires. The generator is deliberately a
//! fast, non-cryptographic PRNG seeded once per instance; the storage is an
//! in-memory map that purges expired entries on access.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::backends::NonceStorage;

/// Alphanumeric nonce generator backed by a `SmallRng` seeded at creation.
#[derive(Debug)]
pub struct NonceGenerator {
    rng: Mutex<SmallRng>,
    length: usize,
}

impl NonceGenerator {
    pub fn new(length: usize) -> Self {
        Self {
            rng: Mutex::new(SmallRng::from_entropy()),
            length,
        }
    }

    /// Generate a fresh alphanumeric nonce of the configured length.
    pub fn generate(&self) -> String {
        let mut rng = self.rng.lock().unwrap();
        (&mut *rng)
            .sample_iter(Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect()
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

/// In-memory nonce storage.
///
/// Remembers each verified `jti` until its expiry; expired entries are purged
/// whenever the store is consulted, so memory stays bounded by the number of
/// live tokens.
#[derive(Debug, Default)]
pub struct LocalNonceStorage {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LocalNonceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, nonce: &str, expiry: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let mut seen = self.seen.lock().unwrap();
        seen.retain(|_, exp| *exp > now);

        if seen.contains_key(nonce) {
            debug!(nonce, "nonce replayed");
            return false;
        }
        seen.insert(nonce.to_string(), expiry);
        true
    }
}

#[async_trait]
impl NonceStorage for LocalNonceStorage {
    async fn verify(&self, nonce: &str, expiry: DateTime<Utc>) -> bool {
        self.check(nonce, expiry)
    }

    async fn stop(&self) {}
}
