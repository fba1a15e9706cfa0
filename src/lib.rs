//! jwtproxy - JWT authentication proxy for service-to-service HTTP traffic
//!
//! jwtproxy authenticates HTTP traffic between services without modifying
//! the services themselves. It runs two roles from one binary:
//!
//! - **Signer (forward proxy)**: a MITM-capable CONNECT proxy that stamps
//!   every outbound request with a freshly minted JWT bound to its
//!   destination. HTTPS is terminated with per-host certificates signed by a
//!   configured CA; without a CA, CONNECT is rejected rather than tunneled.
//! - **Verifier (reverse proxy)**: sits in front of an upstream service and
//!   validates inbound JWTs (signature, claims, single-use nonce), then
//!   forwards, rejects with 403, or redirects browser clients to an
//!   authentication service.
//!
//! Public keys are distributed through a remote key registry; the signer
//! publishes its key there (with an asynchronous approval workflow) and
//! verifiers fetch keys through a read-through cache.
//!
//! ## Architecture
//!
//! - `jwt` - token minting and ordered claim validation
//! - `keys` - ES256 key material, JWK bridging, preshared provider
//! - `keyserver` - registry client (reader, manager, cache)
//! - `nonce` - nonce generation and local single-use storage
//! - `backends` - pluggable backend contracts
//! - `handlers` - signer / verifier / cookie-auth request transforms
//! - `proxy` - forward and reverse engines, listeners, signing CA
//! - `config` - configuration surface with explicit factory tables
//! - `runner` - orchestrator building and supervising proxy instances

pub mod backends;
pub mod config;
pub mod handlers;
pub mod jwt;
pub mod keys;
pub mod keyserver;
pub mod nonce;
pub mod proxy;
pub mod runner;

pub use config::Config;
pub use jwt::{Claims, Signer, SignerParams, ValidationError};
pub use keys::{Jwk, PrivateKey, PublicKey};
pub use keyserver::{KeyPolicy, KeyRegistryClient, PublishResult, RegistryError};
pub use proxy::{ForwardProxy, Proxy, ReverseProxy, SigningCa};
pub use runner::JwtProxy;
