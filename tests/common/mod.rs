//! Shared test support: a scriptable HTTP server and an in-memory key
//! server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use jwtproxy::backends::KeyServerReader;
use jwtproxy::keys::{PrivateKey, PublicKey};
use jwtproxy::RegistryError;

pub type ScriptedHandler =
    Arc<dyn Fn(&http::Method, &http::Uri, &http::HeaderMap) -> Response<Full<Bytes>> + Send + Sync>;

/// Serve a scripted handler on an ephemeral port for the rest of the test.
pub async fn spawn_server(handler: ScriptedHandler) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = Arc::clone(&handler);
                    async move {
                        Ok::<_, Infallible>(handler(req.method(), req.uri(), req.headers()))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

pub fn text_response(status: u16, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Key server serving a fixed issuer/kid table.
pub struct StaticKeyServer {
    keys: HashMap<(String, String), PublicKey>,
}

impl StaticKeyServer {
    pub fn with(issuer: &str, key: &PrivateKey) -> Self {
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
    async fn get_public_key(&self, issuer: &str, kid: &str) -> Result<PublicKey, RegistryError> {
        self.keys
            .get(&(issuer.to_string(), kid.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownKey {
                issuer: issuer.to_string(),
                kid: kid.to_string(),
            })
    }
}
