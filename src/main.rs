use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use jwtproxy::config::Config;
use jwtproxy::runner::JwtProxy;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("JWTPROXY_CONFIG").ok())
        .context("usage: jwtproxy <config.yaml> (or set JWTPROXY_CONFIG)")?;

    let config = Config::from_yaml_file(&config_path)
        .with_context(|| format!("loading {config_path}"))?;
    let app = Arc::new(JwtProxy::build(config).await?);

    {
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            app.stop().await;
        });
    }

    app.run().await
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}
