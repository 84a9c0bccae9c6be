pub mod config;
pub mod infisical;
pub mod nats;
pub mod state;
pub mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use async_nats::{Client, ConnectOptions};
use secrets_core::{IdentityValidator, Orchestrator};
use tracing::{info, warn};

pub use config::{BrokerConfig, ConfigError};
pub use infisical::InfisicalStore;
pub use state::{AppState, SharedStore, Subjects};
pub use telemetry::CorrelationId;

const CLIENT_NAME: &str = "xkey-secrets-broker";

pub async fn run(config: BrokerConfig) -> anyhow::Result<()> {
    let store = InfisicalStore::new(config.infisical.clone())?;
    store
        .verify_login()
        .await
        .context("failed to authenticate with infisical")?;

    let state = build_state(&config, Arc::new(store))?;
    info!(
        server_xkey = %state.orchestrator.server_xkey(),
        "service key pair ready"
    );

    info!(nats_url = %config.nats.url, "connecting to nats");
    let client = connect(&config).await?;

    tokio::select! {
        result = nats::run(client.clone(), state) => result?,
        _ = shutdown_signal() => info!("shutdown signal received"),
    }

    if let Err(err) = client.flush().await {
        warn!(error = %err, "failed to flush nats connection on shutdown");
    }
    Ok(())
}

/// Assemble shared request state. Trust anchors are read here, once.
pub fn build_state(config: &BrokerConfig, store: SharedStore) -> anyhow::Result<AppState> {
    let anchors = config
        .trust_anchors()
        .context("failed to load caller trust anchors")?;
    info!(anchors = anchors.len(), "loaded caller trust anchors");
    let validator = IdentityValidator::new(anchors).with_clock_skew(config.auth.clock_skew);

    let orchestrator = Orchestrator::with_policy(
        Arc::new(config.service_keys()),
        Arc::new(validator),
        store,
        config.access_policy(),
    )
    .with_defaults(config.store_defaults())
    .with_store_timeout(config.store_timeout);

    Ok(AppState::new(
        Arc::new(orchestrator),
        Subjects {
            get: config.get_subject(),
            server_xkey: config.server_xkey_subject(),
        },
    ))
}

async fn connect(config: &BrokerConfig) -> anyhow::Result<Client> {
    let options = match &config.nats.creds_file {
        Some(path) => ConnectOptions::with_credentials_file(path.clone())
            .await
            .with_context(|| format!("failed to read nats credentials {}", path.display()))?,
        None => ConnectOptions::new(),
    };
    options
        .name(CLIENT_NAME)
        .connect(config.nats.url.as_str())
        .await
        .with_context(|| format!("failed to connect to nats at {}", config.nats.url))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(?err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(?err, "failed to install sigterm handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
