// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Warden: credential broker for autonomous agents.

pub mod audit;
pub mod config;
pub mod device;
pub mod error;
pub mod flow;
pub mod grant;
pub mod oauth;
pub mod persist;
pub mod provider;
pub mod revoke;
pub mod state;
pub mod test_support;
pub mod transport;
pub mod vault;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::audit::storage::{AuditStorage, FileStorage, MemoryStorage};
use crate::audit::AuditChain;
use crate::config::Config;
use crate::flow::FlowSettings;
use crate::grant::notify::{spawn_notifier, LogNotifier, Notifier, WebhookNotifier};
use crate::grant::GrantStore;
use crate::provider::ProviderRegistry;
use crate::state::{AppParts, AppState};
use crate::transport::build_router;
use crate::vault::CredentialVault;

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Open the stores, load providers and start the background tasks.
pub async fn prepare(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Arc<AppState>> {
    let client = reqwest::Client::builder().timeout(config.http_timeout()).build()?;
    let (grant_tx, _) = broadcast::channel(crate::grant::EVENT_CAPACITY);

    let (vault, grants, storage, key): (_, _, Arc<dyn AuditStorage>, _) = if config.ephemeral {
        let key = match config.audit_key {
            Some(ref key) => key.as_bytes().to_vec(),
            None => crate::oauth::pkce::generate_state().into_bytes(),
        };
        info!("ephemeral mode: nothing is written to disk");
        (
            CredentialVault::in_memory(),
            GrantStore::in_memory(grant_tx),
            Arc::new(MemoryStorage::new()),
            key,
        )
    } else {
        let dir = config.state_dir();
        crate::persist::ensure_private_dir(&dir)?;
        info!(state_dir = %dir.display(), "opening state");
        (
            CredentialVault::open(dir.join("credentials.json"))?,
            GrantStore::open(dir.join("grants.json"), grant_tx)?,
            Arc::new(FileStorage::new(dir.join("audit.jsonl"))?),
            crate::audit::key::load_or_create(config.audit_key.as_deref(), &dir)?,
        )
    };
    let audit = AuditChain::open(storage, &key)?;

    let providers = match config.providers {
        Some(ref path) => ProviderRegistry::load(path, &client)?,
        None => ProviderRegistry::new(),
    };
    info!(providers = ?providers.services(), "providers loaded");

    let grants = Arc::new(grants);
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(ref url) = config.notify_webhook {
        notifiers.push(Arc::new(WebhookNotifier::new(client.clone(), url.clone())));
    }
    spawn_notifier(notifiers, config.dashboard_url.clone(), grants.subscribe(), shutdown.clone());

    let parts = AppParts {
        vault: Arc::new(vault),
        grants,
        audit: Arc::new(audit),
        providers,
        client,
        flow: FlowSettings { redirect_uri: config.callback_url(), call_timeout: config.http_timeout() },
        auth_token: config.auth_token.clone(),
        principal: config.principal.clone(),
    };
    Ok(Arc::new(AppState::new(parts, shutdown)))
}

/// Run the broker until SIGTERM or SIGINT.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();
    let state = prepare(&config, shutdown.clone()).await?;

    {
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

            tokio::select! {
                _ = async {
                    if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGTERM"),
                _ = async {
                    if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGINT"),
            }
            sd.cancel();
        });
    }

    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    info!("warden listening on {}", listener.local_addr()?);
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("warden stopped");
    Ok(())
}
