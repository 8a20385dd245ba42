// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;
use crate::audit::storage::MemoryStorage;
use crate::audit::AuditFilter;
use crate::grant::GrantRequest;
use crate::provider::{OAuthConfig, OAuthProvider};
use crate::state::AppState;
use crate::test_support::{http_client, unrecorded, MockOAuthServer, StateBuilder};
use crate::vault::CredentialData;

fn state_with(config: OAuthConfig) -> anyhow::Result<Arc<AppState>> {
    let provider = OAuthProvider::new("github", config, http_client())?;
    StateBuilder::new().provider("github", Arc::new(provider)).build()
}

async fn approved_grant(state: &AppState, service: &str) -> anyhow::Result<Grant> {
    let request = GrantRequest {
        service: service.to_owned(),
        scopes: vec!["repo".to_owned()],
        ..Default::default()
    };
    let grant = state.grants.create(request, "agent-1", "owner", unrecorded).await?;
    let flows = Arc::clone(&state.flows);
    state
        .grants
        .approve(&grant.id, "owner", |g| flows.oauth_capable(&g.service), unrecorded)
        .await?
        .ok_or_else(|| anyhow::anyhow!("grant was not pending"))
}

/// Poll `check` every 50ms until it holds or `within` elapses.
async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

fn access_token(data: &CredentialData) -> Option<&str> {
    match data {
        CredentialData::Oauth { access_token, .. } => Some(access_token),
        _ => None,
    }
}

#[tokio::test]
async fn redirect_flow_exchanges_code_and_stores_credential() -> anyhow::Result<()> {
    let server = MockOAuthServer::start().await?;
    let state = state_with(server.oauth_config())?;
    let grant = approved_grant(&state, "github").await?;
    let oauth_state = grant.oauth_state.clone().ok_or_else(|| anyhow::anyhow!("no oauth_state"))?;

    let start = state.flows.begin(&grant, &AuditContext::system()).await?;
    let oauth_url = match start {
        FlowStart::OauthUrl { oauth_url } => oauth_url,
        other => anyhow::bail!("expected a redirect flow, got {other:?}"),
    };
    assert!(oauth_url.starts_with(&server.url("/authorize?client_id=test-client&")));
    assert!(oauth_url.contains(&format!("state={oauth_state}")));
    assert!(oauth_url.contains("code_challenge_method=S256"));

    let completed = state.flows.complete(&oauth_state, "good-code", &AuditContext::system()).await?;
    assert_eq!(completed.id, grant.id);

    let stored = state.vault.get("github").await?;
    assert_eq!(access_token(&stored.data), Some("redirect-token"));
    assert_eq!(stored.expires_at, None);

    let entries = state.audit.query(&AuditFilter::default())?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::CredentialStored);
    assert_eq!(entries[0].resource_id.as_deref(), Some(grant.id.as_str()));
    assert_eq!(entries[0].metadata.clone().unwrap_or_default()["flow"], "auth_code");

    // A state is single-use.
    let replay = state.flows.complete(&oauth_state, "good-code", &AuditContext::system()).await;
    assert!(matches!(replay, Err(FlowError::UnknownState)));
    Ok(())
}

#[tokio::test]
async fn unknown_state_is_rejected() -> anyhow::Result<()> {
    let server = MockOAuthServer::start().await?;
    let state = state_with(server.oauth_config())?;
    let result = state.flows.complete("forged", "good-code", &AuditContext::system()).await;
    assert!(matches!(result, Err(FlowError::UnknownState)));
    assert_eq!(server.token_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn rejected_code_surfaces_provider_error() -> anyhow::Result<()> {
    let server = MockOAuthServer::start().await?;
    let state = state_with(server.oauth_config())?;
    let grant = approved_grant(&state, "github").await?;
    let oauth_state = grant.oauth_state.clone().unwrap_or_default();
    state.flows.begin(&grant, &AuditContext::system()).await?;

    let result = state.flows.complete(&oauth_state, "bad-code", &AuditContext::system()).await;

    assert!(matches!(result, Err(FlowError::Provider(_))));
    assert!(state.vault.is_empty().await);
    assert!(state.audit.query(&AuditFilter::default())?.is_empty());
    Ok(())
}

#[tokio::test]
async fn callback_after_revoke_stores_nothing() -> anyhow::Result<()> {
    let server = MockOAuthServer::start().await?;
    let state = state_with(server.oauth_config())?;
    let grant = approved_grant(&state, "github").await?;
    let oauth_state = grant.oauth_state.clone().unwrap_or_default();
    state.flows.begin(&grant, &AuditContext::system()).await?;

    state.grants.revoke("github").await?;
    let result = state.flows.complete(&oauth_state, "good-code", &AuditContext::system()).await;

    // Either the supervisor already dropped the pending auth or the grant
    // check caught it; both refuse the exchange.
    assert!(matches!(result, Err(FlowError::UnknownState | FlowError::GrantNotApproved)));
    assert!(state.vault.is_empty().await);
    assert_eq!(server.token_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn service_without_provider_is_manual() -> anyhow::Result<()> {
    let state = StateBuilder::new().build()?;
    let grant = approved_grant(&state, "openai").await?;
    assert_eq!(grant.oauth_state, None);

    let start = state.flows.begin(&grant, &AuditContext::system()).await?;
    assert_eq!(start, FlowStart::Manual);
    assert_eq!(state.flows.active_pollers(), 0);
    Ok(())
}

#[tokio::test]
async fn device_flow_polls_until_token_is_issued() -> anyhow::Result<()> {
    let server = MockOAuthServer::start().await?;
    server.set_device_pending(1);
    let state = state_with(OAuthConfig { authorize_url: None, ..server.oauth_config() })?;
    let grant = approved_grant(&state, "github").await?;

    let start = state.flows.begin(&grant, &AuditContext::system()).await?;
    assert_eq!(
        start,
        FlowStart::Device {
            user_code: "WDJB-MJHT".to_owned(),
            verification_uri: "https://example.com/device".to_owned(),
            expires_in: 60,
        }
    );

    let mut stored = false;
    for _ in 0..100 {
        if state.vault.peek("github").await.is_some() {
            stored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(stored, "device token was never stored");

    let credential = state.vault.get("github").await?;
    assert_eq!(access_token(&credential.data), Some("device-token"));
    assert!(credential.expires_at.is_some());

    let flows = Arc::clone(&state.flows);
    assert!(eventually(Duration::from_secs(2), || flows.active_pollers() == 0).await);
    let audit = Arc::clone(&state.audit);
    let recorded = || audit.query(&AuditFilter::default()).map(|e| e.len() == 2).unwrap_or(false);
    assert!(eventually(Duration::from_secs(2), recorded).await);
    let actions: Vec<AuditAction> =
        state.audit.query(&AuditFilter::default())?.into_iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::DeviceFlowStarted, AuditAction::CredentialStored]);
    Ok(())
}

#[tokio::test]
async fn method_device_prefers_device_flow() -> anyhow::Result<()> {
    let server = MockOAuthServer::start().await?;
    server.set_device_never();
    let state = state_with(server.oauth_config())?;
    let request = GrantRequest {
        service: "github".to_owned(),
        method: Some("device".to_owned()),
        ..Default::default()
    };
    let grant = state.grants.create(request, "agent-1", "owner", unrecorded).await?;
    let grant = state
        .grants
        .approve(&grant.id, "owner", |_| true, unrecorded)
        .await?
        .ok_or_else(|| anyhow::anyhow!("grant was not pending"))?;

    let start = state.flows.begin(&grant, &AuditContext::system()).await?;
    assert!(matches!(start, FlowStart::Device { .. }));
    state.shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn revoking_grant_cancels_device_poller() -> anyhow::Result<()> {
    let server = MockOAuthServer::start().await?;
    server.set_device_never();
    let state = state_with(OAuthConfig { authorize_url: None, ..server.oauth_config() })?;
    let grant = approved_grant(&state, "github").await?;

    state.flows.begin(&grant, &AuditContext::system()).await?;
    assert_eq!(state.flows.active_pollers(), 1);

    state.grants.revoke("github").await?;

    let flows = Arc::clone(&state.flows);
    assert!(eventually(Duration::from_secs(2), || flows.active_pollers() == 0).await);
    let polls = server.token_requests();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(server.token_requests(), polls, "poller kept running after revoke");
    assert!(state.vault.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn device_initiation_failure_is_audited() -> anyhow::Result<()> {
    let server = MockOAuthServer::start().await?;
    let config = OAuthConfig {
        authorize_url: None,
        device_authorization_url: Some(server.url("/missing")),
        ..server.oauth_config()
    };
    let state = state_with(config)?;
    let grant = approved_grant(&state, "github").await?;

    let result = state.flows.begin(&grant, &AuditContext::system()).await;

    assert!(matches!(result, Err(FlowError::DeviceInit(_))));
    assert_eq!(state.flows.active_pollers(), 0);
    let entries = state.audit.query(&AuditFilter::default())?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::DeviceFlowFailed);
    assert_eq!(entries[0].outcome, Outcome::Error);
    assert_eq!(
        state.grants.get(&grant.id).await.map(|g| g.status),
        Some(GrantStatus::Approved)
    );
    Ok(())
}

#[tokio::test]
async fn token_for_revoked_grant_is_discarded() -> anyhow::Result<()> {
    let state = StateBuilder::new().build()?;
    let grant = approved_grant(&state, "github").await?;
    state.grants.revoke("github").await?;

    let token = TokenResponse {
        access_token: "late-token".to_owned(),
        refresh_token: None,
        expires_in: 0,
        token_type: None,
        scope: None,
    };
    let result = state.flows.store_token(&grant, token, &AuditContext::system(), "device").await;

    assert!(matches!(result, Err(FlowError::GrantNotApproved)));
    assert!(state.vault.is_empty().await);
    assert!(state.audit.query(&AuditFilter::default())?.is_empty());
    Ok(())
}

#[tokio::test]
async fn reconcile_cancels_flows_whose_events_were_missed() -> anyhow::Result<()> {
    let server = MockOAuthServer::start().await?;
    server.set_device_never();
    let config = OAuthConfig { authorize_url: None, ..server.oauth_config() };
    let mut providers = ProviderRegistry::new();
    providers.insert("github", Arc::new(OAuthProvider::new("github", config, http_client())?));

    // No supervisor listens on this channel, as if every event was lagged away.
    let (tx, _) = broadcast::channel(16);
    let grants = Arc::new(GrantStore::in_memory(tx));
    let shutdown = CancellationToken::new();
    let flows = AuthorizationFlows::new(
        Arc::new(providers),
        Arc::clone(&grants),
        Arc::new(CredentialVault::in_memory()),
        Arc::new(AuditChain::open(Arc::new(MemoryStorage::new()), b"test-audit-key")?),
        http_client(),
        FlowSettings {
            redirect_uri: "http://127.0.0.1:9900/api/v1/oauth/callback".to_owned(),
            call_timeout: Duration::from_secs(2),
        },
        shutdown.clone(),
    );

    let request = GrantRequest { service: "github".to_owned(), ..Default::default() };
    let grant = grants.create(request, "agent-1", "owner", unrecorded).await?;
    let grant = grants
        .approve(&grant.id, "owner", |_| true, unrecorded)
        .await?
        .ok_or_else(|| anyhow::anyhow!("grant was not pending"))?;
    flows.begin(&grant, &AuditContext::system()).await?;
    assert_eq!(flows.active_pollers(), 1);

    grants.revoke("github").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(flows.active_pollers(), 1);

    flows.reconcile().await;
    assert_eq!(flows.active_pollers(), 0);
    shutdown.cancel();
    Ok(())
}
