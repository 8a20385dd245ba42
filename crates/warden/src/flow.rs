// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authorization flows: turn an approved grant into a stored credential.
//!
//! Redirect flows remember the PKCE verifier under the grant's `oauth_state`
//! until the callback arrives. Device flows run as supervised tasks, one per
//! grant, cancelled when the grant is denied or revoked or on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditAction, AuditChain, AuditContext, AuditError, Outcome};
use crate::device::{poll_until_authorized, HttpDeviceClient, PollError, PollSchedule};
use crate::grant::{Grant, GrantEvent, GrantStatus, GrantStore};
use crate::oauth::{pkce, DeviceCodeResponse, TokenResponse};
use crate::provider::{AuthCode, AuthorizeParams, Capability, ProviderError, ProviderRegistry};
use crate::vault::CredentialVault;

/// Unclaimed redirect flows are dropped after this long.
const PENDING_AUTH_TTL: Duration = Duration::from_secs(15 * 60);

/// Poll deadline used when a provider omits `expires_in`.
const DEFAULT_DEVICE_EXPIRY_SECS: u64 = 900;

/// How the owner continues after approving a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum FlowStart {
    /// Visit `oauth_url` to authorize; the provider redirects to the callback.
    OauthUrl { oauth_url: String },
    /// Enter `user_code` at `verification_uri`; the broker polls for the token.
    Device { user_code: String, verification_uri: String, expires_in: u64 },
    /// No automated flow; the owner stores the credential by hand.
    Manual,
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("unknown or expired authorization state")]
    UnknownState,
    #[error("grant is no longer approved")]
    GrantNotApproved,
    #[error("device authorization failed: {0}")]
    DeviceInit(anyhow::Error),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("failed to store credential: {0}")]
    Store(anyhow::Error),
}

/// Settings shared by every flow.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Redirect URI registered with providers; points at `/api/v1/oauth/callback`.
    pub redirect_uri: String,
    /// Per-request bound on device token polls.
    pub call_timeout: Duration,
}

struct PendingAuth {
    grant_id: String,
    code_verifier: String,
    created_at: Instant,
}

pub struct AuthorizationFlows {
    providers: Arc<ProviderRegistry>,
    grants: Arc<GrantStore>,
    vault: Arc<CredentialVault>,
    audit: Arc<AuditChain>,
    client: reqwest::Client,
    settings: FlowSettings,
    /// In-flight redirect flows, keyed by `state`.
    pending_auths: RwLock<HashMap<String, PendingAuth>>,
    /// Cancellation handles of running device pollers, keyed by grant id.
    pollers: parking_lot::Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl AuthorizationFlows {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        grants: Arc<GrantStore>,
        vault: Arc<CredentialVault>,
        audit: Arc<AuditChain>,
        client: reqwest::Client,
        settings: FlowSettings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            providers,
            grants,
            vault,
            audit,
            client,
            settings,
            pending_auths: RwLock::new(HashMap::new()),
            pollers: parking_lot::Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// Whether approving a grant for `service` should mint an `oauth_state`.
    pub fn oauth_capable(&self, service: &str) -> bool {
        self.providers.capabilities(service).oauth_capable()
    }

    /// Number of device pollers currently running.
    pub fn active_pollers(&self) -> usize {
        self.pollers.lock().len()
    }

    /// Start the flow for a freshly approved grant.
    pub async fn begin(
        self: &Arc<Self>,
        grant: &Grant,
        ctx: &AuditContext,
    ) -> Result<FlowStart, FlowError> {
        let caps = self.providers.capabilities(&grant.service);
        let wants_device = grant.method.as_deref() == Some("device");

        if caps.device_flow && (wants_device || !caps.auth_code) {
            return self.begin_device(grant, ctx).await;
        }
        if caps.auth_code {
            if let Some(ref state) = grant.oauth_state {
                return self.begin_redirect(grant, state).await;
            }
        }
        Ok(FlowStart::Manual)
    }

    async fn begin_redirect(&self, grant: &Grant, state: &str) -> Result<FlowStart, FlowError> {
        let provider = self
            .providers
            .get(&grant.service)
            .ok_or(ProviderError::Unsupported(Capability::AuthCode))?;

        let code_verifier = pkce::generate_code_verifier();
        let code_challenge = pkce::compute_code_challenge(&code_verifier);
        let oauth_url = provider
            .authorize_url(AuthorizeParams {
                state,
                code_challenge: &code_challenge,
                redirect_uri: &self.settings.redirect_uri,
                scopes: &grant.scopes,
            })
            .ok_or(ProviderError::Unsupported(Capability::AuthCode))?;

        let mut pending = self.pending_auths.write().await;
        pending.retain(|_, p| p.created_at.elapsed() < PENDING_AUTH_TTL);
        pending.insert(
            state.to_owned(),
            PendingAuth {
                grant_id: grant.id.clone(),
                code_verifier,
                created_at: Instant::now(),
            },
        );

        tracing::info!(grant_id = %grant.id, service = %grant.service, "redirect flow started");
        Ok(FlowStart::OauthUrl { oauth_url })
    }

    async fn begin_device(
        self: &Arc<Self>,
        grant: &Grant,
        ctx: &AuditContext,
    ) -> Result<FlowStart, FlowError> {
        let endpoints = self
            .providers
            .get(&grant.service)
            .and_then(|p| p.device_endpoints())
            .ok_or(ProviderError::Unsupported(Capability::DeviceFlow))?;
        let client = HttpDeviceClient::new(self.client.clone(), endpoints);

        let device = match client.initiate(&grant.scopes).await {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!(grant_id = %grant.id, service = %grant.service, err = %e, "device authorization failed");
                let entry = ctx
                    .entry(AuditAction::DeviceFlowFailed, &grant.service)
                    .scopes(&grant.scopes)
                    .resource(&grant.id)
                    .outcome(Outcome::Error)
                    .error("device_authorization_failed", e.to_string());
                self.audit.append(entry).await?;
                return Err(FlowError::DeviceInit(e));
            }
        };

        let expires_in =
            if device.expires_in == 0 { DEFAULT_DEVICE_EXPIRY_SECS } else { device.expires_in };
        let entry = ctx
            .entry(AuditAction::DeviceFlowStarted, &grant.service)
            .scopes(&grant.scopes)
            .resource(&grant.id)
            .metadata(serde_json::json!({
                "verification_uri": device.verification_uri,
                "expires_in": expires_in,
            }));
        self.audit.append(entry).await?;

        let start = FlowStart::Device {
            user_code: device.user_code.clone(),
            verification_uri: device.verification_uri.clone(),
            expires_in,
        };
        self.spawn_device_poll(grant.clone(), client, device, expires_in);
        Ok(start)
    }

    fn spawn_device_poll(
        self: &Arc<Self>,
        grant: Grant,
        client: HttpDeviceClient,
        device: DeviceCodeResponse,
        expires_in: u64,
    ) {
        let cancel = self.shutdown.child_token();
        let previous = self.pollers.lock().insert(grant.id.clone(), cancel.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let flows = Arc::clone(self);
        tokio::spawn(async move {
            let schedule =
                PollSchedule::new(device.interval, expires_in, flows.settings.call_timeout);
            let result =
                poll_until_authorized(&client, &device.device_code, schedule, &cancel).await;
            flows.pollers.lock().remove(&grant.id);

            let ctx = AuditContext::system();
            match result {
                Ok(token) => {
                    if let Err(e) = flows.store_token(&grant, token, &ctx, "device").await {
                        tracing::warn!(grant_id = %grant.id, err = %e, "device flow token not stored");
                    }
                }
                Err(PollError::Cancelled) => {
                    tracing::debug!(grant_id = %grant.id, "device flow cancelled");
                }
                Err(e) => {
                    tracing::warn!(grant_id = %grant.id, service = %grant.service, err = %e, "device flow failed");
                    let entry = ctx
                        .entry(AuditAction::DeviceFlowFailed, &grant.service)
                        .scopes(&grant.scopes)
                        .resource(&grant.id)
                        .outcome(Outcome::Error)
                        .error(e.code(), e.to_string());
                    if let Err(e) = flows.audit.append(entry).await {
                        tracing::error!(grant_id = %grant.id, err = %e, "failed to audit device flow failure");
                    }
                }
            }
        });
    }

    /// Complete a redirect flow from the provider's callback.
    pub async fn complete(
        &self,
        state: &str,
        code: &str,
        ctx: &AuditContext,
    ) -> Result<Grant, FlowError> {
        let pending =
            self.pending_auths.write().await.remove(state).ok_or(FlowError::UnknownState)?;
        if pending.created_at.elapsed() >= PENDING_AUTH_TTL {
            return Err(FlowError::UnknownState);
        }

        let grant = self
            .grants
            .find_by_oauth_state(state)
            .await
            .filter(|g| g.id == pending.grant_id)
            .ok_or(FlowError::GrantNotApproved)?;
        let provider = self
            .providers
            .get(&grant.service)
            .ok_or(ProviderError::Unsupported(Capability::AuthCode))?;

        let token = provider
            .authenticate(AuthCode {
                code,
                code_verifier: &pending.code_verifier,
                redirect_uri: &self.settings.redirect_uri,
            })
            .await?;
        self.store_token(&grant, token, ctx, "auth_code").await?;
        Ok(grant)
    }

    /// Store a token for `grant` if it is still approved, then audit it.
    async fn store_token(
        &self,
        grant: &Grant,
        token: TokenResponse,
        ctx: &AuditContext,
        flow: &str,
    ) -> Result<(), FlowError> {
        let current = self.grants.get(&grant.id).await;
        if current.map(|g| g.status) != Some(GrantStatus::Approved) {
            return Err(FlowError::GrantNotApproved);
        }

        let credential = token.into_credential(&grant.service);
        let expires_at = credential.expires_at;
        self.vault.put(credential).await.map_err(FlowError::Store)?;

        // A revoke may have landed between the check and the put.
        let current = self.grants.get(&grant.id).await;
        if current.map(|g| g.status) != Some(GrantStatus::Approved) {
            self.vault.delete(&grant.service).await.map_err(FlowError::Store)?;
            tracing::info!(
                grant_id = %grant.id,
                service = %grant.service,
                "grant revoked during exchange, token discarded"
            );
            return Err(FlowError::GrantNotApproved);
        }

        let entry = ctx
            .entry(AuditAction::CredentialStored, &grant.service)
            .scopes(&grant.scopes)
            .resource(&grant.id)
            .metadata(serde_json::json!({ "flow": flow, "expires_at": expires_at }));
        self.audit.append(entry).await?;
        tracing::info!(grant_id = %grant.id, service = %grant.service, flow, "credential stored");
        Ok(())
    }

    /// Cancel whatever flow is in flight for `grant_id`.
    async fn abandon(&self, grant_id: &str) {
        let poller = self.pollers.lock().remove(grant_id);
        if let Some(cancel) = poller {
            cancel.cancel();
            tracing::info!(grant_id, "device flow cancelled");
        }
        self.pending_auths.write().await.retain(|_, p| p.grant_id != grant_id);
    }

    /// Cancel every flow whose grant is no longer `approved`. Run after the
    /// supervisor missed events.
    pub async fn reconcile(&self) {
        let mut ids: Vec<String> = self.pollers.lock().keys().cloned().collect();
        ids.extend(self.pending_auths.read().await.values().map(|p| p.grant_id.clone()));
        ids.sort();
        ids.dedup();
        for id in ids {
            let approved = self
                .grants
                .get(&id)
                .await
                .is_some_and(|g| g.status == GrantStatus::Approved);
            if !approved {
                self.abandon(&id).await;
            }
        }
    }

    /// Spawn the supervisor that cancels flows for grants leaving `approved`.
    pub fn spawn_supervisor(
        self: &Arc<Self>,
        mut event_rx: broadcast::Receiver<GrantEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let flows = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = flows.shutdown.cancelled() => break,
                    event = event_rx.recv() => event,
                };
                match event {
                    Ok(GrantEvent::Denied(grant)) | Ok(GrantEvent::Revoked(grant)) => {
                        flows.abandon(&grant.id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "flow supervisor lagged, reconciling");
                        flows.reconcile().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "flow_tests.rs"]
mod tests;
