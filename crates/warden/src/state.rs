// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audit::AuditChain;
use crate::flow::{AuthorizationFlows, FlowSettings};
use crate::grant::GrantStore;
use crate::provider::ProviderRegistry;
use crate::revoke::RevocationOrchestrator;
use crate::vault::CredentialVault;

/// Stores and settings assembled by the caller before the state is built.
pub struct AppParts {
    pub vault: Arc<CredentialVault>,
    pub grants: Arc<GrantStore>,
    pub audit: Arc<AuditChain>,
    pub providers: ProviderRegistry,
    pub client: reqwest::Client,
    pub flow: FlowSettings,
    pub auth_token: Option<String>,
    pub principal: String,
}

/// Shared broker state.
pub struct AppState {
    pub vault: Arc<CredentialVault>,
    pub grants: Arc<GrantStore>,
    pub audit: Arc<AuditChain>,
    pub providers: Arc<ProviderRegistry>,
    pub flows: Arc<AuthorizationFlows>,
    pub revoker: RevocationOrchestrator,
    pub auth_token: Option<String>,
    /// Principal used when a request does not name one.
    pub principal: String,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the components together and start the flow supervisor.
    pub fn new(parts: AppParts, shutdown: CancellationToken) -> Self {
        let providers = Arc::new(parts.providers);
        let flows = AuthorizationFlows::new(
            Arc::clone(&providers),
            Arc::clone(&parts.grants),
            Arc::clone(&parts.vault),
            Arc::clone(&parts.audit),
            parts.client,
            parts.flow,
            shutdown.clone(),
        );
        flows.spawn_supervisor(parts.grants.subscribe());
        let revoker = RevocationOrchestrator::new(
            Arc::clone(&parts.vault),
            Arc::clone(&parts.grants),
            Arc::clone(&providers),
            Arc::clone(&parts.audit),
        );
        Self {
            vault: parts.vault,
            grants: parts.grants,
            audit: parts.audit,
            providers,
            flows,
            revoker,
            auth_token: parts.auth_token,
            principal: parts.principal,
            shutdown,
        }
    }
}
