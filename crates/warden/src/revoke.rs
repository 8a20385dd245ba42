// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Revocation: remote revoke, local delete, grant update, audit.
//!
//! A provider that fails to revoke never blocks the local deletion; the
//! failure is recorded in the audit entry instead. An audit failure is fatal.
//!
//! Approved grants are revoked even when no credential is stored yet, so an
//! authorization still in flight cannot deliver one afterwards.

use std::sync::Arc;

use serde::Serialize;

use crate::audit::{AuditAction, AuditChain, AuditContext, AuditError, Outcome};
use crate::grant::{GrantStatus, GrantStore};
use crate::provider::ProviderRegistry;
use crate::vault::CredentialVault;

/// Error code recorded when the provider's revoke call fails.
pub const PROVIDER_REVOKE_FAILED: &str = "provider_revoke_failed";

/// What happened at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteRevoke {
    Revoked,
    NotSupported,
    Failed,
}

/// Per-service result of a revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevokeResult {
    pub service: String,
    pub provider_revoke: RemoteRevoke,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<String>,
    /// Ids of grants moved to `revoked`.
    pub grants_revoked: Vec<String>,
    pub audit_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevokeAllReport {
    pub count: usize,
    pub services: Vec<String>,
    pub results: Vec<RevokeResult>,
}

#[derive(Debug, thiserror::Error)]
pub enum RevokeError {
    #[error("no credential stored for {0}")]
    NotFound(String),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("failed to update local state: {0}")]
    Local(anyhow::Error),
}

pub struct RevocationOrchestrator {
    vault: Arc<CredentialVault>,
    grants: Arc<GrantStore>,
    providers: Arc<ProviderRegistry>,
    audit: Arc<AuditChain>,
}

impl RevocationOrchestrator {
    pub fn new(
        vault: Arc<CredentialVault>,
        grants: Arc<GrantStore>,
        providers: Arc<ProviderRegistry>,
        audit: Arc<AuditChain>,
    ) -> Self {
        Self { vault, grants, providers, audit }
    }

    /// Revoke the credential for `service`.
    pub async fn revoke(
        &self,
        service: &str,
        reason: Option<&str>,
        ctx: &AuditContext,
    ) -> Result<RevokeResult, RevokeError> {
        // Expired credentials are revoked too.
        let Some(credential) = self.vault.peek(service).await else {
            self.revoke_grants(service, reason, ctx).await?;
            return Err(RevokeError::NotFound(service.to_owned()));
        };

        let (provider_revoke, provider_error) = match self.providers.get(service) {
            Some(provider) if provider.capabilities().remote_revoke => {
                match provider.revoke(&credential).await {
                    Ok(()) => (RemoteRevoke::Revoked, None),
                    Err(e) => {
                        tracing::warn!(service, err = %e, "provider revoke failed, deleting locally");
                        (RemoteRevoke::Failed, Some(e.to_string()))
                    }
                }
            }
            _ => (RemoteRevoke::NotSupported, None),
        };

        let local = async {
            self.vault.delete(service).await?;
            Ok::<_, anyhow::Error>(self.grants.revoke(service).await?)
        }
        .await;

        let mut entry = ctx.entry(AuditAction::CredentialRevoked, service);
        let grants_revoked = match local {
            Ok(ref grants) => grants.iter().map(|g| g.id.clone()).collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        entry = entry.metadata(serde_json::json!({
            "reason": reason,
            "provider_revoke": provider_revoke,
            "grants_revoked": grants_revoked,
        }));
        if let Err(ref e) = local {
            entry = entry.outcome(Outcome::Error).error("local_revoke_failed", e.to_string());
        } else if let Some(ref message) = provider_error {
            entry = entry.outcome(Outcome::Error).error(PROVIDER_REVOKE_FAILED, message.clone());
        }
        let recorded = self.audit.append(entry).await?;

        if let Err(e) = local {
            return Err(RevokeError::Local(e));
        }
        tracing::info!(service, provider_revoke = ?provider_revoke, grants = grants_revoked.len(), "credential revoked");
        Ok(RevokeResult {
            service: service.to_owned(),
            provider_revoke,
            provider_error,
            grants_revoked,
            audit_id: recorded.id,
        })
    }

    /// Revoke every stored credential, continuing past provider failures.
    pub async fn revoke_all(
        &self,
        reason: Option<&str>,
        ctx: &AuditContext,
    ) -> Result<RevokeAllReport, RevokeError> {
        let mut results = Vec::new();
        for service in self.vault.services().await {
            match self.revoke(&service, reason, ctx).await {
                Ok(result) => results.push(result),
                // Removed concurrently.
                Err(RevokeError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        let services: Vec<String> = results.iter().map(|r| r.service.clone()).collect();

        // Whatever is still approved has no credential yet.
        let mut in_flight: Vec<String> = self
            .grants
            .list()
            .await
            .into_iter()
            .filter(|g| g.status == GrantStatus::Approved)
            .map(|g| g.service)
            .collect();
        in_flight.sort();
        in_flight.dedup();
        for service in in_flight {
            self.revoke_grants(&service, reason, ctx).await?;
        }

        tracing::info!(count = results.len(), "all credentials revoked");
        Ok(RevokeAllReport { count: results.len(), services, results })
    }

    /// Revoke the approved grants of a service with nothing stored. Audited
    /// only when a grant actually changed.
    async fn revoke_grants(
        &self,
        service: &str,
        reason: Option<&str>,
        ctx: &AuditContext,
    ) -> Result<Vec<String>, RevokeError> {
        let revoked = self.grants.revoke(service).await.map_err(|e| RevokeError::Local(e.into()))?;
        if revoked.is_empty() {
            return Ok(Vec::new());
        }
        let grants_revoked: Vec<String> = revoked.into_iter().map(|g| g.id).collect();
        let entry = ctx.entry(AuditAction::CredentialRevoked, service).metadata(serde_json::json!({
            "reason": reason,
            "credential_stored": false,
            "grants_revoked": grants_revoked,
        }));
        self.audit.append(entry).await?;
        tracing::info!(service, grants = grants_revoked.len(), "in-flight grants revoked");
        Ok(grants_revoked)
    }
}

#[cfg(test)]
#[path = "revoke_tests.rs"]
mod tests;
