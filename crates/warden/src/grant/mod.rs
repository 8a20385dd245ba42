// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Grant approval state machine.
//!
//! ```text
//! pending ──► approved ──► revoked
//!    │                        ▲
//!    └──────► denied ─────────┘
//! ```
//!
//! Every transition is a check-and-set under the store's write lock, so two
//! concurrent approvals of the same grant cannot both succeed. A transition
//! is committed only once its audit record has been written; if recording
//! fails the grant is rolled back and no event is published.

pub mod notify;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::audit::AuditError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Pending,
    Approved,
    Denied,
    Revoked,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Revoked => "revoked",
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_become(&self, next: GrantStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Denied)
                | (Self::Approved, Self::Revoked)
                | (Self::Denied, Self::Revoked)
        )
    }
}

impl fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An agent's request for access, as submitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantRequest {
    pub service: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub id: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub agent: String,
    pub principal: String,
    pub status: GrantStatus,
    /// Anti-CSRF nonce for the redirect flow; set only on approval of an
    /// OAuth-capable service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_state: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Capacity of the grant event channel. Consumers that fall further behind
/// see `Lagged` and must reconcile from the store.
pub const EVENT_CAPACITY: usize = 1024;

/// Lifecycle events published on every successful transition.
#[derive(Debug, Clone)]
pub enum GrantEvent {
    Requested(Grant),
    Approved(Grant),
    Denied(Grant),
    Revoked(Grant),
}

impl GrantEvent {
    pub fn grant(&self) -> &Grant {
        match self {
            Self::Requested(g) | Self::Approved(g) | Self::Denied(g) | Self::Revoked(g) => g,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GrantError {
    #[error("service is required")]
    MissingService,
    #[error("failed to persist grants: {0:#}")]
    Persist(anyhow::Error),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Grant store keyed by id, in creation order.
pub struct GrantStore {
    grants: RwLock<IndexMap<String, Grant>>,
    path: Option<PathBuf>,
    event_tx: broadcast::Sender<GrantEvent>,
}

impl GrantStore {
    pub fn in_memory(event_tx: broadcast::Sender<GrantEvent>) -> Self {
        Self { grants: RwLock::new(IndexMap::new()), path: None, event_tx }
    }

    /// Store persisted to `path`, loading any existing snapshot.
    pub fn open(path: PathBuf, event_tx: broadcast::Sender<GrantEvent>) -> anyhow::Result<Self> {
        let saved: Vec<Grant> = crate::persist::load(&path)?.unwrap_or_default();
        let grants: IndexMap<String, Grant> =
            saved.into_iter().map(|g| (g.id.clone(), g)).collect();
        tracing::debug!(path = %path.display(), grants = grants.len(), "grant store loaded");
        Ok(Self { grants: RwLock::new(grants), path: Some(path), event_tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GrantEvent> {
        self.event_tx.subscribe()
    }

    /// Record a new pending grant and publish [`GrantEvent::Requested`].
    ///
    /// `record` writes the audit entry for the new grant; the grant is kept
    /// only if it succeeds.
    pub async fn create<R, F, T>(
        &self,
        request: GrantRequest,
        agent: &str,
        principal: &str,
        record: R,
    ) -> Result<Grant, GrantError>
    where
        R: FnOnce(&Grant) -> F,
        F: Future<Output = Result<T, AuditError>>,
    {
        let service = request.service.trim();
        if service.is_empty() {
            return Err(GrantError::MissingService);
        }
        let grant = Grant {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.to_owned(),
            method: request.method,
            scopes: request.scopes,
            org: request.org,
            team: request.team,
            reason: request.reason,
            agent: agent.to_owned(),
            principal: principal.to_owned(),
            status: GrantStatus::Pending,
            oauth_state: None,
            created_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            deny_reason: None,
            revoked_at: None,
        };

        {
            let mut grants = self.grants.write().await;
            grants.insert(grant.id.clone(), grant.clone());
            if let Err(e) = self.persist(&grants) {
                grants.shift_remove(&grant.id);
                return Err(GrantError::Persist(e));
            }
            if let Err(e) = record(&grant).await {
                grants.shift_remove(&grant.id);
                self.persist_rollback(&grants, &grant.id);
                return Err(e.into());
            }
        }

        tracing::info!(grant_id = %grant.id, service = %grant.service, agent, "grant requested");
        let _ = self.event_tx.send(GrantEvent::Requested(grant.clone()));
        Ok(grant)
    }

    /// Approve a pending grant.
    ///
    /// `oauth_capable` is consulted under the lock; when it returns true the
    /// grant is given a fresh `oauth_state` nonce. Returns `Ok(None)` when the
    /// grant does not exist or is not pending.
    pub async fn approve<R, F, T>(
        &self,
        id: &str,
        approver: &str,
        oauth_capable: impl FnOnce(&Grant) -> bool,
        record: R,
    ) -> Result<Option<Grant>, GrantError>
    where
        R: FnOnce(&Grant) -> F,
        F: Future<Output = Result<T, AuditError>>,
    {
        let update = |grant: &mut Grant| {
            grant.decided_at = Some(Utc::now());
            grant.decided_by = Some(approver.to_owned());
            if oauth_capable(&*grant) {
                grant.oauth_state = Some(crate::oauth::pkce::generate_state());
            }
        };
        let updated = self.transition(id, GrantStatus::Approved, update, record).await?;
        if let Some(ref grant) = updated {
            tracing::info!(grant_id = %grant.id, service = %grant.service, approver, "grant approved");
            let _ = self.event_tx.send(GrantEvent::Approved(grant.clone()));
        }
        Ok(updated)
    }

    /// Deny a pending grant. Same `Ok(None)` discipline as [`GrantStore::approve`].
    pub async fn deny<R, F, T>(
        &self,
        id: &str,
        reason: Option<String>,
        approver: &str,
        record: R,
    ) -> Result<Option<Grant>, GrantError>
    where
        R: FnOnce(&Grant) -> F,
        F: Future<Output = Result<T, AuditError>>,
    {
        let update = |grant: &mut Grant| {
            grant.decided_at = Some(Utc::now());
            grant.decided_by = Some(approver.to_owned());
            grant.deny_reason = reason;
        };
        let updated = self.transition(id, GrantStatus::Denied, update, record).await?;
        if let Some(ref grant) = updated {
            tracing::info!(grant_id = %grant.id, service = %grant.service, approver, "grant denied");
            let _ = self.event_tx.send(GrantEvent::Denied(grant.clone()));
        }
        Ok(updated)
    }

    /// Revoke every approved grant for `service`.
    ///
    /// Pending grants are left for a human decision and denied grants already
    /// grant nothing, so neither is touched. Returns the grants revoked by this
    /// call; an empty result is not an error.
    pub async fn revoke(&self, service: &str) -> Result<Vec<Grant>, GrantError> {
        let revoked = {
            let mut grants = self.grants.write().await;
            let before = grants.clone();
            let now = Utc::now();
            let mut revoked = Vec::new();
            for grant in grants.values_mut() {
                if grant.service == service && grant.status == GrantStatus::Approved {
                    grant.status = GrantStatus::Revoked;
                    grant.revoked_at = Some(now);
                    revoked.push(grant.clone());
                }
            }
            if !revoked.is_empty() {
                if let Err(e) = self.persist(&grants) {
                    *grants = before;
                    return Err(GrantError::Persist(e));
                }
            }
            revoked
        };

        for grant in &revoked {
            tracing::info!(grant_id = %grant.id, service, "grant revoked");
            let _ = self.event_tx.send(GrantEvent::Revoked(grant.clone()));
        }
        Ok(revoked)
    }

    pub async fn get(&self, id: &str) -> Option<Grant> {
        self.grants.read().await.get(id).cloned()
    }

    /// Pending grants, oldest first.
    pub async fn pending(&self) -> Vec<Grant> {
        let grants = self.grants.read().await;
        let mut pending: Vec<Grant> =
            grants.values().filter(|g| g.status == GrantStatus::Pending).cloned().collect();
        // Stable sort: insertion order breaks timestamp ties.
        pending.sort_by_key(|g| g.created_at);
        pending
    }

    pub async fn list(&self) -> Vec<Grant> {
        self.grants.read().await.values().cloned().collect()
    }

    /// The approved grant holding `state` as its redirect nonce.
    pub async fn find_by_oauth_state(&self, state: &str) -> Option<Grant> {
        self.grants
            .read()
            .await
            .values()
            .find(|g| {
                g.status == GrantStatus::Approved
                    && g.oauth_state.as_deref().is_some_and(|s| crate::oauth::constant_time_eq(s, state))
            })
            .cloned()
    }

    /// Check-and-set: apply `update` only if the transition is legal, then
    /// `record` it. The write lock is held until both have succeeded.
    async fn transition<R, F, T>(
        &self,
        id: &str,
        next: GrantStatus,
        update: impl FnOnce(&mut Grant),
        record: R,
    ) -> Result<Option<Grant>, GrantError>
    where
        R: FnOnce(&Grant) -> F,
        F: Future<Output = Result<T, AuditError>>,
    {
        let mut grants = self.grants.write().await;
        let Some(grant) = grants.get_mut(id) else {
            return Ok(None);
        };
        if !grant.status.can_become(next) {
            tracing::debug!(grant_id = id, status = %grant.status, next = %next, "transition rejected");
            return Ok(None);
        }
        let before = grant.clone();
        grant.status = next;
        update(grant);
        let updated = grant.clone();

        if let Err(e) = self.persist(&grants) {
            grants.insert(id.to_owned(), before);
            return Err(GrantError::Persist(e));
        }
        if let Err(e) = record(&updated).await {
            grants.insert(id.to_owned(), before);
            self.persist_rollback(&grants, id);
            return Err(e.into());
        }
        Ok(Some(updated))
    }

    fn persist_rollback(&self, grants: &IndexMap<String, Grant>, id: &str) {
        if let Err(e) = self.persist(grants) {
            tracing::error!(grant_id = id, err = %e, "failed to persist grant rollback");
        }
    }

    fn persist(&self, grants: &IndexMap<String, Grant>) -> anyhow::Result<()> {
        match self.path {
            Some(ref path) => {
                let snapshot: Vec<&Grant> = grants.values().collect();
                crate::persist::save(path, &snapshot)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
