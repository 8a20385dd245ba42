// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential vault: keyed secret store with expiry-aware reads.
//!
//! Optionally backed by a JSON snapshot (see [`crate::persist`]) that is
//! rewritten atomically after every mutation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Credential kind, the `type` tag of [`CredentialData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Oauth,
    ApiKey,
    BankLink,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oauth => "oauth",
            Self::ApiKey => "api_key",
            Self::BankLink => "bank_link",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secret payload, tagged by `type`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialData {
    Oauth {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
    ApiKey {
        key: String,
    },
    BankLink {
        access_token: String,
        item_id: String,
    },
}

impl CredentialData {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::Oauth { .. } => CredentialKind::Oauth,
            Self::ApiKey { .. } => CredentialKind::ApiKey,
            Self::BankLink { .. } => CredentialKind::BankLink,
        }
    }

    /// The token presented to the provider, whatever the kind.
    pub fn secret(&self) -> &str {
        match self {
            Self::Oauth { access_token, .. } | Self::BankLink { access_token, .. } => access_token,
            Self::ApiKey { key } => key,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for CredentialData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oauth { token_type, scope, refresh_token, .. } => f
                .debug_struct("Oauth")
                .field("access_token", &"<redacted>")
                .field("has_refresh_token", &refresh_token.is_some())
                .field("token_type", token_type)
                .field("scope", scope)
                .finish(),
            Self::ApiKey { .. } => f.debug_struct("ApiKey").field("key", &"<redacted>").finish(),
            Self::BankLink { item_id, .. } => f
                .debug_struct("BankLink")
                .field("access_token", &"<redacted>")
                .field("item_id", item_id)
                .finish(),
        }
    }
}

/// A stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub service: String,
    pub data: CredentialData,
    pub created_at: DateTime<Utc>,
    /// `None` never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(service: impl Into<String>, data: CredentialData) -> Self {
        Self { service: service.into(), data, created_at: Utc::now(), expires_at: None }
    }

    /// Set the expiry `secs` from now. Zero means the provider gave no lifetime.
    pub fn expires_in(mut self, secs: u64) -> Self {
        if secs > 0 {
            let secs = i64::try_from(secs).unwrap_or(i64::MAX);
            self.expires_at = chrono::TimeDelta::try_seconds(secs).map(|d| self.created_at + d);
        }
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            service: self.service.clone(),
            kind: self.data.kind(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// List view of a credential. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub service: String,
    #[serde(rename = "type")]
    pub kind: CredentialKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Why a direct read returned no credential. Callers map these differently.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("no credential stored for service")]
    NotFound,
    #[error("credential expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },
}

/// The credential vault.
pub struct CredentialVault {
    entries: RwLock<BTreeMap<String, Credential>>,
    path: Option<PathBuf>,
}

impl CredentialVault {
    /// In-memory vault with no persistence.
    pub fn in_memory() -> Self {
        Self { entries: RwLock::new(BTreeMap::new()), path: None }
    }

    /// Vault persisted to `path`, loading any existing snapshot.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let entries: BTreeMap<String, Credential> = crate::persist::load(&path)?.unwrap_or_default();
        tracing::debug!(path = %path.display(), credentials = entries.len(), "vault loaded");
        Ok(Self { entries: RwLock::new(entries), path: Some(path) })
    }

    /// Summaries of every stored credential, sorted by service.
    pub async fn list(&self) -> Vec<CredentialSummary> {
        self.entries.read().await.values().map(Credential::summary).collect()
    }

    /// Service names currently stored.
    pub async fn services(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Full credential for `service`, checked against the current time.
    pub async fn get(&self, service: &str) -> Result<Credential, LookupError> {
        self.get_at(service, Utc::now()).await
    }

    pub async fn get_at(&self, service: &str, now: DateTime<Utc>) -> Result<Credential, LookupError> {
        let entries = self.entries.read().await;
        let cred = entries.get(service).ok_or(LookupError::NotFound)?;
        match cred.expires_at {
            Some(expired_at) if expired_at <= now => Err(LookupError::Expired { expired_at }),
            _ => Ok(cred.clone()),
        }
    }

    /// Credential for `service` regardless of expiry (used by revocation).
    pub async fn peek(&self, service: &str) -> Option<Credential> {
        self.entries.read().await.get(service).cloned()
    }

    /// Insert or replace the credential for `credential.service`.
    pub async fn put(&self, credential: Credential) -> anyhow::Result<()> {
        if credential.service.is_empty() {
            anyhow::bail!("credential service must not be empty");
        }
        let mut entries = self.entries.write().await;
        let service = credential.service.clone();
        let previous = entries.insert(service.clone(), credential);
        if let Err(e) = self.persist(&entries) {
            // Keep memory consistent with disk.
            match previous {
                Some(prev) => entries.insert(service, prev),
                None => entries.remove(&service),
            };
            return Err(e);
        }
        tracing::info!(service = %service, replaced = previous.is_some(), "credential stored");
        Ok(())
    }

    /// Remove the credential for `service`. Returns whether one existed.
    pub async fn delete(&self, service: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.write().await;
        let Some(removed) = entries.remove(service) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(service.to_owned(), removed);
            return Err(e);
        }
        tracing::info!(service, "credential deleted");
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn persist(&self, entries: &BTreeMap<String, Credential>) -> anyhow::Result<()> {
        match self.path {
            Some(ref path) => crate::persist::save(path, entries),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
