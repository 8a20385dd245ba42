// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Provider adapters and their declared capabilities.
//!
//! Callers branch on [`Provider::capabilities`] before invoking a flow; a
//! method called for an undeclared capability returns
//! [`ProviderError::Unsupported`] rather than failing mysteriously.

pub mod api_key;
pub mod oauth;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::DeviceEndpoints;
use crate::oauth::TokenResponse;
use crate::vault::Credential;

pub use api_key::{ApiKeyConfig, ApiKeyProvider};
pub use oauth::{OAuthConfig, OAuthProvider};

/// What a provider can do. Every flag is explicit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub auth_code: bool,
    pub device_flow: bool,
    pub remote_revoke: bool,
    pub test: bool,
}

impl Capabilities {
    /// Whether approval should mint an `oauth_state` nonce.
    pub fn oauth_capable(&self) -> bool {
        self.auth_code || self.device_flow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    AuthCode,
    DeviceFlow,
    RemoteRevoke,
    Test,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AuthCode => "auth_code",
            Self::DeviceFlow => "device_flow",
            Self::RemoteRevoke => "remote_revoke",
            Self::Test => "test",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider does not support {0}")]
    Unsupported(Capability),
    #[error("provider rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Other(e.into())
    }
}

pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

fn unsupported<'a, T: Send + 'a>(capability: Capability) -> ProviderFuture<'a, T> {
    Box::pin(std::future::ready(Err(ProviderError::Unsupported(capability))))
}

/// Inputs to [`Provider::authorize_url`].
#[derive(Debug, Clone, Copy)]
pub struct AuthorizeParams<'a> {
    pub state: &'a str,
    pub code_challenge: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
}

/// An authorization code returned to the redirect URI.
#[derive(Debug, Clone, Copy)]
pub struct AuthCode<'a> {
    pub code: &'a str,
    pub code_verifier: &'a str,
    pub redirect_uri: &'a str,
}

/// Adapter contract for one third-party service.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Authorization URL for the redirect flow, `None` without `auth_code`.
    fn authorize_url(&self, _params: AuthorizeParams<'_>) -> Option<String> {
        None
    }

    /// Endpoints for the device flow, `None` without `device_flow`.
    fn device_endpoints(&self) -> Option<DeviceEndpoints> {
        None
    }

    /// Exchange an authorization code for tokens.
    fn authenticate<'a>(&'a self, _code: AuthCode<'a>) -> ProviderFuture<'a, TokenResponse> {
        unsupported(Capability::AuthCode)
    }

    /// Check that a stored credential still works.
    fn test<'a>(&'a self, _credential: &'a Credential) -> ProviderFuture<'a, ()> {
        unsupported(Capability::Test)
    }

    /// Invalidate a credential at the provider.
    fn revoke<'a>(&'a self, _credential: &'a Credential) -> ProviderFuture<'a, ()> {
        unsupported(Capability::RemoteRevoke)
    }
}

/// Provider adapters keyed by service name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("services", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(service.into(), provider);
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(service).cloned()
    }

    /// Declared capabilities, or none for an unregistered service.
    pub fn capabilities(&self, service: &str) -> Capabilities {
        self.providers.get(service).map(|p| p.capabilities()).unwrap_or_default()
    }

    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.providers.keys().cloned().collect();
        services.sort();
        services
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Build built-in adapters from a parsed providers file.
    pub fn from_file(file: ProvidersFile, client: &reqwest::Client) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for entry in file.providers {
            let service = entry.service.trim().to_owned();
            if service.is_empty() {
                anyhow::bail!("provider entry has an empty service name");
            }
            if registry.providers.contains_key(&service) {
                anyhow::bail!("duplicate provider for service {service:?}");
            }
            let provider: Arc<dyn Provider> = match entry.kind {
                ProviderKind::Oauth(config) => {
                    Arc::new(OAuthProvider::new(&service, config, client.clone())?)
                }
                ProviderKind::ApiKey(config) => {
                    Arc::new(ApiKeyProvider::new(&service, config, client.clone()))
                }
            };
            tracing::debug!(service = %service, capabilities = ?provider.capabilities(), "provider registered");
            registry.insert(service, provider);
        }
        Ok(registry)
    }

    /// Load and build from a JSON providers file.
    pub fn load(path: &Path, client: &reqwest::Client) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read providers file {}: {e}", path.display()))?;
        let file: ProvidersFile = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("invalid providers file {}: {e}", path.display()))?;
        Self::from_file(file, client)
    }
}

/// Top-level shape of the providers file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersFile {
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub service: String,
    #[serde(flatten)]
    pub kind: ProviderKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderKind {
    Oauth(OAuthConfig),
    ApiKey(ApiKeyConfig),
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
