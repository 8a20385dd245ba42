// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};

use super::{Capabilities, Capability, Provider, ProviderError, ProviderFuture};
use crate::vault::Credential;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// URL fetched with the key to check it still works.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_url: Option<String>,
    /// Header carrying the key on test requests. Defaults to a bearer
    /// `Authorization` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

/// Static API key service. Keys are pasted in by the owner and cannot be
/// invalidated remotely, so revocation is local only.
pub struct ApiKeyProvider {
    service: String,
    config: ApiKeyConfig,
    client: reqwest::Client,
}

impl ApiKeyProvider {
    pub fn new(service: &str, config: ApiKeyConfig, client: reqwest::Client) -> Self {
        Self { service: service.to_owned(), config, client }
    }

    async fn check(&self, url: &str, credential: &Credential) -> Result<(), ProviderError> {
        let request = self.client.get(url);
        let request = match self.config.header.as_deref() {
            Some(header) => request.header(header, credential.data.secret()),
            None => request.bearer_auth(credential.data.secret()),
        };
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ProviderError::Rejected { status: status.as_u16(), body })
    }
}

impl Provider for ApiKeyProvider {
    fn name(&self) -> &str {
        &self.service
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { test: self.config.test_url.is_some(), ..Capabilities::default() }
    }

    fn test<'a>(&'a self, credential: &'a Credential) -> ProviderFuture<'a, ()> {
        match self.config.test_url.as_deref() {
            Some(url) => Box::pin(self.check(url, credential)),
            None => Box::pin(std::future::ready(Err(ProviderError::Unsupported(Capability::Test)))),
        }
    }

    fn revoke<'a>(&'a self, _credential: &'a Credential) -> ProviderFuture<'a, ()> {
        Box::pin(std::future::ready(Ok(())))
    }
}
