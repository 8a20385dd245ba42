// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Generic OAuth 2.0 provider: authorization code + PKCE, device flow,
//! RFC 7009 revocation, and an optional bearer-authenticated test URL.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{AuthCode, AuthorizeParams, Capabilities, Capability, Provider, ProviderError, ProviderFuture};
use crate::device::DeviceEndpoints;
use crate::oauth::pkce::{self, AuthUrlParams};
use crate::oauth::TokenResponse;
use crate::vault::Credential;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorize_url: Option<String>,
    pub token_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_authorization_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_url: Option<String>,
    /// Extra query parameters appended to the authorization URL.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_params: BTreeMap<String, String>,
}

pub struct OAuthProvider {
    service: String,
    config: OAuthConfig,
    extra: Vec<(String, String)>,
    client: reqwest::Client,
}

impl OAuthProvider {
    pub fn new(service: &str, config: OAuthConfig, client: reqwest::Client) -> anyhow::Result<Self> {
        if config.client_id.is_empty() {
            anyhow::bail!("oauth provider {service:?}: client_id is required");
        }
        if config.token_url.is_empty() {
            anyhow::bail!("oauth provider {service:?}: token_url is required");
        }
        let extra = config.extra_params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(Self { service: service.to_owned(), config, extra, client })
    }

    async fn exchange(&self, code: AuthCode<'_>) -> Result<TokenResponse, ProviderError> {
        let token = pkce::exchange_code(
            &self.client,
            &self.config.token_url,
            &self.config.client_id,
            self.config.client_secret.as_deref(),
            code.code,
            code.code_verifier,
            code.redirect_uri,
        )
        .await?;
        Ok(token)
    }

    async fn check(&self, url: &str, credential: &Credential) -> Result<(), ProviderError> {
        let resp = self.client.get(url).bearer_auth(credential.data.secret()).send().await?;
        ensure_success(resp).await
    }

    async fn revoke_token(&self, url: &str, credential: &Credential) -> Result<(), ProviderError> {
        let mut form = vec![
            ("token", credential.data.secret()),
            ("token_type_hint", "access_token"),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(ref secret) = self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        let resp = self.client.post(url).form(&form).send().await?;
        ensure_success(resp).await
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<(), ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Rejected { status: status.as_u16(), body })
}

impl Provider for OAuthProvider {
    fn name(&self) -> &str {
        &self.service
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            auth_code: self.config.authorize_url.is_some(),
            device_flow: self.config.device_authorization_url.is_some(),
            remote_revoke: self.config.revocation_url.is_some(),
            test: self.config.test_url.is_some(),
        }
    }

    fn authorize_url(&self, params: AuthorizeParams<'_>) -> Option<String> {
        let authorize_url = self.config.authorize_url.as_deref()?;
        Some(pkce::build_auth_url(AuthUrlParams {
            authorize_url,
            client_id: &self.config.client_id,
            redirect_uri: params.redirect_uri,
            scopes: params.scopes,
            code_challenge: params.code_challenge,
            state: params.state,
            extra: &self.extra,
        }))
    }

    fn device_endpoints(&self) -> Option<DeviceEndpoints> {
        let device_authorization_url = self.config.device_authorization_url.clone()?;
        Some(DeviceEndpoints {
            device_authorization_url,
            token_url: self.config.token_url.clone(),
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.clone(),
        })
    }

    fn authenticate<'a>(&'a self, code: AuthCode<'a>) -> ProviderFuture<'a, TokenResponse> {
        if self.config.authorize_url.is_none() {
            return Box::pin(std::future::ready(Err(ProviderError::Unsupported(Capability::AuthCode))));
        }
        Box::pin(self.exchange(code))
    }

    fn test<'a>(&'a self, credential: &'a Credential) -> ProviderFuture<'a, ()> {
        match self.config.test_url.as_deref() {
            Some(url) => Box::pin(self.check(url, credential)),
            None => Box::pin(std::future::ready(Err(ProviderError::Unsupported(Capability::Test)))),
        }
    }

    fn revoke<'a>(&'a self, credential: &'a Credential) -> ProviderFuture<'a, ()> {
        match self.config.revocation_url.as_deref() {
            Some(url) => Box::pin(self.revoke_token(url, credential)),
            None => Box::pin(std::future::ready(Err(ProviderError::Unsupported(
                Capability::RemoteRevoke,
            )))),
        }
    }
}
