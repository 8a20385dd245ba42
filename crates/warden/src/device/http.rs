// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::{TokenEndpoint, TokenReply};
use crate::oauth::DeviceCodeResponse;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Endpoints a provider exposes for the device flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEndpoints {
    pub device_authorization_url: String,
    pub token_url: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Device-flow client over HTTP.
pub struct HttpDeviceClient {
    client: reqwest::Client,
    endpoints: DeviceEndpoints,
}

impl HttpDeviceClient {
    pub fn new(client: reqwest::Client, endpoints: DeviceEndpoints) -> Self {
        Self { client, endpoints }
    }

    /// Initiate device authorization by POSTing to the device auth endpoint.
    pub async fn initiate(&self, scopes: &[String]) -> anyhow::Result<DeviceCodeResponse> {
        let scope = scopes.join(" ");
        let resp = self
            .client
            .post(&self.endpoints.device_authorization_url)
            .header("Accept", "application/json")
            .form(&[("client_id", self.endpoints.client_id.as_str()), ("scope", scope.as_str())])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("device authorization failed ({status}): {text}");
        }

        let device: DeviceCodeResponse = resp.json().await?;
        Ok(device)
    }

    async fn request_token(&self, device_code: &str) -> anyhow::Result<TokenReply> {
        let mut form = vec![
            ("grant_type", DEVICE_CODE_GRANT),
            ("client_id", self.endpoints.client_id.as_str()),
            ("device_code", device_code),
        ];
        if let Some(ref secret) = self.endpoints.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let resp = self
            .client
            .post(&self.endpoints.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        // Pending and slow_down arrive as 400s, so classify by body not status.
        let status = resp.status();
        let text = resp.text().await?;
        TokenReply::from_body(&text)
            .ok_or_else(|| anyhow::anyhow!("unrecognised token response ({status})"))
    }
}

impl TokenEndpoint for HttpDeviceClient {
    fn poll<'a>(
        &'a self,
        device_code: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<TokenReply>> + Send + 'a>> {
        Box::pin(self.request_token(device_code))
    }
}
