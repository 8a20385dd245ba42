// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth 2.0 Device Authorization Grant (RFC 8628) polling.
//!
//! The poll loop is generic over a [`TokenEndpoint`] so the response
//! classification and timing rules can be driven by a scripted endpoint
//! in tests. [`HttpDeviceClient`] is the reqwest-backed implementation.

pub mod http;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::oauth::TokenResponse;

pub use http::{DeviceEndpoints, HttpDeviceClient};

/// One classified answer from the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenReply {
    Token(TokenResponse),
    Pending,
    /// Back off; `interval` is the server's suggested interval in seconds, if given.
    /// The poller only ever lengthens its interval in response.
    SlowDown { interval: Option<u64> },
    AccessDenied,
    ExpiredToken,
    /// Any other structured `error` response.
    Error { code: String, description: Option<String> },
}

impl TokenReply {
    /// Classify a token endpoint response body.
    ///
    /// A structured `error` field wins over `access_token`. Returns `None` for
    /// bodies that are neither, which the poller treats as transient.
    pub fn from_body(body: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        if let Some(code) = value.get("error").and_then(|v| v.as_str()) {
            return Some(match code {
                "authorization_pending" => Self::Pending,
                "slow_down" => {
                    Self::SlowDown { interval: value.get("interval").and_then(|v| v.as_u64()) }
                }
                "access_denied" => Self::AccessDenied,
                "expired_token" => Self::ExpiredToken,
                other => Self::Error {
                    code: other.to_owned(),
                    description: value
                        .get("error_description")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                },
            });
        }
        if value.get("access_token").is_some_and(|v| v.is_string()) {
            return serde_json::from_value(value).ok().map(Self::Token);
        }
        None
    }
}

/// Terminal outcomes of a device-flow poll.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("device code expired before the user completed authorization")]
    DeviceCodeExpired,
    #[error("user denied the authorization request")]
    AccessDenied,
    #[error("device code rejected as expired by the provider")]
    ExpiredToken,
    #[error("provider error {code}: {}", description.as_deref().unwrap_or("no description"))]
    Provider { code: String, description: Option<String> },
    #[error("device flow cancelled")]
    Cancelled,
}

impl PollError {
    /// Stable code recorded in audit entries.
    pub fn code(&self) -> &str {
        match self {
            Self::DeviceCodeExpired => "device_code_expired",
            Self::AccessDenied => "access_denied",
            Self::ExpiredToken => "expired_token",
            Self::Provider { code, .. } => code,
            Self::Cancelled => "cancelled",
        }
    }
}

/// Source of token endpoint replies. `Err` is a transport-level failure and
/// is retried.
pub trait TokenEndpoint: Send + Sync {
    fn poll<'a>(
        &'a self,
        device_code: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<TokenReply>> + Send + 'a>>;
}

/// Timing parameters for [`poll_until_authorized`].
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub interval: Duration,
    pub expires_in: Duration,
    /// Bound on each individual token request.
    pub call_timeout: Duration,
}

impl PollSchedule {
    /// Schedule from a device authorization response. Zero interval falls back
    /// to the RFC default of 5 seconds.
    pub fn new(interval_secs: u64, expires_in_secs: u64, call_timeout: Duration) -> Self {
        let interval = if interval_secs == 0 { 5 } else { interval_secs };
        Self {
            interval: Duration::from_secs(interval),
            expires_in: Duration::from_secs(expires_in_secs),
            call_timeout,
        }
    }
}

/// Poll `endpoint` until the user completes authorization, the code expires,
/// the provider reports a terminal error, or `cancel` fires.
pub async fn poll_until_authorized(
    endpoint: &dyn TokenEndpoint,
    device_code: &str,
    schedule: PollSchedule,
    cancel: &CancellationToken,
) -> Result<TokenResponse, PollError> {
    let deadline = Instant::now() + schedule.expires_in;
    let mut interval = schedule.interval;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }

        if Instant::now() >= deadline {
            return Err(PollError::DeviceCodeExpired);
        }

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            r = tokio::time::timeout(schedule.call_timeout, endpoint.poll(device_code)) => r,
        };

        let reply = match reply {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!(err = %e, "device token poll failed, retrying");
                continue;
            }
            Err(_) => {
                tracing::warn!(timeout_ms = schedule.call_timeout.as_millis() as u64, "device token poll timed out, retrying");
                continue;
            }
        };

        match reply {
            TokenReply::Token(token) => return Ok(token),
            TokenReply::Pending => {}
            TokenReply::SlowDown { interval: hint } => {
                // Never shorter than one second more than before.
                let floor = interval + Duration::from_secs(1);
                interval = hint.map(Duration::from_secs).map_or(floor, |h| h.max(floor));
                tracing::debug!(interval_secs = interval.as_secs(), "device flow slow_down");
            }
            TokenReply::AccessDenied => return Err(PollError::AccessDenied),
            TokenReply::ExpiredToken => return Err(PollError::ExpiredToken),
            TokenReply::Error { code, description } => {
                return Err(PollError::Provider { code, description });
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
