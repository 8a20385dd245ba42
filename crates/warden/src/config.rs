// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Configuration for the warden credential broker.
#[derive(Debug, Clone, Parser)]
#[command(name = "warden", version, about = "Credential broker for autonomous agents.")]
pub struct Config {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "WARDEN_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9900, env = "WARDEN_PORT")]
    pub port: u16,

    /// Bearer token for API auth. If unset, auth is disabled.
    #[arg(long, env = "WARDEN_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Principal recorded when a request carries no `X-Principal-Id`.
    #[arg(long, default_value = "owner", env = "WARDEN_PRINCIPAL")]
    pub principal: String,

    /// Directory for the vault, grants, audit log and audit key.
    #[arg(long, env = "WARDEN_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// HMAC key for the audit chain. Read from `<state-dir>/audit.key` if unset.
    #[arg(long, env = "WARDEN_AUDIT_KEY", hide_env_values = true)]
    pub audit_key: Option<String>,

    /// Path to the providers JSON file.
    #[arg(long, env = "WARDEN_PROVIDERS")]
    pub providers: Option<PathBuf>,

    /// Link included in grant request notifications.
    #[arg(long, env = "WARDEN_DASHBOARD_URL")]
    pub dashboard_url: Option<String>,

    /// Webhook POSTed on every new grant request.
    #[arg(long, env = "WARDEN_NOTIFY_WEBHOOK")]
    pub notify_webhook: Option<String>,

    /// Timeout for each outbound HTTP call in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "WARDEN_HTTP_TIMEOUT_MS")]
    pub http_timeout_ms: u64,

    /// Log format (json or text).
    #[arg(long, default_value = "json", env = "WARDEN_LOG_FORMAT")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "WARDEN_LOG_LEVEL")]
    pub log_level: String,

    /// Keep every store in memory; nothing is written to disk.
    #[arg(long, env = "WARDEN_EPHEMERAL")]
    pub ephemeral: bool,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            anyhow::bail!("--auth-token must not be empty when set");
        }
        if self.http_timeout_ms == 0 {
            anyhow::bail!("--http-timeout-ms must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("invalid log format: {} (expected json or text)", self.log_format);
        }
        if self.principal.trim().is_empty() {
            anyhow::bail!("--principal must not be empty");
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Resolve the state directory.
    ///
    /// Uses `--state-dir`, then `$XDG_STATE_HOME/warden`, then
    /// `$HOME/.local/state/warden`.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
            return PathBuf::from(xdg).join("warden");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/state/warden");
        }
        PathBuf::from(".warden")
    }

    /// Redirect URI handed to providers for the authorization code flow.
    pub fn callback_url(&self) -> String {
        format!("http://{}:{}/api/v1/oauth/callback", self.host, self.port)
    }

    /// Build a minimal `Config` for tests (port 0, ephemeral stores).
    #[doc(hidden)]
    pub fn test() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            auth_token: None,
            principal: "owner".into(),
            state_dir: None,
            audit_key: Some("test-audit-key".into()),
            providers: None,
            dashboard_url: None,
            notify_webhook: None,
            http_timeout_ms: 2_000,
            log_format: "text".into(),
            log_level: "debug".into(),
            ephemeral: true,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
