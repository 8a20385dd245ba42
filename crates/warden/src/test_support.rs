// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: builders, mocks, and assertion helpers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Form, Json, Router};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::audit::storage::{AuditStorage, MemoryStorage};
use crate::audit::{AuditChain, AuditError};
use crate::flow::FlowSettings;
use crate::grant::{Grant, GrantStore};
use crate::provider::{
    Capabilities, Capability, OAuthConfig, Provider, ProviderError, ProviderFuture, ProviderRegistry,
};
use crate::state::{AppParts, AppState};
use crate::vault::{Credential, CredentialVault};

static INIT: Once = Once::new();

/// Install the rustls crypto provider (needed for reqwest even on plain HTTP).
pub fn ensure_crypto_provider() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// HTTP client for tests, with the crypto provider installed.
pub fn http_client() -> reqwest::Client {
    ensure_crypto_provider();
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default()
}

/// Assert that an expression evaluates to `Err` whose Display output
/// contains the given substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}

/// Grant-transition recorder that writes nothing, for exercising the state
/// machine on its own.
pub fn unrecorded(_: &Grant) -> std::future::Ready<Result<(), AuditError>> {
    std::future::ready(Ok(()))
}

/// Audit storage that can be switched into failing every append.
#[derive(Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    failing: AtomicBool,
}

impl FailingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl AuditStorage for FailingStorage {
    fn append(&self, line: &str) -> std::io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full"));
        }
        self.inner.append(line)
    }

    fn read_all(&self) -> std::io::Result<Vec<Vec<u8>>> {
        self.inner.read_all()
    }
}

/// Provider with fixed capabilities that records revoke calls.
pub struct MockProvider {
    name: String,
    capabilities: Capabilities,
    fail_revoke: bool,
    accepts: Option<String>,
    revoked: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(name: &str, capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            capabilities,
            fail_revoke: false,
            accepts: None,
            revoked: Mutex::new(Vec::new()),
        })
    }

    /// Provider declaring `remote_revoke` whose revoke call fails.
    pub fn failing_revoke(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            capabilities: Capabilities { remote_revoke: true, ..Capabilities::default() },
            fail_revoke: true,
            accepts: None,
            revoked: Mutex::new(Vec::new()),
        })
    }

    /// Provider declaring `test` that accepts only the given secret.
    pub fn testable(name: &str, accepts: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            capabilities: Capabilities { test: true, ..Capabilities::default() },
            fail_revoke: false,
            accepts: Some(accepts.to_owned()),
            revoked: Mutex::new(Vec::new()),
        })
    }

    /// Provider declaring `remote_revoke` whose revoke call succeeds.
    pub fn revocable(name: &str) -> Arc<Self> {
        Self::new(name, Capabilities { remote_revoke: true, ..Capabilities::default() })
    }

    /// Secrets passed to successful or failed revoke calls.
    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().clone()
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn test<'a>(&'a self, credential: &'a Credential) -> ProviderFuture<'a, ()> {
        let result = match self.accepts.as_deref() {
            Some(secret) if secret == credential.data.secret() => Ok(()),
            Some(_) => Err(ProviderError::Rejected { status: 401, body: "bad credentials".to_owned() }),
            None => Err(ProviderError::Unsupported(Capability::Test)),
        };
        Box::pin(std::future::ready(result))
    }

    fn revoke<'a>(&'a self, credential: &'a Credential) -> ProviderFuture<'a, ()> {
        self.revoked.lock().push(credential.data.secret().to_owned());
        let result = if self.fail_revoke {
            Err(ProviderError::Rejected { status: 503, body: "upstream unavailable".to_owned() })
        } else {
            Ok(())
        };
        Box::pin(std::future::ready(result))
    }
}

#[derive(Default)]
struct MockOAuthState {
    /// `authorization_pending` replies left before the device token is issued.
    device_pending: AtomicU32,
    /// Answer `authorization_pending` forever.
    device_never: AtomicBool,
    token_requests: AtomicU32,
    revoked: Mutex<Vec<String>>,
}

/// Local OAuth 2.0 authorization server for flow tests.
///
/// - `POST /token`: `authorization_code` grants accept the code `good-code`;
///   device grants answer `authorization_pending` as configured, then a token.
/// - `POST /device/code`: issues `user_code` `WDJB-MJHT` polled every second.
/// - `POST /revoke`: records the token and answers 200.
pub struct MockOAuthServer {
    pub addr: SocketAddr,
    state: Arc<MockOAuthState>,
    shutdown: CancellationToken,
}

impl MockOAuthServer {
    pub async fn start() -> anyhow::Result<Self> {
        let state = Arc::new(MockOAuthState::default());
        let app = Router::new()
            .route("/token", post(mock_token))
            .route("/device/code", post(mock_device_code))
            .route("/revoke", post(mock_revoke))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).with_graceful_shutdown(stop.cancelled_owned()).await;
        });
        Ok(Self { addr, state, shutdown })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Provider config with every endpoint pointing at this server.
    pub fn oauth_config(&self) -> OAuthConfig {
        OAuthConfig {
            client_id: "test-client".to_owned(),
            authorize_url: Some(self.url("/authorize")),
            token_url: self.url("/token"),
            device_authorization_url: Some(self.url("/device/code")),
            revocation_url: Some(self.url("/revoke")),
            ..OAuthConfig::default()
        }
    }

    pub fn set_device_pending(&self, polls: u32) {
        self.state.device_pending.store(polls, Ordering::SeqCst);
    }

    pub fn set_device_never(&self) {
        self.state.device_never.store(true, Ordering::SeqCst);
    }

    pub fn token_requests(&self) -> u32 {
        self.state.token_requests.load(Ordering::SeqCst)
    }

    pub fn revoked_tokens(&self) -> Vec<String> {
        self.state.revoked.lock().clone()
    }
}

impl Drop for MockOAuthServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn form_value<'a>(form: &'a [(String, String)], key: &str) -> Option<&'a str> {
    form.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

async fn mock_token(
    State(state): State<Arc<MockOAuthState>>,
    Form(form): Form<Vec<(String, String)>>,
) -> impl IntoResponse {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    match form_value(&form, "grant_type") {
        Some("authorization_code") => {
            if form_value(&form, "code") != Some("good-code")
                || form_value(&form, "code_verifier").is_none()
            {
                return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": "invalid_grant"})));
            }
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "access_token": "redirect-token",
                    "refresh_token": "redirect-refresh",
                    "token_type": "bearer",
                })),
            )
        }
        Some("urn:ietf:params:oauth:grant-type:device_code") => {
            let pending = state.device_never.load(Ordering::SeqCst)
                || state
                    .device_pending
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if pending {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "authorization_pending"})),
                );
            }
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "access_token": "device-token",
                    "token_type": "bearer",
                    "expires_in": 3600,
                })),
            )
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "unsupported_grant_type"})),
        ),
    }
}

async fn mock_device_code() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "device_code": "device-code-1",
        "user_code": "WDJB-MJHT",
        "verification_uri": "https://example.com/device",
        "expires_in": 60,
        "interval": 1,
    }))
}

async fn mock_revoke(
    State(state): State<Arc<MockOAuthState>>,
    Form(form): Form<Vec<(String, String)>>,
) -> StatusCode {
    if let Some(token) = form_value(&form, "token") {
        state.revoked.lock().push(token.to_owned());
    }
    StatusCode::OK
}

/// Builder for constructing [`AppState`] in tests with in-memory stores.
pub struct StateBuilder {
    providers: ProviderRegistry,
    storage: Arc<dyn AuditStorage>,
    auth_token: Option<String>,
    principal: String,
    redirect_uri: String,
}

impl Default for StateBuilder {
    fn default() -> Self {
        Self {
            providers: ProviderRegistry::new(),
            storage: Arc::new(MemoryStorage::new()),
            auth_token: None,
            principal: "owner".to_owned(),
            redirect_uri: "http://127.0.0.1:9900/api/v1/oauth/callback".to_owned(),
        }
    }
}

impl StateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, service: &str, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(service, provider);
        self
    }

    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn AuditStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    pub fn principal(mut self, principal: &str) -> Self {
        self.principal = principal.to_owned();
        self
    }

    pub fn build(self) -> anyhow::Result<Arc<AppState>> {
        let (grant_tx, _) = broadcast::channel(crate::grant::EVENT_CAPACITY);
        let audit = AuditChain::open(self.storage, b"test-audit-key")?;
        let parts = AppParts {
            vault: Arc::new(CredentialVault::in_memory()),
            grants: Arc::new(GrantStore::in_memory(grant_tx)),
            audit: Arc::new(audit),
            providers: self.providers,
            client: http_client(),
            flow: FlowSettings {
                redirect_uri: self.redirect_uri,
                call_timeout: Duration::from_secs(2),
            },
            auth_token: self.auth_token,
            principal: self.principal,
        };
        Ok(Arc::new(AppState::new(parts, CancellationToken::new())))
    }
}
