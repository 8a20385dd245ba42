// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Form, Router};
use parking_lot::Mutex;

use super::*;
use crate::test_support::http_client;
use crate::vault::CredentialData;

const PROVIDERS_JSON: &str = r#"{
  "providers": [
    {
      "service": "github",
      "kind": "oauth",
      "client_id": "Iv1.abc",
      "authorize_url": "https://github.com/login/oauth/authorize",
      "token_url": "https://github.com/login/oauth/access_token",
      "device_authorization_url": "https://github.com/login/device/code"
    },
    {
      "service": "google",
      "kind": "oauth",
      "client_id": "g-client",
      "client_secret": "g-secret",
      "authorize_url": "https://accounts.google.com/o/oauth2/v2/auth",
      "token_url": "https://oauth2.googleapis.com/token",
      "revocation_url": "https://oauth2.googleapis.com/revoke",
      "extra_params": {"access_type": "offline", "prompt": "consent"}
    },
    { "service": "openai", "kind": "api_key" }
  ]
}"#;

fn registry() -> anyhow::Result<ProviderRegistry> {
    let file: ProvidersFile = serde_json::from_str(PROVIDERS_JSON)?;
    ProviderRegistry::from_file(file, &http_client())
}

fn api_key(key: &str) -> Credential {
    Credential::new("openai", CredentialData::ApiKey { key: key.to_owned() })
}

#[test]
fn capabilities_follow_configured_endpoints() -> anyhow::Result<()> {
    let registry = registry()?;
    assert_eq!(registry.services(), vec!["github", "google", "openai"]);

    let github = registry.capabilities("github");
    assert!(github.auth_code && github.device_flow);
    assert!(!github.remote_revoke && !github.test);

    let google = registry.capabilities("google");
    assert!(google.auth_code && google.remote_revoke && !google.device_flow);

    assert_eq!(registry.capabilities("openai"), Capabilities::default());
    assert!(!registry.capabilities("openai").oauth_capable());
    assert_eq!(registry.capabilities("unregistered"), Capabilities::default());
    Ok(())
}

#[test]
fn authorize_url_carries_pkce_and_extras() -> anyhow::Result<()> {
    let registry = registry()?;
    let google = registry.get("google").ok_or_else(|| anyhow::anyhow!("google missing"))?;
    let scopes = vec!["email".to_owned()];
    let url = google
        .authorize_url(AuthorizeParams {
            state: "st",
            code_challenge: "ch",
            redirect_uri: "http://127.0.0.1:9900/api/v1/oauth/callback",
            scopes: &scopes,
        })
        .ok_or_else(|| anyhow::anyhow!("no authorize url"))?;
    assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?client_id=g-client&"));
    assert!(url.contains("code_challenge=ch&code_challenge_method=S256&state=st"));
    assert!(url.ends_with("&access_type=offline&prompt=consent"));

    let openai = registry.get("openai").ok_or_else(|| anyhow::anyhow!("openai missing"))?;
    assert!(openai
        .authorize_url(AuthorizeParams {
            state: "st",
            code_challenge: "ch",
            redirect_uri: "r",
            scopes: &scopes,
        })
        .is_none());
    Ok(())
}

#[test]
fn device_endpoints_only_when_declared() -> anyhow::Result<()> {
    let registry = registry()?;
    let github = registry.get("github").ok_or_else(|| anyhow::anyhow!("github missing"))?;
    let endpoints = github.device_endpoints().ok_or_else(|| anyhow::anyhow!("no endpoints"))?;
    assert_eq!(endpoints.device_authorization_url, "https://github.com/login/device/code");
    assert_eq!(endpoints.token_url, "https://github.com/login/oauth/access_token");
    assert!(registry.get("google").and_then(|p| p.device_endpoints()).is_none());
    Ok(())
}

#[tokio::test]
async fn undeclared_capabilities_are_unsupported() -> anyhow::Result<()> {
    let registry = registry()?;
    let github = registry.get("github").ok_or_else(|| anyhow::anyhow!("github missing"))?;
    let cred = api_key("x");

    let err = github.revoke(&cred).await.err();
    assert!(matches!(err, Some(ProviderError::Unsupported(Capability::RemoteRevoke))));
    let err = github.test(&cred).await.err();
    assert!(matches!(err, Some(ProviderError::Unsupported(Capability::Test))));
    Ok(())
}

#[tokio::test]
async fn api_key_revoke_is_trivially_successful() -> anyhow::Result<()> {
    let registry = registry()?;
    let openai = registry.get("openai").ok_or_else(|| anyhow::anyhow!("openai missing"))?;
    openai.revoke(&api_key("sk-1")).await?;
    Ok(())
}

#[yare::parameterized(
    duplicate = {
        r#"{"providers":[{"service":"a","kind":"api_key"},{"service":"a","kind":"api_key"}]}"#,
        "duplicate provider"
    },
    empty_service = { r#"{"providers":[{"service":" ","kind":"api_key"}]}"#, "empty service" },
    missing_client_id = {
        r#"{"providers":[{"service":"a","kind":"oauth","client_id":"","token_url":"https://t"}]}"#,
        "client_id is required"
    },
)]
fn rejects_bad_provider_files(json: &str, expected: &str) {
    let result = serde_json::from_str::<ProvidersFile>(json)
        .map_err(anyhow::Error::from)
        .and_then(|file| ProviderRegistry::from_file(file, &http_client()));
    crate::assert_err_contains!(result, expected);
}

#[test]
fn unknown_kind_fails_to_parse() {
    let result: Result<ProvidersFile, _> =
        serde_json::from_str(r#"{"providers":[{"service":"a","kind":"saml"}]}"#);
    assert!(result.is_err());
}

#[test]
fn load_reads_file_from_disk() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("providers.json");
    std::fs::write(&path, PROVIDERS_JSON)?;
    let registry = ProviderRegistry::load(&path, &http_client())?;
    assert_eq!(registry.len(), 3);

    crate::assert_err_contains!(
        ProviderRegistry::load(&tmp.path().join("absent.json"), &http_client()),
        "failed to read providers file"
    );
    Ok(())
}

type Seen = Arc<Mutex<Vec<Vec<(String, String)>>>>;

async fn revoke_endpoint(
    State(seen): State<Seen>,
    Form(form): Form<Vec<(String, String)>>,
) -> StatusCode {
    let fail = form.iter().any(|(k, v)| k == "token" && v == "bad");
    seen.lock().push(form);
    if fail {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    }
}

#[tokio::test]
async fn oauth_revoke_posts_rfc7009_form() -> anyhow::Result<()> {
    let seen: Seen = Arc::default();
    let app = Router::new().route("/revoke", post(revoke_endpoint)).with_state(Arc::clone(&seen));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });

    let provider = OAuthProvider::new(
        "google",
        OAuthConfig {
            client_id: "cid".to_owned(),
            client_secret: Some("csecret".to_owned()),
            token_url: format!("http://{addr}/token"),
            revocation_url: Some(format!("http://{addr}/revoke")),
            ..Default::default()
        },
        http_client(),
    )?;
    let cred = Credential::new(
        "google",
        CredentialData::Oauth {
            access_token: "ya29.good".to_owned(),
            refresh_token: None,
            token_type: None,
            scope: None,
        },
    );
    provider.revoke(&cred).await?;

    let mut bad = cred.clone();
    bad.data = CredentialData::Oauth {
        access_token: "bad".to_owned(),
        refresh_token: None,
        token_type: None,
        scope: None,
    };
    let err = provider.revoke(&bad).await.err();
    assert!(matches!(err, Some(ProviderError::Rejected { status: 400, .. })));

    let forms = seen.lock().clone();
    assert_eq!(forms.len(), 2);
    assert_eq!(
        forms[0],
        vec![
            ("token".to_owned(), "ya29.good".to_owned()),
            ("token_type_hint".to_owned(), "access_token".to_owned()),
            ("client_id".to_owned(), "cid".to_owned()),
            ("client_secret".to_owned(), "csecret".to_owned()),
        ]
    );
    Ok(())
}
