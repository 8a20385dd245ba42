// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn state_is_43_chars_of_base64url() -> anyhow::Result<()> {
    let state = generate_state();
    assert_eq!(state.len(), 43);
    assert!(state.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    assert_ne!(state, generate_state());
    Ok(())
}

#[test]
fn challenge_matches_rfc7636_appendix_b() -> anyhow::Result<()> {
    let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    assert_eq!(compute_code_challenge(verifier), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    Ok(())
}

#[test]
fn auth_url_orders_standard_params_then_extras() -> anyhow::Result<()> {
    let scopes = vec!["repo".to_owned(), "read:org".to_owned()];
    let extra = vec![("access_type".to_owned(), "offline".to_owned())];
    let url = build_auth_url(AuthUrlParams {
        authorize_url: "https://example.com/authorize",
        client_id: "client-123",
        redirect_uri: "http://localhost:9900/api/v1/oauth/callback",
        scopes: &scopes,
        code_challenge: "challenge-abc",
        state: "state-xyz",
        extra: &extra,
    });

    let (base, query) = url.split_once('?').ok_or_else(|| anyhow::anyhow!("no query"))?;
    assert_eq!(base, "https://example.com/authorize");
    let keys: Vec<&str> = query.split('&').filter_map(|p| p.split('=').next()).collect();
    assert_eq!(
        keys,
        [
            "client_id",
            "response_type",
            "redirect_uri",
            "scope",
            "code_challenge",
            "code_challenge_method",
            "state",
            "access_type",
        ],
    );
    assert!(url.contains("scope=repo+read%3Aorg"));
    assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A9900%2Fapi%2Fv1%2Foauth%2Fcallback"));
    Ok(())
}

#[test]
fn auth_url_extends_existing_query() -> anyhow::Result<()> {
    let url = build_auth_url(AuthUrlParams {
        authorize_url: "https://example.com/authorize?tenant=acme",
        client_id: "c",
        redirect_uri: "r",
        scopes: &[],
        code_challenge: "x",
        state: "s",
        extra: &[],
    });
    assert!(url.starts_with("https://example.com/authorize?tenant=acme&client_id=c&"));
    Ok(())
}
