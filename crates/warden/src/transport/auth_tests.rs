// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::{HeaderMap, HeaderValue};

use super::*;

fn headers(authorization: Option<&'static str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(value) = authorization {
        headers.insert("authorization", HeaderValue::from_static(value));
    }
    headers
}

#[yare::parameterized(
    matching = { Some("Bearer s3cret"), Some("s3cret"), true },
    no_token_configured = { None, None, true },
    no_token_configured_ignores_header = { Some("Bearer whatever"), None, true },
    missing_header = { None, Some("s3cret"), false },
    wrong_token = { Some("Bearer s3cret!"), Some("s3cret"), false },
    wrong_scheme = { Some("Basic s3cret"), Some("s3cret"), false },
    lowercase_scheme = { Some("bearer s3cret"), Some("s3cret"), false },
)]
fn bearer_validation(header: Option<&'static str>, expected: Option<&str>, ok: bool) {
    let result = validate_bearer(&headers(header), expected);
    assert_eq!(result.is_ok(), ok, "header={header:?} expected={expected:?}");
    if let Err(code) = result {
        assert_eq!(code, ErrorCode::Unauthorized);
    }
}
