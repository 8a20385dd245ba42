// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport for the credential broker.

pub mod auth;
pub mod context;
pub mod http;
pub mod http_grant;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the axum `Router` with all broker routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Credentials
        .route(
            "/api/v1/credentials",
            get(http::list_credentials).delete(http::revoke_all_credentials),
        )
        .route(
            "/api/v1/credentials/{service}",
            get(http::get_credential).put(http::put_credential).delete(http::revoke_credential),
        )
        .route("/api/v1/credentials/{service}/test", post(http::test_credential))
        // Grants
        .route("/api/v1/grants/request", post(http_grant::request_grant))
        .route("/api/v1/grants/pending", get(http_grant::pending_grants))
        .route("/api/v1/grants/{id}", get(http_grant::get_grant))
        .route("/api/v1/grants/{id}/approve", post(http_grant::approve_grant))
        .route("/api/v1/grants/{id}/deny", post(http_grant::deny_grant))
        // OAuth redirect target (no auth)
        .route("/api/v1/oauth/callback", get(http_grant::oauth_callback))
        // Audit
        .route("/api/v1/audit", get(http::query_audit))
        .route("/api/v1/audit/verify", get(http::verify_audit))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
