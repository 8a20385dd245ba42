// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for grant requests, decisions and the OAuth callback.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::audit::AuditAction;
use crate::error::{ApiError, ErrorCode};
use crate::flow::{FlowError, FlowStart};
use crate::grant::{Grant, GrantError, GrantRequest, GrantStatus};
use crate::state::AppState;
use crate::transport::context::RequestContext;

#[derive(Debug, Serialize)]
pub struct GrantRequestResponse {
    pub grant_id: String,
    pub status: GrantStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub grant_id: String,
    pub status: GrantStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DenyRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DenyResponse {
    pub grant_id: String,
    pub status: GrantStatus,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub grant_id: String,
    pub service: String,
    pub stored: bool,
    pub message: String,
}

fn grant_error_response(e: GrantError) -> axum::response::Response {
    if e.error_code() == ErrorCode::Internal {
        tracing::error!(err = %e, "grant transition not committed");
    }
    e.to_api_response()
}

fn flow_error_response(e: FlowError) -> axum::response::Response {
    match e.error_code() {
        ErrorCode::Internal => tracing::error!(err = %e, "authorization flow not recorded"),
        _ => tracing::warn!(err = %e, "authorization flow failed"),
    }
    e.to_api_response()
}

fn not_found_or_not_pending(id: &str) -> axum::response::Response {
    ErrorCode::NotFound.to_http_response(format!("grant {id} not found or not pending")).into_response()
}

/// `POST /api/v1/grants/request`: an agent asks for access.
pub async fn request_grant(
    State(s): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Json(req): Json<GrantRequest>,
) -> impl IntoResponse {
    let agent = ctx.agent_id.clone().unwrap_or_else(|| "unknown".to_owned());
    let record = |g: &Grant| {
        s.audit.append(
            ctx.entry(AuditAction::GrantRequested, &g.service)
                .scopes(&g.scopes)
                .resource(&g.id)
                .metadata(serde_json::json!({ "method": g.method, "reason": g.reason })),
        )
    };
    let grant = match s.grants.create(req, &agent, &ctx.principal_id, record).await {
        Ok(grant) => grant,
        Err(e) => return grant_error_response(e),
    };

    let body = GrantRequestResponse {
        grant_id: grant.id,
        status: grant.status,
        message: "awaiting approval".to_owned(),
    };
    (StatusCode::CREATED, Json(body)).into_response()
}

/// `GET /api/v1/grants/pending`: oldest first.
pub async fn pending_grants(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(s.grants.pending().await)
}

/// `GET /api/v1/grants/{id}`
pub async fn get_grant(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match s.grants.get(&id).await {
        Some(grant) => Json(grant).into_response(),
        None => ErrorCode::NotFound.to_http_response(format!("grant {id} not found")).into_response(),
    }
}

/// `POST /api/v1/grants/{id}/approve`: approve and start the authorization flow.
pub async fn approve_grant(
    State(s): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let flows = Arc::clone(&s.flows);
    let record = |g: &Grant| {
        s.audit.append(ctx.entry(AuditAction::GrantApproved, &g.service).scopes(&g.scopes).resource(&g.id))
    };
    let approved = s
        .grants
        .approve(&id, &ctx.principal_id, |g| flows.oauth_capable(&g.service), record)
        .await;
    let grant = match approved {
        Ok(Some(grant)) => grant,
        Ok(None) => return not_found_or_not_pending(&id),
        Err(e) => return grant_error_response(e),
    };

    let start = match flows.begin(&grant, &ctx).await {
        Ok(start) => start,
        Err(e) => return flow_error_response(e),
    };

    let mut body = ApproveResponse {
        grant_id: grant.id,
        status: grant.status,
        oauth_url: None,
        user_code: None,
        verification_uri: None,
        expires_in: None,
        message: String::new(),
    };
    match start {
        FlowStart::OauthUrl { oauth_url } => {
            body.oauth_url = Some(oauth_url);
            body.message = "visit oauth_url to authorize".to_owned();
        }
        FlowStart::Device { user_code, verification_uri, expires_in } => {
            body.message = format!("enter {user_code} at {verification_uri}");
            body.user_code = Some(user_code);
            body.verification_uri = Some(verification_uri);
            body.expires_in = Some(expires_in);
        }
        FlowStart::Manual => {
            body.message = format!("store the credential with PUT /api/v1/credentials/{}", grant.service);
        }
    }
    Json(body).into_response()
}

/// `POST /api/v1/grants/{id}/deny`: body `{reason?}` is optional.
pub async fn deny_grant(
    State(s): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let req = if body.is_empty() {
        DenyRequest::default()
    } else {
        match serde_json::from_slice::<DenyRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return ErrorCode::BadRequest
                    .to_http_response(format!("invalid deny body: {e}"))
                    .into_response()
            }
        }
    };

    let record = |g: &Grant| {
        let mut entry =
            ctx.entry(AuditAction::GrantDenied, &g.service).scopes(&g.scopes).resource(&g.id);
        if let Some(ref reason) = g.deny_reason {
            entry = entry.metadata(serde_json::json!({ "reason": reason }));
        }
        s.audit.append(entry)
    };
    let grant = match s.grants.deny(&id, req.reason, &ctx.principal_id, record).await {
        Ok(Some(grant)) => grant,
        Ok(None) => return not_found_or_not_pending(&id),
        Err(e) => return grant_error_response(e),
    };

    Json(DenyResponse { grant_id: grant.id, status: grant.status }).into_response()
}

/// `GET /api/v1/oauth/callback?state=&code=`: provider redirect target.
pub async fn oauth_callback(
    State(s): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    if let Some(error) = params.error {
        let detail = params.error_description.unwrap_or_default();
        tracing::warn!(error = %error, detail = %detail, "provider returned an authorization error");
        return ErrorCode::BadRequest
            .to_http_response(format!("authorization failed: {error} {detail}").trim_end().to_owned())
            .into_response();
    }
    let (Some(state), Some(code)) = (params.state, params.code) else {
        return ErrorCode::BadRequest.to_http_response("state and code are required").into_response();
    };

    match s.flows.complete(&state, &code, &ctx).await {
        Ok(grant) => Json(CallbackResponse {
            message: format!("credential for {} stored", grant.service),
            grant_id: grant.id,
            service: grant.service,
            stored: true,
        })
        .into_response(),
        Err(e @ (FlowError::UnknownState | FlowError::GrantNotApproved)) => e.to_api_response(),
        Err(e) => flow_error_response(e),
    }
}
