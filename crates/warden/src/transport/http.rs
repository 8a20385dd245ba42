// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for health, credentials and the audit log.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditFilter, Outcome};
use crate::error::{ApiError, ErrorCode};
use crate::provider::ProviderError;
use crate::revoke::RevokeError;
use crate::state::AppState;
use crate::transport::context::RequestContext;
use crate::vault::{Credential, CredentialData, LookupError};

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub credentials: usize,
    pub pending_grants: usize,
}

/// Body of `PUT /api/v1/credentials/{service}`.
#[derive(Debug, Deserialize)]
pub struct StoreCredentialRequest {
    pub data: CredentialData,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RevokeQuery {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Result of `POST /api/v1/credentials/{service}/test`.
#[derive(Debug, Serialize)]
pub struct CredentialCheck {
    pub service: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExpiredBody {
    pub error: crate::error::ErrorBody,
    pub expired_at: chrono::DateTime<chrono::Utc>,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "running".to_owned(),
        credentials: s.vault.len().await,
        pending_grants: s.grants.pending().await.len(),
    })
}

/// `GET /api/v1/credentials`: summaries only, never secrets.
pub async fn list_credentials(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(s.vault.list().await)
}

/// `GET /api/v1/credentials/{service}`: the secret, audited before it leaves.
pub async fn get_credential(
    State(s): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Path(service): Path<String>,
) -> impl IntoResponse {
    let lookup = s.vault.get(&service).await;

    let entry = ctx.entry(AuditAction::CredentialAccessed, &service);
    let entry = match &lookup {
        Ok(_) => entry,
        Err(LookupError::NotFound) => {
            entry.outcome(Outcome::Error).error("not_found", "no credential stored")
        }
        Err(LookupError::Expired { expired_at }) => entry
            .outcome(Outcome::Error)
            .error("expired", format!("credential expired at {expired_at}")),
    };
    if let Err(e) = s.audit.append(entry).await {
        tracing::error!(service = %service, err = %e, "audit append failed, withholding credential");
        return e.to_api_response();
    }

    match lookup {
        Ok(credential) => Json(credential).into_response(),
        Err(e @ LookupError::NotFound) => {
            e.error_code().to_http_response(format!("no credential stored for {service}")).into_response()
        }
        Err(LookupError::Expired { expired_at }) => {
            let body = ExpiredBody {
                error: ErrorCode::Expired.to_error_body(format!("credential for {service} has expired")),
                expired_at,
            };
            (StatusCode::GONE, Json(body)).into_response()
        }
    }
}

/// `PUT /api/v1/credentials/{service}`: store a credential by hand.
pub async fn put_credential(
    State(s): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Path(service): Path<String>,
    Json(req): Json<StoreCredentialRequest>,
) -> impl IntoResponse {
    let mut credential = Credential::new(service.clone(), req.data);
    if let Some(secs) = req.expires_in {
        credential = credential.expires_in(secs);
    }
    let summary = credential.summary();

    if let Err(e) = s.vault.put(credential).await {
        tracing::error!(service = %service, err = %e, "failed to store credential");
        return ErrorCode::Internal.to_http_response(e.to_string()).into_response();
    }

    let entry = ctx.entry(AuditAction::CredentialStored, &service).metadata(serde_json::json!({
        "flow": "manual",
        "expires_at": summary.expires_at,
    }));
    if let Err(e) = s.audit.append(entry).await {
        tracing::error!(service = %service, err = %e, "audit append failed");
        return e.to_api_response();
    }

    tracing::info!(service = %service, kind = summary.kind.as_str(), "credential stored");
    Json(summary).into_response()
}

/// `POST /api/v1/credentials/{service}/test`: ask the provider whether the
/// stored credential still works. The secret is sent upstream, so the check
/// is audited as an access.
pub async fn test_credential(
    State(s): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Path(service): Path<String>,
) -> impl IntoResponse {
    let provider = match s.providers.get(&service) {
        Some(provider) if provider.capabilities().test => provider,
        _ => {
            return ErrorCode::BadRequest
                .to_http_response(format!("provider for {service} does not support credential tests"))
                .into_response()
        }
    };
    let credential = match s.vault.get(&service).await {
        Ok(credential) => credential,
        Err(e) => return e.to_api_response(),
    };

    let entry = ctx
        .entry(AuditAction::CredentialAccessed, &service)
        .metadata(serde_json::json!({ "purpose": "test" }));
    if let Err(e) = s.audit.append(entry).await {
        tracing::error!(service = %service, err = %e, "audit append failed, credential not tested");
        return e.to_api_response();
    }

    let check = match provider.test(&credential).await {
        Ok(()) => CredentialCheck { service, valid: true, detail: None },
        Err(e @ ProviderError::Rejected { .. }) => {
            tracing::info!(service = %service, err = %e, "stored credential rejected by provider");
            CredentialCheck { service, valid: false, detail: Some(e.to_string()) }
        }
        Err(e) => {
            tracing::warn!(service = %service, err = %e, "credential test failed");
            return e.to_api_response();
        }
    };
    Json(check).into_response()
}

fn revoke_error_response(e: RevokeError) -> axum::response::Response {
    if e.error_code() == ErrorCode::Internal {
        tracing::error!(err = %e, "revocation failed");
    }
    e.to_api_response()
}

/// `DELETE /api/v1/credentials/{service}?reason=`
pub async fn revoke_credential(
    State(s): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Path(service): Path<String>,
    Query(q): Query<RevokeQuery>,
) -> impl IntoResponse {
    match s.revoker.revoke(&service, q.reason.as_deref(), &ctx).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => revoke_error_response(e),
    }
}

/// `DELETE /api/v1/credentials?reason=`: revoke everything.
pub async fn revoke_all_credentials(
    State(s): State<Arc<AppState>>,
    RequestContext(ctx): RequestContext,
    Query(q): Query<RevokeQuery>,
) -> impl IntoResponse {
    match s.revoker.revoke_all(q.reason.as_deref(), &ctx).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => revoke_error_response(e),
    }
}

/// `GET /api/v1/audit`
pub async fn query_audit(
    State(s): State<Arc<AppState>>,
    Query(filter): Query<AuditFilter>,
) -> impl IntoResponse {
    match s.audit.query(&filter) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => e.to_api_response(),
    }
}

/// `GET /api/v1/audit/verify`
pub async fn verify_audit(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    match s.audit.verify().await {
        Ok(report) => {
            if !report.valid {
                tracing::warn!(broken_at = ?report.broken_at, "audit chain verification failed");
            }
            Json(report).into_response()
        }
        Err(e) => e.to_api_response(),
    }
}
