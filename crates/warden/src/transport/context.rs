// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-request audit context pulled from headers and the peer address.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::audit::AuditContext;
use crate::state::AppState;

/// Extractor yielding the [`AuditContext`] for the current request.
///
/// - `X-Agent-Id` names the agent, if any.
/// - `X-Principal-Id` names the principal, defaulting to the configured one.
/// - `X-Request-Id` is echoed into audit entries, or generated.
/// - The source address is the first `X-Forwarded-For` hop, else the peer.
#[derive(Debug, Clone)]
pub struct RequestContext(pub AuditContext);

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

fn source_ip(parts: &Parts) -> String {
    if let Some(forwarded) = header(&parts.headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|hop| !hop.is_empty()) {
            return first.to_owned();
        }
    }
    match parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => "unknown".to_owned(),
    }
}

impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let ctx = AuditContext {
            principal_id: header(headers, "x-principal-id").unwrap_or(&state.principal).to_owned(),
            agent_id: header(headers, "x-agent-id").map(str::to_owned),
            source_ip: source_ip(parts),
            user_agent: header(headers, "user-agent").unwrap_or("unknown").to_owned(),
            request_id: header(headers, "x-request-id")
                .map(str::to_owned)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        };
        Ok(Self(ctx))
    }
}
