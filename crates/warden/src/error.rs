// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! API error envelope and the mapping from domain errors onto it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::audit::AuditError;
use crate::flow::FlowError;
use crate::grant::GrantError;
use crate::provider::ProviderError;
use crate::revoke::RevokeError;
use crate::vault::LookupError;

/// Error codes for the warden API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    BadRequest,
    NotFound,
    Expired,
    UpstreamError,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Expired => 410,
            Self::UpstreamError => 502,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Expired => "EXPIRED",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain error that the API reports under a fixed [`ErrorCode`].
pub trait ApiError: fmt::Display {
    fn error_code(&self) -> ErrorCode;

    /// Envelope response carrying this error's message.
    fn to_api_response(&self) -> Response {
        self.error_code().to_http_response(self.to_string()).into_response()
    }
}

/// Every audit failure fails the request closed.
impl ApiError for AuditError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::Internal
    }
}

impl ApiError for LookupError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotFound => ErrorCode::NotFound,
            Self::Expired { .. } => ErrorCode::Expired,
        }
    }
}

impl ApiError for ProviderError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Unsupported(_) => ErrorCode::BadRequest,
            Self::Rejected { .. } | Self::Other(_) => ErrorCode::UpstreamError,
        }
    }
}

impl ApiError for GrantError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::MissingService => ErrorCode::BadRequest,
            Self::Persist(_) | Self::Audit(_) => ErrorCode::Internal,
        }
    }
}

impl ApiError for FlowError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnknownState | Self::GrantNotApproved => ErrorCode::BadRequest,
            Self::Provider(_) | Self::DeviceInit(_) => ErrorCode::UpstreamError,
            Self::Audit(_) | Self::Store(_) => ErrorCode::Internal,
        }
    }
}

impl ApiError for RevokeError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Audit(_) | Self::Local(_) => ErrorCode::Internal,
        }
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
