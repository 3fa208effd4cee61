use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::OnceCell;
use serde::Serialize;
use thiserror::Error;

/// Stable machine-readable denial codes. Clients switch on these, so the
/// strings are part of the public contract and never change casing.
pub mod codes {
    pub const MISSING_TOKEN: &str = "MISSING_TOKEN";
    pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
    pub const TOKEN_REVOKED: &str = "TOKEN_REVOKED";
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const TOKEN_NOT_ACTIVE: &str = "TOKEN_NOT_ACTIVE";
    pub const ROLE_CHANGED: &str = "ROLE_CHANGED";
    pub const INVALID_SESSION: &str = "INVALID_SESSION";
    pub const INSUFFICIENT_PERMISSIONS: &str = "INSUFFICIENT_PERMISSIONS";
    pub const NO_STORE_ACCESS: &str = "NO_STORE_ACCESS";
    pub const IP_BLOCKED: &str = "IP_BLOCKED";
    pub const REQUEST_BLOCKED: &str = "REQUEST_BLOCKED";
    pub const RESPONSE_BLOCKED: &str = "RESPONSE_BLOCKED";
    pub const MISSING_STORE_ID: &str = "MISSING_STORE_ID";
    pub const CSRF_INVALID: &str = "CSRF_INVALID";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const AUTH_SERVICE_ERROR: &str = "AUTH_SERVICE_ERROR";
}

static EXPOSE_ERROR_DETAILS: OnceCell<bool> = OnceCell::new();

/// Opt in to internal error details in responses. Call once at startup,
/// in development environments only.
pub fn expose_error_details(enabled: bool) {
    let _ = EXPOSE_ERROR_DETAILS.set(enabled);
}

fn details_enabled() -> bool {
    EXPOSE_ERROR_DETAILS.get().copied().unwrap_or(false)
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    Unauthorized { code: &'static str, message: String },

    #[error("{message}")]
    Forbidden {
        code: &'static str,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("{message}")]
    BadRequest { code: &'static str, message: String },

    #[error("{message}")]
    TooManyRequests {
        message: String,
        retry_after_secs: u64,
        limit: Option<u32>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error("Cache error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl AppError {
    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Unauthorized {
            code,
            message: message.into(),
        }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Forbidden {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        AppError::BadRequest {
            code,
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

/// Wire shape of every denial the gateway produces.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl ErrorBody {
    pub fn new(code: &str, error: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            error: error.into(),
            details: None,
            retry_after: None,
            limit: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body, retry_after) = match self {
            AppError::Unauthorized { code, message } => (
                StatusCode::UNAUTHORIZED,
                ErrorBody::new(code, message),
                None,
            ),
            AppError::Forbidden {
                code,
                message,
                details,
            } => {
                let mut body = ErrorBody::new(code, message);
                body.details = details;
                (StatusCode::FORBIDDEN, body, None)
            }
            AppError::BadRequest { code, message } => {
                (StatusCode::BAD_REQUEST, ErrorBody::new(code, message), None)
            }
            AppError::TooManyRequests {
                message,
                retry_after_secs,
                limit,
            } => {
                let mut body = ErrorBody::new(codes::RATE_LIMITED, message);
                body.retry_after = Some(retry_after_secs);
                body.limit = limit;
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    body,
                    Some((retry_after_secs, limit)),
                )
            }
            AppError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody::new(codes::AUTH_SERVICE_ERROR, "Service unavailable"),
                None,
            ),
            // Infrastructure failures share one opaque code; internals go to
            // the log, not the caller, unless details were enabled for dev.
            AppError::ConfigError(err)
            | AppError::InternalError(err) => {
                tracing::error!(error = %err, "Request failed with internal error");
                let mut body =
                    ErrorBody::new(codes::AUTH_SERVICE_ERROR, "Authentication service error");
                if details_enabled() {
                    body.details = Some(serde_json::Value::String(format!("{err:#}")));
                }
                (StatusCode::INTERNAL_SERVER_ERROR, body, None)
            }
            AppError::RedisError(err) => {
                tracing::error!(error = %err, "Request failed with cache error");
                let mut body =
                    ErrorBody::new(codes::AUTH_SERVICE_ERROR, "Authentication service error");
                if details_enabled() {
                    body.details = Some(serde_json::Value::String(err.to_string()));
                }
                (StatusCode::INTERNAL_SERVER_ERROR, body, None)
            }
        };

        let mut res = (status, Json(body)).into_response();

        if let Some((retry, limit)) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
            if let Some(limit) = limit {
                res.headers_mut().insert("x-ratelimit-limit", limit.into());
            }
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_carries_retry_after_header() {
        let err = AppError::TooManyRequests {
            message: "slow down".to_string(),
            retry_after_secs: 42,
            limit: Some(10),
        };
        let res = err.into_response();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers().get("retry-after").unwrap(), "42");
        assert_eq!(res.headers().get("x-ratelimit-limit").unwrap(), "10");
    }

    #[test]
    fn internal_error_hides_details_by_default() {
        let err = AppError::InternalError(anyhow::anyhow!("secret backend path"));
        let res = err.into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
