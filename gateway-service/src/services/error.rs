use gateway_core::error::{codes, AppError};
use thiserror::Error;

/// Why a presented token was rejected. One variant per caller-visible
/// reason; mapped to HTTP exactly once, in `From<AuthFailure>` below.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("Authorization header missing or not a bearer token")]
    MissingToken,
    #[error("Token has expired")]
    Expired,
    #[error("Token has been revoked")]
    Revoked,
    #[error("Token is malformed or its signature is invalid")]
    Malformed,
    #[error("Token is not yet valid")]
    NotYetValid,
    #[error("Role changed since the token was issued, sign in again")]
    RoleChanged,
    #[error("Session is no longer active")]
    InvalidSession,
}

impl AuthFailure {
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::MissingToken => codes::MISSING_TOKEN,
            AuthFailure::Expired => codes::TOKEN_EXPIRED,
            AuthFailure::Revoked => codes::TOKEN_REVOKED,
            AuthFailure::Malformed => codes::INVALID_TOKEN,
            AuthFailure::NotYetValid => codes::TOKEN_NOT_ACTIVE,
            AuthFailure::RoleChanged => codes::ROLE_CHANGED,
            AuthFailure::InvalidSession => codes::INVALID_SESSION,
        }
    }
}

impl From<AuthFailure> for AppError {
    fn from(failure: AuthFailure) -> Self {
        AppError::Unauthorized {
            code: failure.code(),
            message: failure.to_string(),
        }
    }
}

/// Outcome of a verification that consults the revocation store. A store
/// outage on this path is not a denial reason of its own: the token is
/// unverifiable, and unverifiable means rejected (fail closed).
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Denied(#[from] AuthFailure),
    #[error("security store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl From<VerifyError> for AppError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Denied(failure) => failure.into(),
            VerifyError::Unavailable(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_failure_has_a_distinct_code() {
        let failures = [
            AuthFailure::MissingToken,
            AuthFailure::Expired,
            AuthFailure::Revoked,
            AuthFailure::Malformed,
            AuthFailure::NotYetValid,
            AuthFailure::RoleChanged,
            AuthFailure::InvalidSession,
        ];
        let codes: std::collections::HashSet<_> = failures.iter().map(|f| f.code()).collect();
        assert_eq!(codes.len(), failures.len());
    }
}
