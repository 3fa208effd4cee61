use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};

use gateway_core::error::AppError;

use crate::services::{AccessTokenClaims, AuthFailure, MembershipProvider};
use crate::AppState;

/// Middleware to require an authenticated caller.
///
/// Verification order is fixed: revocation ledger first (cheap,
/// deterministic denial), then signature and claims, then session
/// liveness, then role freshness against the directory. Claims land in
/// request extensions for handlers, and in response extensions so the
/// audit wrapper can attribute the exchange.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(token) = token else {
        return Err(AuthFailure::MissingToken.into());
    };

    let claims = state.tokens.verify_access_token(token).await?;

    if !state.tokens.session_active(&claims.session_id).await? {
        return Err(AuthFailure::InvalidSession.into());
    }

    // A persisted role that no longer matches the claim means the token
    // was minted under privileges the user no longer holds. Force a fresh
    // login instead of honoring either side.
    match state
        .access
        .directory()
        .current_role(&claims.user_id)
        .await
    {
        Ok(Some(role)) if role == claims.role => {}
        Ok(Some(_)) => {
            state
                .tokens
                .revoke_access_token(token, "role_changed")
                .await
                .ok();
            return Err(AuthFailure::RoleChanged.into());
        }
        Ok(None) => return Err(AuthFailure::InvalidSession.into()),
        Err(e) => {
            // Authoritative lookup: without it the token is unverifiable.
            tracing::error!(error = %e, "Directory unreachable during role check");
            return Err(AppError::InternalError(e));
        }
    }

    req.extensions_mut().insert(claims.clone());

    let mut response = next.run(req).await;
    response.extensions_mut().insert(claims);
    Ok(response)
}

/// Extractor for verified claims in handlers.
pub struct AuthUser(pub AccessTokenClaims);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = parts
            .extensions
            .get::<AccessTokenClaims>()
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Auth claims missing from request extensions"
                ))
            })?;

        Ok(AuthUser(claims.clone()))
    }
}
