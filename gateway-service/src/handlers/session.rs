//! Gateway-owned endpoints: health, CSRF issuance, refresh rotation and
//! logout. Login itself lives with the business handlers - they validate
//! credentials and call `TokenAuthority::issue_session`.

use axum::{
    extract::{Request, State},
    http::header,
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};

use gateway_core::error::AppError;
use gateway_core::middleware::rate_limit::client_ip;

use crate::middleware::AuthUser;
use crate::services::{AuthFailure, MembershipProvider, RevocationStore, TokenPair};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

/// Rotate a refresh token: the old token dies, the next pair in the
/// family comes back. The access token's role claim is re-read from the
/// directory so a rotation never carries a stale role forward.
pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let claims = state
        .tokens
        .verify_refresh_token(&body.refresh_token)
        .await?;

    let role = state
        .access
        .directory()
        .current_role(&claims.user_id)
        .await
        .map_err(AppError::InternalError)?
        .ok_or(AuthFailure::InvalidSession)?;

    let pair = state.tokens.rotate_refresh(&body.refresh_token, role).await?;
    Ok(Json(pair))
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub message: &'static str,
}

/// Revoke the presented access token and close its session. The refresh
/// family dies with the session, so outstanding refresh tokens are dead
/// the moment this returns.
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    req: Request,
) -> Result<Json<LogoutResponse>, AppError> {
    if let Some(token) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        state.tokens.revoke_access_token(token, "logout").await?;
    }
    state.tokens.close_session(&claims.session_id).await;

    Ok(Json(LogoutResponse {
        message: "Logged out",
    }))
}

#[derive(Debug, Serialize)]
pub struct CsrfResponse {
    pub token: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Issue a CSRF token, returned in the body and mirrored into the
/// double-submit cookie. Works for anonymous callers too; authenticated
/// ones get the token bound to their identity.
pub async fn csrf_token(
    State(state): State<AppState>,
    jar: CookieJar,
    req: Request,
) -> Result<(CookieJar, Json<CsrfResponse>), AppError> {
    let ip = client_ip(&req)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let claims = req
        .extensions()
        .get::<crate::services::AccessTokenClaims>();

    let token = state
        .csrf
        .issue(
            claims.map(|c| c.user_id.as_str()),
            claims.map(|c| c.session_id.as_str()),
            &ip,
        )
        .await;

    let cookie = Cookie::build((state.config.csrf.cookie_name.clone(), token.token.clone()))
        .path("/")
        .same_site(SameSite::Strict)
        .http_only(false)
        .build();

    Ok((
        jar.add(cookie),
        Json(CsrfResponse {
            token: token.token,
            expires_at: token.expires_at,
        }),
    ))
}

/// Service health check.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Security store health check failed");
        AppError::InternalError(e)
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "revocation_store": "up"
        }
    })))
}
