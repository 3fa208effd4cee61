use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;

use gateway_core::error::AppError;
use gateway_core::middleware::rate_limit::client_ip;

use crate::services::csrf::CsrfError;
use crate::AppState;

/// Double-submit CSRF validation on mutating verbs.
///
/// Only cookie-bearing (browser) clients are in scope: a request without
/// the CSRF cookie is a bearer-token API call and passes untouched. When
/// the cookie is present, the matching header must accompany it.
pub async fn csrf_middleware(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    ) {
        return Ok(next.run(request).await);
    }

    let Some(cookie) = jar.get(&state.config.csrf.cookie_name) else {
        return Ok(next.run(request).await);
    };
    let cookie_token = cookie.value().to_string();

    let header_token = request
        .headers()
        .get(state.config.csrf.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let ip = client_ip(&request)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    state
        .csrf
        .validate(&header_token, &cookie_token, &ip)
        .await
        .map_err(|err: CsrfError| {
            tracing::warn!(error = %err, path = %request.uri().path(), "CSRF validation failed");
            AppError::from(err)
        })?;

    Ok(next.run(request).await)
}
