use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

use gateway_core::error::AppError;
use gateway_core::middleware::rate_limit::client_ip;

use crate::services::BruteForceState;
use crate::AppState;

/// Brute-force lockout around the authentication endpoints.
///
/// Before the handler: a locked key is denied outright with the remaining
/// lockout. After the handler: a 401 counts as a failure (the failure
/// that crosses the threshold is itself answered with 429), a success
/// wipes the key. Store outages here degrade open - the guard is abuse
/// telemetry, not the authentication decision itself.
pub async fn brute_force_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !request.uri().path().starts_with("/auth") {
        return Ok(next.run(request).await);
    }

    let Some(ip) = client_ip(&request) else {
        return Ok(next.run(request).await);
    };
    let key = ip.to_string();

    match state.brute_force.status(&key).await {
        Ok(BruteForceState::Locked { remaining }) => {
            return Err(AppError::TooManyRequests {
                message: "Too many failed attempts. Account access temporarily locked."
                    .to_string(),
                retry_after_secs: remaining.as_secs().max(1),
                limit: None,
            });
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "Brute-force status check failed, continuing");
        }
    }

    let response = next.run(request).await;

    match response.status() {
        StatusCode::UNAUTHORIZED => match state.brute_force.record_failure(&key).await {
            Ok(BruteForceState::Locked { remaining }) => {
                // The locking failure answers with the lockout itself.
                return Ok(AppError::TooManyRequests {
                    message: "Too many failed attempts. Account access temporarily locked."
                        .to_string(),
                    retry_after_secs: remaining.as_secs().max(1),
                    limit: None,
                }
                .into_response());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to record brute-force failure");
            }
        },
        status if status.is_success() => {
            state.brute_force.record_success(&key).await;
        }
        _ => {}
    }

    Ok(response)
}
