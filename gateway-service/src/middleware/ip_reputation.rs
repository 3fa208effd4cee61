use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;

use gateway_core::error::{codes, AppError};
use gateway_core::middleware::rate_limit::client_ip;

use crate::services::ip_reputation::{scan_text, Severity, SignatureMatch};
use crate::AppState;

// Request bodies larger than this are not signature-scanned; capped so an
// oversized upload cannot pin the worker buffering it.
const MAX_SCANNED_BODY_BYTES: usize = 64 * 1024;

/// IP reputation check and request signature scan, ahead of everything
/// identity-related. Evaluated independently of authentication outcome:
/// blocked addresses are denied outright, and critical signature matches
/// short-circuit regardless of the caller's standing.
pub async fn ip_reputation_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(ip) = client_ip(&request) else {
        return Ok(next.run(request).await);
    };
    let ip = ip.to_string();

    match state.reputation.is_blocked(&ip).await {
        Ok(Some(remaining)) => {
            tracing::warn!(ip = %ip, remaining_secs = remaining.as_secs(), "Blocked IP rejected");
            return Err(AppError::forbidden(
                codes::IP_BLOCKED,
                "Requests from this address are temporarily blocked",
            ));
        }
        Ok(None) => {}
        Err(e) => {
            // Reputation bookkeeping is advisory; a store outage does not
            // take the gateway down with it.
            tracing::warn!(error = %e, "IP block check failed, continuing");
        }
    }

    let (request, matches) = scan_request(request).await?;

    if !matches.is_empty() {
        let critical = matches.iter().any(|m| m.severity == Severity::Critical);

        if let Err(e) = state.reputation.record_matches(&ip, &matches).await {
            tracing::warn!(error = %e, "Failed to record reputation matches");
        }

        if critical {
            return Err(AppError::forbidden(
                codes::REQUEST_BLOCKED,
                "Request blocked by security policy",
            ));
        }
    }

    Ok(next.run(request).await)
}

/// Scan path, query, selected headers and (textual) body. Reading the body
/// consumes it, so the request is rebuilt from the captured bytes.
async fn scan_request(request: Request) -> Result<(Request, Vec<SignatureMatch>), AppError> {
    let mut matches = Vec::new();

    matches.extend(scan_text(request.uri().path(), "path"));
    if let Some(query) = request.uri().query() {
        matches.extend(scan_text(query, "query"));
        // Percent-encoding must not hide a payload; scan decoded values too.
        if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
            for (_, value) in &pairs {
                matches.extend(scan_text(value, "query"));
            }
        }
    }
    for name in ["user-agent", "referer", "x-forwarded-host"] {
        if let Some(value) = request.headers().get(name).and_then(|v| v.to_str().ok()) {
            matches.extend(scan_text(value, "header"));
        }
    }

    let scan_body = request
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .map(|len| len <= MAX_SCANNED_BODY_BYTES)
        .unwrap_or(true);

    if !scan_body {
        return Ok((request, dedupe(matches)));
    }

    let (parts, body) = request.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to read body: {}", e)))?
        .to_bytes();

    if bytes.len() <= MAX_SCANNED_BODY_BYTES {
        if let Ok(text) = std::str::from_utf8(&bytes) {
            matches.extend(scan_text(text, "body"));
        }
    }

    Ok((Request::from_parts(parts, Body::from(bytes)), dedupe(matches)))
}

/// One suspicion increment per signature per request, however many
/// surfaces it matched on.
fn dedupe(mut matches: Vec<SignatureMatch>) -> Vec<SignatureMatch> {
    matches.sort_by_key(|m| m.name);
    matches.dedup_by_key(|m| m.name);
    matches
}
