use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

use gateway_core::middleware::rate_limit::client_ip;
use gateway_core::middleware::tracing::RequestId;

use crate::models::{AuditEvent, DataClassification, RequestContext, ResponseContext};
use crate::services::audit::{
    assess_risk, capture_body, classify_path, compliance_flags, redact_value, sanitize_headers,
    RiskSignals,
};
use crate::services::{AccessTokenClaims, DlpScanner};
use crate::AppState;

/// Outermost wrapper of the chain: snapshots the request, lets everything
/// inside run, scans the outgoing body, and emits one audit event per
/// exchange. Failures in here never fail the request; a response that DLP
/// rejects is the single exception, replaced before it is flushed.
pub async fn audit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let cfg = &state.config.audit;
    let path = req.uri().path().to_string();
    let method = req.method().to_string();

    let excluded = cfg
        .exclude_paths
        .iter()
        .any(|p| path == *p || path.starts_with(&format!("{}/", p)))
        || cfg
            .exclude_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&method));
    if excluded {
        return next.run(req).await;
    }

    let start = Instant::now();
    let timestamp = Utc::now();

    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ip_address = client_ip(&req).map(|ip| ip.to_string());
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let query = req
        .uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str::<HashMap<String, String>>(q).ok())
        .and_then(|params| serde_json::to_value(params).ok());
    let headers = sanitize_headers(req.headers(), &cfg.redact_headers);

    // Snapshot the request body, then hand the bytes back to the chain.
    let (parts, body) = req.into_parts();
    let request_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to buffer request body for audit");
            return gateway_core::error::AppError::InternalError(anyhow::anyhow!(
                "Failed to read request body: {}",
                e
            ))
            .into_response();
        }
    };
    let (request_body, request_truncated) = capture_body(&request_bytes, cfg.max_body_bytes);
    let req = Request::from_parts(parts, Body::from(request_bytes));

    let response = next.run(req).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    // The auth middleware parks verified claims in response extensions so
    // the event can be attributed without re-verifying anything here.
    let user_id = response
        .extensions()
        .get::<AccessTokenClaims>()
        .map(|claims| claims.user_id.clone());

    let (response_parts, response_body) = response.into_parts();
    let response_bytes = match response_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to buffer response body for audit");
            axum::body::Bytes::new()
        }
    };

    // Outbound DLP, synchronous and before anything reaches the wire. The
    // gateway's own token endpoints are exempt: issuing credentials is
    // their entire purpose.
    let mut dlp_rule = None;
    let response = if !path.starts_with("/auth") {
        match state.dlp.scan(&response_bytes) {
            Some(verdict) => {
                tracing::warn!(
                    request_id = %request_id,
                    path = %path,
                    rule = verdict.rule,
                    "Outgoing response blocked by DLP policy"
                );
                dlp_rule = Some(verdict.rule);
                (
                    StatusCode::FORBIDDEN,
                    Json(DlpScanner::blocked_body()),
                )
                    .into_response()
            }
            None => Response::from_parts(response_parts, Body::from(response_bytes.clone())),
        }
    } else {
        Response::from_parts(response_parts, Body::from(response_bytes.clone()))
    };

    let status = response.status().as_u16();

    // What the client actually received is what gets recorded; a blocked
    // body is represented by its replacement, plus the dlp flag.
    let audited_bytes: &[u8] = if dlp_rule.is_some() {
        &[]
    } else {
        &response_bytes
    };
    let (response_body, response_truncated) = capture_body(audited_bytes, cfg.max_body_bytes);

    let (risk_score, mut security_flags) = assess_risk(&RiskSignals {
        status,
        method: &method,
        path: &path,
        user_agent: user_agent.as_deref(),
        timestamp,
    });
    let mut data_classification = classify_path(&path);
    if let Some(rule) = dlp_rule {
        security_flags.push(format!("dlp_blocked:{}", rule));
        data_classification = data_classification.max(DataClassification::Restricted);
    }

    let compliance = compliance_flags(
        &path,
        request_body.as_ref(),
        response_body.as_ref(),
        &cfg.pii_fields,
    );

    let mut event = AuditEvent {
        request_id: request_id.clone(),
        timestamp,
        request: RequestContext {
            method: method.clone(),
            path: path.clone(),
            query,
            headers,
            body: request_body,
            body_truncated: request_truncated,
            ip_address,
            user_agent,
            user_id,
        },
        response: Some(ResponseContext {
            status,
            duration_ms,
            body: response_body,
            body_truncated: response_truncated,
        }),
        risk_score,
        security_flags,
        data_classification,
        compliance,
    };
    redact_event(&mut event, &cfg.pii_fields);

    if status >= 500 {
        state
            .notifier
            .notify_server_error(&request_id, status, &method, &path);
    }

    state.audit.record(event).await;

    response
}

/// Strip PII from every captured surface before the event leaves the
/// request path.
fn redact_event(event: &mut AuditEvent, pii_fields: &[String]) {
    if let Some(query) = event.request.query.as_mut() {
        redact_value(query, pii_fields);
    }
    if let Some(body) = event.request.body.as_mut() {
        redact_value(body, pii_fields);
    }
    if let Some(response) = event.response.as_mut() {
        if let Some(body) = response.body.as_mut() {
            redact_value(body, pii_fields);
        }
    }
}
