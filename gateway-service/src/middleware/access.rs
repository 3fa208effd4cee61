use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, Method},
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashMap;

use gateway_core::error::{codes, AppError};

use crate::services::{AccessTokenClaims, AuthFailure, MembershipProvider};
use crate::models::Role;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Read,
    Write,
}

/// Middleware factory body: require one permission on the store the
/// request addresses. Mount with a closure:
///
/// ```ignore
/// from_fn_with_state(state, |s, req, next| {
///     require_permission(s, "products:write", req, next)
/// })
/// ```
pub async fn require_permission(
    State(state): State<AppState>,
    required: &'static str,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(claims) = req.extensions().get::<AccessTokenClaims>().cloned() else {
        return Err(AuthFailure::MissingToken.into());
    };

    // Platform owners pass every permission check.
    if claims.role == Role::Owner {
        return Ok(next.run(req).await);
    }

    let (req, store_id) = extract_store_id(req).await?;
    let Some(store_id) = store_id else {
        return Err(AppError::bad_request(
            codes::MISSING_STORE_ID,
            "Store id missing from path, body and query",
        ));
    };

    let grant = state
        .access
        .resolve_permissions(&claims.user_id, &store_id)
        .await
        .map_err(AppError::InternalError)?;

    if !grant.allows(required) {
        tracing::warn!(
            user_id = %claims.user_id,
            store_id = %store_id,
            required,
            level = ?grant.level,
            "Permission denied"
        );
        return Err(AppError::Forbidden {
            code: codes::INSUFFICIENT_PERMISSIONS,
            message: format!("Missing required permission: {}", required),
            details: Some(json!({
                "required": required,
                "currentRole": claims.role,
            })),
        });
    }

    Ok(next.run(req).await)
}

/// Require a read or write relation to the store the request addresses.
/// Platform owners pass unconditionally; store owners and admins pass
/// both operations; vendor membership additionally covers reads.
pub async fn require_store_access(
    State(state): State<AppState>,
    operation: StoreOperation,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(claims) = req.extensions().get::<AccessTokenClaims>().cloned() else {
        return Err(AuthFailure::MissingToken.into());
    };

    let (req, store_id) = extract_store_id(req).await?;
    let Some(store_id) = store_id else {
        return Err(AppError::bad_request(
            codes::MISSING_STORE_ID,
            "Store id missing from path, body and query",
        ));
    };

    if claims.role == Role::Owner {
        return Ok(next.run(req).await);
    }

    let membership = state
        .access
        .directory()
        .resolve_membership(&claims.user_id, &store_id)
        .await
        .map_err(AppError::InternalError)?;

    let allowed = membership.owner
        || membership.admin
        || (operation == StoreOperation::Read && membership.vendor.is_some());

    if !allowed {
        tracing::warn!(
            user_id = %claims.user_id,
            store_id = %store_id,
            operation = ?operation,
            "Store access denied"
        );
        return Err(AppError::forbidden(
            codes::NO_STORE_ACCESS,
            format!("No access to store {}", store_id),
        ));
    }

    Ok(next.run(req).await)
}

/// A caller may always reach their own user record; platform owners and
/// admins may reach any.
pub async fn require_self_or_admin(req: Request, next: Next) -> Result<Response, AppError> {
    let Some(claims) = req.extensions().get::<AccessTokenClaims>() else {
        return Err(AuthFailure::MissingToken.into());
    };

    if matches!(claims.role, Role::Owner | Role::Admin) {
        return Ok(next.run(req).await);
    }

    let target = user_id_from_path(req.uri().path());
    match target {
        Some(target) if target == claims.user_id => Ok(next.run(req).await),
        _ => Err(AppError::forbidden(
            codes::INSUFFICIENT_PERMISSIONS,
            "You may only access your own user record",
        )),
    }
}

/// Store id resolution, in fixed precedence: path, then JSON body, then
/// query string. Reading the body consumes it, so the request is rebuilt
/// from the captured bytes before it continues down the chain.
async fn extract_store_id(req: Request) -> Result<(Request, Option<String>), AppError> {
    if let Some(id) = store_id_from_path(req.uri().path()) {
        return Ok((req, Some(id)));
    }

    let has_json_body = req.method() != Method::GET
        && req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);

    if has_json_body {
        let (parts, body) = req.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to read body: {}", e)))?
            .to_bytes();

        let body_id = serde_json::from_slice::<Value>(&bytes).ok().and_then(|v| {
            v.get("storeId")
                .or_else(|| v.get("store_id"))
                .and_then(|id| id.as_str().map(|s| s.to_string()))
        });
        let query_id = store_id_from_query(parts.uri.query());

        let req = Request::from_parts(parts, Body::from(bytes));
        return Ok((req, body_id.or(query_id)));
    }

    let id = store_id_from_query(req.uri().query());
    Ok((req, id))
}

fn store_id_from_path(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "stores" {
            return segments.next().map(|s| s.to_string());
        }
    }
    None
}

fn store_id_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    let params: HashMap<String, String> = serde_urlencoded::from_str(query).ok()?;
    params
        .get("storeId")
        .or_else(|| params.get("store_id"))
        .cloned()
}

fn user_id_from_path(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "users" {
            return segments.next().map(|s| s.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_id_prefers_the_path_segment() {
        assert_eq!(
            store_id_from_path("/api/stores/st_42/products"),
            Some("st_42".to_string())
        );
        assert_eq!(store_id_from_path("/api/orders/o_1"), None);
    }

    #[test]
    fn store_id_parses_from_query() {
        assert_eq!(
            store_id_from_query(Some("storeId=st_9&page=1")),
            Some("st_9".to_string())
        );
        assert_eq!(
            store_id_from_query(Some("store_id=st_10")),
            Some("st_10".to_string())
        );
        assert_eq!(store_id_from_query(Some("page=1")), None);
        assert_eq!(store_id_from_query(None), None);
    }

    #[test]
    fn user_id_comes_from_the_users_segment() {
        assert_eq!(
            user_id_from_path("/api/users/u_7/settings"),
            Some("u_7".to_string())
        );
        assert_eq!(user_id_from_path("/api/stores/s_1"), None);
    }
}
