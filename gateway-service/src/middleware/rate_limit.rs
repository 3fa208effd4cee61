use axum::{extract::Request, extract::State, middleware::Next, response::Response};

use gateway_core::error::AppError;
use gateway_core::middleware::rate_limit::{
    check_key, client_ip, create_keyed_rate_limiter, KeyedRateLimiter,
};

use crate::config::RateLimitConfig;
use crate::services::AccessTokenClaims;
use crate::AppState;

/// One keyed limiter per tier. Every request pays the global tier plus the
/// tier its path falls in; the admin tier runs separately, after
/// authentication, so it can key on IP+user.
#[derive(Clone)]
pub struct TierLimiters {
    global: KeyedRateLimiter,
    auth: KeyedRateLimiter,
    uploads: KeyedRateLimiter,
    api: KeyedRateLimiter,
    admin: KeyedRateLimiter,
    config: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Auth,
    Uploads,
    Api,
    Other,
}

fn tier_for_path(path: &str) -> Tier {
    if path.starts_with("/auth") {
        Tier::Auth
    } else if path.contains("/uploads") {
        Tier::Uploads
    } else if path.starts_with("/api") {
        Tier::Api
    } else {
        Tier::Other
    }
}

impl TierLimiters {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            global: create_keyed_rate_limiter(
                config.global.max_requests,
                config.global.window_seconds,
            ),
            auth: create_keyed_rate_limiter(config.auth.max_requests, config.auth.window_seconds),
            uploads: create_keyed_rate_limiter(
                config.uploads.max_requests,
                config.uploads.window_seconds,
            ),
            api: create_keyed_rate_limiter(config.api.max_requests, config.api.window_seconds),
            admin: create_keyed_rate_limiter(
                config.admin.max_requests,
                config.admin.window_seconds,
            ),
            config: config.clone(),
        }
    }

    /// Global tier plus the path's own tier. `Err` carries (wait, limit)
    /// of whichever tier denied.
    fn check(&self, path: &str, key: &str) -> Result<(), (u64, u32)> {
        check_key(&self.global, key).map_err(|wait| (wait, self.config.global.max_requests))?;

        match tier_for_path(path) {
            Tier::Auth => {
                check_key(&self.auth, key).map_err(|wait| (wait, self.config.auth.max_requests))
            }
            Tier::Uploads => check_key(&self.uploads, key)
                .map_err(|wait| (wait, self.config.uploads.max_requests)),
            Tier::Api => {
                check_key(&self.api, key).map_err(|wait| (wait, self.config.api.max_requests))
            }
            Tier::Other => Ok(()),
        }
    }

    fn check_admin(&self, key: &str) -> Result<(), (u64, u32)> {
        check_key(&self.admin, key).map_err(|wait| (wait, self.config.admin.max_requests))
    }
}

/// Pre-authentication tiers, keyed by caller IP.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(ip) = client_ip(&request) else {
        tracing::warn!("Could not determine IP for rate limiting");
        return Ok(next.run(request).await);
    };

    match state.limiters.check(request.uri().path(), &ip.to_string()) {
        Ok(()) => Ok(next.run(request).await),
        Err((wait, limit)) => Err(AppError::TooManyRequests {
            message: "Too many requests. Please try again later.".to_string(),
            retry_after_secs: wait,
            limit: Some(limit),
        }),
    }
}

/// Admin-API tier, mounted after authentication on admin routes. Keyed by
/// IP+user so one gateway address shared by several admins does not
/// throttle them collectively.
pub async fn admin_rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !request.uri().path().starts_with("/api/admin") {
        return Ok(next.run(request).await);
    }

    let ip = client_ip(&request)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let key = match request.extensions().get::<AccessTokenClaims>() {
        Some(claims) => format!("{}:{}", ip, claims.user_id),
        None => ip,
    };

    match state.limiters.check_admin(&key) {
        Ok(()) => Ok(next.run(request).await),
        Err((wait, limit)) => Err(AppError::TooManyRequests {
            message: "Admin API rate limit exceeded. Please try again later.".to_string(),
            retry_after_secs: wait,
            limit: Some(limit),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitTier;

    fn tiny_config() -> RateLimitConfig {
        RateLimitConfig {
            global: RateLimitTier {
                max_requests: 100,
                window_seconds: 60,
            },
            auth: RateLimitTier {
                max_requests: 2,
                window_seconds: 60,
            },
            uploads: RateLimitTier {
                max_requests: 1,
                window_seconds: 60,
            },
            api: RateLimitTier {
                max_requests: 3,
                window_seconds: 60,
            },
            admin: RateLimitTier {
                max_requests: 1,
                window_seconds: 60,
            },
        }
    }

    #[test]
    fn tiers_are_selected_by_path() {
        assert_eq!(tier_for_path("/auth/refresh"), Tier::Auth);
        assert_eq!(tier_for_path("/api/stores/s1/uploads"), Tier::Uploads);
        assert_eq!(tier_for_path("/api/stores/s1"), Tier::Api);
        assert_eq!(tier_for_path("/health"), Tier::Other);
    }

    #[test]
    fn auth_tier_denies_independently_of_api_tier() {
        let limiters = TierLimiters::new(&tiny_config());
        assert!(limiters.check("/auth/refresh", "ip1").is_ok());
        assert!(limiters.check("/auth/refresh", "ip1").is_ok());

        let (wait, limit) = limiters.check("/auth/refresh", "ip1").unwrap_err();
        assert!(wait >= 1);
        assert_eq!(limit, 2);

        // The api tier still has budget for the same key.
        assert!(limiters.check("/api/stores/s1", "ip1").is_ok());
    }

    #[test]
    fn admin_tier_keys_do_not_collide_across_users() {
        let limiters = TierLimiters::new(&tiny_config());
        assert!(limiters.check_admin("ip1:user_a").is_ok());
        assert!(limiters.check_admin("ip1:user_a").is_err());
        assert!(limiters.check_admin("ip1:user_b").is_ok());
    }
}
