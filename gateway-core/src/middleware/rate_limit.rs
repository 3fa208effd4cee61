use axum::extract::Request;
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{net::IpAddr, num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter keyed by an arbitrary string (an IP, or an IP+user pair for
/// tiers that must not let one address throttle unrelated callers).
pub type KeyedRateLimiter = Arc<RateLimiter<String, DashMapStateStore<String>, DefaultClock>>;

/// Create a keyed rate limiter allowing `attempts` per `window_seconds`,
/// with the full budget available as an initial burst.
pub fn create_keyed_rate_limiter(attempts: u32, window_seconds: u64) -> KeyedRateLimiter {
    let attempts = attempts.max(1);
    let period = Duration::from_millis((window_seconds * 1000) / attempts as u64);
    let quota = Quota::with_period(period)
        .expect("Failed to create quota with valid period")
        .allow_burst(NonZeroU32::new(attempts).expect("attempts is guaranteed to be non-zero"));

    Arc::new(RateLimiter::dashmap(quota))
}

/// Check one key against a limiter. `Err` carries the whole seconds until
/// the next permit, for the `Retry-After` header.
pub fn check_key(limiter: &KeyedRateLimiter, key: &str) -> Result<(), u64> {
    match limiter.check_key(&key.to_string()) {
        Ok(_) => Ok(()),
        Err(negative) => {
            let wait = negative.wait_time_from(DefaultClock::default().now());
            Err(wait.as_secs().max(1))
        }
    }
}

/// Best-effort client address: `x-forwarded-for` (first hop) when present,
/// falling back to the socket peer recorded by `into_make_service_with_connect_info`.
pub fn client_ip(req: &Request) -> Option<IpAddr> {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());

    forwarded.or_else(|| {
        req.extensions()
            .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
            .map(|axum::extract::ConnectInfo(addr)| addr.ip())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn limiter_denies_after_burst() {
        let limiter = create_keyed_rate_limiter(2, 60);
        assert!(check_key(&limiter, "10.0.0.1").is_ok());
        assert!(check_key(&limiter, "10.0.0.1").is_ok());
        let wait = check_key(&limiter, "10.0.0.1").unwrap_err();
        assert!(wait >= 1);
        // Other keys are unaffected.
        assert!(check_key(&limiter, "10.0.0.2").is_ok());
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let req = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), Some("203.0.113.7".parse().unwrap()));
    }
}
