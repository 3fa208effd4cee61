//! CSRF token issuance and double-submit validation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;

use gateway_core::error::{codes, AppError};

use crate::config::CsrfConfig;
use crate::services::revocation::RevocationStore;

pub const CSRF_PREFIX: &str = "csrf:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfToken {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_session_id: Option<String>,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsrfError {
    #[error("CSRF token missing from request")]
    Missing,
    #[error("CSRF cookie and header token do not match")]
    Mismatch,
    #[error("CSRF token is unknown or expired")]
    Unknown,
    #[error("CSRF token was issued to a different address")]
    IpMismatch,
}

impl From<CsrfError> for AppError {
    fn from(err: CsrfError) -> Self {
        AppError::bad_request(codes::CSRF_INVALID, err.to_string())
    }
}

#[derive(Clone)]
pub struct CsrfProtection {
    store: Arc<dyn RevocationStore>,
    ttl: Duration,
    strict_ip: bool,
}

impl CsrfProtection {
    pub fn new(store: Arc<dyn RevocationStore>, config: &CsrfConfig) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(config.ttl_seconds),
            strict_ip: config.strict_ip,
        }
    }

    /// Mint a token bound to the caller's identity (when known) and
    /// address. Persistence is best-effort: CSRF state is not worth
    /// failing the request over when the store is down.
    pub async fn issue(
        &self,
        owner_user_id: Option<&str>,
        owner_session_id: Option<&str>,
        ip_address: &str,
    ) -> CsrfToken {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let now = Utc::now();

        let token = CsrfToken {
            token: hex::encode(bytes),
            owner_user_id: owner_user_id.map(|s| s.to_string()),
            owner_session_id: owner_session_id.map(|s| s.to_string()),
            ip_address: ip_address.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(self.ttl.as_secs() as i64),
        };

        match serde_json::to_string(&token) {
            Ok(payload) => {
                let key = format!("{}{}", CSRF_PREFIX, token.token);
                if let Err(e) = self.store.put(&key, &payload, self.ttl).await {
                    tracing::warn!(error = %e, "CSRF token persistence failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "CSRF token serialization failed"),
        }

        token
    }

    /// Double-submit validation: header and cookie values must agree (in
    /// constant time) and the token must be on record. An address mismatch
    /// rejects only under `strict_ip`; otherwise it is logged and allowed,
    /// matching the observed leniency of the platform this replaces.
    pub async fn validate(
        &self,
        header_token: &str,
        cookie_token: &str,
        ip_address: &str,
    ) -> Result<(), CsrfError> {
        if header_token.is_empty() || cookie_token.is_empty() {
            return Err(CsrfError::Missing);
        }
        if header_token
            .as_bytes()
            .ct_eq(cookie_token.as_bytes())
            .unwrap_u8()
            != 1
        {
            return Err(CsrfError::Mismatch);
        }

        let key = format!("{}{}", CSRF_PREFIX, header_token);
        let record = match self.store.get(&key).await {
            Ok(record) => record,
            Err(e) => {
                // Bookkeeping outage: let the request through rather than
                // turning a cache failure into a hard denial.
                tracing::warn!(error = %e, "CSRF store unreachable, accepting token unchecked");
                return Ok(());
            }
        };

        let Some(raw) = record else {
            return Err(CsrfError::Unknown);
        };

        let stored: CsrfToken = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, "CSRF record corrupt, rejecting");
                return Err(CsrfError::Unknown);
            }
        };

        if stored.ip_address != ip_address {
            if self.strict_ip {
                return Err(CsrfError::IpMismatch);
            }
            tracing::warn!(
                issued_to = %stored.ip_address,
                presented_from = %ip_address,
                "CSRF token used from a different address"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::revocation::MemoryRevocationStore;

    fn protection(strict_ip: bool) -> CsrfProtection {
        CsrfProtection::new(
            Arc::new(MemoryRevocationStore::new()),
            &CsrfConfig {
                cookie_name: "sf_csrf".to_string(),
                header_name: "x-csrf-token".to_string(),
                ttl_seconds: 60,
                strict_ip,
            },
        )
    }

    #[tokio::test]
    async fn issued_token_validates() {
        let csrf = protection(false);
        let token = csrf.issue(Some("u1"), None, "1.2.3.4").await;
        assert!(csrf
            .validate(&token.token, &token.token, "1.2.3.4")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn header_cookie_disagreement_is_rejected() {
        let csrf = protection(false);
        let token = csrf.issue(None, None, "1.2.3.4").await;
        let err = csrf
            .validate(&token.token, "something-else", "1.2.3.4")
            .await
            .unwrap_err();
        assert_eq!(err, CsrfError::Mismatch);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let csrf = protection(false);
        let err = csrf
            .validate("deadbeef", "deadbeef", "1.2.3.4")
            .await
            .unwrap_err();
        assert_eq!(err, CsrfError::Unknown);
    }

    #[tokio::test]
    async fn ip_mismatch_rejects_only_under_strict_mode() {
        let lenient = protection(false);
        let token = lenient.issue(None, None, "1.2.3.4").await;
        assert!(lenient
            .validate(&token.token, &token.token, "5.6.7.8")
            .await
            .is_ok());

        let strict = protection(true);
        let token = strict.issue(None, None, "1.2.3.4").await;
        let err = strict
            .validate(&token.token, &token.token, "5.6.7.8")
            .await
            .unwrap_err();
        assert_eq!(err, CsrfError::IpMismatch);
    }

    #[tokio::test]
    async fn expired_token_is_unknown() {
        let store = Arc::new(MemoryRevocationStore::new());
        let csrf = CsrfProtection::new(
            store,
            &CsrfConfig {
                cookie_name: "sf_csrf".to_string(),
                header_name: "x-csrf-token".to_string(),
                ttl_seconds: 0,
                strict_ip: false,
            },
        );
        let token = csrf.issue(None, None, "1.2.3.4").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = csrf
            .validate(&token.token, &token.token, "1.2.3.4")
            .await
            .unwrap_err();
        assert_eq!(err, CsrfError::Unknown);
    }
}
