//! Token issuance, verification, revocation and refresh rotation.

use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::models::Role;
use crate::services::error::{AuthFailure, VerifyError};
use crate::services::revocation::{MemoryRevocationStore, RevocationStore};

pub const BLACKLIST_PREFIX: &str = "blacklist:";
const SESSION_PREFIX: &str = "session:";
const ROTATED_PREFIX: &str = "rotated:";

/// Claims for access tokens (short-lived).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub role: Role,
    #[serde(rename = "telegramId", default, skip_serializing_if = "Option::is_none")]
    pub telegram_id: Option<i64>,
    /// Tenant session id; also the refresh-token family of this session.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Claims for refresh tokens (long-lived, single use).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenClaims {
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Lineage of rotations; doubles as the tenant session id.
    #[serde(rename = "tokenFamily")]
    pub token_family: String,
    /// Strictly increases on each rotation within a family.
    pub version: u32,
    #[serde(rename = "telegramId", default, skip_serializing_if = "Option::is_none")]
    pub telegram_id: Option<i64>,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Token pair returned to the client after login or rotation.
#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Deterministic one-way digest of a raw token; the revocation key. The
/// raw token never reaches the store.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub struct TokenAuthority {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl_minutes: i64,
    refresh_ttl_days: i64,
    issuer: String,
    audience: String,
    clock_skew_seconds: u64,
    store: Arc<dyn RevocationStore>,
    /// Receives security state the primary store could not take. Never read
    /// for anything but positive revocation/session hits.
    fallback: MemoryRevocationStore,
}

impl TokenAuthority {
    pub fn new(config: &TokenConfig, store: Arc<dyn RevocationStore>) -> Self {
        let access_secret = config.access_secret.expose_secret().as_bytes();
        let refresh_secret = config.refresh_secret.expose_secret().as_bytes();

        Self {
            access_encoding: EncodingKey::from_secret(access_secret),
            access_decoding: DecodingKey::from_secret(access_secret),
            refresh_encoding: EncodingKey::from_secret(refresh_secret),
            refresh_decoding: DecodingKey::from_secret(refresh_secret),
            access_ttl_minutes: config.access_ttl_minutes,
            refresh_ttl_days: config.refresh_ttl_days,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            clock_skew_seconds: config.clock_skew_seconds,
            store,
            fallback: MemoryRevocationStore::new(),
        }
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_ttl_minutes * 60
    }

    fn refresh_ttl(&self) -> Duration {
        Duration::from_secs((self.refresh_ttl_days.max(1) as u64) * 86_400)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.clock_skew_seconds;
        // nbf is only present on access tokens; validation skips it elsewhere.
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation
    }

    /// Generate an access token bound to a user, role and session.
    pub fn issue_access_token(
        &self,
        user_id: &str,
        role: Role,
        telegram_id: Option<i64>,
        session_id: &str,
    ) -> Result<String, anyhow::Error> {
        let now = Utc::now();
        let exp = now + ChronoDuration::minutes(self.access_ttl_minutes);

        let claims = AccessTokenClaims {
            user_id: user_id.to_string(),
            role,
            telegram_id,
            session_id: session_id.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: exp.timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.access_encoding)
            .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e))
    }

    /// Generate a refresh token for one version in a family.
    pub fn issue_refresh_token(
        &self,
        user_id: &str,
        family: &str,
        version: u32,
        telegram_id: Option<i64>,
    ) -> Result<String, anyhow::Error> {
        let now = Utc::now();
        let exp = now + ChronoDuration::days(self.refresh_ttl_days);

        let claims = RefreshTokenClaims {
            user_id: user_id.to_string(),
            token_family: family.to_string(),
            version,
            telegram_id,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.refresh_encoding)
            .map_err(|e| anyhow::anyhow!("Failed to encode refresh token: {}", e))
    }

    fn issue_pair(
        &self,
        user_id: &str,
        role: Role,
        telegram_id: Option<i64>,
        family: &str,
        version: u32,
    ) -> Result<TokenPair, anyhow::Error> {
        Ok(TokenPair {
            access_token: self.issue_access_token(user_id, role, telegram_id, family)?,
            refresh_token: self.issue_refresh_token(user_id, family, version, telegram_id)?,
            token_type: "Bearer".to_string(),
            expires_in: self.access_token_expiry_seconds(),
        })
    }

    /// Open a fresh session and issue its first token pair. Called by the
    /// login handler after credentials were validated upstream.
    pub async fn issue_session(
        &self,
        user_id: &str,
        role: Role,
        telegram_id: Option<i64>,
    ) -> Result<TokenPair, anyhow::Error> {
        let session_id = Uuid::new_v4().to_string();
        let key = format!("{}{}", SESSION_PREFIX, session_id);
        if let Err(e) = self.store.put(&key, user_id, self.refresh_ttl()).await {
            tracing::warn!(error = %e, "Session registry write failed, using in-process fallback");
            self.fallback.put(&key, user_id, self.refresh_ttl()).await?;
        }
        self.issue_pair(user_id, role, telegram_id, &session_id, 1)
    }

    /// Whether the session behind a token is still live. A dead session is
    /// a denial; an unreachable registry fails closed.
    pub async fn session_active(&self, session_id: &str) -> Result<bool, VerifyError> {
        let key = format!("{}{}", SESSION_PREFIX, session_id);
        match self.store.exists(&key).await {
            Ok(true) => Ok(true),
            Ok(false) => Ok(self.fallback.exists(&key).await.unwrap_or(false)),
            Err(e) => {
                if self.fallback.exists(&key).await.unwrap_or(false) {
                    return Ok(true);
                }
                Err(VerifyError::Unavailable(e))
            }
        }
    }

    pub async fn close_session(&self, session_id: &str) {
        let key = format!("{}{}", SESSION_PREFIX, session_id);
        if let Err(e) = self.store.delete(&key).await {
            tracing::error!(error = %e, "Failed to close session in primary store");
        }
        let _ = self.fallback.delete(&key).await;
    }

    /// Revocation check by hash. Runs before signature verification: the
    /// lookup is cheap and deterministic, and checking it first keeps
    /// revoked-but-well-signed tokens from ever reaching the verifier.
    async fn is_revoked(&self, hash: &str) -> Result<bool, VerifyError> {
        let key = format!("{}{}", BLACKLIST_PREFIX, hash);
        match self.store.exists(&key).await {
            Ok(true) => Ok(true),
            Ok(false) => Ok(self.fallback.exists(&key).await.unwrap_or(false)),
            Err(e) => {
                // Entries parked in the fallback during an outage still deny.
                if self.fallback.exists(&key).await.unwrap_or(false) {
                    return Ok(true);
                }
                Err(VerifyError::Unavailable(e))
            }
        }
    }

    /// Blacklist a token hash for exactly the token's remaining lifetime
    /// (floor one second). The entry never outlives what it revokes.
    async fn blacklist_hash(&self, hash: &str, exp: i64, reason: &str) {
        let remaining = (exp - Utc::now().timestamp()).max(1) as u64;
        let key = format!("{}{}", BLACKLIST_PREFIX, hash);
        if let Err(e) = self
            .store
            .put(&key, reason, Duration::from_secs(remaining))
            .await
        {
            // Dropping a revocation is worse than keeping it process-local.
            tracing::warn!(error = %e, reason, "Blacklist write failed, parking entry in-process");
            let _ = self
                .fallback
                .put(&key, reason, Duration::from_secs(remaining))
                .await;
        }
    }

    /// Verify an access token: revocation first, then signature and claims.
    pub async fn verify_access_token(
        &self,
        token: &str,
    ) -> Result<AccessTokenClaims, VerifyError> {
        if self.is_revoked(&token_hash(token)).await? {
            return Err(AuthFailure::Revoked.into());
        }

        let data = decode::<AccessTokenClaims>(token, &self.access_decoding, &self.validation())
            .map_err(|e| VerifyError::Denied(map_jwt_error(e)))?;
        Ok(data.claims)
    }

    /// Verify a refresh token with the same ordering as access verification.
    pub async fn verify_refresh_token(
        &self,
        token: &str,
    ) -> Result<RefreshTokenClaims, VerifyError> {
        if self.is_revoked(&token_hash(token)).await? {
            return Err(AuthFailure::Revoked.into());
        }

        let data = decode::<RefreshTokenClaims>(token, &self.refresh_decoding, &self.validation())
            .map_err(|e| VerifyError::Denied(map_jwt_error(e)))?;
        Ok(data.claims)
    }

    /// Blacklist an access token, e.g. at logout or on a detected role
    /// change. Accepts tokens that already expired (the write is a no-op
    /// with a one second floor).
    pub async fn revoke_access_token(&self, token: &str, reason: &str) -> Result<(), VerifyError> {
        let mut validation = self.validation();
        validation.validate_exp = false;
        let data = decode::<AccessTokenClaims>(token, &self.access_decoding, &validation)
            .map_err(|e| VerifyError::Denied(map_jwt_error(e)))?;
        self.blacklist_hash(&token_hash(token), data.claims.exp, reason)
            .await;
        Ok(())
    }

    /// Rotate a refresh token: verify, consume its (family, version) slot,
    /// blacklist it, and issue the next pair in the family.
    ///
    /// `current_role` comes from the membership directory so a rotation
    /// picks up role changes instead of carrying a stale claim forward.
    pub async fn rotate_refresh(
        &self,
        old_token: &str,
        current_role: Role,
    ) -> Result<TokenPair, VerifyError> {
        let claims = self.verify_refresh_token(old_token).await?;

        if !self.session_active(&claims.token_family).await? {
            return Err(AuthFailure::InvalidSession.into());
        }

        // One rotation per (family, version). A second presentation of the
        // same version means this lineage was already rotated: replay.
        let marker = format!("{}{}:{}", ROTATED_PREFIX, claims.token_family, claims.version);
        let fresh = self
            .store
            .put_if_absent(&marker, "1", self.refresh_ttl())
            .await
            .map_err(VerifyError::Unavailable)?;

        if !fresh {
            tracing::warn!(
                family = %claims.token_family,
                version = claims.version,
                user_id = %claims.user_id,
                "Refresh token replay detected, closing session lineage"
            );
            self.blacklist_hash(&token_hash(old_token), claims.exp, "refresh_replay")
                .await;
            self.close_session(&claims.token_family).await;
            return Err(AuthFailure::Revoked.into());
        }

        // Single use: the old token dies the moment its successor exists.
        self.blacklist_hash(&token_hash(old_token), claims.exp, "rotated")
            .await;

        self.issue_pair(
            &claims.user_id,
            current_role,
            claims.telegram_id,
            &claims.token_family,
            claims.version + 1,
        )
        .map_err(VerifyError::Unavailable)
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthFailure {
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthFailure::Expired,
        ErrorKind::ImmatureSignature => AuthFailure::NotYetValid,
        _ => AuthFailure::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn test_config() -> TokenConfig {
        TokenConfig {
            access_secret: SecretString::new("unit-test-access-secret".to_string()),
            refresh_secret: SecretString::new("unit-test-refresh-secret".to_string()),
            access_ttl_minutes: 15,
            refresh_ttl_days: 7,
            issuer: "storefront-gateway".to_string(),
            audience: "storefront-api".to_string(),
            clock_skew_seconds: 0,
        }
    }

    fn authority() -> TokenAuthority {
        TokenAuthority::new(&test_config(), Arc::new(MemoryRevocationStore::new()))
    }

    #[test]
    fn token_hash_is_deterministic() {
        assert_eq!(token_hash("abc"), token_hash("abc"));
        assert_ne!(token_hash("abc"), token_hash("abd"));
    }

    #[tokio::test]
    async fn access_token_roundtrip_preserves_claims() {
        let authority = authority();
        let pair = authority
            .issue_session("user_1", Role::Vendor, Some(42))
            .await
            .unwrap();

        let claims = authority
            .verify_access_token(&pair.access_token)
            .await
            .unwrap();
        assert_eq!(claims.user_id, "user_1");
        assert_eq!(claims.role, Role::Vendor);
        assert_eq!(claims.telegram_id, Some(42));
        assert_eq!(claims.iss, "storefront-gateway");
        assert_eq!(claims.aud, "storefront-api");
        assert!(authority.session_active(&claims.session_id).await.unwrap());
    }

    #[tokio::test]
    async fn revoked_token_fails_as_revoked() {
        let authority = authority();
        let pair = authority
            .issue_session("user_1", Role::Customer, None)
            .await
            .unwrap();

        authority
            .revoke_access_token(&pair.access_token, "logout")
            .await
            .unwrap();

        let err = authority
            .verify_access_token(&pair.access_token)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Denied(AuthFailure::Revoked)));
    }

    #[tokio::test]
    async fn expired_token_fails_as_expired() {
        let mut config = test_config();
        config.access_ttl_minutes = -1;
        let authority =
            TokenAuthority::new(&config, Arc::new(MemoryRevocationStore::new()));

        let token = authority
            .issue_access_token("user_1", Role::Customer, None, "sess")
            .unwrap();
        let err = authority.verify_access_token(&token).await.unwrap_err();
        assert!(matches!(err, VerifyError::Denied(AuthFailure::Expired)));
    }

    #[tokio::test]
    async fn tampered_token_fails_as_malformed() {
        let authority = authority();
        let pair = authority
            .issue_session("user_1", Role::Customer, None)
            .await
            .unwrap();

        let mut tampered = pair.access_token.clone();
        tampered.pop();
        tampered.push('A');
        let err = authority.verify_access_token(&tampered).await.unwrap_err();
        assert!(matches!(err, VerifyError::Denied(AuthFailure::Malformed)));

        let err = authority.verify_access_token("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, VerifyError::Denied(AuthFailure::Malformed)));
    }

    #[tokio::test]
    async fn wrong_audience_is_rejected() {
        let authority = authority();
        let pair = authority
            .issue_session("user_1", Role::Customer, None)
            .await
            .unwrap();

        let mut other_config = test_config();
        other_config.audience = "some-other-api".to_string();
        let other =
            TokenAuthority::new(&other_config, Arc::new(MemoryRevocationStore::new()));

        let err = other
            .verify_access_token(&pair.access_token)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Denied(AuthFailure::Malformed)));
    }

    #[tokio::test]
    async fn rotation_bumps_version_within_family() {
        let authority = authority();
        let pair = authority
            .issue_session("user_1", Role::Vendor, None)
            .await
            .unwrap();

        let first = authority
            .verify_refresh_token(&pair.refresh_token)
            .await
            .unwrap();
        assert_eq!(first.version, 1);

        let rotated = authority
            .rotate_refresh(&pair.refresh_token, Role::Vendor)
            .await
            .unwrap();
        let second = authority
            .verify_refresh_token(&rotated.refresh_token)
            .await
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.token_family, first.token_family);
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_single_use() {
        let authority = authority();
        let pair = authority
            .issue_session("user_1", Role::Vendor, None)
            .await
            .unwrap();

        authority
            .rotate_refresh(&pair.refresh_token, Role::Vendor)
            .await
            .unwrap();

        let err = authority
            .rotate_refresh(&pair.refresh_token, Role::Vendor)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Denied(AuthFailure::Revoked)));
    }

    #[tokio::test]
    async fn rotation_picks_up_a_changed_role() {
        let authority = authority();
        let pair = authority
            .issue_session("user_1", Role::Vendor, None)
            .await
            .unwrap();

        let rotated = authority
            .rotate_refresh(&pair.refresh_token, Role::Admin)
            .await
            .unwrap();
        let claims = authority
            .verify_access_token(&rotated.access_token)
            .await
            .unwrap();
        assert_eq!(claims.role, Role::Admin);
    }

    #[tokio::test]
    async fn closed_session_rejects_rotation() {
        let authority = authority();
        let pair = authority
            .issue_session("user_1", Role::Customer, None)
            .await
            .unwrap();
        let claims = authority
            .verify_refresh_token(&pair.refresh_token)
            .await
            .unwrap();

        authority.close_session(&claims.token_family).await;

        let err = authority
            .rotate_refresh(&pair.refresh_token, Role::Customer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VerifyError::Denied(AuthFailure::InvalidSession)
        ));
    }
}
