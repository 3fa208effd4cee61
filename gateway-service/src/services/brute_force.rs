//! Brute-force lockout with exponential backoff.
//!
//! State machine per key (caller IP, or IP+route): `Clear` until the first
//! failure, `Tracking` while failures accumulate inside the base window,
//! `Locked` once the threshold is crossed. The lock clears on its own when
//! the block duration elapses without further failures, and the counter
//! key expires with the base window, so the next attempt after a completed
//! lockout is a fresh first failure.

use std::sync::Arc;
use std::time::Duration;

use crate::config::BruteForceConfig;
use crate::services::revocation::RevocationStore;

pub const BRUTE_FORCE_PREFIX: &str = "bruteforce:";
const LOCKOUT_PREFIX: &str = "lockout:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BruteForceState {
    Clear,
    Tracking { count: u64 },
    Locked { remaining: Duration },
}

#[derive(Clone)]
pub struct BruteForceGuard {
    store: Arc<dyn RevocationStore>,
    threshold: u64,
    base_window: Duration,
    max_lockout: Duration,
}

impl BruteForceGuard {
    pub fn new(store: Arc<dyn RevocationStore>, config: &BruteForceConfig) -> Self {
        Self {
            store,
            threshold: config.threshold.max(1),
            base_window: Duration::from_secs(config.base_window_seconds),
            max_lockout: Duration::from_secs(config.max_lockout_seconds),
        }
    }

    /// Lockout length for a given failure count:
    /// `base_window * 2^(count - threshold)`, capped.
    pub fn block_duration(&self, count: u64) -> Duration {
        let exponent = count.saturating_sub(self.threshold).min(32) as u32;
        self.base_window
            .checked_mul(2u32.saturating_pow(exponent))
            .unwrap_or(self.max_lockout)
            .min(self.max_lockout)
    }

    /// Current state for a key, without recording anything.
    pub async fn status(&self, key: &str) -> Result<BruteForceState, anyhow::Error> {
        if let Some(remaining) = self.store.ttl(&lockout_key(key)).await? {
            return Ok(BruteForceState::Locked { remaining });
        }
        match self.store.get(&counter_key(key)).await? {
            Some(raw) => Ok(BruteForceState::Tracking {
                count: raw.parse().unwrap_or(0),
            }),
            None => Ok(BruteForceState::Clear),
        }
    }

    /// Record one failed attempt and return the resulting state. Crossing
    /// the threshold arms (or extends) the lockout entry.
    pub async fn record_failure(&self, key: &str) -> Result<BruteForceState, anyhow::Error> {
        let count = self
            .store
            .increment(&counter_key(key), self.base_window)
            .await?;

        if count >= self.threshold {
            let block = self.block_duration(count);
            self.store
                .put(&lockout_key(key), &count.to_string(), block)
                .await?;
            tracing::warn!(
                key = %key,
                count,
                block_secs = block.as_secs(),
                "Brute-force threshold crossed, key locked"
            );
            return Ok(BruteForceState::Locked { remaining: block });
        }

        Ok(BruteForceState::Tracking { count })
    }

    /// A successful authentication wipes the slate for the key.
    pub async fn record_success(&self, key: &str) {
        if let Err(e) = self.store.delete(&counter_key(key)).await {
            tracing::warn!(error = %e, "Failed to clear brute-force counter");
        }
        if let Err(e) = self.store.delete(&lockout_key(key)).await {
            tracing::warn!(error = %e, "Failed to clear brute-force lockout");
        }
    }
}

fn counter_key(key: &str) -> String {
    format!("{}{}", BRUTE_FORCE_PREFIX, key)
}

fn lockout_key(key: &str) -> String {
    format!("{}{}", LOCKOUT_PREFIX, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::revocation::MemoryRevocationStore;

    fn guard(threshold: u64, base_secs: u64, cap_secs: u64) -> BruteForceGuard {
        BruteForceGuard::new(
            Arc::new(MemoryRevocationStore::new()),
            &BruteForceConfig {
                threshold,
                base_window_seconds: base_secs,
                max_lockout_seconds: cap_secs,
            },
        )
    }

    #[test]
    fn block_duration_doubles_per_failure_past_the_threshold() {
        let guard = guard(3, 60, 3600);
        assert_eq!(guard.block_duration(3), Duration::from_secs(60));
        assert_eq!(guard.block_duration(4), Duration::from_secs(120));
        assert_eq!(guard.block_duration(5), Duration::from_secs(240));
        // capped
        assert_eq!(guard.block_duration(20), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn failures_below_the_threshold_only_track() {
        let guard = guard(3, 60, 3600);
        assert_eq!(
            guard.record_failure("1.2.3.4").await.unwrap(),
            BruteForceState::Tracking { count: 1 }
        );
        assert_eq!(
            guard.record_failure("1.2.3.4").await.unwrap(),
            BruteForceState::Tracking { count: 2 }
        );
        assert_eq!(
            guard.status("1.2.3.4").await.unwrap(),
            BruteForceState::Tracking { count: 2 }
        );
    }

    #[tokio::test]
    async fn third_failure_locks_at_threshold_three() {
        let guard = guard(3, 60, 3600);
        guard.record_failure("k").await.unwrap();
        guard.record_failure("k").await.unwrap();
        let state = guard.record_failure("k").await.unwrap();
        // First lock runs for base_window * 2^0.
        assert_eq!(
            state,
            BruteForceState::Locked {
                remaining: Duration::from_secs(60)
            }
        );
        assert!(matches!(
            guard.status("k").await.unwrap(),
            BruteForceState::Locked { .. }
        ));
    }

    #[tokio::test]
    async fn success_resets_to_clear() {
        let guard = guard(3, 60, 3600);
        guard.record_failure("k").await.unwrap();
        guard.record_failure("k").await.unwrap();
        guard.record_success("k").await;
        assert_eq!(guard.status("k").await.unwrap(), BruteForceState::Clear);
        // Next failure starts a fresh count.
        assert_eq!(
            guard.record_failure("k").await.unwrap(),
            BruteForceState::Tracking { count: 1 }
        );
    }

    #[tokio::test]
    async fn lock_expires_back_to_clear() {
        // Millisecond windows so the test can wait the lockout out.
        let guard = BruteForceGuard::new(
            Arc::new(MemoryRevocationStore::new()),
            &BruteForceConfig {
                threshold: 1,
                base_window_seconds: 0,
                max_lockout_seconds: 0,
            },
        );
        assert!(matches!(
            guard.record_failure("k").await.unwrap(),
            BruteForceState::Locked { .. }
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(guard.status("k").await.unwrap(), BruteForceState::Clear);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let guard = guard(1, 60, 3600);
        guard.record_failure("a").await.unwrap();
        assert!(matches!(
            guard.status("a").await.unwrap(),
            BruteForceState::Locked { .. }
        ));
        assert_eq!(guard.status("b").await.unwrap(), BruteForceState::Clear);
    }
}
