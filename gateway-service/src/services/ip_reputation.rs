//! IP reputation scoring from pattern-matched malicious-looking requests.
//!
//! Independent of authentication outcome: every request surface (path,
//! query, headers, body) is matched against known attack signatures. Each
//! match bumps a per-IP suspicion counter; crossing the threshold blocks
//! the address for a fixed duration. Critical signatures deny immediately
//! regardless of block state.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReputationConfig;
use crate::services::revocation::RevocationStore;

pub const REPUTATION_PREFIX: &str = "reputation:";
const IP_BLOCK_PREFIX: &str = "ipblock:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Medium,
    High,
    Critical,
}

pub struct AttackSignature {
    pub name: &'static str,
    pub severity: Severity,
    pattern: Regex,
}

static SIGNATURES: Lazy<Vec<AttackSignature>> = Lazy::new(|| {
    vec![
        AttackSignature {
            name: "path_traversal",
            severity: Severity::High,
            pattern: Regex::new(r"(?i)(\.\./|\.\.\\|%2e%2e%2f|%2e%2e/|\.\.%2f)").unwrap(),
        },
        AttackSignature {
            name: "script_injection",
            severity: Severity::Medium,
            pattern: Regex::new(r"(?i)(<script\b|javascript:|\bonerror\s*=|\bonload\s*=)")
                .unwrap(),
        },
        AttackSignature {
            name: "sql_injection",
            severity: Severity::Critical,
            pattern: Regex::new(
                r"(?i)(\bunion\s+(all\s+)?select\b|\bdrop\s+table\b|\binsert\s+into\b|'\s*or\s+'?\d+'?\s*=\s*'?\d+|--\s*$|;\s*--)",
            )
            .unwrap(),
        },
        AttackSignature {
            name: "code_injection",
            severity: Severity::Critical,
            pattern: Regex::new(
                r"(?i)(\beval\s*\(|\bexec\s*\(|\bsystem\s*\(|\bpassthru\s*\(|__import__\s*\()",
            )
            .unwrap(),
        },
    ]
});

#[derive(Debug, Clone)]
pub struct SignatureMatch {
    pub name: &'static str,
    pub severity: Severity,
    /// Which request surface matched: "path", "query", "header" or "body".
    pub location: &'static str,
}

/// Match one request surface against the signature table.
pub fn scan_text(text: &str, location: &'static str) -> Vec<SignatureMatch> {
    SIGNATURES
        .iter()
        .filter(|sig| sig.pattern.is_match(text))
        .map(|sig| SignatureMatch {
            name: sig.name,
            severity: sig.severity,
            location,
        })
        .collect()
}

#[derive(Clone)]
pub struct IpReputationService {
    store: Arc<dyn RevocationStore>,
    threshold: u64,
    window: Duration,
    block_duration: Duration,
}

impl IpReputationService {
    pub fn new(store: Arc<dyn RevocationStore>, config: &ReputationConfig) -> Self {
        Self {
            store,
            threshold: config.threshold.max(1),
            window: Duration::from_secs(config.window_seconds),
            block_duration: Duration::from_secs(config.block_seconds),
        }
    }

    /// Remaining block time for an address, if it is currently blocked.
    pub async fn is_blocked(&self, ip: &str) -> Result<Option<Duration>, anyhow::Error> {
        self.store
            .ttl(&format!("{}{}", IP_BLOCK_PREFIX, ip))
            .await
    }

    /// Record signature matches against an address. Returns the suspicion
    /// count after recording; crossing the threshold arms the block marker.
    pub async fn record_matches(
        &self,
        ip: &str,
        matches: &[SignatureMatch],
    ) -> Result<u64, anyhow::Error> {
        let counter = format!("{}{}", REPUTATION_PREFIX, ip);
        let mut count = 0;
        for m in matches {
            count = self.store.increment(&counter, self.window).await?;
            tracing::warn!(
                ip = %ip,
                signature = m.name,
                location = m.location,
                severity = ?m.severity,
                suspicion = count,
                "Attack signature matched"
            );
        }

        if count >= self.threshold {
            self.store
                .put(
                    &format!("{}{}", IP_BLOCK_PREFIX, ip),
                    &count.to_string(),
                    self.block_duration,
                )
                .await?;
            tracing::warn!(ip = %ip, suspicion = count, "IP blocked by reputation");
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::revocation::MemoryRevocationStore;

    #[test]
    fn detects_path_traversal() {
        let matches = scan_text("/api/files/../../etc/passwd", "path");
        assert!(matches.iter().any(|m| m.name == "path_traversal"));
    }

    #[test]
    fn detects_sql_injection_as_critical() {
        let matches = scan_text("id=1 UNION SELECT password FROM users", "query");
        let hit = matches.iter().find(|m| m.name == "sql_injection").unwrap();
        assert_eq!(hit.severity, Severity::Critical);

        let matches = scan_text("name=' OR '1'='1", "body");
        assert!(matches.iter().any(|m| m.name == "sql_injection"));
    }

    #[test]
    fn detects_script_and_code_injection() {
        assert!(scan_text("<script>alert(1)</script>", "body")
            .iter()
            .any(|m| m.name == "script_injection"));
        assert!(scan_text("cmd=eval(request)", "query")
            .iter()
            .any(|m| m.name == "code_injection"));
    }

    #[test]
    fn clean_requests_do_not_match() {
        assert!(scan_text("/api/stores/s1/products?page=2", "path").is_empty());
        assert!(scan_text(r#"{"name":"Selection of plates"}"#, "body").is_empty());
    }

    #[tokio::test]
    async fn crossing_the_threshold_blocks_the_address() {
        let service = IpReputationService::new(
            Arc::new(MemoryRevocationStore::new()),
            &ReputationConfig {
                threshold: 2,
                window_seconds: 60,
                block_seconds: 300,
            },
        );

        let matches = scan_text("../../etc/passwd", "path");
        assert!(service.is_blocked("9.9.9.9").await.unwrap().is_none());

        service.record_matches("9.9.9.9", &matches).await.unwrap();
        assert!(service.is_blocked("9.9.9.9").await.unwrap().is_none());

        service.record_matches("9.9.9.9", &matches).await.unwrap();
        let remaining = service.is_blocked("9.9.9.9").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(300));
        assert!(remaining > Duration::from_secs(290));

        // Other addresses are unaffected.
        assert!(service.is_blocked("8.8.8.8").await.unwrap().is_none());
    }
}
