//! Audit event model - one immutable record per request/response exchange.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Sensitivity classification assigned to a request or response payload.
/// Ordered from least to most sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClassification {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl DataClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataClassification::Public => "public",
            DataClassification::Internal => "internal",
            DataClassification::Confidential => "confidential",
            DataClassification::Restricted => "restricted",
        }
    }
}

/// Regulatory regimes a recorded exchange may fall under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ComplianceFlags {
    pub pii: bool,
    pub gdpr: bool,
    pub pci: bool,
    pub hipaa: bool,
}

/// Request snapshot taken before the handler runs. Headers and bodies are
/// sanitized and size-capped before they reach this struct.
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    pub headers: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub body_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseContext {
    pub status: u16,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub body_truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub request: RequestContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseContext>,
    /// Bounded 0..=100; a pure function of the rest of the event.
    pub risk_score: u8,
    pub security_flags: Vec<String>,
    pub data_classification: DataClassification,
    pub compliance: ComplianceFlags,
}
