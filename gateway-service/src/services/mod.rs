//! Services layer for the request-security gateway.
//!
//! Everything here is constructed once at startup and handed to the
//! middleware chain through `AppState`; nothing holds module-level state.

pub mod access;
pub mod audit;
pub mod brute_force;
pub mod csrf;
pub mod dlp;
pub mod error;
pub mod ip_reputation;
pub mod notifier;
pub mod revocation;
pub mod token;

pub use access::{AccessController, MembershipProvider, StaticDirectory};
pub use audit::{AuditPipeline, AuditSink, TracingAuditSink};
pub use brute_force::{BruteForceGuard, BruteForceState};
pub use csrf::{CsrfProtection, CsrfToken};
pub use dlp::DlpScanner;
pub use error::{AuthFailure, VerifyError};
pub use ip_reputation::IpReputationService;
pub use notifier::OperatorNotifier;
pub use revocation::{MemoryRevocationStore, RedisRevocationStore, RevocationStore};
pub use token::{AccessTokenClaims, RefreshTokenClaims, TokenAuthority, TokenPair};
