pub mod access;
pub mod audit;
pub mod auth;
pub mod brute_force;
pub mod csrf;
pub mod ip_reputation;
pub mod rate_limit;

pub use access::{
    require_permission, require_self_or_admin, require_store_access, StoreOperation,
};
pub use audit::audit_middleware;
pub use auth::{auth_middleware, AuthUser};
pub use brute_force::brute_force_middleware;
pub use csrf::csrf_middleware;
pub use ip_reputation::ip_reputation_middleware;
pub use rate_limit::{admin_rate_limit_middleware, rate_limit_middleware, TierLimiters};
