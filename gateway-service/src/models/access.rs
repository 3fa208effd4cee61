use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Platform-wide role carried in access-token claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Vendor,
    Customer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Vendor => "vendor",
            Role::Customer => "customer",
        }
    }
}

/// Relations between one user and one store, as reported by the membership
/// directory. All fields may be set at once; resolution applies precedence.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    pub owner: bool,
    pub admin: bool,
    pub vendor: Option<VendorGrant>,
}

/// Vendor-level grant: a named custom role with explicit permission strings,
/// or the legacy inline permission list kept for stores that predate
/// custom roles.
#[derive(Debug, Clone, Default)]
pub struct VendorGrant {
    pub custom_role: Option<CustomRole>,
    pub legacy_permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CustomRole {
    pub name: String,
    pub permissions: Vec<String>,
}

/// Store-scoped access level resolved for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    None,
    Vendor,
    Admin,
    Owner,
}

/// Fixed permission set granted to store admins. Owners need no listing:
/// they pass every check implicitly.
pub const ADMIN_PERMISSIONS: &[&str] = &[
    "store:read",
    "store:write",
    "products:*",
    "orders:*",
    "vendors:read",
    "vendors:write",
    "analytics:read",
    "users:read",
];

/// Effective permission set for one user on one store, derived per request
/// and never stored.
#[derive(Debug, Clone)]
pub struct PermissionGrant {
    pub level: AccessLevel,
    pub permissions: HashSet<String>,
}

impl PermissionGrant {
    pub fn denied() -> Self {
        Self {
            level: AccessLevel::None,
            permissions: HashSet::new(),
        }
    }

    pub fn owner() -> Self {
        Self {
            level: AccessLevel::Owner,
            permissions: HashSet::new(),
        }
    }

    pub fn admin() -> Self {
        Self {
            level: AccessLevel::Admin,
            permissions: ADMIN_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn vendor(permissions: Vec<String>) -> Self {
        Self {
            level: AccessLevel::Vendor,
            permissions: permissions.into_iter().collect(),
        }
    }

    /// Owner passes every check; everyone else needs an explicit or
    /// wildcard-matched permission string.
    pub fn allows(&self, required: &str) -> bool {
        if self.level == AccessLevel::Owner {
            return true;
        }
        has_permission(&self.permissions, required)
    }
}

/// Wildcard-aware permission matching: `*` grants everything, and a grant
/// ending in `*` matches by prefix (`products:*` covers `products:write`).
pub fn has_permission(granted: &HashSet<String>, required: &str) -> bool {
    for grant in granted {
        if grant == "*" || grant == required {
            return true;
        }
        if let Some(prefix) = grant.strip_suffix('*') {
            if required.starts_with(prefix) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(perms: &[&str]) -> HashSet<String> {
        perms.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn exact_permission_matches() {
        assert!(has_permission(&set(&["products:read"]), "products:read"));
        assert!(!has_permission(&set(&["products:read"]), "products:write"));
    }

    #[test]
    fn wildcard_permission_matches_by_prefix() {
        let grants = set(&["products:*"]);
        assert!(has_permission(&grants, "products:write"));
        assert!(has_permission(&grants, "products:read"));
        assert!(!has_permission(&grants, "orders:read"));
    }

    #[test]
    fn star_grants_everything() {
        assert!(has_permission(&set(&["*"]), "anything:at:all"));
    }

    #[test]
    fn owner_grant_allows_without_explicit_permissions() {
        let grant = PermissionGrant::owner();
        assert!(grant.permissions.is_empty());
        assert!(grant.allows("store:delete"));
    }

    #[test]
    fn denied_grant_allows_nothing() {
        assert!(!PermissionGrant::denied().allows("store:read"));
    }
}
