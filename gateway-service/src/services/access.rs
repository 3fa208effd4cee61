//! Store-scoped authorization: resolving a caller's effective permission
//! set from the membership directory.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::models::{Membership, PermissionGrant, Role};

/// The gateway's window into the platform's user and membership data. The
/// real implementation lives with the domain store; the gateway only ever
/// calls these two lookups.
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Relations between one user and one store.
    async fn resolve_membership(
        &self,
        user_id: &str,
        store_id: &str,
    ) -> Result<Membership, anyhow::Error>;

    /// The user's current platform role, or None when the account is gone.
    /// Compared against token claims to catch stale-privilege tokens.
    async fn current_role(&self, user_id: &str) -> Result<Option<Role>, anyhow::Error>;
}

/// Resolves permission grants per request. Stateless besides the directory
/// handle; grants are derived, never cached or stored.
#[derive(Clone)]
pub struct AccessController {
    directory: Arc<dyn MembershipProvider>,
}

impl AccessController {
    pub fn new(directory: Arc<dyn MembershipProvider>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Arc<dyn MembershipProvider> {
        &self.directory
    }

    /// Resolution precedence: store owner (full set), store admin (fixed
    /// set), vendor (custom role over legacy inline list), otherwise deny.
    pub async fn resolve_permissions(
        &self,
        user_id: &str,
        store_id: &str,
    ) -> Result<PermissionGrant, anyhow::Error> {
        let membership = self
            .directory
            .resolve_membership(user_id, store_id)
            .await?;

        if membership.owner {
            return Ok(PermissionGrant::owner());
        }
        if membership.admin {
            return Ok(PermissionGrant::admin());
        }
        if let Some(vendor) = membership.vendor {
            let permissions = match vendor.custom_role {
                Some(role) => role.permissions,
                None => vendor.legacy_permissions,
            };
            return Ok(PermissionGrant::vendor(permissions));
        }

        Ok(PermissionGrant::denied())
    }
}

/// In-process directory used by tests and local development. Production
/// deployments wire the user service behind `MembershipProvider` instead.
#[derive(Default)]
pub struct StaticDirectory {
    roles: DashMap<String, Role>,
    memberships: DashMap<(String, String), Membership>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user_id: &str, role: Role) {
        self.roles.insert(user_id.to_string(), role);
    }

    pub fn remove_user(&self, user_id: &str) {
        self.roles.remove(user_id);
    }

    pub fn insert_membership(&self, user_id: &str, store_id: &str, membership: Membership) {
        self.memberships
            .insert((user_id.to_string(), store_id.to_string()), membership);
    }
}

#[async_trait]
impl MembershipProvider for StaticDirectory {
    async fn resolve_membership(
        &self,
        user_id: &str,
        store_id: &str,
    ) -> Result<Membership, anyhow::Error> {
        Ok(self
            .memberships
            .get(&(user_id.to_string(), store_id.to_string()))
            .map(|m| m.clone())
            .unwrap_or_default())
    }

    async fn current_role(&self, user_id: &str) -> Result<Option<Role>, anyhow::Error> {
        Ok(self.roles.get(user_id).map(|r| *r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessLevel, CustomRole, VendorGrant};

    fn controller_with(directory: StaticDirectory) -> AccessController {
        AccessController::new(Arc::new(directory))
    }

    #[tokio::test]
    async fn store_owner_gets_a_full_grant_with_empty_permission_set() {
        let directory = StaticDirectory::new();
        directory.insert_membership(
            "u1",
            "s1",
            Membership {
                owner: true,
                ..Default::default()
            },
        );
        let grant = controller_with(directory)
            .resolve_permissions("u1", "s1")
            .await
            .unwrap();
        assert_eq!(grant.level, AccessLevel::Owner);
        assert!(grant.allows("store:delete"));
        assert!(grant.allows("anything"));
    }

    #[tokio::test]
    async fn store_admin_gets_the_fixed_set() {
        let directory = StaticDirectory::new();
        directory.insert_membership(
            "u1",
            "s1",
            Membership {
                admin: true,
                ..Default::default()
            },
        );
        let grant = controller_with(directory)
            .resolve_permissions("u1", "s1")
            .await
            .unwrap();
        assert_eq!(grant.level, AccessLevel::Admin);
        assert!(grant.allows("products:write"));
        assert!(grant.allows("orders:read"));
        assert!(!grant.allows("store:delete"));
    }

    #[tokio::test]
    async fn vendor_custom_role_grants_exactly_its_declared_set() {
        let directory = StaticDirectory::new();
        directory.insert_membership(
            "u1",
            "s1",
            Membership {
                vendor: Some(VendorGrant {
                    custom_role: Some(CustomRole {
                        name: "catalog-editor".to_string(),
                        permissions: vec![
                            "products:read".to_string(),
                            "products:write".to_string(),
                        ],
                    }),
                    legacy_permissions: vec!["orders:read".to_string()],
                }),
                ..Default::default()
            },
        );
        let grant = controller_with(directory)
            .resolve_permissions("u1", "s1")
            .await
            .unwrap();
        assert_eq!(grant.level, AccessLevel::Vendor);
        assert!(grant.allows("products:write"));
        // The custom role replaces the legacy list; no admin fallback either.
        assert!(!grant.allows("orders:read"));
        assert!(!grant.allows("users:read"));
    }

    #[tokio::test]
    async fn vendor_without_custom_role_falls_back_to_legacy_list() {
        let directory = StaticDirectory::new();
        directory.insert_membership(
            "u1",
            "s1",
            Membership {
                vendor: Some(VendorGrant {
                    custom_role: None,
                    legacy_permissions: vec!["orders:read".to_string()],
                }),
                ..Default::default()
            },
        );
        let grant = controller_with(directory)
            .resolve_permissions("u1", "s1")
            .await
            .unwrap();
        assert!(grant.allows("orders:read"));
        assert!(!grant.allows("orders:write"));
    }

    #[tokio::test]
    async fn unknown_relation_is_denied() {
        let grant = controller_with(StaticDirectory::new())
            .resolve_permissions("u1", "s1")
            .await
            .unwrap();
        assert_eq!(grant.level, AccessLevel::None);
        assert!(!grant.allows("store:read"));
    }

    #[tokio::test]
    async fn owner_precedence_wins_over_other_relations() {
        let directory = StaticDirectory::new();
        directory.insert_membership(
            "u1",
            "s1",
            Membership {
                owner: true,
                admin: true,
                vendor: Some(VendorGrant::default()),
            },
        );
        let grant = controller_with(directory)
            .resolve_permissions("u1", "s1")
            .await
            .unwrap();
        assert_eq!(grant.level, AccessLevel::Owner);
    }
}
