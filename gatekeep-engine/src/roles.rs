//! Role aggregation
//!
//! Resolves a role's effective permission set and the roles a subject holds
//! within a tenant. Roles are flat: the effective set is exactly the assigned
//! set, with no role-to-role inheritance.

use chrono::{DateTime, Utc};
use gatekeep_core::{EntityStore, GatekeepError, GatekeepResult, Role};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct RoleAggregator {
    store: Arc<dyn EntityStore>,
}

impl RoleAggregator {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Effective (flat) permission set of a role
    pub async fn effective_permissions(&self, role_id: &str) -> GatekeepResult<HashSet<String>> {
        let role = self
            .store
            .load_role(role_id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Role", role_id, "roles"))?;

        if !role.is_active {
            return Ok(HashSet::new());
        }

        Ok(role.permission_ids)
    }

    /// Active roles the user holds that apply within the given tenant,
    /// derived from active, unexpired memberships.
    pub async fn roles_for_subject(
        &self,
        user_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> GatekeepResult<Vec<Role>> {
        let memberships = self.store.memberships_for_user(user_id).await?;

        let mut roles = Vec::new();
        for membership in memberships {
            if !membership.is_valid_at(now) {
                continue;
            }
            let Some(role_id) = membership.role_id.as_deref() else {
                continue;
            };
            let Some(role) = self.store.load_role(role_id).await? else {
                // Dangling role reference; skip rather than fail the decision
                debug!(role_id, user_id, "Membership references missing role");
                continue;
            };
            if role.is_active && role.applies_to_tenant(tenant_id) {
                roles.push(role);
            }
        }

        Ok(roles)
    }

    /// Whether any of the subject's tenant-applicable roles carries the
    /// permission in its aggregated set
    pub async fn subject_has_permission_via_roles(
        &self,
        user_id: &str,
        permission_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> GatekeepResult<bool> {
        let roles = self.roles_for_subject(user_id, tenant_id, now).await?;
        Ok(roles
            .iter()
            .any(|role| role.permission_ids.contains(permission_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEntityStore;
    use gatekeep_core::{Membership, MembershipType, RoleScope};

    async fn setup() -> (Arc<MemoryEntityStore>, RoleAggregator) {
        let store = Arc::new(MemoryEntityStore::new());
        let aggregator = RoleAggregator::new(store.clone());
        (store, aggregator)
    }

    #[tokio::test]
    async fn aggregation_is_flat_assigned_set() {
        let (store, aggregator) = setup().await;
        let role = Role::new("editor", Some("t1"), RoleScope::Tenant)
            .with_permissions(["p-read".to_string(), "p-write".to_string()]);
        store.save_role(&role).await.unwrap();

        let set = aggregator.effective_permissions(&role.id).await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("p-read"));
    }

    #[tokio::test]
    async fn tenant_scoped_role_does_not_leak_across_tenants() {
        let (store, aggregator) = setup().await;
        let now = Utc::now();

        let role = Role::new("editor", Some("t1"), RoleScope::Tenant)
            .with_permissions(["p-read".to_string()]);
        store.save_role(&role).await.unwrap();
        store
            .save_membership(&Membership::new("carol", "org-1", MembershipType::Member).with_role(&role.id))
            .await
            .unwrap();

        assert!(aggregator
            .subject_has_permission_via_roles("carol", "p-read", "t1", now)
            .await
            .unwrap());
        assert!(!aggregator
            .subject_has_permission_via_roles("carol", "p-read", "t2", now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_membership_yields_no_roles() {
        let (store, aggregator) = setup().await;
        let now = Utc::now();

        let role = Role::new("editor", None, RoleScope::Application)
            .with_permissions(["p-read".to_string()]);
        store.save_role(&role).await.unwrap();

        let mut membership =
            Membership::new("carol", "org-1", MembershipType::Member).with_role(&role.id);
        membership.expires_at = Some(now - chrono::Duration::hours(1));
        store.save_membership(&membership).await.unwrap();

        assert!(aggregator
            .roles_for_subject("carol", "t1", now)
            .await
            .unwrap()
            .is_empty());
    }
}
