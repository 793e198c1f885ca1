//! In-memory entity store (default backend)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatekeep_core::{
    EntityStore, GatekeepResult, Grant, Membership, Permission, Resource, Role, SubjectRef,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    resources: HashMap<String, Resource>,
    permissions: HashMap<String, Permission>,
    roles: HashMap<String, Role>,
    grants: HashMap<String, Grant>,
    memberships: Vec<Membership>,
}

/// In-memory entity store.
///
/// All tables live behind a single lock so that `insert_grant_if_absent`
/// can hold the write guard across its check and insert, which is what
/// makes the conditional write atomic for this backend.
#[derive(Debug, Default, Clone)]
pub struct MemoryEntityStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored grants, valid or not (test helper)
    pub async fn grant_count(&self) -> usize {
        self.inner.read().await.grants.len()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn save_resource(&self, resource: &Resource) -> GatekeepResult<()> {
        let mut inner = self.inner.write().await;
        inner.resources.insert(resource.id.clone(), resource.clone());
        debug!("Saved resource {} to memory store", resource.id);
        Ok(())
    }

    async fn load_resource(&self, id: &str) -> GatekeepResult<Option<Resource>> {
        let inner = self.inner.read().await;
        Ok(inner.resources.get(id).cloned())
    }

    async fn load_resource_by_token(&self, token: &str) -> GatekeepResult<Option<Resource>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .values()
            .find(|r| r.public_link_token.as_deref() == Some(token))
            .cloned())
    }

    async fn list_resources(
        &self,
        tenant_id: &str,
        resource_type: Option<&str>,
    ) -> GatekeepResult<Vec<Resource>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .values()
            .filter(|r| {
                r.is_active
                    && r.tenant_id == tenant_id
                    && resource_type.map_or(true, |t| r.resource_type == t)
            })
            .cloned()
            .collect())
    }

    async fn list_children(&self, resource_id: &str) -> GatekeepResult<Vec<Resource>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .values()
            .filter(|r| r.is_active && r.parent_id.as_deref() == Some(resource_id))
            .cloned()
            .collect())
    }

    async fn save_permission(&self, permission: &Permission) -> GatekeepResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .permissions
            .insert(permission.id.clone(), permission.clone());
        debug!("Saved permission {} to memory store", permission.name);
        Ok(())
    }

    async fn load_permission(&self, id: &str) -> GatekeepResult<Option<Permission>> {
        let inner = self.inner.read().await;
        Ok(inner.permissions.get(id).cloned())
    }

    async fn find_permission(
        &self,
        name: &str,
        resource_type: Option<&str>,
    ) -> GatekeepResult<Option<Permission>> {
        let inner = self.inner.read().await;
        Ok(inner
            .permissions
            .values()
            .find(|p| p.name == name && p.resource_type.as_deref() == resource_type)
            .cloned())
    }

    async fn save_role(&self, role: &Role) -> GatekeepResult<()> {
        let mut inner = self.inner.write().await;
        inner.roles.insert(role.id.clone(), role.clone());
        debug!("Saved role {} to memory store", role.name);
        Ok(())
    }

    async fn load_role(&self, id: &str) -> GatekeepResult<Option<Role>> {
        let inner = self.inner.read().await;
        Ok(inner.roles.get(id).cloned())
    }

    async fn find_role(&self, name: &str, tenant_id: Option<&str>) -> GatekeepResult<Option<Role>> {
        let inner = self.inner.read().await;
        Ok(inner
            .roles
            .values()
            .find(|r| r.name == name && r.tenant_id.as_deref() == tenant_id)
            .cloned())
    }

    async fn insert_grant_if_absent(
        &self,
        grant: &Grant,
        now: DateTime<Utc>,
    ) -> GatekeepResult<Grant> {
        // Write guard held across check and insert; concurrent identical
        // calls serialize here and the loser observes the winner's row.
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner
            .grants
            .values()
            .find(|g| {
                g.subject == grant.subject
                    && g.resource_id == grant.resource_id
                    && g.permission_id == grant.permission_id
                    && g.is_valid_at(now)
            })
            .cloned()
        {
            debug!(
                "Grant for {} on {} already valid, returning existing",
                grant.subject, grant.resource_id
            );
            return Ok(existing);
        }

        inner.grants.insert(grant.id.clone(), grant.clone());
        debug!("Inserted grant {} into memory store", grant.id);
        Ok(grant.clone())
    }

    async fn update_grant(&self, grant: &Grant) -> GatekeepResult<()> {
        let mut inner = self.inner.write().await;
        inner.grants.insert(grant.id.clone(), grant.clone());
        Ok(())
    }

    async fn grants_for_subject(
        &self,
        subject: &SubjectRef,
        resource_id: &str,
    ) -> GatekeepResult<Vec<Grant>> {
        let inner = self.inner.read().await;
        Ok(inner
            .grants
            .values()
            .filter(|g| &g.subject == subject && g.resource_id == resource_id)
            .cloned()
            .collect())
    }

    async fn grants_for_user(&self, user_id: &str, tenant_id: &str) -> GatekeepResult<Vec<Grant>> {
        let inner = self.inner.read().await;
        Ok(inner
            .grants
            .values()
            .filter(|g| g.tenant_id == tenant_id && g.subject.as_user() == Some(user_id))
            .cloned()
            .collect())
    }

    async fn save_membership(&self, membership: &Membership) -> GatekeepResult<()> {
        let mut inner = self.inner.write().await;
        // One membership per (user, organization); replace on repeat
        inner.memberships.retain(|m| {
            !(m.user_id == membership.user_id && m.organization_id == membership.organization_id)
        });
        inner.memberships.push(membership.clone());
        Ok(())
    }

    async fn memberships_for_user(&self, user_id: &str) -> GatekeepResult<Vec<Membership>> {
        let inner = self.inner.read().await;
        Ok(inner
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> GatekeepResult<()> {
        // Memory storage is always healthy
        Ok(())
    }
}
