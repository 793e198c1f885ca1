//! Public and anonymous access
//!
//! Publishing puts a resource behind a strict allow-list of permission names
//! and mints a shareable link token. Anonymous checks consult only the
//! allow-list: ownership, grants, roles, and parent inheritance never apply
//! to an anonymous caller.

use chrono::{DateTime, Utc};
use gatekeep_core::{
    with_timeout, AuditEvent, AuditSink, Clock, EngineConfig, EntityStore, GatekeepError,
    GatekeepResult, Resource,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct PublicAccessManager {
    store: Arc<dyn EntityStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl PublicAccessManager {
    pub fn new(
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            config,
        }
    }

    async fn timed<T, F>(&self, operation: &str, future: F) -> GatekeepResult<T>
    where
        F: std::future::Future<Output = GatekeepResult<T>>,
    {
        with_timeout(future, self.config.store_timeout_ms, operation).await
    }

    async fn load_tenant_resource(
        &self,
        resource_id: &str,
        tenant_id: &str,
    ) -> GatekeepResult<Resource> {
        let resource = self
            .store
            .load_resource(resource_id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Resource", resource_id, "public_access"))?;

        if resource.tenant_id != tenant_id {
            return Err(GatekeepError::tenant_mismatch(
                resource_id,
                tenant_id,
                "public_access",
            ));
        }
        Ok(resource)
    }

    async fn audit_mutation(
        &self,
        actor: &str,
        action: &str,
        resource_id: &str,
        tenant_id: &str,
        succeeded: bool,
        reason: Option<&str>,
    ) {
        self.audit
            .record(AuditEvent::mutation(
                actor,
                action,
                resource_id,
                tenant_id,
                succeeded,
                reason,
            ))
            .await;
    }

    /// Mark the resource public with the given anonymous allow-list and
    /// return its link token. A token is minted on first publish and kept
    /// stable on republish, so existing links keep working when the
    /// allow-list changes.
    pub async fn publish(
        &self,
        resource_id: &str,
        permissions: &[&str],
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<String> {
        if permissions.is_empty() {
            self.audit_mutation(actor, "publish", resource_id, tenant_id, false, Some("validation_failed"))
                .await;
            return Err(GatekeepError::validation(
                "Publishing requires at least one allowed permission",
                Some("permissions"),
                "public_access",
            ));
        }

        let mut resource = match self.load_tenant_resource(resource_id, tenant_id).await {
            Ok(resource) => resource,
            Err(e) => {
                self.audit_mutation(
                    actor,
                    "publish",
                    resource_id,
                    tenant_id,
                    false,
                    Some(e.audit_reason()),
                )
                .await;
                return Err(e);
            }
        };

        resource.is_public = true;
        resource.public_permissions = permissions.iter().map(|p| p.to_string()).collect();
        let token = match &resource.public_link_token {
            Some(token) => token.clone(),
            None => {
                let token = Uuid::new_v4().to_string();
                resource.public_link_token = Some(token.clone());
                token
            }
        };
        resource.updated_at = self.clock.now();
        self.store.save_resource(&resource).await?;

        self.audit
            .record(
                AuditEvent::mutation(actor, "publish", resource_id, tenant_id, true, None)
                    .with_metadata("permissions", &permissions.join(",")),
            )
            .await;
        info!(
            resource = resource_id,
            permissions = %permissions.join(","),
            "Published resource"
        );
        Ok(token)
    }

    /// Withdraw public access: flag, allow-list, token, and expiry are
    /// cleared in one write so no intermediate state is observable.
    pub async fn unpublish(
        &self,
        resource_id: &str,
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<()> {
        let mut resource = match self.load_tenant_resource(resource_id, tenant_id).await {
            Ok(resource) => resource,
            Err(e) => {
                self.audit_mutation(
                    actor,
                    "unpublish",
                    resource_id,
                    tenant_id,
                    false,
                    Some(e.audit_reason()),
                )
                .await;
                return Err(e);
            }
        };

        resource.is_public = false;
        resource.public_permissions = HashSet::new();
        resource.public_link_token = None;
        resource.public_link_expires_at = None;
        resource.updated_at = self.clock.now();
        self.store.save_resource(&resource).await?;

        self.audit_mutation(actor, "unpublish", resource_id, tenant_id, true, None)
            .await;
        info!(resource = resource_id, "Unpublished resource");
        Ok(())
    }

    /// Set or clear the expiry instant on the resource's public link.
    /// Expiry is enforced lazily at check time.
    pub async fn set_link_expiry(
        &self,
        resource_id: &str,
        expires_at: Option<DateTime<Utc>>,
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<()> {
        let mut resource = self.load_tenant_resource(resource_id, tenant_id).await?;
        if resource.public_link_token.is_none() {
            return Err(GatekeepError::validation(
                "Resource has no public link",
                Some("resource_id"),
                "public_access",
            ));
        }

        resource.public_link_expires_at = expires_at;
        resource.updated_at = self.clock.now();
        self.store.save_resource(&resource).await?;

        self.audit
            .record(
                AuditEvent::mutation(actor, "set_link_expiry", resource_id, tenant_id, true, None)
                    .with_metadata(
                        "expires_at",
                        &expires_at.map_or("none".to_string(), |e| e.to_rfc3339()),
                    ),
            )
            .await;
        Ok(())
    }

    /// Replace the link token, invalidating every previously shared link
    /// while the resource stays public.
    pub async fn rotate_link(
        &self,
        resource_id: &str,
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<String> {
        let mut resource = self.load_tenant_resource(resource_id, tenant_id).await?;
        if resource.public_link_token.is_none() {
            return Err(GatekeepError::validation(
                "Resource has no public link",
                Some("resource_id"),
                "public_access",
            ));
        }

        let token = Uuid::new_v4().to_string();
        resource.public_link_token = Some(token.clone());
        resource.updated_at = self.clock.now();
        self.store.save_resource(&resource).await?;

        self.audit_mutation(actor, "rotate_link", resource_id, tenant_id, true, None)
            .await;
        info!(resource = resource_id, "Rotated public link token");
        Ok(token)
    }

    /// Anonymous decision against the public allow-list. Never errors:
    /// any fault (missing record, hung store) denies, with the reason
    /// audited. Ownership, grants, roles, and hierarchy are deliberately
    /// out of scope here.
    pub async fn check_anonymous(
        &self,
        resource_id: &str,
        permission_name: &str,
        tenant_id: &str,
    ) -> bool {
        let (allowed, reason) = match self.evaluate_anonymous(resource_id, permission_name, tenant_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                e.log();
                (false, e.audit_reason())
            }
        };

        self.audit
            .record(AuditEvent::decision(
                None,
                "check_anonymous",
                resource_id,
                permission_name,
                tenant_id,
                allowed,
                reason,
            ))
            .await;
        debug!(
            resource = resource_id,
            permission = permission_name,
            allowed,
            reason,
            "Anonymous access decision"
        );
        allowed
    }

    async fn evaluate_anonymous(
        &self,
        resource_id: &str,
        permission_name: &str,
        tenant_id: &str,
    ) -> GatekeepResult<(bool, &'static str)> {
        let Some(resource) = self
            .timed("load_resource", self.store.load_resource(resource_id))
            .await?
        else {
            return Ok((false, "resource_not_found"));
        };
        if resource.tenant_id != tenant_id {
            return Ok((false, "tenant_mismatch"));
        }
        if !resource.is_active {
            return Ok((false, "resource_inactive"));
        }
        if !resource.is_public {
            return Ok((false, "not_public"));
        }
        if resource.public_permissions.contains(permission_name) {
            Ok((true, "public_allow_list"))
        } else {
            Ok((false, "not_in_allow_list"))
        }
    }

    /// Resolve a link token to an anonymous decision. `Some` only when the
    /// token is live (present and unexpired) and the requested permission
    /// is on the allow-list. Like `check_anonymous`, this never errors:
    /// faults deny, and every call is audited.
    pub async fn validate_link(&self, token: &str, permission_name: &str) -> Option<Resource> {
        let (resource, allowed, reason) = match self.evaluate_link(token, permission_name).await {
            Ok(outcome) => outcome,
            Err(e) => {
                e.log();
                (None, false, e.audit_reason())
            }
        };

        self.audit
            .record(AuditEvent::decision(
                None,
                "validate_link",
                resource.as_ref().map(|r| r.id.as_str()).unwrap_or("*"),
                permission_name,
                resource.as_ref().map(|r| r.tenant_id.as_str()).unwrap_or("*"),
                allowed,
                reason,
            ))
            .await;
        debug!(permission = permission_name, allowed, reason, "Public link decision");

        if allowed {
            resource
        } else {
            None
        }
    }

    async fn evaluate_link(
        &self,
        token: &str,
        permission_name: &str,
    ) -> GatekeepResult<(Option<Resource>, bool, &'static str)> {
        let Some(resource) = self
            .timed(
                "load_resource_by_token",
                self.store.load_resource_by_token(token),
            )
            .await?
        else {
            return Ok((None, false, "token_not_found"));
        };

        let now = self.clock.now();
        let allowed = resource.is_active
            && resource.is_public
            && resource.link_valid_at(now)
            && resource.public_permissions.contains(permission_name);
        let reason = if allowed { "public_link" } else { "link_invalid" };
        Ok((Some(resource), allowed, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::FixedClock;
    use crate::store::MemoryEntityStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use gatekeep_core::{AuditOutcome, Grant, Membership, Permission, Role, SubjectRef};

    struct Fixture {
        store: Arc<MemoryEntityStore>,
        audit: Arc<MemoryAuditSink>,
        clock: Arc<FixedClock>,
        manager: PublicAccessManager,
        doc: Resource,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryEntityStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(FixedClock::at_epoch());
        let manager = PublicAccessManager::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            EngineConfig::default(),
        );

        let doc = Resource::new("doc-1", "document", "alice", "t1");
        store.save_resource(&doc).await.unwrap();

        Fixture {
            store,
            audit,
            clock,
            manager,
            doc,
        }
    }

    /// Store wrapper that injects faults into the token lookup and resource
    /// load paths while delegating everything else.
    struct FaultStore {
        inner: MemoryEntityStore,
        fail_token_lookup: bool,
        hang_loads: bool,
    }

    #[async_trait]
    impl EntityStore for FaultStore {
        async fn save_resource(&self, resource: &Resource) -> GatekeepResult<()> {
            self.inner.save_resource(resource).await
        }

        async fn load_resource(&self, id: &str) -> GatekeepResult<Option<Resource>> {
            if self.hang_loads {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
            self.inner.load_resource(id).await
        }

        async fn load_resource_by_token(&self, token: &str) -> GatekeepResult<Option<Resource>> {
            if self.fail_token_lookup {
                return Err(GatekeepError::internal(
                    "token index unavailable",
                    "test_store",
                ));
            }
            if self.hang_loads {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
            self.inner.load_resource_by_token(token).await
        }

        async fn list_resources(
            &self,
            tenant_id: &str,
            resource_type: Option<&str>,
        ) -> GatekeepResult<Vec<Resource>> {
            self.inner.list_resources(tenant_id, resource_type).await
        }

        async fn list_children(&self, resource_id: &str) -> GatekeepResult<Vec<Resource>> {
            self.inner.list_children(resource_id).await
        }

        async fn save_permission(&self, permission: &Permission) -> GatekeepResult<()> {
            self.inner.save_permission(permission).await
        }

        async fn load_permission(&self, id: &str) -> GatekeepResult<Option<Permission>> {
            self.inner.load_permission(id).await
        }

        async fn find_permission(
            &self,
            name: &str,
            resource_type: Option<&str>,
        ) -> GatekeepResult<Option<Permission>> {
            self.inner.find_permission(name, resource_type).await
        }

        async fn save_role(&self, role: &Role) -> GatekeepResult<()> {
            self.inner.save_role(role).await
        }

        async fn load_role(&self, id: &str) -> GatekeepResult<Option<Role>> {
            self.inner.load_role(id).await
        }

        async fn find_role(
            &self,
            name: &str,
            tenant_id: Option<&str>,
        ) -> GatekeepResult<Option<Role>> {
            self.inner.find_role(name, tenant_id).await
        }

        async fn insert_grant_if_absent(
            &self,
            grant: &Grant,
            now: DateTime<Utc>,
        ) -> GatekeepResult<Grant> {
            self.inner.insert_grant_if_absent(grant, now).await
        }

        async fn update_grant(&self, grant: &Grant) -> GatekeepResult<()> {
            self.inner.update_grant(grant).await
        }

        async fn grants_for_subject(
            &self,
            subject: &SubjectRef,
            resource_id: &str,
        ) -> GatekeepResult<Vec<Grant>> {
            self.inner.grants_for_subject(subject, resource_id).await
        }

        async fn grants_for_user(
            &self,
            user_id: &str,
            tenant_id: &str,
        ) -> GatekeepResult<Vec<Grant>> {
            self.inner.grants_for_user(user_id, tenant_id).await
        }

        async fn save_membership(&self, membership: &Membership) -> GatekeepResult<()> {
            self.inner.save_membership(membership).await
        }

        async fn memberships_for_user(&self, user_id: &str) -> GatekeepResult<Vec<Membership>> {
            self.inner.memberships_for_user(user_id).await
        }

        async fn health_check(&self) -> GatekeepResult<()> {
            self.inner.health_check().await
        }
    }

    #[tokio::test]
    async fn anonymous_access_follows_allow_list() {
        let f = fixture().await;
        f.manager
            .publish(&f.doc.id, &["read"], "alice", "t1")
            .await
            .unwrap();

        assert!(f.manager.check_anonymous(&f.doc.id, "read", "t1").await);
        assert!(!f.manager.check_anonymous(&f.doc.id, "write", "t1").await);
        // Anonymous checks are tenant-guarded like everything else
        assert!(!f.manager.check_anonymous(&f.doc.id, "read", "t2").await);
    }

    #[tokio::test]
    async fn unpublish_clears_everything_at_once() {
        let f = fixture().await;
        let token = f
            .manager
            .publish(&f.doc.id, &["read"], "alice", "t1")
            .await
            .unwrap();

        f.manager.unpublish(&f.doc.id, "alice", "t1").await.unwrap();

        assert!(!f.manager.check_anonymous(&f.doc.id, "read", "t1").await);
        assert!(f.manager.validate_link(&token, "read").await.is_none());

        let stored = f.store.load_resource(&f.doc.id).await.unwrap().unwrap();
        assert!(!stored.is_public);
        assert!(stored.public_permissions.is_empty());
        assert!(stored.public_link_token.is_none());
        assert!(stored.public_link_expires_at.is_none());
    }

    #[tokio::test]
    async fn republish_keeps_the_token_stable() {
        let f = fixture().await;
        let first = f
            .manager
            .publish(&f.doc.id, &["read"], "alice", "t1")
            .await
            .unwrap();
        let second = f
            .manager
            .publish(&f.doc.id, &["read", "write"], "alice", "t1")
            .await
            .unwrap();
        assert_eq!(first, second);

        let rotated = f.manager.rotate_link(&f.doc.id, "alice", "t1").await.unwrap();
        assert_ne!(rotated, first);
        assert!(f.manager.validate_link(&first, "read").await.is_none());
        assert!(f.manager.validate_link(&rotated, "read").await.is_some());
    }

    #[tokio::test]
    async fn link_expiry_is_enforced_lazily() {
        let f = fixture().await;
        let token = f
            .manager
            .publish(&f.doc.id, &["read"], "alice", "t1")
            .await
            .unwrap();
        f.manager
            .set_link_expiry(&f.doc.id, Some(f.clock.now() + Duration::hours(1)), "alice", "t1")
            .await
            .unwrap();

        assert!(f.manager.validate_link(&token, "read").await.is_some());

        f.clock.advance(Duration::hours(2));
        assert!(f.manager.validate_link(&token, "read").await.is_none());
        // The allow-list check without a link is unaffected by link expiry
        assert!(f.manager.check_anonymous(&f.doc.id, "read", "t1").await);
    }

    #[tokio::test]
    async fn publish_requires_permissions_and_matching_tenant() {
        let f = fixture().await;

        assert!(matches!(
            f.manager.publish(&f.doc.id, &[], "alice", "t1").await,
            Err(GatekeepError::Validation { .. })
        ));
        assert!(matches!(
            f.manager.publish(&f.doc.id, &["read"], "alice", "t2").await,
            Err(GatekeepError::TenantMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn anonymous_decisions_are_audited_without_an_actor() {
        let f = fixture().await;
        f.manager
            .publish(&f.doc.id, &["read"], "alice", "t1")
            .await
            .unwrap();
        f.audit.clear().await;

        f.manager.check_anonymous(&f.doc.id, "read", "t1").await;
        f.manager.check_anonymous(&f.doc.id, "write", "t1").await;

        let events = f.audit.events().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.actor.is_none()));
        assert_eq!(events[0].outcome, AuditOutcome::Allowed);
        assert_eq!(events[0].reason.as_deref(), Some("public_allow_list"));
        assert_eq!(events[1].outcome, AuditOutcome::Denied);
        assert_eq!(events[1].reason.as_deref(), Some("not_in_allow_list"));
    }

    #[tokio::test]
    async fn unknown_token_denies_and_is_audited() {
        let f = fixture().await;

        assert!(f.manager.validate_link("no-such-token", "read").await.is_none());

        let events = f.audit.events().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].actor.is_none());
        assert_eq!(events[0].outcome, AuditOutcome::Denied);
        assert_eq!(events[0].reason.as_deref(), Some("token_not_found"));
    }

    #[tokio::test]
    async fn store_fault_on_token_lookup_fails_closed() {
        let store = Arc::new(FaultStore {
            inner: MemoryEntityStore::new(),
            fail_token_lookup: true,
            hang_loads: false,
        });
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = PublicAccessManager::new(
            store,
            audit.clone(),
            Arc::new(FixedClock::at_epoch()),
            EngineConfig::default(),
        );

        // The fault must deny, not surface to the caller
        assert!(manager.validate_link("tok-1", "read").await.is_none());

        let events = audit.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Denied);
        assert_eq!(events[0].reason.as_deref(), Some("internal_error"));
    }

    #[tokio::test]
    async fn hung_store_times_out_and_denies() {
        let inner = MemoryEntityStore::new();
        let mut doc = Resource::new("doc-1", "document", "alice", "t1");
        doc.is_public = true;
        doc.public_permissions.insert("read".to_string());
        doc.public_link_token = Some("tok-1".to_string());
        inner.save_resource(&doc).await.unwrap();

        let store = Arc::new(FaultStore {
            inner,
            fail_token_lookup: false,
            hang_loads: true,
        });
        let audit = Arc::new(MemoryAuditSink::new());
        let config = EngineConfig {
            store_timeout_ms: 20,
            ..Default::default()
        };
        let manager = PublicAccessManager::new(
            store,
            audit.clone(),
            Arc::new(FixedClock::at_epoch()),
            config,
        );

        // Both anonymous paths would allow against a healthy store; the
        // hung backend must resolve to deny within the bound instead.
        assert!(!manager.check_anonymous(&doc.id, "read", "t1").await);
        assert!(manager.validate_link("tok-1", "read").await.is_none());

        let events = audit.events().await;
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.reason.as_deref() == Some("store_timeout")));
    }
}
