//! Permission resolver
//!
//! Combines ownership, direct grants, role-derived grants and hierarchical
//! inheritance into one allow/deny verdict under strict tenant isolation.
//!
//! The decision path never surfaces errors: every fault (missing record,
//! store timeout, hierarchy cycle) resolves to deny, and the reason is
//! recorded through the audit sink. Precedence per hop, first match wins:
//! tenant guard (deny), ownership, direct grant, role grant, then the parent
//! resource with the same subject/permission/tenant.

use crate::roles::RoleAggregator;
use gatekeep_core::{
    with_timeout, AuditEvent, AuditSink, Clock, EngineConfig, EntityStore, GatekeepError,
    GatekeepResult, Permission, Resource, SubjectRef,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Outcome of an evaluation before it is audited
#[derive(Debug, Clone)]
pub(crate) struct Decision {
    pub allowed: bool,
    pub reason: String,
}

impl Decision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

pub struct PermissionResolver {
    store: Arc<dyn EntityStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    roles: RoleAggregator,
    config: EngineConfig,
}

impl PermissionResolver {
    pub fn new(
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let roles = RoleAggregator::new(store.clone());
        Self {
            store,
            audit,
            clock,
            roles,
            config,
        }
    }

    async fn timed<T, F>(&self, operation: &str, future: F) -> GatekeepResult<T>
    where
        F: std::future::Future<Output = GatekeepResult<T>>,
    {
        with_timeout(future, self.config.store_timeout_ms, operation).await
    }

    /// The authorization verdict for an authenticated subject.
    ///
    /// Never errors; every call, regardless of outcome, emits one audit
    /// event. Audit emission cannot alter the returned decision.
    pub async fn check_permission(
        &self,
        subject_id: &str,
        resource_id: &str,
        permission_name: &str,
        tenant_id: &str,
    ) -> bool {
        let decision = match self
            .evaluate(subject_id, resource_id, permission_name, tenant_id)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                e.log();
                Decision::deny(e.audit_reason())
            }
        };

        self.audit
            .record(AuditEvent::decision(
                Some(subject_id),
                "check_permission",
                resource_id,
                permission_name,
                tenant_id,
                decision.allowed,
                &decision.reason,
            ))
            .await;

        debug!(
            subject = subject_id,
            resource = resource_id,
            permission = permission_name,
            tenant = tenant_id,
            allowed = decision.allowed,
            reason = %decision.reason,
            "Permission decision"
        );

        decision.allowed
    }

    /// Resolve the permission name against the resource type, falling back
    /// from the type-scoped definition to the global one
    async fn resolve_permission(
        &self,
        permission_name: &str,
        resource_type: &str,
    ) -> GatekeepResult<Option<Permission>> {
        if let Some(scoped) = self
            .timed(
                "find_permission_scoped",
                self.store
                    .find_permission(permission_name, Some(resource_type)),
            )
            .await?
        {
            if scoped.is_active {
                return Ok(Some(scoped));
            }
        }

        Ok(self
            .timed(
                "find_permission_global",
                self.store.find_permission(permission_name, None),
            )
            .await?
            .filter(|p| p.is_active))
    }

    pub(crate) async fn evaluate(
        &self,
        subject_id: &str,
        resource_id: &str,
        permission_name: &str,
        tenant_id: &str,
    ) -> GatekeepResult<Decision> {
        let now = self.clock.now();

        let Some(resource) = self
            .timed("load_resource", self.store.load_resource(resource_id))
            .await?
        else {
            return Ok(Decision::deny("resource_not_found"));
        };

        let Some(permission) = self
            .resolve_permission(permission_name, &resource.resource_type)
            .await?
        else {
            return Ok(Decision::deny("permission_not_found"));
        };

        let mut visited: HashSet<String> = HashSet::new();
        let mut current = resource;
        let mut depth = 0usize;

        loop {
            if !visited.insert(current.id.clone()) {
                // The stored model does not guarantee acyclicity; stop
                // instead of looping unboundedly.
                return Err(GatekeepError::cycle_detected(&current.id, "resolver"));
            }
            if depth >= self.config.max_hierarchy_depth {
                return Ok(Decision::deny("max_depth_exceeded"));
            }

            // Tenant guard beats every other rule, on every hop
            if current.tenant_id != tenant_id {
                return Ok(Decision::deny("tenant_mismatch"));
            }
            if !current.is_active {
                return Ok(Decision::deny("resource_inactive"));
            }

            if current.owner_id == subject_id {
                return Ok(Decision::allow(if depth == 0 {
                    "owner".to_string()
                } else {
                    format!("inherited_owner:{}", current.id)
                }));
            }

            if self
                .has_valid_grant(&SubjectRef::user(subject_id), &current.id, &permission.id, now)
                .await?
            {
                return Ok(Decision::allow(if depth == 0 {
                    "direct_grant".to_string()
                } else {
                    format!("inherited_grant:{}", current.id)
                }));
            }

            let roles = self
                .timed(
                    "roles_for_subject",
                    self.roles.roles_for_subject(subject_id, tenant_id, now),
                )
                .await?;
            for role in &roles {
                if role.permission_ids.contains(&permission.id) {
                    return Ok(Decision::allow(format!("role_grant:{}", role.name)));
                }
                if self
                    .has_valid_grant(&SubjectRef::role(&role.id), &current.id, &permission.id, now)
                    .await?
                {
                    return Ok(Decision::allow(format!(
                        "role_addressed_grant:{}",
                        role.name
                    )));
                }
            }

            let Some(parent_id) = current.parent_id.clone() else {
                return Ok(Decision::deny("no_matching_grant"));
            };

            let Some(parent) = self
                .timed("load_parent", self.store.load_resource(&parent_id))
                .await?
            else {
                // Dangling parent pointer ends the chain; fail closed
                return Ok(Decision::deny("parent_not_found"));
            };

            current = parent;
            depth += 1;
        }
    }

    async fn has_valid_grant(
        &self,
        subject: &SubjectRef,
        resource_id: &str,
        permission_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> GatekeepResult<bool> {
        let grants = self
            .timed(
                "grants_for_subject",
                self.store.grants_for_subject(subject, resource_id),
            )
            .await?;

        Ok(grants
            .iter()
            .any(|g| g.permission_id == permission_id && g.is_valid_at(now)))
    }

    /// Enumerate the tenant's resources the subject can reach with the given
    /// permission (defaults to the read permission). Each candidate goes
    /// through the full evaluation, so inheritance and roles apply; the
    /// listing emits a single audit event rather than one per candidate.
    pub async fn accessible_resources(
        &self,
        subject_id: &str,
        tenant_id: &str,
        resource_type: Option<&str>,
        permission_name: Option<&str>,
    ) -> GatekeepResult<Vec<Resource>> {
        let permission_name = permission_name.unwrap_or("read");
        let candidates = self
            .timed(
                "list_resources",
                self.store.list_resources(tenant_id, resource_type),
            )
            .await?;

        let mut accessible = Vec::new();
        for resource in candidates {
            let decision = self
                .evaluate(subject_id, &resource.id, permission_name, tenant_id)
                .await;
            match decision {
                Ok(decision) if decision.allowed => accessible.push(resource),
                Ok(_) => {}
                Err(e) => {
                    // One bad record must not hide the rest of the listing
                    e.log();
                }
            }
        }

        self.audit
            .record(
                AuditEvent::mutation(
                    subject_id,
                    "list_accessible_resources",
                    "*",
                    tenant_id,
                    true,
                    None,
                )
                .with_permission(permission_name)
                .with_metadata("count", &accessible.len().to_string()),
            )
            .await;

        Ok(accessible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::FixedClock;
    use crate::store::MemoryEntityStore;
    use chrono::{Duration, Utc};
    use gatekeep_core::{Grant, GrantType, Membership, MembershipType, Resource, Role, RoleScope};

    struct Fixture {
        store: Arc<MemoryEntityStore>,
        audit: Arc<MemoryAuditSink>,
        clock: Arc<FixedClock>,
        resolver: PermissionResolver,
        read: Permission,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryEntityStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(FixedClock::at_epoch());
        let resolver = PermissionResolver::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            EngineConfig::default(),
        );

        let read = Permission::new("read", None, true);
        store.save_permission(&read).await.unwrap();

        Fixture {
            store,
            audit,
            clock,
            resolver,
            read,
        }
    }

    async fn save_doc(f: &Fixture, name: &str, owner: &str, tenant: &str) -> Resource {
        let resource = Resource::new(name, "document", owner, tenant);
        f.store.save_resource(&resource).await.unwrap();
        resource
    }

    #[tokio::test]
    async fn owner_is_always_allowed() {
        let f = fixture().await;
        let doc = save_doc(&f, "doc-1", "alice", "t1").await;

        assert!(f.resolver.check_permission("alice", &doc.id, "read", "t1").await);
    }

    #[tokio::test]
    async fn tenant_guard_beats_ownership() {
        let f = fixture().await;
        let doc = save_doc(&f, "doc-1", "alice", "t1").await;

        assert!(!f.resolver.check_permission("alice", &doc.id, "read", "t2").await);
    }

    #[tokio::test]
    async fn direct_grant_allows_and_expiry_is_lazy() {
        let f = fixture().await;
        let doc = save_doc(&f, "doc-1", "alice", "t1").await;
        let now = f.clock.now();

        let grant = Grant::new(
            &doc.id,
            SubjectRef::user("bob"),
            &f.read.id,
            GrantType::Direct,
            "alice",
            "t1",
            Some(now + Duration::hours(1)),
        );
        f.store.insert_grant_if_absent(&grant, now).await.unwrap();

        assert!(f.resolver.check_permission("bob", &doc.id, "read", "t1").await);

        // Past expiry the grant stays is_active but stops matching
        f.clock.advance(Duration::hours(2));
        assert!(!f.resolver.check_permission("bob", &doc.id, "read", "t1").await);
    }

    #[tokio::test]
    async fn role_grant_allows_within_tenant() {
        let f = fixture().await;
        let doc = save_doc(&f, "doc-1", "alice", "t1").await;

        let role = Role::new("reader", Some("t1"), RoleScope::Tenant)
            .with_permissions([f.read.id.clone()]);
        f.store.save_role(&role).await.unwrap();
        f.store
            .save_membership(
                &Membership::new("carol", "org-1", MembershipType::Member).with_role(&role.id),
            )
            .await
            .unwrap();

        assert!(f.resolver.check_permission("carol", &doc.id, "read", "t1").await);
        assert!(!f.resolver.check_permission("dave", &doc.id, "read", "t1").await);
    }

    #[tokio::test]
    async fn inheritance_follows_parent_chain() {
        let f = fixture().await;
        let folder = save_doc(&f, "folder-1", "alice", "t1").await;
        let doc = {
            let r = Resource::new("doc-2", "document", "alice", "t1").with_parent(&folder.id);
            f.store.save_resource(&r).await.unwrap();
            r
        };
        let now = f.clock.now();

        let grant = Grant::new(
            &folder.id,
            SubjectRef::user("carol"),
            &f.read.id,
            GrantType::Direct,
            "alice",
            "t1",
            None,
        );
        f.store.insert_grant_if_absent(&grant, now).await.unwrap();

        assert!(f.resolver.check_permission("carol", &doc.id, "read", "t1").await);
    }

    #[tokio::test]
    async fn cycle_in_stored_hierarchy_denies_without_hanging() {
        let f = fixture().await;
        let mut a = Resource::new("a", "document", "alice", "t1");
        let mut b = Resource::new("b", "document", "alice", "t1");
        a.parent_id = Some(b.id.clone());
        b.parent_id = Some(a.id.clone());
        f.store.save_resource(&a).await.unwrap();
        f.store.save_resource(&b).await.unwrap();

        // "mallory" matches no rule on either hop, so evaluation walks the
        // cycle and must stop with a deny
        assert!(!f.resolver.check_permission("mallory", &a.id, "read", "t1").await);

        let events = f.audit.events().await;
        assert_eq!(events.last().unwrap().reason.as_deref(), Some("cycle_detected"));
    }

    #[tokio::test]
    async fn missing_records_deny_instead_of_erroring() {
        let f = fixture().await;
        let doc = save_doc(&f, "doc-1", "alice", "t1").await;

        assert!(!f.resolver.check_permission("alice", "nope", "read", "t1").await);
        assert!(!f.resolver.check_permission("alice", &doc.id, "nope", "t1").await);
    }

    #[tokio::test]
    async fn every_decision_is_audited() {
        let f = fixture().await;
        let doc = save_doc(&f, "doc-1", "alice", "t1").await;

        f.resolver.check_permission("alice", &doc.id, "read", "t1").await;
        f.resolver.check_permission("bob", &doc.id, "read", "t1").await;

        let events = f.audit.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason.as_deref(), Some("owner"));
        assert_eq!(events[1].reason.as_deref(), Some("no_matching_grant"));
    }

    #[tokio::test]
    async fn accessible_resources_filters_by_reachability() {
        let f = fixture().await;
        let mine = save_doc(&f, "mine", "bob", "t1").await;
        let _others = save_doc(&f, "others", "alice", "t1").await;
        let now = f.clock.now();

        let shared = save_doc(&f, "shared", "alice", "t1").await;
        let grant = Grant::new(
            &shared.id,
            SubjectRef::user("bob"),
            &f.read.id,
            GrantType::Direct,
            "alice",
            "t1",
            None,
        );
        f.store.insert_grant_if_absent(&grant, now).await.unwrap();

        let mut ids: Vec<String> = f
            .resolver
            .accessible_resources("bob", "t1", None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        let mut expected = vec![mine.id, shared.id];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
