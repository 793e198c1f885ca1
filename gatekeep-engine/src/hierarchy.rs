//! Resource hierarchy
//!
//! Parent-chain management and resolution. The store does not guarantee
//! acyclicity, so mutation rejects cycle-forming assignments AND every
//! traversal carries a visited set with a depth bound.

use crate::resolver::PermissionResolver;
use gatekeep_core::{
    AuditEvent, AuditSink, Clock, EngineConfig, EntityStore, GatekeepError, GatekeepResult,
    Resource,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub struct ResourceHierarchy {
    store: Arc<dyn EntityStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    resolver: Arc<PermissionResolver>,
    config: EngineConfig,
}

impl ResourceHierarchy {
    pub fn new(
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        resolver: Arc<PermissionResolver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
            resolver,
            config,
        }
    }

    async fn audit_rejection(&self, actor: &str, resource_id: &str, tenant_id: &str, reason: &str) {
        self.audit
            .record(AuditEvent::mutation(
                actor,
                "set_parent",
                resource_id,
                tenant_id,
                false,
                Some(reason),
            ))
            .await;
    }

    /// Attach the resource under a new parent, or detach it to top level
    /// with `None`. Only the owner or a holder of the administrative
    /// permission on the resource may re-parent it.
    pub async fn set_parent(
        &self,
        resource_id: &str,
        parent_id: Option<&str>,
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<()> {
        let mut resource = self
            .store
            .load_resource(resource_id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Resource", resource_id, "hierarchy"))?;

        if resource.tenant_id != tenant_id {
            self.audit_rejection(actor, resource_id, tenant_id, "tenant_mismatch")
                .await;
            return Err(GatekeepError::tenant_mismatch(
                resource_id,
                tenant_id,
                "hierarchy",
            ));
        }

        // Internal authorization check: evaluated, not audited as a
        // decision; the mutation outcome below is what gets audited.
        let authorized = resource.owner_id == actor
            || match self
                .resolver
                .evaluate(actor, resource_id, &self.config.admin_permission, tenant_id)
                .await
            {
                Ok(decision) => decision.allowed,
                Err(e) => {
                    e.log();
                    false
                }
            };
        if !authorized {
            self.audit_rejection(actor, resource_id, tenant_id, "permission_denied")
                .await;
            return Err(GatekeepError::permission_denied(
                resource_id,
                "Only the owner or an administrator may change the parent",
                "hierarchy",
            ));
        }

        if let Some(parent_id) = parent_id {
            if parent_id == resource_id {
                self.audit_rejection(actor, resource_id, tenant_id, "cycle_detected")
                    .await;
                return Err(GatekeepError::cycle_detected(resource_id, "hierarchy"));
            }

            let parent = self
                .store
                .load_resource(parent_id)
                .await?
                .ok_or_else(|| GatekeepError::not_found("Resource", parent_id, "hierarchy"))?;

            if parent.tenant_id != tenant_id {
                self.audit_rejection(actor, resource_id, tenant_id, "tenant_mismatch")
                    .await;
                return Err(GatekeepError::tenant_mismatch(
                    parent_id, tenant_id, "hierarchy",
                ));
            }

            // The candidate parent must not be a descendant of the resource:
            // if the resource sits anywhere on the candidate's ancestor
            // chain, the assignment would close a loop.
            let ancestors = self.resolve_chain(parent_id).await?;
            if ancestors.iter().any(|a| a.id == resource_id) {
                self.audit_rejection(actor, resource_id, tenant_id, "cycle_detected")
                    .await;
                return Err(GatekeepError::cycle_detected(resource_id, "hierarchy"));
            }
        }

        resource.parent_id = parent_id.map(|p| p.to_string());
        resource.updated_at = self.clock.now();
        self.store.save_resource(&resource).await?;

        self.audit
            .record(
                AuditEvent::mutation(actor, "set_parent", resource_id, tenant_id, true, None)
                    .with_metadata("parent", parent_id.unwrap_or("none")),
            )
            .await;
        info!(
            resource = resource_id,
            parent = parent_id.unwrap_or("none"),
            "Re-parented resource"
        );
        Ok(())
    }

    pub async fn get_children(&self, resource_id: &str) -> GatekeepResult<Vec<Resource>> {
        self.store
            .load_resource(resource_id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Resource", resource_id, "hierarchy"))?;

        self.store.list_children(resource_id).await
    }

    /// Ordered ancestor list, nearest parent first. A dangling parent
    /// pointer ends the chain; a revisited id is a cycle and errors.
    pub async fn resolve_chain(&self, resource_id: &str) -> GatekeepResult<Vec<Resource>> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(resource_id.to_string());

        let mut chain = Vec::new();
        let mut cursor = self
            .store
            .load_resource(resource_id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Resource", resource_id, "hierarchy"))?
            .parent_id;

        while let Some(parent_id) = cursor {
            if !visited.insert(parent_id.clone()) {
                return Err(GatekeepError::cycle_detected(&parent_id, "hierarchy"));
            }
            if chain.len() >= self.config.max_hierarchy_depth {
                return Err(GatekeepError::cycle_detected(&parent_id, "hierarchy"));
            }

            let Some(parent) = self.store.load_resource(&parent_id).await? else {
                break;
            };
            cursor = parent.parent_id.clone();
            chain.push(parent);
        }

        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::SystemClock;
    use crate::store::MemoryEntityStore;

    struct Fixture {
        store: Arc<MemoryEntityStore>,
        audit: Arc<MemoryAuditSink>,
        hierarchy: ResourceHierarchy,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryEntityStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(SystemClock);
        let config = EngineConfig::default();
        let resolver = Arc::new(PermissionResolver::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            config.clone(),
        ));
        let hierarchy =
            ResourceHierarchy::new(store.clone(), audit.clone(), clock, resolver, config);
        Fixture {
            store,
            audit,
            hierarchy,
        }
    }

    async fn save_doc(f: &Fixture, name: &str, owner: &str, tenant: &str) -> Resource {
        let resource = Resource::new(name, "document", owner, tenant);
        f.store.save_resource(&resource).await.unwrap();
        resource
    }

    #[tokio::test]
    async fn owner_can_attach_and_detach() {
        let f = fixture().await;
        let folder = save_doc(&f, "folder", "alice", "t1").await;
        let doc = save_doc(&f, "doc", "alice", "t1").await;

        f.hierarchy
            .set_parent(&doc.id, Some(&folder.id), "alice", "t1")
            .await
            .unwrap();

        let children = f.hierarchy.get_children(&folder.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, doc.id);

        f.hierarchy
            .set_parent(&doc.id, None, "alice", "t1")
            .await
            .unwrap();
        assert!(f.hierarchy.get_children(&folder.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_owner_without_admin_is_rejected() {
        let f = fixture().await;
        let folder = save_doc(&f, "folder", "alice", "t1").await;
        let doc = save_doc(&f, "doc", "alice", "t1").await;

        let result = f
            .hierarchy
            .set_parent(&doc.id, Some(&folder.id), "mallory", "t1")
            .await;
        assert!(matches!(result, Err(GatekeepError::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn admin_checks_emit_no_decision_events() {
        let f = fixture().await;
        let folder = save_doc(&f, "folder", "alice", "t1").await;
        let doc = save_doc(&f, "doc", "alice", "t1").await;

        // Non-owner attempt exercises the administrative check, owner
        // attempt skips it; neither may leave a decision event behind.
        let _ = f
            .hierarchy
            .set_parent(&doc.id, Some(&folder.id), "mallory", "t1")
            .await;
        f.hierarchy
            .set_parent(&doc.id, Some(&folder.id), "alice", "t1")
            .await
            .unwrap();

        let events = f.audit.events().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.action == "set_parent"));
    }

    #[tokio::test]
    async fn self_parent_is_a_cycle() {
        let f = fixture().await;
        let doc = save_doc(&f, "doc", "alice", "t1").await;

        let result = f
            .hierarchy
            .set_parent(&doc.id, Some(&doc.id), "alice", "t1")
            .await;
        assert!(matches!(result, Err(GatekeepError::CycleDetected { .. })));
    }

    #[tokio::test]
    async fn descendant_parent_is_a_cycle() {
        let f = fixture().await;
        let a = save_doc(&f, "a", "alice", "t1").await;
        let b = save_doc(&f, "b", "alice", "t1").await;
        let c = save_doc(&f, "c", "alice", "t1").await;

        f.hierarchy.set_parent(&b.id, Some(&a.id), "alice", "t1").await.unwrap();
        f.hierarchy.set_parent(&c.id, Some(&b.id), "alice", "t1").await.unwrap();

        // a -> b -> c exists; attaching a under c would close the loop
        let result = f.hierarchy.set_parent(&a.id, Some(&c.id), "alice", "t1").await;
        assert!(matches!(result, Err(GatekeepError::CycleDetected { .. })));
    }

    #[tokio::test]
    async fn cross_tenant_parent_is_rejected() {
        let f = fixture().await;
        let folder = save_doc(&f, "folder", "alice", "t2").await;
        let doc = save_doc(&f, "doc", "alice", "t1").await;

        let result = f
            .hierarchy
            .set_parent(&doc.id, Some(&folder.id), "alice", "t1")
            .await;
        assert!(matches!(result, Err(GatekeepError::TenantMismatch { .. })));
    }

    #[tokio::test]
    async fn resolve_chain_orders_ancestors_nearest_first() {
        let f = fixture().await;
        let a = save_doc(&f, "a", "alice", "t1").await;
        let b = save_doc(&f, "b", "alice", "t1").await;
        let c = save_doc(&f, "c", "alice", "t1").await;

        f.hierarchy.set_parent(&b.id, Some(&a.id), "alice", "t1").await.unwrap();
        f.hierarchy.set_parent(&c.id, Some(&b.id), "alice", "t1").await.unwrap();

        let chain = f.hierarchy.resolve_chain(&c.id).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![b.id.as_str(), a.id.as_str()]);
    }

    #[tokio::test]
    async fn resolve_chain_reports_stored_cycles() {
        let f = fixture().await;
        let mut a = Resource::new("a", "document", "alice", "t1");
        let mut b = Resource::new("b", "document", "alice", "t1");
        a.parent_id = Some(b.id.clone());
        b.parent_id = Some(a.id.clone());
        f.store.save_resource(&a).await.unwrap();
        f.store.save_resource(&b).await.unwrap();

        let result = f.hierarchy.resolve_chain(&a.id).await;
        assert!(matches!(result, Err(GatekeepError::CycleDetected { .. })));
    }
}
