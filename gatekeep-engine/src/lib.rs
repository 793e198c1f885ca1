//! Gatekeep authorization engine
//!
//! Multi-tenant allow/deny decisions combining ownership, direct grants,
//! role-derived grants, hierarchical inheritance and public-link access,
//! with an append-only audit trail.
//!
//! [`AccessEngine`] is the facade most callers want; the component modules
//! underneath ([`resolver`], [`grants`], [`hierarchy`], [`public_access`],
//! [`catalog`], [`roles`]) are public for callers that need finer control.
//! Storage, auditing and time are injected through the trait seams in
//! `gatekeep-core`.

pub mod audit;
pub mod catalog;
pub mod clock;
pub mod grants;
pub mod hierarchy;
pub mod public_access;
pub mod resolver;
pub mod roles;
pub mod seed;
pub mod store;

use catalog::PermissionCatalog;
use chrono::{DateTime, Utc};
use gatekeep_core::{
    AuditEvent, AuditSink, Clock, EngineConfig, EntityStore, GatekeepError, GatekeepResult, Grant,
    Permission, Resource, SubjectRef,
};
use grants::GrantLedger;
use hierarchy::ResourceHierarchy;
use public_access::PublicAccessManager;
use resolver::PermissionResolver;
use std::sync::Arc;
use tracing::info;

/// Everything most integrations need
pub mod prelude {
    pub use crate::audit::{MemoryAuditSink, TracingAuditSink};
    pub use crate::clock::{FixedClock, SystemClock};
    pub use crate::seed::{ensure_seed_data, ADMINISTRATOR_ROLE, SYSTEM_PERMISSIONS};
    pub use crate::store::MemoryEntityStore;
    #[cfg(feature = "sqlite")]
    pub use crate::store::SqliteEntityStore;
    pub use crate::{AccessEngine, AccessEngineBuilder};
    pub use gatekeep_core::{
        AuditEvent, AuditOutcome, AuditSink, Clock, EngineConfig, EntityStore, GatekeepError,
        GatekeepResult, Grant, GrantType, Membership, MembershipType, Permission, Resource, Role,
        RoleScope, SubjectRef,
    };
}

/// Facade over the authorization components.
///
/// Mutating operations enforce who may perform them: granting needs the
/// owner or a holder of the share/administrative permission, publishing
/// and re-parenting need the owner or an administrator, and ownership
/// transfer is owner-only. Decision operations never error.
pub struct AccessEngine {
    store: Arc<dyn EntityStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    resolver: Arc<PermissionResolver>,
    catalog: PermissionCatalog,
    ledger: GrantLedger,
    hierarchy: ResourceHierarchy,
    public: PublicAccessManager,
}

impl AccessEngine {
    pub fn builder() -> AccessEngineBuilder {
        AccessEngineBuilder::default()
    }

    /// Engine with in-memory storage, tracing audit output and the system
    /// clock
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// One-time startup work, seeding the built-in permissions and the
    /// administrator role. Idempotent, so safe to call on every process
    /// start. Logging setup stays with the embedding application via
    /// [`gatekeep_core::init_logging`].
    pub async fn initialize(&self) -> GatekeepResult<()> {
        seed::ensure_seed_data(&self.store).await?;
        info!("Access engine initialized");
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn catalog(&self) -> &PermissionCatalog {
        &self.catalog
    }

    pub async fn health_check(&self) -> GatekeepResult<()> {
        self.store.health_check().await
    }

    // Resource lifecycle

    /// Register a resource under the given tenant, optionally attached to a
    /// parent, which must exist in the same tenant.
    pub async fn register_resource(
        &self,
        name: &str,
        resource_type: &str,
        owner_id: &str,
        tenant_id: &str,
        parent_id: Option<&str>,
    ) -> GatekeepResult<Resource> {
        if name.is_empty() {
            return Err(GatekeepError::validation(
                "Resource name must not be empty",
                Some("name"),
                "engine",
            ));
        }

        if let Some(parent_id) = parent_id {
            let parent = self
                .store
                .load_resource(parent_id)
                .await?
                .ok_or_else(|| GatekeepError::not_found("Resource", parent_id, "engine"))?;
            if parent.tenant_id != tenant_id {
                return Err(GatekeepError::tenant_mismatch(parent_id, tenant_id, "engine"));
            }
        }

        let mut resource = Resource::new(name, resource_type, owner_id, tenant_id);
        if let Some(parent_id) = parent_id {
            resource.parent_id = Some(parent_id.to_string());
        }
        self.store.save_resource(&resource).await?;

        self.audit
            .record(
                AuditEvent::mutation(owner_id, "register_resource", &resource.id, tenant_id, true, None)
                    .with_metadata("resource_type", resource_type),
            )
            .await;
        info!(resource = %resource.id, resource_type, "Registered resource");
        Ok(resource)
    }

    /// Reassign ownership. Only the current owner may transfer.
    pub async fn transfer_ownership(
        &self,
        resource_id: &str,
        new_owner_id: &str,
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<()> {
        let mut resource = self.load_tenant_resource(resource_id, tenant_id).await?;
        if resource.owner_id != actor {
            self.audit
                .record(AuditEvent::mutation(
                    actor,
                    "transfer_ownership",
                    resource_id,
                    tenant_id,
                    false,
                    Some("permission_denied"),
                ))
                .await;
            return Err(GatekeepError::permission_denied(
                resource_id,
                "Only the owner may transfer ownership",
                "engine",
            ));
        }

        resource.owner_id = new_owner_id.to_string();
        resource.updated_at = self.clock.now();
        self.store.save_resource(&resource).await?;

        self.audit
            .record(
                AuditEvent::mutation(actor, "transfer_ownership", resource_id, tenant_id, true, None)
                    .with_metadata("new_owner", new_owner_id),
            )
            .await;
        Ok(())
    }

    // Decisions

    /// Allow/deny verdict for an authenticated subject. Never errors.
    pub async fn check_permission(
        &self,
        subject_id: &str,
        resource_id: &str,
        permission_name: &str,
        tenant_id: &str,
    ) -> bool {
        self.resolver
            .check_permission(subject_id, resource_id, permission_name, tenant_id)
            .await
    }

    /// Allow/deny verdict for an anonymous caller against the public
    /// allow-list. Never errors.
    pub async fn check_anonymous_permission(
        &self,
        resource_id: &str,
        permission_name: &str,
        tenant_id: &str,
    ) -> bool {
        self.public
            .check_anonymous(resource_id, permission_name, tenant_id)
            .await
    }

    /// Resolve a public link token; `Some` only when the token is live and
    /// the permission is on the allow-list. Never errors; faults deny.
    pub async fn validate_public_link(
        &self,
        token: &str,
        permission_name: &str,
    ) -> Option<Resource> {
        self.public.validate_link(token, permission_name).await
    }

    /// Tenant resources the subject can reach with the permission
    /// (read when unspecified)
    pub async fn accessible_resources(
        &self,
        subject_id: &str,
        tenant_id: &str,
        resource_type: Option<&str>,
        permission_name: Option<&str>,
    ) -> GatekeepResult<Vec<Resource>> {
        self.resolver
            .accessible_resources(subject_id, tenant_id, resource_type, permission_name)
            .await
    }

    // Grant lifecycle

    /// Create a direct grant. The actor must own the resource or hold the
    /// share or administrative permission on it.
    pub async fn grant(
        &self,
        subject: SubjectRef,
        resource_id: &str,
        permission_name: &str,
        actor: &str,
        tenant_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> GatekeepResult<Grant> {
        let resource = self.load_tenant_resource(resource_id, tenant_id).await?;
        self.require_sharing_rights(actor, &resource, tenant_id, "grant")
            .await?;
        let permission = self
            .resolve_permission(permission_name, &resource.resource_type)
            .await?;

        self.ledger
            .grant(subject, resource_id, &permission.id, actor, tenant_id, expires_at)
            .await
    }

    /// Revoke all valid grants matching `(user, resource, permission)`.
    /// Returns whether anything was revoked.
    pub async fn revoke(
        &self,
        subject_id: &str,
        resource_id: &str,
        permission_name: &str,
        actor: &str,
        reason: &str,
        tenant_id: &str,
    ) -> GatekeepResult<bool> {
        let resource = self.load_tenant_resource(resource_id, tenant_id).await?;
        self.require_sharing_rights(actor, &resource, tenant_id, "revoke")
            .await?;
        let permission = self
            .resolve_permission(permission_name, &resource.resource_type)
            .await?;

        self.ledger
            .revoke(subject_id, resource_id, &permission.id, actor, reason, tenant_id)
            .await
    }

    /// Expand a role's permissions into delegated grants for a user
    pub async fn delegate(
        &self,
        resource_id: &str,
        target_user_id: &str,
        role_id: &str,
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<Vec<Grant>> {
        let resource = self.load_tenant_resource(resource_id, tenant_id).await?;
        self.require_sharing_rights(actor, &resource, tenant_id, "delegate")
            .await?;

        self.ledger
            .delegate(resource_id, target_user_id, role_id, actor, tenant_id)
            .await
    }

    // Public access

    /// Publish the resource for anonymous access; returns the link token.
    /// Owner or administrator only.
    pub async fn publish(
        &self,
        resource_id: &str,
        permissions: &[&str],
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<String> {
        let resource = self.load_tenant_resource(resource_id, tenant_id).await?;
        self.require_admin_rights(actor, &resource, tenant_id, "publish")
            .await?;
        self.public
            .publish(resource_id, permissions, actor, tenant_id)
            .await
    }

    /// Withdraw public access. Owner or administrator only.
    pub async fn unpublish(
        &self,
        resource_id: &str,
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<()> {
        let resource = self.load_tenant_resource(resource_id, tenant_id).await?;
        self.require_admin_rights(actor, &resource, tenant_id, "unpublish")
            .await?;
        self.public.unpublish(resource_id, actor, tenant_id).await
    }

    /// Set or clear public link expiry. Owner or administrator only.
    pub async fn set_link_expiry(
        &self,
        resource_id: &str,
        expires_at: Option<DateTime<Utc>>,
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<()> {
        let resource = self.load_tenant_resource(resource_id, tenant_id).await?;
        self.require_admin_rights(actor, &resource, tenant_id, "set_link_expiry")
            .await?;
        self.public
            .set_link_expiry(resource_id, expires_at, actor, tenant_id)
            .await
    }

    /// Mint a new link token, invalidating shared links. Owner or
    /// administrator only.
    pub async fn rotate_link(
        &self,
        resource_id: &str,
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<String> {
        let resource = self.load_tenant_resource(resource_id, tenant_id).await?;
        self.require_admin_rights(actor, &resource, tenant_id, "rotate_link")
            .await?;
        self.public.rotate_link(resource_id, actor, tenant_id).await
    }

    // Hierarchy

    pub async fn set_parent(
        &self,
        resource_id: &str,
        parent_id: Option<&str>,
        actor: &str,
        tenant_id: &str,
    ) -> GatekeepResult<()> {
        self.hierarchy
            .set_parent(resource_id, parent_id, actor, tenant_id)
            .await
    }

    pub async fn get_children(&self, resource_id: &str) -> GatekeepResult<Vec<Resource>> {
        self.hierarchy.get_children(resource_id).await
    }

    // Internal helpers

    async fn load_tenant_resource(
        &self,
        resource_id: &str,
        tenant_id: &str,
    ) -> GatekeepResult<Resource> {
        let resource = self
            .store
            .load_resource(resource_id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Resource", resource_id, "engine"))?;
        if resource.tenant_id != tenant_id {
            return Err(GatekeepError::tenant_mismatch(resource_id, tenant_id, "engine"));
        }
        Ok(resource)
    }

    async fn resolve_permission(
        &self,
        permission_name: &str,
        resource_type: &str,
    ) -> GatekeepResult<Permission> {
        self.catalog
            .find(permission_name, Some(resource_type))
            .await?
            .ok_or_else(|| GatekeepError::not_found("Permission", permission_name, "engine"))
    }

    /// Actor must own the resource or hold one of the listed permissions
    /// on it. These internal checks go through the full resolver evaluation
    /// but are not audited as decisions; the mutation itself is audited.
    async fn require_any(
        &self,
        actor: &str,
        resource: &Resource,
        tenant_id: &str,
        permission_names: &[&str],
        operation: &str,
    ) -> GatekeepResult<()> {
        if resource.owner_id == actor {
            return Ok(());
        }
        for name in permission_names {
            match self
                .resolver
                .evaluate(actor, &resource.id, name, tenant_id)
                .await
            {
                Ok(decision) if decision.allowed => return Ok(()),
                Ok(_) => {}
                Err(e) => e.log(),
            }
        }

        self.audit
            .record(AuditEvent::mutation(
                actor,
                operation,
                &resource.id,
                tenant_id,
                false,
                Some("permission_denied"),
            ))
            .await;
        Err(GatekeepError::permission_denied(
            &resource.id,
            &format!("Actor lacks the rights required for {}", operation),
            "engine",
        ))
    }

    async fn require_sharing_rights(
        &self,
        actor: &str,
        resource: &Resource,
        tenant_id: &str,
        operation: &str,
    ) -> GatekeepResult<()> {
        let share = self.config.share_permission.clone();
        let admin = self.config.admin_permission.clone();
        self.require_any(actor, resource, tenant_id, &[&share, &admin], operation)
            .await
    }

    async fn require_admin_rights(
        &self,
        actor: &str,
        resource: &Resource,
        tenant_id: &str,
        operation: &str,
    ) -> GatekeepResult<()> {
        let admin = self.config.admin_permission.clone();
        self.require_any(actor, resource, tenant_id, &[&admin], operation)
            .await
    }
}

impl Default for AccessEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder wiring storage, audit sink, clock and configuration into an
/// [`AccessEngine`]. Unset collaborators fall back to in-memory storage,
/// tracing audit output and the system clock.
#[derive(Default)]
pub struct AccessEngineBuilder {
    store: Option<Arc<dyn EntityStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Option<Arc<dyn Clock>>,
    config: Option<EngineConfig>,
}

impl AccessEngineBuilder {
    pub fn with_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> AccessEngine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(store::MemoryEntityStore::new()));
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(audit::TracingAuditSink));
        let clock = self.clock.unwrap_or_else(|| Arc::new(clock::SystemClock));
        let config = self.config.unwrap_or_default();

        let resolver = Arc::new(PermissionResolver::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            config.clone(),
        ));
        let catalog = PermissionCatalog::new(store.clone());
        let ledger = GrantLedger::new(store.clone(), audit.clone(), clock.clone());
        let hierarchy = ResourceHierarchy::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            resolver.clone(),
            config.clone(),
        );
        let public = PublicAccessManager::new(
            store.clone(),
            audit.clone(),
            clock.clone(),
            config.clone(),
        );

        AccessEngine {
            store,
            audit,
            clock,
            config,
            resolver,
            catalog,
            ledger,
            hierarchy,
            public,
        }
    }
}
