//! Collaborator trait definitions
//!
//! The engine consumes three external collaborators: a durable entity store,
//! an audit sink, and a clock. Persistence technology, transport and wiring
//! live behind these seams.

use crate::error::GatekeepResult;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable storage for resources, permissions, roles, grants and memberships.
///
/// Implementations must provide at least read-committed isolation.
/// `insert_grant_if_absent` is the one operation with a stronger contract:
/// it must be atomic per `(subject, resource_id, permission_id)` so that
/// concurrent identical grant calls cannot both insert.
#[async_trait]
pub trait EntityStore: Send + Sync {
    // Resources

    async fn save_resource(&self, resource: &Resource) -> GatekeepResult<()>;

    async fn load_resource(&self, id: &str) -> GatekeepResult<Option<Resource>>;

    async fn load_resource_by_token(&self, token: &str) -> GatekeepResult<Option<Resource>>;

    /// List active resources in a tenant, optionally filtered by type
    async fn list_resources(
        &self,
        tenant_id: &str,
        resource_type: Option<&str>,
    ) -> GatekeepResult<Vec<Resource>>;

    async fn list_children(&self, resource_id: &str) -> GatekeepResult<Vec<Resource>>;

    // Permissions

    async fn save_permission(&self, permission: &Permission) -> GatekeepResult<()>;

    async fn load_permission(&self, id: &str) -> GatekeepResult<Option<Permission>>;

    /// Exact lookup on the `(name, resource_type)` unique pair
    async fn find_permission(
        &self,
        name: &str,
        resource_type: Option<&str>,
    ) -> GatekeepResult<Option<Permission>>;

    // Roles

    async fn save_role(&self, role: &Role) -> GatekeepResult<()>;

    async fn load_role(&self, id: &str) -> GatekeepResult<Option<Role>>;

    async fn find_role(&self, name: &str, tenant_id: Option<&str>) -> GatekeepResult<Option<Role>>;

    // Grants

    /// Insert the grant unless a valid grant for the same
    /// `(subject, resource_id, permission_id)` already exists at `now`;
    /// returns whichever grant is current after the call. This is the
    /// conditional write that closes the concurrent-grant race.
    async fn insert_grant_if_absent(
        &self,
        grant: &Grant,
        now: DateTime<Utc>,
    ) -> GatekeepResult<Grant>;

    async fn update_grant(&self, grant: &Grant) -> GatekeepResult<()>;

    async fn grants_for_subject(
        &self,
        subject: &SubjectRef,
        resource_id: &str,
    ) -> GatekeepResult<Vec<Grant>>;

    async fn grants_for_user(&self, user_id: &str, tenant_id: &str) -> GatekeepResult<Vec<Grant>>;

    // Memberships

    async fn save_membership(&self, membership: &Membership) -> GatekeepResult<()>;

    async fn memberships_for_user(&self, user_id: &str) -> GatekeepResult<Vec<Membership>>;

    /// Health check for the storage backend
    async fn health_check(&self) -> GatekeepResult<()>;
}

/// Receives structured decision/mutation events.
///
/// Recording is best-effort: implementations must never propagate failures
/// back to the caller, and emission must never influence a decision.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Injectable time source for deterministic expiration testing
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
