//! Built-in permission and role seeding
//!
//! Seeding is an explicit, idempotent startup step rather than an implicit
//! side effect of the first decision. Callers run it once after constructing
//! a store; running it again changes nothing.

use gatekeep_core::{EntityStore, GatekeepResult, Permission, Role, RoleScope};
use std::sync::Arc;
use tracing::info;

/// Global permissions every deployment carries
pub const SYSTEM_PERMISSIONS: [&str; 5] = ["read", "write", "delete", "share", "manage"];

/// Name of the built-in application-wide administrator role
pub const ADMINISTRATOR_ROLE: &str = "administrator";

/// Create the system permissions and the built-in administrator role if
/// they do not already exist. Safe to call on every startup.
pub async fn ensure_seed_data(store: &Arc<dyn EntityStore>) -> GatekeepResult<()> {
    let mut permission_ids = Vec::with_capacity(SYSTEM_PERMISSIONS.len());
    let mut created = 0usize;

    for name in SYSTEM_PERMISSIONS {
        match store.find_permission(name, None).await? {
            Some(existing) => permission_ids.push(existing.id),
            None => {
                let permission = Permission::new(name, None, true);
                store.save_permission(&permission).await?;
                permission_ids.push(permission.id);
                created += 1;
            }
        }
    }

    if store.find_role(ADMINISTRATOR_ROLE, None).await?.is_none() {
        let role = Role::new(ADMINISTRATOR_ROLE, None, RoleScope::Application)
            .with_permissions(permission_ids);
        store.save_role(&role).await?;
        created += 1;
    }

    if created > 0 {
        info!(created, "Seeded built-in permissions and roles");
    }
    Ok(())
}
