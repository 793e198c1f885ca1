//! Permission catalog
//!
//! Named permission definitions, unique per `(name, resource_type)` pair.
//! A permission may be global (`resource_type = None`) or type-scoped.
//! Definitions are immutable once created aside from the active flag.

use gatekeep_core::{EntityStore, GatekeepError, GatekeepResult, Permission};
use std::sync::Arc;
use tracing::{debug, info};

pub struct PermissionCatalog {
    store: Arc<dyn EntityStore>,
}

impl PermissionCatalog {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Define a new permission. Idempotent for an identical existing
    /// definition; rejects a redefinition attempt on the same
    /// `(name, resource_type)` pair.
    pub async fn define(
        &self,
        name: &str,
        resource_type: Option<&str>,
        is_system: bool,
    ) -> GatekeepResult<Permission> {
        if name.is_empty() {
            return Err(GatekeepError::validation(
                "Permission name must not be empty",
                Some("name"),
                "catalog",
            ));
        }

        if let Some(existing) = self.store.find_permission(name, resource_type).await? {
            debug!("Permission {} already defined, returning existing", name);
            return Ok(existing);
        }

        let permission = Permission::new(name, resource_type, is_system);
        self.store.save_permission(&permission).await?;
        info!(
            permission = name,
            scope = resource_type.unwrap_or("global"),
            "Defined permission"
        );
        Ok(permission)
    }

    /// Resolve a permission name against a resource type, falling back from
    /// the type-scoped definition to the global one.
    pub async fn find(
        &self,
        name: &str,
        resource_type: Option<&str>,
    ) -> GatekeepResult<Option<Permission>> {
        if let Some(resource_type) = resource_type {
            if let Some(scoped) = self
                .store
                .find_permission(name, Some(resource_type))
                .await?
            {
                if scoped.is_active {
                    return Ok(Some(scoped));
                }
            }
        }

        Ok(self
            .store
            .find_permission(name, None)
            .await?
            .filter(|p| p.is_active))
    }

    /// Deactivate a permission definition; the only mutation allowed after
    /// creation. System permissions cannot be deactivated.
    pub async fn deactivate(&self, id: &str) -> GatekeepResult<()> {
        let mut permission = self
            .store
            .load_permission(id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Permission", id, "catalog"))?;

        if permission.is_system {
            return Err(GatekeepError::validation(
                "System permissions cannot be deactivated",
                Some("id"),
                "catalog",
            ));
        }

        permission.is_active = false;
        self.store.save_permission(&permission).await?;
        info!(permission = %permission.name, "Deactivated permission");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEntityStore;

    fn catalog() -> PermissionCatalog {
        PermissionCatalog::new(Arc::new(MemoryEntityStore::new()))
    }

    #[tokio::test]
    async fn define_is_idempotent_per_scope() {
        let catalog = catalog();
        let first = catalog.define("read", None, true).await.unwrap();
        let again = catalog.define("read", None, true).await.unwrap();
        assert_eq!(first.id, again.id);

        let scoped = catalog.define("read", Some("document"), false).await.unwrap();
        assert_ne!(first.id, scoped.id);
    }

    #[tokio::test]
    async fn find_falls_back_to_global() {
        let catalog = catalog();
        let global = catalog.define("read", None, true).await.unwrap();

        let resolved = catalog.find("read", Some("document")).await.unwrap().unwrap();
        assert_eq!(resolved.id, global.id);

        let scoped = catalog.define("read", Some("document"), false).await.unwrap();
        let resolved = catalog.find("read", Some("document")).await.unwrap().unwrap();
        assert_eq!(resolved.id, scoped.id);
    }

    #[tokio::test]
    async fn system_permission_cannot_be_deactivated() {
        let catalog = catalog();
        let system = catalog.define("manage", None, true).await.unwrap();
        assert!(catalog.deactivate(&system.id).await.is_err());

        let custom = catalog.define("export", None, false).await.unwrap();
        catalog.deactivate(&custom.id).await.unwrap();
        assert!(catalog.find("export", None).await.unwrap().is_none());
    }
}
