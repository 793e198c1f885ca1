//! Grant ledger
//!
//! Create/revoke/delegate lifecycle for direct and role-addressed grants.
//! Creation is idempotent through the store's conditional insert; revocation
//! is effective immediately because the resolver reads grant validity live.
//! Expiry is lazy: expired grants are never swept, they stop matching at
//! decision time.

use chrono::{DateTime, Utc};
use gatekeep_core::{
    AuditEvent, AuditSink, Clock, EntityStore, GatekeepError, GatekeepResult, Grant, GrantType,
    SubjectRef,
};
use std::sync::Arc;
use tracing::info;

pub struct GrantLedger {
    store: Arc<dyn EntityStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl GrantLedger {
    pub fn new(
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            audit,
            clock,
        }
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

    /// Validate the shared preconditions of grant and delegate: the
    /// resource exists, belongs to the asserted tenant, and the permission
    /// definition exists.
    async fn check_target(
        &self,
        resource_id: &str,
        permission_id: &str,
        tenant_id: &str,
    ) -> GatekeepResult<()> {
        let resource = self
            .store
            .load_resource(resource_id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Resource", resource_id, "grants"))?;

        if resource.tenant_id != tenant_id {
            return Err(GatekeepError::tenant_mismatch(
                resource_id,
                tenant_id,
                "grants",
            ));
        }

        self.store
            .load_permission(permission_id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Permission", permission_id, "grants"))?;

        Ok(())
    }

    /// Create a direct grant for a user or role subject.
    ///
    /// Idempotent: if a valid grant already exists for the same
    /// `(subject, resource, permission)`, it is returned instead of a
    /// duplicate being inserted.
    pub async fn grant(
        &self,
        subject: SubjectRef,
        resource_id: &str,
        permission_id: &str,
        granted_by: &str,
        tenant_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> GatekeepResult<Grant> {
        if let Err(e) = self.check_target(resource_id, permission_id, tenant_id).await {
            self.audit_mutation(
                granted_by,
                "grant",
                resource_id,
                tenant_id,
                false,
                Some(e.audit_reason()),
            )
            .await;
            return Err(e);
        }

        if let Some(role_id) = subject.as_role() {
            if self.store.load_role(role_id).await?.is_none() {
                self.audit_mutation(
                    granted_by,
                    "grant",
                    resource_id,
                    tenant_id,
                    false,
                    Some("role_not_found"),
                )
                .await;
                return Err(GatekeepError::not_found("Role", role_id, "grants"));
            }
        }

        let now = self.clock.now();
        let grant = Grant::new(
            resource_id,
            subject.clone(),
            permission_id,
            GrantType::Direct,
            granted_by,
            tenant_id,
            expires_at,
        );
        let current = self.store.insert_grant_if_absent(&grant, now).await?;

        self.audit
            .record(
                AuditEvent::mutation(granted_by, "grant", resource_id, tenant_id, true, None)
                    .with_metadata("subject", &subject.to_string())
                    .with_metadata("grant_id", &current.id),
            )
            .await;
        info!(
            subject = %subject,
            resource = resource_id,
            permission = permission_id,
            "Grant recorded"
        );
        Ok(current)
    }

    /// Revoke all valid grants matching `(user, resource, permission)`,
    /// stamping actor and reason. Returns whether anything was revoked.
    pub async fn revoke(
        &self,
        subject_id: &str,
        resource_id: &str,
        permission_id: &str,
        revoked_by: &str,
        reason: &str,
        tenant_id: &str,
    ) -> GatekeepResult<bool> {
        if let Err(e) = self.check_target(resource_id, permission_id, tenant_id).await {
            self.audit_mutation(
                revoked_by,
                "revoke",
                resource_id,
                tenant_id,
                false,
                Some(e.audit_reason()),
            )
            .await;
            return Err(e);
        }

        let now = self.clock.now();
        let subject = SubjectRef::user(subject_id);
        let grants = self.store.grants_for_subject(&subject, resource_id).await?;

        let mut revoked = 0usize;
        for mut grant in grants {
            if grant.permission_id == permission_id && grant.is_valid_at(now) {
                grant.revoke(revoked_by, reason, now);
                self.store.update_grant(&grant).await?;
                revoked += 1;
            }
        }

        self.audit
            .record(
                AuditEvent::mutation(revoked_by, "revoke", resource_id, tenant_id, true, Some(reason))
                    .with_metadata("subject", &subject.to_string())
                    .with_metadata("revoked_count", &revoked.to_string()),
            )
            .await;
        info!(
            subject = subject_id,
            resource = resource_id,
            revoked_count = revoked,
            "Revocation processed"
        );
        Ok(revoked > 0)
    }

    /// Expand a role's permission set into one `Delegated` grant per
    /// permission, addressed to the target user. Idempotent per permission
    /// through the conditional insert.
    pub async fn delegate(
        &self,
        resource_id: &str,
        target_user_id: &str,
        role_id: &str,
        delegated_by: &str,
        tenant_id: &str,
    ) -> GatekeepResult<Vec<Grant>> {
        let resource = self
            .store
            .load_resource(resource_id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Resource", resource_id, "grants"))?;

        if resource.tenant_id != tenant_id {
            self.audit_mutation(
                delegated_by,
                "delegate",
                resource_id,
                tenant_id,
                false,
                Some("tenant_mismatch"),
            )
            .await;
            return Err(GatekeepError::tenant_mismatch(
                resource_id,
                tenant_id,
                "grants",
            ));
        }

        let role = self
            .store
            .load_role(role_id)
            .await?
            .ok_or_else(|| GatekeepError::not_found("Role", role_id, "grants"))?;

        let now = self.clock.now();
        let mut grants = Vec::with_capacity(role.permission_ids.len());
        for permission_id in &role.permission_ids {
            let grant = Grant::new(
                resource_id,
                SubjectRef::user(target_user_id),
                permission_id,
                GrantType::Delegated,
                delegated_by,
                tenant_id,
                None,
            );
            grants.push(self.store.insert_grant_if_absent(&grant, now).await?);
        }

        self.audit
            .record(
                AuditEvent::mutation(delegated_by, "delegate", resource_id, tenant_id, true, None)
                    .with_metadata("target_user", target_user_id)
                    .with_metadata("role", &role.name)
                    .with_metadata("grant_count", &grants.len().to_string()),
            )
            .await;
        info!(
            target_user = target_user_id,
            role = %role.name,
            resource = resource_id,
            grant_count = grants.len(),
            "Role delegated"
        );
        Ok(grants)
    }
}
