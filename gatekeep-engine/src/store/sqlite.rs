//! SQLite entity store implementation
//!
//! Timestamps are stored as RFC 3339 text, set-valued columns as JSON.
//! The grants table carries a partial unique index over live rows, so the
//! conditional insert is closed by the database rather than by a
//! read-then-write check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatekeep_core::{
    EntityStore, GatekeepError, GatekeepResult, Grant, GrantType, Membership, MembershipType,
    Permission, Resource, Role, RoleScope, SubjectRef,
};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, info};

/// SQLite-backed entity store
#[derive(Debug, Clone)]
pub struct SqliteEntityStore {
    pool: SqlitePool,
}

fn db_err(operation: &str) -> impl FnOnce(sqlx::Error) -> GatekeepError + '_ {
    move |e| GatekeepError::storage(&format!("{} failed", operation), e, "sqlite_store")
}

fn parse_ts(value: &str) -> GatekeepResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            GatekeepError::internal(
                &format!("Malformed timestamp in store: {}", e),
                "sqlite_store",
            )
        })
}

fn parse_ts_opt(value: Option<String>) -> GatekeepResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn subject_columns(subject: &SubjectRef) -> (&'static str, &str) {
    match subject {
        SubjectRef::User(id) => ("user", id),
        SubjectRef::Role(id) => ("role", id),
    }
}

impl SqliteEntityStore {
    pub async fn new(pool: SqlitePool) -> GatekeepResult<Self> {
        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    /// Create from database URL
    pub async fn from_url(database_url: &str) -> GatekeepResult<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(db_err("connect"))?;
        Self::new(pool).await
    }

    async fn create_tables(&self) -> GatekeepResult<()> {
        let query = r#"
            CREATE TABLE IF NOT EXISTS resources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                organization_id TEXT,
                parent_id TEXT,
                is_public INTEGER NOT NULL DEFAULT 0,
                public_permissions TEXT NOT NULL DEFAULT '[]',
                public_link_token TEXT UNIQUE,
                public_link_expires_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_resources_tenant ON resources(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_resources_parent ON resources(parent_id);

            CREATE TABLE IF NOT EXISTS permissions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                resource_type TEXT,
                is_system INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_permissions_name_scope
                ON permissions(name, IFNULL(resource_type, ''));

            CREATE TABLE IF NOT EXISTS roles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                tenant_id TEXT,
                scope TEXT NOT NULL,
                permission_ids TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_roles_name_tenant
                ON roles(name, IFNULL(tenant_id, ''));

            CREATE TABLE IF NOT EXISTS grants (
                id TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL,
                subject_kind TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                permission_id TEXT NOT NULL,
                grant_type TEXT NOT NULL,
                granted_by TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                expires_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                revoked_at TEXT,
                revoked_by TEXT,
                reason TEXT,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_grants_live
                ON grants(subject_kind, subject_id, resource_id, permission_id)
                WHERE is_active = 1 AND revoked_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_grants_resource ON grants(resource_id);
            CREATE INDEX IF NOT EXISTS idx_grants_user_tenant ON grants(subject_id, tenant_id);

            CREATE TABLE IF NOT EXISTS memberships (
                user_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                role_id TEXT,
                membership_type TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                expires_at TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, organization_id)
            );
        "#;

        sqlx::query(query)
            .execute(&self.pool)
            .await
            .map_err(db_err("create_tables"))?;

        info!("SQLite entity store schema ready");
        Ok(())
    }

    fn row_to_resource(row: &sqlx::sqlite::SqliteRow) -> GatekeepResult<Resource> {
        let public_permissions: HashSet<String> = serde_json::from_str(
            &row.try_get::<String, _>("public_permissions")
                .map_err(db_err("read public_permissions"))?,
        )?;

        Ok(Resource {
            id: row.try_get("id").map_err(db_err("read id"))?,
            name: row.try_get("name").map_err(db_err("read name"))?,
            resource_type: row
                .try_get("resource_type")
                .map_err(db_err("read resource_type"))?,
            owner_id: row.try_get("owner_id").map_err(db_err("read owner_id"))?,
            tenant_id: row.try_get("tenant_id").map_err(db_err("read tenant_id"))?,
            organization_id: row
                .try_get("organization_id")
                .map_err(db_err("read organization_id"))?,
            parent_id: row.try_get("parent_id").map_err(db_err("read parent_id"))?,
            is_public: row.try_get("is_public").map_err(db_err("read is_public"))?,
            public_permissions,
            public_link_token: row
                .try_get("public_link_token")
                .map_err(db_err("read public_link_token"))?,
            public_link_expires_at: parse_ts_opt(
                row.try_get("public_link_expires_at")
                    .map_err(db_err("read public_link_expires_at"))?,
            )?,
            is_active: row.try_get("is_active").map_err(db_err("read is_active"))?,
            created_at: parse_ts(
                &row.try_get::<String, _>("created_at")
                    .map_err(db_err("read created_at"))?,
            )?,
            updated_at: parse_ts(
                &row.try_get::<String, _>("updated_at")
                    .map_err(db_err("read updated_at"))?,
            )?,
        })
    }

    fn row_to_permission(row: &sqlx::sqlite::SqliteRow) -> GatekeepResult<Permission> {
        Ok(Permission {
            id: row.try_get("id").map_err(db_err("read id"))?,
            name: row.try_get("name").map_err(db_err("read name"))?,
            resource_type: row
                .try_get("resource_type")
                .map_err(db_err("read resource_type"))?,
            is_system: row.try_get("is_system").map_err(db_err("read is_system"))?,
            is_active: row.try_get("is_active").map_err(db_err("read is_active"))?,
            created_at: parse_ts(
                &row.try_get::<String, _>("created_at")
                    .map_err(db_err("read created_at"))?,
            )?,
        })
    }

    fn row_to_role(row: &sqlx::sqlite::SqliteRow) -> GatekeepResult<Role> {
        let permission_ids: HashSet<String> = serde_json::from_str(
            &row.try_get::<String, _>("permission_ids")
                .map_err(db_err("read permission_ids"))?,
        )?;
        let scope: String = row.try_get("scope").map_err(db_err("read scope"))?;
        let scope: RoleScope = scope
            .parse()
            .map_err(|e: String| GatekeepError::internal(&e, "sqlite_store"))?;

        Ok(Role {
            id: row.try_get("id").map_err(db_err("read id"))?,
            name: row.try_get("name").map_err(db_err("read name"))?,
            tenant_id: row.try_get("tenant_id").map_err(db_err("read tenant_id"))?,
            scope,
            permission_ids,
            is_active: row.try_get("is_active").map_err(db_err("read is_active"))?,
            created_at: parse_ts(
                &row.try_get::<String, _>("created_at")
                    .map_err(db_err("read created_at"))?,
            )?,
        })
    }

    fn row_to_grant(row: &sqlx::sqlite::SqliteRow) -> GatekeepResult<Grant> {
        let subject_kind: String = row
            .try_get("subject_kind")
            .map_err(db_err("read subject_kind"))?;
        let subject_id: String = row
            .try_get("subject_id")
            .map_err(db_err("read subject_id"))?;
        let subject = match subject_kind.as_str() {
            "user" => SubjectRef::User(subject_id),
            "role" => SubjectRef::Role(subject_id),
            other => {
                return Err(GatekeepError::invalid_grant_target(
                    &format!("Unknown subject kind in store: {}", other),
                    "sqlite_store",
                ))
            }
        };

        let grant_type: String = row
            .try_get("grant_type")
            .map_err(db_err("read grant_type"))?;
        let grant_type: GrantType = grant_type
            .parse()
            .map_err(|e: String| GatekeepError::internal(&e, "sqlite_store"))?;

        Ok(Grant {
            id: row.try_get("id").map_err(db_err("read id"))?,
            resource_id: row
                .try_get("resource_id")
                .map_err(db_err("read resource_id"))?,
            subject,
            permission_id: row
                .try_get("permission_id")
                .map_err(db_err("read permission_id"))?,
            grant_type,
            granted_by: row
                .try_get("granted_by")
                .map_err(db_err("read granted_by"))?,
            tenant_id: row.try_get("tenant_id").map_err(db_err("read tenant_id"))?,
            expires_at: parse_ts_opt(
                row.try_get("expires_at").map_err(db_err("read expires_at"))?,
            )?,
            is_active: row.try_get("is_active").map_err(db_err("read is_active"))?,
            revoked_at: parse_ts_opt(
                row.try_get("revoked_at").map_err(db_err("read revoked_at"))?,
            )?,
            revoked_by: row
                .try_get("revoked_by")
                .map_err(db_err("read revoked_by"))?,
            reason: row.try_get("reason").map_err(db_err("read reason"))?,
            created_at: parse_ts(
                &row.try_get::<String, _>("created_at")
                    .map_err(db_err("read created_at"))?,
            )?,
        })
    }

    fn row_to_membership(row: &sqlx::sqlite::SqliteRow) -> GatekeepResult<Membership> {
        let membership_type: String = row
            .try_get("membership_type")
            .map_err(db_err("read membership_type"))?;
        let membership_type: MembershipType = membership_type
            .parse()
            .map_err(|e: String| GatekeepError::internal(&e, "sqlite_store"))?;

        Ok(Membership {
            user_id: row.try_get("user_id").map_err(db_err("read user_id"))?,
            organization_id: row
                .try_get("organization_id")
                .map_err(db_err("read organization_id"))?,
            role_id: row.try_get("role_id").map_err(db_err("read role_id"))?,
            membership_type,
            is_active: row.try_get("is_active").map_err(db_err("read is_active"))?,
            expires_at: parse_ts_opt(
                row.try_get("expires_at").map_err(db_err("read expires_at"))?,
            )?,
            created_at: parse_ts(
                &row.try_get::<String, _>("created_at")
                    .map_err(db_err("read created_at"))?,
            )?,
        })
    }

    async fn try_insert_grant(&self, grant: &Grant) -> GatekeepResult<bool> {
        let (subject_kind, subject_id) = subject_columns(&grant.subject);
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO grants
            (id, resource_id, subject_kind, subject_id, permission_id, grant_type,
             granted_by, tenant_id, expires_at, is_active, revoked_at, revoked_by,
             reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&grant.id)
        .bind(&grant.resource_id)
        .bind(subject_kind)
        .bind(subject_id)
        .bind(&grant.permission_id)
        .bind(grant.grant_type.to_string())
        .bind(&grant.granted_by)
        .bind(&grant.tenant_id)
        .bind(grant.expires_at.map(|t| t.to_rfc3339()))
        .bind(grant.is_active)
        .bind(grant.revoked_at.map(|t| t.to_rfc3339()))
        .bind(&grant.revoked_by)
        .bind(&grant.reason)
        .bind(grant.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err("insert grant"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn live_grant(
        &self,
        subject: &SubjectRef,
        resource_id: &str,
        permission_id: &str,
    ) -> GatekeepResult<Option<Grant>> {
        let (subject_kind, subject_id) = subject_columns(subject);
        let row = sqlx::query(
            r#"
            SELECT * FROM grants
            WHERE subject_kind = ? AND subject_id = ? AND resource_id = ?
              AND permission_id = ? AND is_active = 1 AND revoked_at IS NULL
            "#,
        )
        .bind(subject_kind)
        .bind(subject_id)
        .bind(resource_id)
        .bind(permission_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("select live grant"))?;

        row.as_ref().map(Self::row_to_grant).transpose()
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn save_resource(&self, resource: &Resource) -> GatekeepResult<()> {
        let public_permissions = serde_json::to_string(&resource.public_permissions)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO resources
            (id, name, resource_type, owner_id, tenant_id, organization_id, parent_id,
             is_public, public_permissions, public_link_token, public_link_expires_at,
             is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&resource.id)
        .bind(&resource.name)
        .bind(&resource.resource_type)
        .bind(&resource.owner_id)
        .bind(&resource.tenant_id)
        .bind(&resource.organization_id)
        .bind(&resource.parent_id)
        .bind(resource.is_public)
        .bind(public_permissions)
        .bind(&resource.public_link_token)
        .bind(resource.public_link_expires_at.map(|t| t.to_rfc3339()))
        .bind(resource.is_active)
        .bind(resource.created_at.to_rfc3339())
        .bind(resource.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err("save resource"))?;

        debug!("Saved resource {} to SQLite store", resource.id);
        Ok(())
    }

    async fn load_resource(&self, id: &str) -> GatekeepResult<Option<Resource>> {
        let row = sqlx::query("SELECT * FROM resources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("load resource"))?;

        row.as_ref().map(Self::row_to_resource).transpose()
    }

    async fn load_resource_by_token(&self, token: &str) -> GatekeepResult<Option<Resource>> {
        let row = sqlx::query("SELECT * FROM resources WHERE public_link_token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("load resource by token"))?;

        row.as_ref().map(Self::row_to_resource).transpose()
    }

    async fn list_resources(
        &self,
        tenant_id: &str,
        resource_type: Option<&str>,
    ) -> GatekeepResult<Vec<Resource>> {
        let rows = match resource_type {
            Some(resource_type) => {
                sqlx::query(
                    "SELECT * FROM resources WHERE tenant_id = ? AND resource_type = ? AND is_active = 1",
                )
                .bind(tenant_id)
                .bind(resource_type)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM resources WHERE tenant_id = ? AND is_active = 1")
                    .bind(tenant_id)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err("list resources"))?;

        rows.iter().map(Self::row_to_resource).collect()
    }

    async fn list_children(&self, resource_id: &str) -> GatekeepResult<Vec<Resource>> {
        let rows = sqlx::query("SELECT * FROM resources WHERE parent_id = ? AND is_active = 1")
            .bind(resource_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list children"))?;

        rows.iter().map(Self::row_to_resource).collect()
    }

    async fn save_permission(&self, permission: &Permission) -> GatekeepResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO permissions
            (id, name, resource_type, is_system, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&permission.id)
        .bind(&permission.name)
        .bind(&permission.resource_type)
        .bind(permission.is_system)
        .bind(permission.is_active)
        .bind(permission.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err("save permission"))?;

        Ok(())
    }

    async fn load_permission(&self, id: &str) -> GatekeepResult<Option<Permission>> {
        let row = sqlx::query("SELECT * FROM permissions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("load permission"))?;

        row.as_ref().map(Self::row_to_permission).transpose()
    }

    async fn find_permission(
        &self,
        name: &str,
        resource_type: Option<&str>,
    ) -> GatekeepResult<Option<Permission>> {
        let row = sqlx::query(
            "SELECT * FROM permissions WHERE name = ? AND IFNULL(resource_type, '') = ?",
        )
        .bind(name)
        .bind(resource_type.unwrap_or(""))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("find permission"))?;

        row.as_ref().map(Self::row_to_permission).transpose()
    }

    async fn save_role(&self, role: &Role) -> GatekeepResult<()> {
        let permission_ids = serde_json::to_string(&role.permission_ids)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO roles
            (id, name, tenant_id, scope, permission_ids, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&role.id)
        .bind(&role.name)
        .bind(&role.tenant_id)
        .bind(role.scope.to_string())
        .bind(permission_ids)
        .bind(role.is_active)
        .bind(role.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err("save role"))?;

        Ok(())
    }

    async fn load_role(&self, id: &str) -> GatekeepResult<Option<Role>> {
        let row = sqlx::query("SELECT * FROM roles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("load role"))?;

        row.as_ref().map(Self::row_to_role).transpose()
    }

    async fn find_role(&self, name: &str, tenant_id: Option<&str>) -> GatekeepResult<Option<Role>> {
        let row = sqlx::query("SELECT * FROM roles WHERE name = ? AND IFNULL(tenant_id, '') = ?")
            .bind(name)
            .bind(tenant_id.unwrap_or(""))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("find role"))?;

        row.as_ref().map(Self::row_to_role).transpose()
    }

    async fn insert_grant_if_absent(
        &self,
        grant: &Grant,
        now: DateTime<Utc>,
    ) -> GatekeepResult<Grant> {
        if self.try_insert_grant(grant).await? {
            return Ok(grant.clone());
        }

        // The live index rejected us; fetch the row that won.
        match self
            .live_grant(&grant.subject, &grant.resource_id, &grant.permission_id)
            .await?
        {
            Some(existing) if existing.is_valid_at(now) => Ok(existing),
            Some(mut expired) => {
                // Lazily expired row still occupies the live index slot.
                // Retire it and insert the fresh grant.
                expired.is_active = false;
                self.update_grant(&expired).await?;
                if self.try_insert_grant(grant).await? {
                    Ok(grant.clone())
                } else {
                    // Raced another writer; their row is now current.
                    self.live_grant(&grant.subject, &grant.resource_id, &grant.permission_id)
                        .await?
                        .ok_or_else(|| {
                            GatekeepError::internal(
                                "Grant insert raced and no live row remains",
                                "sqlite_store",
                            )
                        })
                }
            }
            None => Err(GatekeepError::internal(
                "Grant insert rejected but no live row found",
                "sqlite_store",
            )),
        }
    }

    async fn update_grant(&self, grant: &Grant) -> GatekeepResult<()> {
        sqlx::query(
            r#"
            UPDATE grants
            SET is_active = ?, expires_at = ?, revoked_at = ?, revoked_by = ?, reason = ?
            WHERE id = ?
            "#,
        )
        .bind(grant.is_active)
        .bind(grant.expires_at.map(|t| t.to_rfc3339()))
        .bind(grant.revoked_at.map(|t| t.to_rfc3339()))
        .bind(&grant.revoked_by)
        .bind(&grant.reason)
        .bind(&grant.id)
        .execute(&self.pool)
        .await
        .map_err(db_err("update grant"))?;

        Ok(())
    }

    async fn grants_for_subject(
        &self,
        subject: &SubjectRef,
        resource_id: &str,
    ) -> GatekeepResult<Vec<Grant>> {
        let (subject_kind, subject_id) = subject_columns(subject);
        let rows = sqlx::query(
            "SELECT * FROM grants WHERE subject_kind = ? AND subject_id = ? AND resource_id = ?",
        )
        .bind(subject_kind)
        .bind(subject_id)
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("grants for subject"))?;

        rows.iter().map(Self::row_to_grant).collect()
    }

    async fn grants_for_user(&self, user_id: &str, tenant_id: &str) -> GatekeepResult<Vec<Grant>> {
        let rows = sqlx::query(
            "SELECT * FROM grants WHERE subject_kind = 'user' AND subject_id = ? AND tenant_id = ?",
        )
        .bind(user_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("grants for user"))?;

        rows.iter().map(Self::row_to_grant).collect()
    }

    async fn save_membership(&self, membership: &Membership) -> GatekeepResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO memberships
            (user_id, organization_id, role_id, membership_type, is_active, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&membership.user_id)
        .bind(&membership.organization_id)
        .bind(&membership.role_id)
        .bind(membership.membership_type.to_string())
        .bind(membership.is_active)
        .bind(membership.expires_at.map(|t| t.to_rfc3339()))
        .bind(membership.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err("save membership"))?;

        Ok(())
    }

    async fn memberships_for_user(&self, user_id: &str) -> GatekeepResult<Vec<Membership>> {
        let rows = sqlx::query("SELECT * FROM memberships WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("memberships for user"))?;

        rows.iter().map(Self::row_to_membership).collect()
    }

    async fn health_check(&self) -> GatekeepResult<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("health check"))?;

        Ok(())
    }
}
