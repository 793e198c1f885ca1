//! Core domain types for the authorization engine
//!
//! These types are storage-agnostic: the engine reads and writes them only
//! through the [`crate::traits::EntityStore`] trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Scope at which a role applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleScope {
    /// Applies across the whole application
    Application,
    /// Applies within a single tenant
    Tenant,
    /// Applies to individual resources
    Resource,
}

impl std::fmt::Display for RoleScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleScope::Application => write!(f, "application"),
            RoleScope::Tenant => write!(f, "tenant"),
            RoleScope::Resource => write!(f, "resource"),
        }
    }
}

impl std::str::FromStr for RoleScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "application" => Ok(RoleScope::Application),
            "tenant" => Ok(RoleScope::Tenant),
            "resource" => Ok(RoleScope::Resource),
            _ => Err(format!("Unknown role scope: {}", s)),
        }
    }
}

/// How a grant came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantType {
    /// Created explicitly for a subject
    Direct,
    /// Materialized from a parent resource
    Inherited,
    /// Expanded from a role's permission set onto a user
    Delegated,
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrantType::Direct => write!(f, "direct"),
            GrantType::Inherited => write!(f, "inherited"),
            GrantType::Delegated => write!(f, "delegated"),
        }
    }
}

impl std::str::FromStr for GrantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(GrantType::Direct),
            "inherited" => Ok(GrantType::Inherited),
            "delegated" => Ok(GrantType::Delegated),
            _ => Err(format!("Unknown grant type: {}", s)),
        }
    }
}

/// Kind of membership tying a user to an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipType {
    Member,
    Admin,
    Guest,
}

impl std::fmt::Display for MembershipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipType::Member => write!(f, "member"),
            MembershipType::Admin => write!(f, "admin"),
            MembershipType::Guest => write!(f, "guest"),
        }
    }
}

impl std::str::FromStr for MembershipType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "member" => Ok(MembershipType::Member),
            "admin" => Ok(MembershipType::Admin),
            "guest" => Ok(MembershipType::Guest),
            _ => Err(format!("Unknown membership type: {}", s)),
        }
    }
}

/// Subject of a grant: exactly one of a user or a role.
///
/// Modeling this as an enum makes the "both or neither" state unrepresentable
/// in the engine; the `InvalidGrantTarget` error remains for store backends
/// and API layers whose raw records can still carry ambiguous data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectRef {
    User(String),
    Role(String),
}

impl SubjectRef {
    pub fn user<S: Into<String>>(id: S) -> Self {
        SubjectRef::User(id.into())
    }

    pub fn role<S: Into<String>>(id: S) -> Self {
        SubjectRef::Role(id.into())
    }

    pub fn as_user(&self) -> Option<&str> {
        match self {
            SubjectRef::User(id) => Some(id),
            SubjectRef::Role(_) => None,
        }
    }

    pub fn as_role(&self) -> Option<&str> {
        match self {
            SubjectRef::Role(id) => Some(id),
            SubjectRef::User(_) => None,
        }
    }
}

impl std::fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectRef::User(id) => write!(f, "user:{}", id),
            SubjectRef::Role(id) => write!(f, "role:{}", id),
        }
    }
}

/// A named capability, optionally scoped to a resource type.
///
/// Immutable once created aside from the `is_active` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub id: String,
    /// Unique within the optional `resource_type` scope
    pub name: String,
    /// None means the permission is global
    pub resource_type: Option<String>,
    pub is_system: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn new(name: &str, resource_type: Option<&str>, is_system: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            resource_type: resource_type.map(|t| t.to_string()),
            is_system,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// A named bundle of permissions.
///
/// Roles are flat: the effective permission set is exactly `permission_ids`,
/// with no role-to-role inheritance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    /// None means the role is system-wide
    pub tenant_id: Option<String>,
    pub scope: RoleScope,
    pub permission_ids: HashSet<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub fn new(name: &str, tenant_id: Option<&str>, scope: RoleScope) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            tenant_id: tenant_id.map(|t| t.to_string()),
            scope,
            permission_ids: HashSet::new(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_permissions<I>(mut self, permission_ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.permission_ids.extend(permission_ids);
        self
    }

    /// Whether this role applies within the given tenant
    pub fn applies_to_tenant(&self, tenant_id: &str) -> bool {
        match &self.tenant_id {
            Some(t) => t == tenant_id,
            None => true,
        }
    }
}

/// An entity access decisions are made about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub resource_type: String,
    pub owner_id: String,
    pub tenant_id: String,
    pub organization_id: Option<String>,
    /// Self-reference forming the hierarchy; the store does not guarantee
    /// acyclicity, so every traversal carries a visited set
    pub parent_id: Option<String>,
    pub is_public: bool,
    /// Permission names allowed for anonymous access while public
    pub public_permissions: HashSet<String>,
    pub public_link_token: Option<String>,
    pub public_link_expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(name: &str, resource_type: &str, owner_id: &str, tenant_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            owner_id: owner_id.to_string(),
            tenant_id: tenant_id.to_string(),
            organization_id: None,
            parent_id: None,
            is_public: false,
            public_permissions: HashSet::new(),
            public_link_token: None,
            public_link_expires_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_organization(mut self, organization_id: &str) -> Self {
        self.organization_id = Some(organization_id.to_string());
        self
    }

    /// Whether the public link token is usable at the given instant
    pub fn link_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.public_link_token.is_some()
            && self
                .public_link_expires_at
                .map_or(true, |expires| expires > now)
    }
}

/// An explicit allow record binding a subject to a permission on a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: String,
    pub resource_id: String,
    pub subject: SubjectRef,
    pub permission_id: String,
    pub grant_type: GrantType,
    pub granted_by: String,
    pub tenant_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    pub fn new(
        resource_id: &str,
        subject: SubjectRef,
        permission_id: &str,
        grant_type: GrantType,
        granted_by: &str,
        tenant_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            subject,
            permission_id: permission_id.to_string(),
            grant_type,
            granted_by: granted_by.to_string(),
            tenant_id: tenant_id.to_string(),
            expires_at,
            is_active: true,
            revoked_at: None,
            revoked_by: None,
            reason: None,
            created_at: Utc::now(),
        }
    }

    /// Grant validity is evaluated lazily at decision time; expired grants
    /// are never swept, they simply stop matching here.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.revoked_at.is_none()
            && self.expires_at.map_or(true, |expires| expires > now)
    }

    /// Mark this grant revoked, stamping actor and reason
    pub fn revoke(&mut self, revoked_by: &str, reason: &str, now: DateTime<Utc>) {
        self.is_active = false;
        self.revoked_at = Some(now);
        self.revoked_by = Some(revoked_by.to_string());
        self.reason = Some(reason.to_string());
    }
}

/// Ties a user to organization-scoped roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: String,
    pub organization_id: String,
    pub role_id: Option<String>,
    pub membership_type: MembershipType,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(user_id: &str, organization_id: &str, membership_type: MembershipType) -> Self {
        Self {
            user_id: user_id.to_string(),
            organization_id: organization_id.to_string(),
            role_id: None,
            membership_type,
            is_active: true,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_role(mut self, role_id: &str) -> Self {
        self.role_id = Some(role_id.to_string());
        self
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// Outcome recorded on an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    /// A decision resolved to allow
    Allowed,
    /// A decision resolved to deny
    Denied,
    /// A mutation completed
    Succeeded,
    /// A mutation was rejected
    Rejected,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditOutcome::Allowed => write!(f, "allowed"),
            AuditOutcome::Denied => write!(f, "denied"),
            AuditOutcome::Succeeded => write!(f, "succeeded"),
            AuditOutcome::Rejected => write!(f, "rejected"),
        }
    }
}

/// Immutable, append-only record of a decision or mutation.
///
/// The decision path never reads audit events back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// None for anonymous callers
    pub actor: Option<String>,
    pub action: String,
    pub resource_id: Option<String>,
    pub permission: Option<String>,
    pub tenant_id: Option<String>,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl AuditEvent {
    /// Record an allow/deny decision
    pub fn decision(
        actor: Option<&str>,
        action: &str,
        resource_id: &str,
        permission: &str,
        tenant_id: &str,
        allowed: bool,
        reason: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.map(|a| a.to_string()),
            action: action.to_string(),
            resource_id: Some(resource_id.to_string()),
            permission: Some(permission.to_string()),
            tenant_id: Some(tenant_id.to_string()),
            outcome: if allowed {
                AuditOutcome::Allowed
            } else {
                AuditOutcome::Denied
            },
            reason: Some(reason.to_string()),
            metadata: HashMap::new(),
        }
    }

    /// Record a mutation (grant, revoke, publish, hierarchy change)
    pub fn mutation(
        actor: &str,
        action: &str,
        resource_id: &str,
        tenant_id: &str,
        succeeded: bool,
        reason: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: Some(actor.to_string()),
            action: action.to_string(),
            resource_id: Some(resource_id.to_string()),
            permission: None,
            tenant_id: Some(tenant_id.to_string()),
            outcome: if succeeded {
                AuditOutcome::Succeeded
            } else {
                AuditOutcome::Rejected
            },
            reason: reason.map(|r| r.to_string()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_permission(mut self, permission: &str) -> Self {
        self.permission = Some(permission.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}
