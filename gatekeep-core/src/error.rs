//! Unified error handling system
//!
//! Provides structured error types with context, recovery suggestions, and proper error chaining.
//!
//! Decision-path operations (permission checks) never surface these errors to callers:
//! the resolver converts every fault into a deny and records the reason through the
//! audit sink. Mutation-path operations (grant, revoke, publish, set_parent) return
//! `GatekeepResult` so callers can distinguish rejection from success.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

pub type GatekeepResult<T> = Result<T, GatekeepError>;

/// Error context providing additional information for debugging and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Unique error ID for tracking
    pub error_id: String,
    /// Timestamp when error occurred
    pub timestamp: DateTime<Utc>,
    /// Component where error originated
    pub component: String,
    /// Operation being performed when error occurred
    pub operation: Option<String>,
    /// Additional metadata
    pub metadata: std::collections::HashMap<String, String>,
    /// Recovery suggestions
    pub recovery_suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(component: &str) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            component: component.to_string(),
            operation: None,
            metadata: std::collections::HashMap::new(),
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.recovery_suggestions.push(suggestion.to_string());
        self
    }
}

/// Main error type for the Gatekeep system
#[derive(Error, Debug)]
pub enum GatekeepError {
    /// A referenced entity (resource, permission, role, grant) does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
        context: ErrorContext,
    },

    /// The resource belongs to a different tenant than the caller asserted
    #[error("Tenant mismatch for resource {resource_id}")]
    TenantMismatch {
        resource_id: String,
        asserted_tenant: String,
        context: ErrorContext,
    },

    /// A grant subject was neither a user nor a role, or was both at once
    #[error("Invalid grant target: {message}")]
    InvalidGrantTarget {
        message: String,
        context: ErrorContext,
    },

    /// A hierarchy mutation or traversal would create/encounter a cycle
    #[error("Hierarchy cycle detected at resource {resource_id}")]
    CycleDetected {
        resource_id: String,
        context: ErrorContext,
    },

    /// The acting subject is not allowed to perform this mutation
    #[error("Permission denied for resource {resource_id}: {reason}")]
    PermissionDenied {
        resource_id: String,
        reason: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        context: ErrorContext,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Operation timeout: {operation}")]
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatekeepError {
    /// Get the error context
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            GatekeepError::NotFound { context, .. } => Some(context),
            GatekeepError::TenantMismatch { context, .. } => Some(context),
            GatekeepError::InvalidGrantTarget { context, .. } => Some(context),
            GatekeepError::CycleDetected { context, .. } => Some(context),
            GatekeepError::PermissionDenied { context, .. } => Some(context),
            GatekeepError::Validation { context, .. } => Some(context),
            GatekeepError::Storage { context, .. } => Some(context),
            GatekeepError::Timeout { context, .. } => Some(context),
            GatekeepError::Config { context, .. } => Some(context),
            GatekeepError::Internal { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Check if error is recoverable (retry may help)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GatekeepError::Storage { .. } | GatekeepError::Timeout { .. }
        )
    }

    /// Short machine-readable reason for audit records
    pub fn audit_reason(&self) -> &'static str {
        match self {
            GatekeepError::NotFound { .. } => "not_found",
            GatekeepError::TenantMismatch { .. } => "tenant_mismatch",
            GatekeepError::InvalidGrantTarget { .. } => "invalid_grant_target",
            GatekeepError::CycleDetected { .. } => "cycle_detected",
            GatekeepError::PermissionDenied { .. } => "permission_denied",
            GatekeepError::Validation { .. } => "validation_failed",
            GatekeepError::Storage { .. } => "storage_error",
            GatekeepError::Timeout { .. } => "store_timeout",
            GatekeepError::Config { .. } => "config_error",
            GatekeepError::Internal { .. } => "internal_error",
            GatekeepError::Io(_) => "io_error",
            GatekeepError::Serialization(_) => "serialization_error",
        }
    }

    /// Log the error with appropriate level
    pub fn log(&self) {
        match self {
            GatekeepError::Internal { .. } | GatekeepError::Config { .. } => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Error occurred"
                );
            }
            GatekeepError::Storage { .. } | GatekeepError::Timeout { .. } => {
                warn!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Storage or timeout error (may be recoverable)"
                );
            }
            _ => {
                warn!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Operation rejected"
                );
            }
        }
    }

    // Convenience constructors for the common variants

    pub fn not_found(entity: &str, id: &str, component: &str) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
            context: ErrorContext::new(component)
                .with_suggestion("Verify the identifier and tenant"),
        }
    }

    pub fn tenant_mismatch(resource_id: &str, asserted_tenant: &str, component: &str) -> Self {
        Self::TenantMismatch {
            resource_id: resource_id.to_string(),
            asserted_tenant: asserted_tenant.to_string(),
            context: ErrorContext::new(component),
        }
    }

    pub fn cycle_detected(resource_id: &str, component: &str) -> Self {
        Self::CycleDetected {
            resource_id: resource_id.to_string(),
            context: ErrorContext::new(component)
                .with_suggestion("Detach the resource from its parent before reattaching"),
        }
    }

    pub fn permission_denied(resource_id: &str, reason: &str, component: &str) -> Self {
        Self::PermissionDenied {
            resource_id: resource_id.to_string(),
            reason: reason.to_string(),
            context: ErrorContext::new(component),
        }
    }

    pub fn invalid_grant_target(message: &str, component: &str) -> Self {
        Self::InvalidGrantTarget {
            message: message.to_string(),
            context: ErrorContext::new(component)
                .with_suggestion("Supply exactly one of user_id or role_id"),
        }
    }

    pub fn validation(message: &str, field: Option<&str>, component: &str) -> Self {
        Self::Validation {
            message: message.to_string(),
            field: field.map(|f| f.to_string()),
            context: ErrorContext::new(component),
        }
    }

    pub fn storage<E>(message: &str, source: E, component: &str) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            message: message.to_string(),
            source: Some(Box::new(source)),
            context: ErrorContext::new(component),
        }
    }

    pub fn internal(message: &str, component: &str) -> Self {
        Self::Internal {
            message: message.to_string(),
            source: None,
            context: ErrorContext::new(component),
        }
    }
}
