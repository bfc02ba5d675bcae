use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    Active,
    Suspended,
    Archived,
}

/// A customer organization. Exactly one system tenant exists and is
/// seeded at bootstrap; it cannot be mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub status: TenantStatus,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceType {
    System,
    Client,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    Active,
    Suspended,
    Archived,
}

/// A unit of template ownership under a tenant. The single global SYSTEM
/// workspace has no tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub code: String,
    pub name: String,
    pub workspace_type: WorkspaceType,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn is_global(&self) -> bool {
        self.tenant_id.is_none()
    }
}

/// Membership role within a workspace, strongest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceRole {
    Viewer,
    Operator,
    Editor,
    Admin,
    Owner,
}

impl WorkspaceRole {
    pub fn at_least(&self, other: WorkspaceRole) -> bool {
        *self >= other
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantRole {
    TenantAdmin,
    TenantOwner,
}

/// Tenant-independent platform roles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemRole {
    PlatformAdmin,
    Superadmin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    /// Subject claim of the identity provider the user signed in with.
    pub subject: String,
    pub email: String,
    pub display_name: String,
    pub system_role: Option<SystemRole>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceMember {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub role: WorkspaceRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantMember {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role: TenantRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessEntityType {
    Tenant,
    Workspace,
}

/// Append-only record ordering "recent" listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub entity_type: AccessEntityType,
    pub entity_id: Uuid,
    pub accessed_at: DateTime<Utc>,
}

/// Validates a short organizational code: upper-case alphanumerics and
/// `_`, within the length bounds, with no leading, trailing or doubled
/// underscore.
pub fn validate_short_code(code: &str, min: usize, max: usize) -> Result<()> {
    let fail = |why: &str| {
        Err(EngineError::Validation(format!("code `{code}` {why}")))
    };
    if code.len() < min || code.len() > max {
        return fail(&format!("must be {min}-{max} characters"));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return fail("may only contain A-Z, 0-9 and `_`");
    }
    if code.starts_with('_') || code.ends_with('_') {
        return fail("may not start or end with `_`");
    }
    if code.contains("__") {
        return fail("may not contain doubled `_`");
    }
    Ok(())
}

/// Tenant codes are 2-10 characters.
pub fn validate_tenant_code(code: &str) -> Result<()> {
    validate_short_code(code, 2, 10)
}

/// Classification codes are up to 50 characters.
pub fn validate_classification_code(code: &str) -> Result<()> {
    validate_short_code(code, 1, 50)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_code_rules() {
        validate_tenant_code("ACME").unwrap();
        validate_tenant_code("A_2B").unwrap();
        assert!(validate_tenant_code("A").is_err(), "too short");
        assert!(validate_tenant_code("ABCDEFGHIJK").is_err(), "too long");
        assert!(validate_tenant_code("acme").is_err(), "lower case");
        assert!(validate_tenant_code("_AB").is_err(), "leading underscore");
        assert!(validate_tenant_code("AB_").is_err(), "trailing underscore");
        assert!(validate_tenant_code("A__B").is_err(), "doubled underscore");
    }

    #[test]
    fn classification_code_rules() {
        validate_classification_code("INVOICE").unwrap();
        validate_classification_code("CREDIT_NOTE_2").unwrap();
        assert!(validate_classification_code(&"X".repeat(51)).is_err());
    }

    #[test]
    fn workspace_role_ordering() {
        assert!(WorkspaceRole::Owner.at_least(WorkspaceRole::Editor));
        assert!(WorkspaceRole::Editor.at_least(WorkspaceRole::Editor));
        assert!(!WorkspaceRole::Viewer.at_least(WorkspaceRole::Operator));
    }
}
