//! Role checks for emergency operations. Identity itself is established
//! upstream; this module only decides what a role may do.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    SchoolAdmin,
    Staff,
    Guardian,
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "super_admin" => Ok(Role::SuperAdmin),
            "school_admin" => Ok(Role::SchoolAdmin),
            "staff" => Ok(Role::Staff),
            "guardian" => Ok(Role::Guardian),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

pub trait Authorization: Send + Sync {
    fn can_initiate(&self, role: Role) -> bool;
    fn can_resolve(&self, role: Role, initiated_by: &str, user_id: &str) -> bool;
    fn can_cancel(&self, role: Role) -> bool;
}

/// Administrators can do everything; the initiating user may also resolve.
#[derive(Clone, Copy, Debug, Default)]
pub struct RolePolicy;

impl RolePolicy {
    fn is_admin(role: Role) -> bool {
        matches!(role, Role::SuperAdmin | Role::SchoolAdmin)
    }
}

impl Authorization for RolePolicy {
    fn can_initiate(&self, role: Role) -> bool {
        Self::is_admin(role)
    }

    fn can_resolve(&self, role: Role, initiated_by: &str, user_id: &str) -> bool {
        Self::is_admin(role) || initiated_by == user_id
    }

    fn can_cancel(&self, role: Role) -> bool {
        Self::is_admin(role)
    }
}
