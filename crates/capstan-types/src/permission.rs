//! Permission hierarchy.
//!
//! Capabilities declare the [`Permission`] they require; callers carry a
//! [`PermissionLevel`] tier.  A tier *reaches* a permission when the
//! permission appears in the tier's reachable set:
//!
//! | Tier | Reachable permissions |
//! |---|---|
//! | `guest` | `read` |
//! | `user`  | `read`, `write`, `execute` |
//! | `admin` | `read`, `write`, `execute`, `admin` |
//!
//! Each tier's set is a superset of every lower tier's set.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The permission a capability requires before it may be executed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Execute,
    /// Highest tier.  Executions requiring it are audited.
    Admin,
}

impl Permission {
    pub const ALL: [Permission; 4] = [
        Permission::Read,
        Permission::Write,
        Permission::Execute,
        Permission::Admin,
    ];

    /// `true` for the top of the hierarchy.
    pub fn is_highest_tier(self) -> bool {
        self == Permission::Admin
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Execute => "execute",
            Permission::Admin => "admin",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "execute" => Ok(Permission::Execute),
            "admin" => Ok(Permission::Admin),
            other => Err(format!("unknown permission '{other}'")),
        }
    }
}

/// The tier a caller is operating at.  Ordered: `Guest < User < Admin`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    #[default]
    Guest,
    User,
    Admin,
}

impl PermissionLevel {
    pub const ALL: [PermissionLevel; 3] = [
        PermissionLevel::Guest,
        PermissionLevel::User,
        PermissionLevel::Admin,
    ];

    /// The permissions reachable from this tier.
    pub fn permissions(self) -> &'static [Permission] {
        match self {
            PermissionLevel::Guest => &[Permission::Read],
            PermissionLevel::User => &[Permission::Read, Permission::Write, Permission::Execute],
            PermissionLevel::Admin => &Permission::ALL,
        }
    }

    /// Return `true` when `required` is reachable from this tier.
    ///
    /// ```
    /// use capstan_types::{Permission, PermissionLevel};
    ///
    /// assert!(PermissionLevel::Guest.reaches(Permission::Read));
    /// assert!(!PermissionLevel::User.reaches(Permission::Admin));
    /// assert!(PermissionLevel::Admin.reaches(Permission::Admin));
    /// ```
    pub fn reaches(self, required: Permission) -> bool {
        self.permissions().contains(&required)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::Guest => "guest",
            PermissionLevel::User => "user",
            PermissionLevel::Admin => "admin",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guest" => Ok(PermissionLevel::Guest),
            "user" => Ok(PermissionLevel::User),
            "admin" => Ok(PermissionLevel::Admin),
            other => Err(format!("unknown permission level '{other}'")),
        }
    }
}
