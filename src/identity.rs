//! User identities and privilege levels.
//!
//! A connection tracks two identities: the *proxy* user that authenticates
//! and the *client* user it acts for. They are usually the same person; an
//! agent redirecting on behalf of a user authenticates as itself (proxy) for
//! that user (client).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, GridError, Result};

/// Name of the anonymous account; it authenticates with an empty password.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Catalog account type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    /// Administrator
    RodsAdmin,
    /// Regular user
    RodsUser,
    /// Group administrator (regular privileges)
    GroupAdmin,
}

impl UserType {
    /// Get type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RodsAdmin => "rodsadmin",
            Self::RodsUser => "rodsuser",
            Self::GroupAdmin => "groupadmin",
        }
    }
}

impl FromStr for UserType {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rodsadmin" => Ok(Self::RodsAdmin),
            "rodsuser" => Ok(Self::RodsUser),
            "groupadmin" => Ok(Self::GroupAdmin),
            _ => Err(GridError::Config(format!("Unknown user type: {s}"))),
        }
    }
}

/// Authorization tier resolved after authentication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrivilegeLevel {
    /// Not authenticated
    #[default]
    NoUser = 0,
    /// Regular user of another zone
    RemoteUser = 1,
    /// Regular user of this zone
    LocalUser = 2,
    /// Administrator of another zone
    RemotePrivUser = 3,
    /// Administrator of this zone
    LocalPrivUser = 5,
}

impl PrivilegeLevel {
    /// Level granted to a local account of `user_type`.
    pub fn for_user_type(user_type: UserType) -> Self {
        match user_type {
            UserType::RodsAdmin => Self::LocalPrivUser,
            UserType::RodsUser | UserType::GroupAdmin => Self::LocalUser,
        }
    }

    /// The same tier seen from a foreign catalog.
    pub fn to_remote(self) -> Self {
        match self {
            Self::LocalPrivUser => Self::RemotePrivUser,
            Self::LocalUser => Self::RemoteUser,
            other => other,
        }
    }

    /// The same tier seen from the user's home catalog.
    pub fn to_local(self) -> Self {
        match self {
            Self::RemotePrivUser => Self::LocalPrivUser,
            Self::RemoteUser => Self::LocalUser,
            other => other,
        }
    }

    /// Check if the level carries administrator rights.
    pub fn is_privileged(self) -> bool {
        matches!(self, Self::LocalPrivUser | Self::RemotePrivUser)
    }

    /// Numeric wire value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoUser => "NO_USER_AUTH",
            Self::RemoteUser => "REMOTE_USER_AUTH",
            Self::LocalUser => "LOCAL_USER_AUTH",
            Self::RemotePrivUser => "REMOTE_PRIV_USER_AUTH",
            Self::LocalPrivUser => "LOCAL_PRIV_USER_AUTH",
        };
        f.write_str(name)
    }
}

/// A user as seen by one side of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserIdentity {
    /// Account name
    pub name: String,
    /// Home zone
    pub zone: String,
    /// Account type, once known
    pub user_type: Option<UserType>,
    /// Resolved privilege
    pub privilege: PrivilegeLevel,
}

impl UserIdentity {
    /// Identity with unresolved privilege.
    pub fn new(name: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: zone.into(),
            user_type: None,
            privilege: PrivilegeLevel::NoUser,
        }
    }

    /// Check if this is the anonymous account.
    pub fn is_anonymous(&self) -> bool {
        self.name == ANONYMOUS_USER
    }

    /// `name#zone` form.
    pub fn qualified(&self) -> String {
        format!("{}#{}", self.name, self.zone)
    }
}

/// Inputs to [`resolve_privileges`].
#[derive(Debug, Clone, Copy)]
pub struct PrivilegeInputs<'a> {
    /// Level from the catalog for the proxy user
    pub proxy_level: PrivilegeLevel,
    /// Level from the catalog for the client user
    pub client_level: PrivilegeLevel,
    /// Proxy user name
    pub proxy_name: &'a str,
    /// Client user name
    pub client_name: &'a str,
    /// Whether the catalog that checked the proxy belongs to another zone
    pub catalog_is_remote: bool,
    /// Whether the client user's zone is this agent's zone
    pub client_zone_is_local: bool,
}

/// Resolve (proxy, client) privilege levels, remapping tiers across zones.
///
/// A proxy acting for a different client must be privileged.
pub fn resolve_privileges(inputs: PrivilegeInputs<'_>) -> Result<(PrivilegeLevel, PrivilegeLevel)> {
    let same_user = inputs.proxy_name == inputs.client_name;
    let mut proxy = inputs.proxy_level;
    let mut client = inputs.client_level;

    if inputs.catalog_is_remote {
        proxy = proxy.to_remote();
        if same_user {
            client = proxy;
        } else if inputs.client_zone_is_local {
            client = client.to_local();
        } else {
            // A user of a foreign zone never holds privileges here.
            client = match client {
                PrivilegeLevel::NoUser => PrivilegeLevel::NoUser,
                _ => PrivilegeLevel::RemoteUser,
            };
        }
    } else if same_user {
        client = proxy;
    }

    if !same_user && proxy != PrivilegeLevel::LocalPrivUser {
        return Err(GridError::auth(
            ErrorCode::CAT_INSUFFICIENT_PRIVILEGE_LEVEL,
            format!(
                "proxy user {} ({}) may not act for {}",
                inputs.proxy_name, proxy, inputs.client_name
            ),
        ));
    }

    Ok((proxy, client))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(proxy: &'a str, client: &'a str) -> PrivilegeInputs<'a> {
        PrivilegeInputs {
            proxy_level: PrivilegeLevel::LocalUser,
            client_level: PrivilegeLevel::LocalUser,
            proxy_name: proxy,
            client_name: client,
            catalog_is_remote: false,
            client_zone_is_local: true,
        }
    }

    #[test]
    fn test_same_user_local_catalog() {
        let mut input = inputs("alice", "alice");
        input.proxy_level = PrivilegeLevel::LocalPrivUser;
        input.client_level = PrivilegeLevel::NoUser;
        let (proxy, client) = resolve_privileges(input).unwrap();
        assert_eq!(proxy, PrivilegeLevel::LocalPrivUser);
        assert_eq!(client, PrivilegeLevel::LocalPrivUser);
    }

    #[test]
    fn test_remote_catalog_demotes_tiers() {
        let mut input = inputs("alice", "alice");
        input.catalog_is_remote = true;
        input.proxy_level = PrivilegeLevel::LocalPrivUser;
        let (proxy, client) = resolve_privileges(input).unwrap();
        assert_eq!(proxy, PrivilegeLevel::RemotePrivUser);
        assert_eq!(client, PrivilegeLevel::RemotePrivUser);

        let mut input = inputs("bob", "bob");
        input.catalog_is_remote = true;
        let (proxy, _) = resolve_privileges(input).unwrap();
        assert_eq!(proxy, PrivilegeLevel::RemoteUser);
    }

    #[test]
    fn test_unprivileged_proxy_rejected() {
        let err = resolve_privileges(inputs("bob", "carol")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CAT_INSUFFICIENT_PRIVILEGE_LEVEL);
    }

    #[test]
    fn test_privileged_proxy_keeps_client_level() {
        let mut input = inputs("agent", "carol");
        input.proxy_level = PrivilegeLevel::LocalPrivUser;
        input.client_level = PrivilegeLevel::LocalUser;
        let (proxy, client) = resolve_privileges(input).unwrap();
        assert_eq!(proxy, PrivilegeLevel::LocalPrivUser);
        assert_eq!(client, PrivilegeLevel::LocalUser);
    }

    #[test]
    fn test_remote_catalog_proxy_cannot_act_for_others() {
        let mut input = inputs("agent", "carol");
        input.catalog_is_remote = true;
        input.proxy_level = PrivilegeLevel::LocalPrivUser;
        let err = resolve_privileges(input).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CAT_INSUFFICIENT_PRIVILEGE_LEVEL);
    }

    #[test]
    fn test_tier_mapping() {
        assert_eq!(
            PrivilegeLevel::LocalUser.to_remote(),
            PrivilegeLevel::RemoteUser
        );
        assert_eq!(
            PrivilegeLevel::RemotePrivUser.to_local(),
            PrivilegeLevel::LocalPrivUser
        );
        assert_eq!(PrivilegeLevel::NoUser.to_remote(), PrivilegeLevel::NoUser);
        assert!(PrivilegeLevel::RemotePrivUser.is_privileged());
        assert_eq!(PrivilegeLevel::LocalPrivUser.as_i32(), 5);
    }

    #[test]
    fn test_identity_helpers() {
        let id = UserIdentity::new("anonymous", "tempZone");
        assert!(id.is_anonymous());
        assert_eq!(id.qualified(), "anonymous#tempZone");
        assert_eq!(
            "rodsadmin".parse::<UserType>().unwrap(),
            UserType::RodsAdmin
        );
    }
}
