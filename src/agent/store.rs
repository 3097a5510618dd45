//! Catalog stand-in: users, their secrets and zone topology.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::auth::digest::challenge_response;
use crate::auth::{Challenge, HashScheme, Password};
use crate::config::AgentConfig;
use crate::error::{ErrorCode, GridError, Result};
use crate::identity::UserType;

/// A catalog account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Account name
    pub name: String,
    /// Home zone
    pub zone: String,
    /// Account type
    pub user_type: UserType,
}

/// One secret accepted for an account.
#[derive(Debug, Clone)]
pub struct StoredSecret {
    /// Secret bytes
    pub password: Password,
    /// Expiry of a limited password; `None` for the permanent one
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredSecret {
    /// Check if the secret has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Check if this is a limited password.
    pub fn is_limited(&self) -> bool {
        self.expires_at.is_some()
    }
}

/// Which catalog is authoritative for a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogLocation {
    /// This agent's catalog
    Local,
    /// A federated zone's catalog
    Remote,
}

/// Credential lookups the agent performs during authentication.
pub trait CredentialStore: Send + Sync {
    /// Account `name#zone`.
    fn user(&self, name: &str, zone: &str) -> Option<UserRecord>;

    /// Secrets accepted for `name#zone`.
    fn secrets(&self, name: &str, zone: &str) -> Vec<StoredSecret>;

    /// Record a limited password for `name#zone`.
    fn add_limited_password(
        &self,
        name: &str,
        zone: &str,
        password: Password,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Catalog authoritative for `zone`.
    fn catalog_location(&self, zone: &str) -> CatalogLocation;

    /// Digest the remote catalog of `zone` returned for `challenge`, base64.
    ///
    /// `None` when the remote side provided none.
    fn remote_server_response(
        &self,
        zone: &str,
        challenge: &Challenge,
        scheme: HashScheme,
    ) -> Option<String>;
}

#[derive(Debug, Clone)]
struct Account {
    record: UserRecord,
    secrets: Vec<StoredSecret>,
}

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<(String, String), Account>,
    remote_zones: HashMap<String, Option<String>>,
}

/// In-memory [`CredentialStore`].
#[derive(Debug)]
pub struct MemoryCredentialStore {
    local_zone: String,
    inner: RwLock<Inner>,
}

impl MemoryCredentialStore {
    /// Empty store for `local_zone`.
    pub fn new(local_zone: impl Into<String>) -> Self {
        Self {
            local_zone: local_zone.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Store holding the accounts listed in `config`.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let store = Self::new(&config.local_zone);
        for entry in &config.users {
            let zone = entry.zone.as_deref().unwrap_or(&config.local_zone);
            store.add_user(&entry.name, zone, entry.user_type, &entry.password)?;
        }
        Ok(store)
    }

    /// Add or replace an account with a permanent password.
    pub fn add_user(&self, name: &str, zone: &str, user_type: UserType, password: &str) -> Result<()> {
        let password = Password::new(password)?;
        let account = Account {
            record: UserRecord {
                name: name.to_string(),
                zone: zone.to_string(),
                user_type,
            },
            secrets: vec![StoredSecret {
                password,
                expires_at: None,
            }],
        };
        self.write()
            .accounts
            .insert((name.to_string(), zone.to_string()), account);
        Ok(())
    }

    /// Declare `zone` federated.
    ///
    /// `sid` is what the remote catalog signs its responses with; `None`
    /// models a remote catalog that sends no response.
    pub fn add_remote_zone(&self, zone: &str, sid: Option<&str>) {
        self.write()
            .remote_zones
            .insert(zone.to_string(), sid.map(str::to_string));
    }

    /// Set the expiry of every limited password of `name#zone`.
    pub fn expire_limited_passwords(&self, name: &str, zone: &str, at: DateTime<Utc>) {
        if let Some(account) = self
            .write()
            .accounts
            .get_mut(&(name.to_string(), zone.to_string()))
        {
            for secret in account.secrets.iter_mut().filter(|s| s.is_limited()) {
                secret.expires_at = Some(at);
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn user(&self, name: &str, zone: &str) -> Option<UserRecord> {
        self.read()
            .accounts
            .get(&(name.to_string(), zone.to_string()))
            .map(|account| account.record.clone())
    }

    fn secrets(&self, name: &str, zone: &str) -> Vec<StoredSecret> {
        self.read()
            .accounts
            .get(&(name.to_string(), zone.to_string()))
            .map(|account| account.secrets.clone())
            .unwrap_or_default()
    }

    fn add_limited_password(
        &self,
        name: &str,
        zone: &str,
        password: Password,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.write();
        let account = inner
            .accounts
            .get_mut(&(name.to_string(), zone.to_string()))
            .ok_or_else(|| {
                GridError::auth(
                    ErrorCode::CAT_INVALID_USER,
                    format!("no such user {name}#{zone}"),
                )
            })?;
        let now = Utc::now();
        account.secrets.retain(|s| !s.is_expired(now));
        account.secrets.push(StoredSecret {
            password,
            expires_at: Some(expires_at),
        });
        debug!("Recorded limited password for {}#{} until {}", name, zone, expires_at);
        Ok(())
    }

    fn catalog_location(&self, zone: &str) -> CatalogLocation {
        if zone != self.local_zone && self.read().remote_zones.contains_key(zone) {
            CatalogLocation::Remote
        } else {
            CatalogLocation::Local
        }
    }

    fn remote_server_response(
        &self,
        zone: &str,
        challenge: &Challenge,
        scheme: HashScheme,
    ) -> Option<String> {
        let sid = self.read().remote_zones.get(zone).cloned().flatten()?;
        if sid.is_empty() {
            return Some(String::new());
        }
        challenge_response(scheme, challenge, sid.as_bytes())
            .ok()
            .map(|response| response.to_base64())
    }
}
