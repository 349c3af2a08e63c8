//! Persistence collaborator: user accounts, agent sessions, and a config
//! key/value store with expiry.
//!
//! The relay engine only ever talks to [`RelayStore`]; every call is treated
//! as an atomic external operation. Multi-step flows (find-or-create during
//! first-time auth) are intentionally not wrapped in a transaction here, so
//! the duplicate-account race under concurrent first logins is a property of
//! the trait contract, not of any one backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{RelayError, Result};

/// A relay account: one platform end-user plus their durable credential.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: i64,
    pub platform_user_id: String,
    pub credential: String,
    pub credential_expires_at: DateTime<Utc>,
    pub live_connection: bool,
    pub last_seen: DateTime<Utc>,
}

/// One authenticated agent connection, keyed by its connection id.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub account_id: i64,
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
}

#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn get_user_by_credential(&self, credential: &str) -> Result<Option<UserRecord>>;
    async fn get_user_by_platform_id(&self, platform_user_id: &str)
        -> Result<Option<UserRecord>>;
    async fn create_user(
        &self,
        platform_user_id: &str,
        credential: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<UserRecord>;
    async fn update_user_credential(
        &self,
        account_id: i64,
        credential: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn set_live_connection(&self, account_id: i64, live: bool) -> Result<()>;

    /// Register a connection's session, replacing any prior record for the
    /// same connection id.
    async fn create_session(&self, account_id: i64, connection_id: &str) -> Result<()>;
    async fn delete_session(&self, connection_id: &str) -> Result<()>;
    async fn get_session(&self, connection_id: &str) -> Result<Option<SessionRecord>>;

    async fn get_config_with_expiry(&self, key: &str) -> Result<Option<String>>;
    async fn set_config(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()>;
    async fn delete_config(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct ConfigEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    users: Vec<UserRecord>,
    sessions: Vec<SessionRecord>,
    config: Vec<(String, ConfigEntry)>,
}

/// In-memory [`RelayStore`] backing the binary and the test suites.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn get_user_by_credential(&self, credential: &str) -> Result<Option<UserRecord>> {
        let now = Utc::now();
        let inner = self.inner.lock();
        Ok(inner
            .users
            .iter()
            .find(|u| u.credential == credential && u.credential_expires_at > now)
            .cloned())
    }

    async fn get_user_by_platform_id(
        &self,
        platform_user_id: &str,
    ) -> Result<Option<UserRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .users
            .iter()
            .find(|u| u.platform_user_id == platform_user_id)
            .cloned())
    }

    async fn create_user(
        &self,
        platform_user_id: &str,
        credential: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<UserRecord> {
        let mut inner = self.inner.lock();
        if inner
            .users
            .iter()
            .any(|u| u.platform_user_id == platform_user_id)
        {
            return Err(RelayError::Store(format!(
                "user exists for platform id {platform_user_id}"
            )));
        }
        inner.next_id += 1;
        let record = UserRecord {
            id: inner.next_id,
            platform_user_id: platform_user_id.to_string(),
            credential: credential.to_string(),
            credential_expires_at: expires_at,
            live_connection: false,
            last_seen: Utc::now(),
        };
        inner.users.push(record.clone());
        Ok(record)
    }

    async fn update_user_credential(
        &self,
        account_id: i64,
        credential: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .iter_mut()
            .find(|u| u.id == account_id)
            .ok_or_else(|| RelayError::Store(format!("no account {account_id}")))?;
        user.credential = credential.to_string();
        user.credential_expires_at = expires_at;
        Ok(())
    }

    async fn set_live_connection(&self, account_id: i64, live: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .iter_mut()
            .find(|u| u.id == account_id)
            .ok_or_else(|| RelayError::Store(format!("no account {account_id}")))?;
        user.live_connection = live;
        user.last_seen = Utc::now();
        Ok(())
    }

    async fn create_session(&self, account_id: i64, connection_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        // One record per connection id; a re-auth replaces it.
        inner.sessions.retain(|s| s.connection_id != connection_id);
        inner.sessions.push(SessionRecord {
            account_id,
            connection_id: connection_id.to_string(),
            connected_at: Utc::now(),
        });
        Ok(())
    }

    async fn delete_session(&self, connection_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.sessions.retain(|s| s.connection_id != connection_id);
        Ok(())
    }

    async fn get_session(&self, connection_id: &str) -> Result<Option<SessionRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .sessions
            .iter()
            .find(|s| s.connection_id == connection_id)
            .cloned())
    }

    async fn get_config_with_expiry(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let inner = self.inner.lock();
        Ok(inner
            .config
            .iter()
            .find(|(k, entry)| k == key && entry.expires_at > now)
            .map(|(_, entry)| entry.value.clone()))
    }

    async fn set_config(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.config.retain(|(k, _)| k != key);
        inner.config.push((
            key.to_string(),
            ConfigEntry {
                value: value.to_string(),
                expires_at,
            },
        ));
        Ok(())
    }

    async fn delete_config(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.config.retain(|(k, _)| k != key);
        Ok(())
    }
}
