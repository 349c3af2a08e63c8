//! Upstream tenant-access-token cache with single-flight refresh.
//!
//! Invariant: at most one outstanding refresh at any time. The first caller
//! that misses the cache installs a shared fetch future; every concurrent
//! caller clones and awaits that same future, so N simultaneous
//! `acquire(true)` calls produce exactly one upstream request.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::store::RelayStore;

/// Fixed key under which the token is persisted in the config store.
pub const TOKEN_CONFIG_KEY: &str = "feishu_tenant_access_token";

/// Seconds shaved off the upstream lifetime when recording expiry, so a
/// token is refreshed before the platform stops honoring it.
const EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    app_access_token: Option<String>,
    #[serde(default)]
    expire: Option<i64>,
}

type FetchFuture = Shared<BoxFuture<'static, std::result::Result<CachedToken, Arc<RelayError>>>>;

#[derive(Default)]
struct CacheState {
    cached: Option<CachedToken>,
    in_flight: Option<FetchFuture>,
}

#[derive(Clone)]
pub struct TokenCache {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    store: Arc<dyn RelayStore>,
    state: Arc<Mutex<CacheState>>,
}

impl TokenCache {
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        store: Arc<dyn RelayStore>,
        request_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            store,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Return a valid access token, fetching one if needed.
    ///
    /// `force_refresh` bypasses the cached copy but still coalesces onto an
    /// already in-flight refresh. Fetch failures propagate; retry is the API
    /// client's responsibility.
    pub async fn acquire(&self, force_refresh: bool) -> Result<String> {
        if !force_refresh {
            if let Some(token) = self.fresh_cached() {
                return Ok(token);
            }
            // Durable read-through: another process start may have left a
            // still-valid token behind.
            if let Some(raw) = self.store.get_config_with_expiry(TOKEN_CONFIG_KEY).await? {
                if let Ok(token) = serde_json::from_str::<CachedToken>(&raw) {
                    if token.is_fresh() {
                        let value = token.value.clone();
                        self.state.lock().cached = Some(token);
                        return Ok(value);
                    }
                }
            }
        }

        let fetch = {
            let mut state = self.state.lock();
            if let Some(in_flight) = &state.in_flight {
                in_flight.clone()
            } else {
                // Re-check under the lock: a concurrent refresh may have
                // landed while we were reading the durable store.
                if !force_refresh {
                    if let Some(cached) = state.cached.as_ref().filter(|c| c.is_fresh()) {
                        return Ok(cached.value.clone());
                    }
                }
                let fut = Self::refresh(
                    self.http.clone(),
                    self.base_url.clone(),
                    self.app_id.clone(),
                    self.app_secret.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.state),
                )
                .boxed()
                .shared();
                state.in_flight = Some(fut.clone());
                fut
            }
        };

        match fetch.await {
            Ok(token) => Ok(token.value),
            Err(err) => Err(clone_for_waiter(&err)),
        }
    }

    /// Drop the cached token, in memory and durably. Called when upstream
    /// explicitly rejects a token.
    pub async fn invalidate(&self) -> Result<()> {
        self.state.lock().cached = None;
        self.store.delete_config(TOKEN_CONFIG_KEY).await?;
        tracing::info!(target = "openclaw_relay::token", "access token invalidated");
        Ok(())
    }

    fn fresh_cached(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .cached
            .as_ref()
            .filter(|c| c.is_fresh())
            .map(|c| c.value.clone())
    }

    /// The single in-flight refresh. Clears its own marker and updates the
    /// in-memory copy before resolving, so late waiters only ever observe a
    /// settled state.
    async fn refresh(
        http: reqwest::Client,
        base_url: String,
        app_id: String,
        app_secret: String,
        store: Arc<dyn RelayStore>,
        state: Arc<Mutex<CacheState>>,
    ) -> std::result::Result<CachedToken, Arc<RelayError>> {
        let result = Self::fetch_and_persist(&http, &base_url, &app_id, &app_secret, &store).await;

        let mut guard = state.lock();
        guard.in_flight = None;
        match result {
            Ok(token) => {
                guard.cached = Some(token.clone());
                Ok(token)
            }
            Err(err) => Err(Arc::new(err)),
        }
    }

    async fn fetch_and_persist(
        http: &reqwest::Client,
        base_url: &str,
        app_id: &str,
        app_secret: &str,
        store: &Arc<dyn RelayStore>,
    ) -> Result<CachedToken> {
        let url = format!("{base_url}/open-apis/auth/v3/tenant_access_token/internal");
        let response = http
            .post(&url)
            .json(&serde_json::json!({
                "app_id": app_id,
                "app_secret": app_secret,
            }))
            .send()
            .await?;
        let status = response.status().as_u16();
        let body: TokenResponse = response.json().await?;

        if body.code != 0 {
            return Err(RelayError::api(body.code, body.msg, status));
        }
        let value = body
            .app_access_token
            .ok_or_else(|| RelayError::InvalidResponse("missing app_access_token".into()))?;
        let lifetime = body.expire.unwrap_or(EXPIRY_MARGIN_SECS);
        let expires_at =
            Utc::now() + chrono::Duration::seconds((lifetime - EXPIRY_MARGIN_SECS).max(0));
        let token = CachedToken { value, expires_at };

        // Persisted alongside its expiry so a restart can read it back.
        let raw = serde_json::to_string(&token)?;
        store.set_config(TOKEN_CONFIG_KEY, &raw, token.expires_at).await?;
        tracing::debug!(
            target = "openclaw_relay::token",
            expires_at = %token.expires_at,
            "access token refreshed"
        );
        Ok(token)
    }
}

/// The shared fetch result is handed to every coalesced waiter, so the error
/// arrives behind an `Arc`. Rebuild an owned error, keeping the API variant
/// intact for `is_auth_rejection` checks.
fn clone_for_waiter(err: &RelayError) -> RelayError {
    match err {
        RelayError::Api {
            code,
            message,
            status,
        } => RelayError::Api {
            code: *code,
            message: message.clone(),
            status: *status,
        },
        other => RelayError::InvalidResponse(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::{CachedToken, TokenCache, TOKEN_CONFIG_KEY};
    use crate::store::{MemoryStore, RelayStore};

    fn cache_with_store(store: Arc<MemoryStore>) -> TokenCache {
        // Unroutable base url: any test that hits the network fails fast.
        TokenCache::new(
            "http://127.0.0.1:1",
            "app",
            "secret",
            store,
            Duration::from_millis(250),
        )
    }

    #[tokio::test]
    async fn reads_through_durable_store_without_fetching() {
        let store = Arc::new(MemoryStore::new());
        let token = CachedToken {
            value: "t-durable".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        store
            .set_config(
                TOKEN_CONFIG_KEY,
                &serde_json::to_string(&token).unwrap(),
                token.expires_at,
            )
            .await
            .unwrap();

        let cache = cache_with_store(Arc::clone(&store));
        assert_eq!(cache.acquire(false).await.unwrap(), "t-durable");
        // Second call is served from memory.
        assert_eq!(cache.acquire(false).await.unwrap(), "t-durable");
    }

    #[tokio::test]
    async fn invalidate_clears_memory_and_durable_copy() {
        let store = Arc::new(MemoryStore::new());
        let token = CachedToken {
            value: "t-durable".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        store
            .set_config(
                TOKEN_CONFIG_KEY,
                &serde_json::to_string(&token).unwrap(),
                token.expires_at,
            )
            .await
            .unwrap();

        let cache = cache_with_store(Arc::clone(&store));
        assert_eq!(cache.acquire(false).await.unwrap(), "t-durable");
        cache.invalidate().await.unwrap();

        assert!(store
            .get_config_with_expiry(TOKEN_CONFIG_KEY)
            .await
            .unwrap()
            .is_none());
        // Nothing cached or stored any more, so acquire must hit the (dead)
        // upstream and fail.
        assert!(cache.acquire(false).await.is_err());
    }

    #[tokio::test]
    async fn expired_durable_token_is_not_used() {
        let store = Arc::new(MemoryStore::new());
        let token = CachedToken {
            value: "t-stale".into(),
            expires_at: Utc::now() - chrono::Duration::seconds(5),
        };
        // Store-level expiry in the future, token-level expiry in the past:
        // freshness is judged on the token itself.
        store
            .set_config(
                TOKEN_CONFIG_KEY,
                &serde_json::to_string(&token).unwrap(),
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();

        let cache = cache_with_store(Arc::clone(&store));
        assert!(cache.acquire(false).await.is_err());
    }
}
