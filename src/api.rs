//! Outbound Feishu API client: message send and user lookup.
//!
//! Every call runs a bounded retry loop. An authorization rejection (HTTP
//! 401/403 or a token-invalid body code) invalidates the token cache and
//! forces a refresh on the next attempt; transient upstream failures retry
//! without touching the cache; anything else surfaces immediately.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{RelayError, Result, UPSTREAM_TOKEN_EXPIRED, UPSTREAM_TOKEN_INVALID};
use crate::token_cache::TokenCache;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct ApiBody {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Clone)]
pub struct FeishuApi {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenCache,
    retries: u32,
    retry_delay: Duration,
}

impl FeishuApi {
    pub fn new(
        base_url: impl Into<String>,
        tokens: TokenCache,
        retries: u32,
        retry_delay: Duration,
        request_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            tokens,
            retries,
            retry_delay,
        }
    }

    /// Send a plain text message. `Ok(true)` when upstream accepted it
    /// (body `code == 0`).
    pub async fn send_text(&self, user_id: &str, text: &str) -> Result<bool> {
        let content = serde_json::json!({ "text": text }).to_string();
        self.send_message(user_id, "text", content).await
    }

    /// Send a rich (post) message.
    pub async fn send_rich(&self, user_id: &str, content: &Value) -> Result<bool> {
        self.send_message(user_id, "post", content.to_string()).await
    }

    async fn send_message(&self, user_id: &str, msg_type: &str, content: String) -> Result<bool> {
        let url = format!(
            "{}/open-apis/im/v1/messages?receive_id_type=user_id",
            self.base_url
        );
        let payload = serde_json::json!({
            "receive_id": user_id,
            "msg_type": msg_type,
            "content": content,
        });
        let body = self
            .execute(&|token| self.http.post(&url).bearer_auth(token).json(&payload))
            .await?;
        if body.code != 0 {
            tracing::warn!(
                target = "openclaw_relay::api",
                user_id = %user_id,
                code = body.code,
                msg = %body.msg,
                "send rejected by upstream"
            );
        }
        Ok(body.code == 0)
    }

    /// Look up a platform user. `Ok(None)` when upstream reports a non-auth
    /// error (unknown user, missing scope).
    pub async fn get_user_info(&self, user_id: &str) -> Result<Option<UserInfo>> {
        let url = format!("{}/open-apis/contact/v3/users/{user_id}", self.base_url);
        let body = self
            .execute(&|token| self.http.get(&url).bearer_auth(token))
            .await?;
        if body.code != 0 {
            return Ok(None);
        }
        let user = body
            .data
            .get("user")
            .cloned()
            .ok_or_else(|| RelayError::InvalidResponse("missing data.user".into()))?;
        Ok(Some(serde_json::from_value(user)?))
    }

    /// Run one API call through the retry budget. The builder closure is
    /// invoked once per attempt with a freshly acquired token.
    async fn execute(
        &self,
        build: &(dyn Fn(&str) -> reqwest::RequestBuilder + Sync),
    ) -> Result<ApiBody> {
        let mut attempt = 0u32;
        loop {
            match self.attempt_once(build, attempt).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_auth_rejection() => {
                    // Invalidate on every rejection, including the last: the
                    // cached token is known bad either way.
                    if let Err(inv) = self.tokens.invalidate().await {
                        tracing::warn!(
                            target = "openclaw_relay::api",
                            error = %inv,
                            "token invalidation failed"
                        );
                    }
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    tracing::info!(
                        target = "openclaw_relay::api",
                        attempt = attempt,
                        error = %err,
                        "auth rejected, retrying with fresh token"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    tracing::info!(
                        target = "openclaw_relay::api",
                        attempt = attempt,
                        error = %err,
                        "transient upstream failure, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt_once(
        &self,
        build: &(dyn Fn(&str) -> reqwest::RequestBuilder + Sync),
        attempt: u32,
    ) -> Result<ApiBody> {
        let token = self.tokens.acquire(attempt > 0).await?;
        let response = build(&token).send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let (code, msg) = match serde_json::from_str::<ApiBody>(&text) {
                Ok(body) => (body.code, body.msg),
                Err(_) => (-1, text),
            };
            return Err(RelayError::api(code, msg, status.as_u16()));
        }

        let body: ApiBody = response.json().await?;
        if matches!(body.code, UPSTREAM_TOKEN_INVALID | UPSTREAM_TOKEN_EXPIRED) {
            return Err(RelayError::api(body.code, body.msg, status.as_u16()));
        }
        Ok(body)
    }
}
