//! Signed-credential primitive.
//!
//! Credentials are compact HMAC-SHA256 tokens:
//! `base64url(claims JSON) "." base64url(mac)`. The relay engine treats the
//! resulting string as an opaque routing key; only this module looks inside.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default credential lifetime.
pub const CREDENTIAL_TTL_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub account_id: i64,
    pub platform_user_id: String,
    /// Expiry as unix seconds.
    pub exp: i64,
}

#[derive(Clone)]
pub struct CredentialSigner {
    secret: Vec<u8>,
}

impl CredentialSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Issue a credential for an account with the default lifetime.
    pub fn issue(&self, account_id: i64, platform_user_id: &str) -> (String, DateTime<Utc>) {
        let expires_at = Utc::now() + Duration::days(CREDENTIAL_TTL_DAYS);
        let claims = Claims {
            account_id,
            platform_user_id: platform_user_id.to_string(),
            exp: expires_at.timestamp(),
        };
        (self.sign(&claims), expires_at)
    }

    pub fn sign(&self, claims: &Claims) -> String {
        // Claims serialization over our own struct cannot fail.
        let body = serde_json::to_vec(claims).unwrap_or_default();
        let encoded = URL_SAFE_NO_PAD.encode(&body);
        let mac = self.mac_for(encoded.as_bytes());
        format!("{encoded}.{}", URL_SAFE_NO_PAD.encode(mac))
    }

    /// Verify signature and expiry, returning the claims on success.
    pub fn verify(&self, token: &str) -> Option<Claims> {
        let (body, sig) = token.split_once('.')?;
        let sig = URL_SAFE_NO_PAD.decode(sig).ok()?;

        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(body.as_bytes());
        mac.verify_slice(&sig).ok()?;

        let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body).ok()?).ok()?;
        if claims.exp <= Utc::now().timestamp() {
            return None;
        }
        Some(claims)
    }

    fn mac_for(&self, body: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| HmacSha256::new_from_slice(b"-").expect("hmac accepts any key"));
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }
}
