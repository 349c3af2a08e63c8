//! Inbound webhook endpoint and health check.
//!
//! Feishu delivers events here: URL-verification challenges on first
//! configuration, then `im.message.receive_v1` events (optionally encrypted).
//! Message events are fed into the same dispatch path as platform-socket
//! frames.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::crypto::decrypt_webhook;
use crate::engine::RelayEngine;
use crate::protocol::{
    InboundMessage, WebhookEnvelope, EVENT_MESSAGE_RECEIVE, EVENT_URL_VERIFICATION,
};

#[derive(Clone)]
struct WebhookState {
    engine: Arc<RelayEngine>,
    encrypt_key: Option<String>,
}

pub fn router(engine: Arc<RelayEngine>, encrypt_key: Option<String>) -> axum::Router {
    use axum::routing;
    let state = WebhookState {
        engine,
        encrypt_key: encrypt_key.filter(|key| !key.is_empty()),
    };
    axum::Router::new()
        .route("/webhook", routing::post(webhook))
        .route("/health", routing::get(health))
        .with_state(state)
}

async fn health(State(state): State<WebhookState>) -> Json<Value> {
    let (platform, agent) = state.engine.connected_counts();
    let (inbound_queued, outbound_queued) = state.engine.queue_depths();
    Json(json!({
        "status": "ok",
        "service": "openclaw-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": { "platform": platform, "agent": agent },
        "queued": { "inbound": inbound_queued, "outbound": outbound_queued },
    }))
}

async fn webhook(State(state): State<WebhookState>, Json(raw): Json<Value>) -> Json<Value> {
    let envelope = match parse_envelope(raw, state.encrypt_key.as_deref()) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::warn!(
                target = "openclaw_relay::webhook",
                error = %error,
                "unparseable webhook body, dropping"
            );
            return Json(json!({ "code": 0, "msg": "ignored" }));
        }
    };

    if let Some(challenge) = verification_challenge(&envelope) {
        return Json(json!({ "challenge": challenge }));
    }

    let event_type = envelope.header.as_ref().map(|h| h.event_type.as_str());
    if event_type == Some(EVENT_MESSAGE_RECEIVE) {
        if let Some(event) = envelope.event {
            let sender_id = event
                .sender
                .sender_id
                .user_id
                .or(event.sender.sender_id.open_id)
                .unwrap_or_default();
            if sender_id.is_empty() {
                tracing::warn!(
                    target = "openclaw_relay::webhook",
                    "message event without sender id, dropping"
                );
                return Json(json!({ "code": 0, "msg": "ignored" }));
            }

            let message = InboundMessage {
                sender_id: sender_id.clone(),
                content: extract_text(&event.message.content),
                message_id: event.message.message_id,
                chat_type: event.message.chat_type,
                chat_id: event.message.chat_id,
            };
            state.engine.dispatch_inbound(&sender_id, message).await;
            return Json(json!({ "code": 0, "msg": "ok" }));
        }
    }

    Json(json!({ "code": 0, "msg": "ok" }))
}

fn parse_envelope(raw: Value, encrypt_key: Option<&str>) -> crate::error::Result<WebhookEnvelope> {
    if let Some(encrypted) = raw.get("encrypt").and_then(Value::as_str) {
        let Some(key) = encrypt_key else {
            return Err(crate::error::RelayError::InvalidPayload(
                "encrypted envelope but no encrypt key configured".into(),
            ));
        };
        let plaintext = decrypt_webhook(encrypted, key)?;
        return Ok(serde_json::from_str(&plaintext)?);
    }
    Ok(serde_json::from_value(raw)?)
}

fn verification_challenge(envelope: &WebhookEnvelope) -> Option<&str> {
    let challenge = envelope.challenge.as_deref()?;
    let is_verification = envelope.kind.as_deref() == Some(EVENT_URL_VERIFICATION)
        || envelope
            .header
            .as_ref()
            .is_some_and(|h| h.event_type == EVENT_URL_VERIFICATION);
    is_verification.then_some(challenge)
}

/// Message content arrives as a JSON string like `{"text":"hi"}`; fall back
/// to the raw content when it is not of that shape.
fn extract_text(content: &str) -> String {
    serde_json::from_str::<Value>(content)
        .ok()
        .and_then(|value| value.get("text").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| content.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{extract_text, parse_envelope, router, verification_challenge};
    use crate::engine::RelayEngine;
    use crate::signer::CredentialSigner;
    use crate::store::{MemoryStore, RelayStore};
    use crate::token_cache::TokenCache;
    use crate::FeishuApi;

    fn engine_with_store() -> (Arc<MemoryStore>, Arc<RelayEngine>) {
        let store = Arc::new(MemoryStore::new());
        let tokens = TokenCache::new(
            "http://127.0.0.1:1",
            "app",
            "secret",
            store.clone(),
            Duration::from_millis(250),
        );
        let api = FeishuApi::new(
            "http://127.0.0.1:1",
            tokens,
            0,
            Duration::from_millis(1),
            Duration::from_millis(250),
        );
        let engine = Arc::new(RelayEngine::new(
            store.clone(),
            CredentialSigner::new("s"),
            api,
        ));
        (store, engine)
    }

    fn test_engine() -> Arc<RelayEngine> {
        engine_with_store().1
    }

    async fn post_json(app: axum::Router, body: Value) -> Value {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_connection_and_queue_state() {
        let app = router(test_engine(), None);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["connections"]["agent"], 0);
        assert_eq!(value["queued"]["inbound"], 0);
    }

    #[tokio::test]
    async fn url_verification_echoes_the_challenge() {
        let app = router(test_engine(), None);
        let reply = post_json(app, json!({ "challenge": "c1", "type": "url_verification" })).await;
        assert_eq!(reply, json!({ "challenge": "c1" }));
    }

    #[tokio::test]
    async fn message_event_for_known_user_lands_in_the_queue() {
        let (store, engine) = engine_with_store();
        let app = router(Arc::clone(&engine), None);
        store
            .create_user("u1", "tok_A", chrono::Utc::now() + chrono::Duration::days(30))
            .await
            .unwrap();

        let reply = post_json(
            app,
            json!({
                "header": { "event_type": "im.message.receive_v1" },
                "event": {
                    "sender": { "sender_id": { "user_id": "u1" } },
                    "message": {
                        "message_id": "om_1",
                        "chat_type": "p2p",
                        "chat_id": "oc_1",
                        "content": r#"{"text":"hi"}"#,
                        "msg_type": "text",
                    },
                },
            }),
        )
        .await;
        assert_eq!(reply["msg"], "ok");
        assert_eq!(engine.queue_depths(), (1, 0));
    }

    #[tokio::test]
    async fn malformed_body_is_acknowledged_and_dropped() {
        let app = router(test_engine(), None);
        let reply = post_json(app, json!({ "header": 42 })).await;
        assert_eq!(reply["msg"], "ignored");
    }

    #[test]
    fn extracts_text_content() {
        assert_eq!(extract_text(r#"{"text":"hello"}"#), "hello");
        assert_eq!(extract_text("plain"), "plain");
        assert_eq!(extract_text(r#"{"image_key":"img_1"}"#), r#"{"image_key":"img_1"}"#);
    }

    #[test]
    fn plaintext_challenge_is_answered() {
        let envelope = parse_envelope(
            json!({ "challenge": "c1", "type": "url_verification" }),
            None,
        )
        .unwrap();
        assert_eq!(verification_challenge(&envelope), Some("c1"));
    }

    #[test]
    fn challenge_without_verification_kind_is_ignored() {
        let envelope = parse_envelope(
            json!({
                "challenge": "c1",
                "header": { "event_type": "im.message.receive_v1" },
            }),
            None,
        )
        .unwrap();
        assert_eq!(verification_challenge(&envelope), None);
    }

    #[test]
    fn encrypted_envelope_without_key_is_rejected() {
        assert!(parse_envelope(json!({ "encrypt": "AAAA" }), None).is_err());
    }

    #[test]
    fn encrypted_envelope_round_trips() {
        use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
        use base64::{engine::general_purpose::STANDARD, Engine};
        use sha2::{Digest, Sha256};

        let body = json!({ "challenge": "c2", "type": "url_verification" }).to_string();
        let key = Sha256::digest(b"hook-key");
        let iv = [1u8; 16];
        let ciphertext = cbc::Encryptor::<aes::Aes256>::new_from_slices(&key, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(body.as_bytes());
        let mut data = iv.to_vec();
        data.extend_from_slice(&ciphertext);

        let envelope = parse_envelope(
            json!({ "encrypt": STANDARD.encode(data) }),
            Some("hook-key"),
        )
        .unwrap();
        assert_eq!(verification_challenge(&envelope), Some("c2"));
    }
}
