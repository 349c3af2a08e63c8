//! Wire frames for both socket pools and the inbound webhook envelope.
//!
//! Frame vocabulary is fixed by the deployed clients: tags are snake_case
//! (`auth`, `llm_request`, `feishu_message`), fields are camelCase
//! (`messageId`, `chatType`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Platform-side frames
// ---------------------------------------------------------------------------

/// Frames received from a platform-side connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PlatformFrame {
    Message {
        content: String,
        message_id: String,
        chat_type: String,
        chat_id: String,
    },
}

/// An inbound platform message on its way to an agent. The sender id is
/// carried separately because it comes from the connection, not the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub sender_id: String,
    pub content: String,
    pub message_id: String,
    pub chat_type: String,
    pub chat_id: String,
}

// ---------------------------------------------------------------------------
// Agent-side frames
// ---------------------------------------------------------------------------

/// Frames received from an agent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentFrame {
    Auth {
        token: String,
    },
    LlmRequest {
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
}

/// An agent request on its way toward the platform, correlation id already
/// filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub content: Value,
    pub message_id: String,
}

/// Frames sent to an agent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    AuthSuccess {},
    Error {
        error: String,
    },
    FeishuMessage {
        user_token: String,
        sender_id: String,
        content: String,
        message_id: String,
        chat_type: String,
        chat_id: String,
        timestamp: i64,
    },
    LlmResponse {
        user_token: String,
        content: Value,
        message_id: String,
        timestamp: i64,
    },
}

// ---------------------------------------------------------------------------
// Offline queue entries
// ---------------------------------------------------------------------------

/// A message buffered because its credential had no live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Queued<T> {
    pub id: String,
    pub credential: String,
    pub payload: T,
    pub enqueued_at: DateTime<Utc>,
}

impl<T> Queued<T> {
    pub fn new(credential: impl Into<String>, payload: T) -> Self {
        Self {
            id: correlation_id(),
            credential: credential.into(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Generate a correlation id for messages the client did not tag.
pub fn correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// Webhook envelope
// ---------------------------------------------------------------------------

/// Event kind Feishu sends on first webhook configuration.
pub const EVENT_URL_VERIFICATION: &str = "url_verification";
/// Event kind for a received IM message.
pub const EVENT_MESSAGE_RECEIVE: &str = "im.message.receive_v1";

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub encrypt: Option<String>,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub header: Option<WebhookHeader>,
    #[serde(default)]
    pub event: Option<WebhookEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookHeader {
    #[serde(default)]
    pub event_id: Option<String>,
    pub event_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub sender: WebhookSender,
    pub message: WebhookMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSender {
    pub sender_id: WebhookSenderId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSenderId {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub open_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMessage {
    pub message_id: String,
    pub chat_type: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub msg_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AgentFrame, PlatformFrame, ServerFrame};

    #[test]
    fn platform_message_frame_parses_camel_case_fields() {
        let frame: PlatformFrame = serde_json::from_value(json!({
            "type": "message",
            "content": "hi",
            "messageId": "om_1",
            "chatType": "p2p",
            "chatId": "oc_1",
        }))
        .unwrap();
        assert_eq!(
            frame,
            PlatformFrame::Message {
                content: "hi".into(),
                message_id: "om_1".into(),
                chat_type: "p2p".into(),
                chat_id: "oc_1".into(),
            }
        );
    }

    #[test]
    fn auth_frame_round_trips() {
        let frame: AgentFrame =
            serde_json::from_value(json!({"type": "auth", "token": "tok_A"})).unwrap();
        assert_eq!(
            frame,
            AgentFrame::Auth {
                token: "tok_A".into()
            }
        );
    }

    #[test]
    fn llm_request_message_id_is_optional() {
        let frame: AgentFrame =
            serde_json::from_value(json!({"type": "llm_request", "content": "answer"})).unwrap();
        let AgentFrame::LlmRequest { message_id, .. } = frame else {
            panic!("expected llm_request");
        };
        assert!(message_id.is_none());
    }

    #[test]
    fn server_frames_serialize_with_snake_case_tags() {
        let frame = ServerFrame::AuthSuccess {};
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "auth_success"})
        );

        let frame = ServerFrame::Error {
            error: "Not authenticated".into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "error", "error": "Not authenticated"})
        );
    }

    #[test]
    fn feishu_message_fields_are_camel_case_on_the_wire() {
        let frame = ServerFrame::FeishuMessage {
            user_token: "tok_A".into(),
            sender_id: "u1".into(),
            content: "hello".into(),
            message_id: "om_1".into(),
            chat_type: "p2p".into(),
            chat_id: "oc_1".into(),
            timestamp: 1,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "feishu_message");
        assert_eq!(value["userToken"], "tok_A");
        assert_eq!(value["messageId"], "om_1");
        assert_eq!(value["chatType"], "p2p");
    }
}
