//! Platform-side WebSocket pool.
//!
//! Identity is carried in the upgrade request (`?user_id=`); there is no
//! handshake frame. The platform never receives messages over this socket;
//! responses travel back through the REST API.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::RelayEngine;
use crate::protocol::{InboundMessage, PlatformFrame};

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct PlatformQuery {
    #[serde(default)]
    user_id: String,
}

pub fn router(engine: Arc<RelayEngine>) -> axum::Router {
    use axum::routing;
    axum::Router::new()
        .route("/feishu", routing::get(platform_ws))
        .with_state(engine)
}

async fn platform_ws(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<RelayEngine>>,
    Query(query): Query<PlatformQuery>,
) -> Response {
    let user_id = query.user_id.trim().to_string();
    if user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing user_id").into_response();
    }
    ws.on_upgrade(move |socket| handle_platform_socket(socket, engine, user_id))
        .into_response()
}

async fn handle_platform_socket(socket: WebSocket, engine: Arc<RelayEngine>, user_id: String) {
    let connection_id = Uuid::new_v4().simple().to_string();
    engine.register_platform(&user_id, &connection_id);

    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<PlatformFrame>(text.as_str()) {
                            Ok(PlatformFrame::Message {
                                content,
                                message_id,
                                chat_type,
                                chat_id,
                            }) => {
                                engine
                                    .dispatch_inbound(
                                        &user_id,
                                        InboundMessage {
                                            sender_id: user_id.clone(),
                                            content,
                                            message_id,
                                            chat_type,
                                            chat_id,
                                        },
                                    )
                                    .await;
                            }
                            Err(error) => {
                                tracing::warn!(
                                    target = "openclaw_relay::platform",
                                    user_id = %user_id,
                                    error = %error,
                                    "invalid frame, dropping"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(error)) => {
                        tracing::warn!(
                            target = "openclaw_relay::platform",
                            user_id = %user_id,
                            error = %error,
                            "platform socket read error"
                        );
                        break;
                    }
                    _ => {}
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }

    engine.unregister_platform(&user_id, &connection_id);
}
