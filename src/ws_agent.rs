//! Agent-side WebSocket pool.
//!
//! Connections arrive unauthenticated; only an `auth` frame carrying a valid
//! credential promotes them. Every connection runs in its own task, so a
//! failure in one handler never disturbs the listener or its siblings.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::engine::{AuthOutcome, RelayEngine};
use crate::protocol::{AgentFrame, ServerFrame};

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub fn router(engine: Arc<RelayEngine>) -> axum::Router {
    use axum::routing;
    axum::Router::new()
        .route("/openclaw", routing::get(agent_ws))
        .with_state(engine)
}

async fn agent_ws(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<RelayEngine>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, engine))
}

async fn handle_agent_socket(socket: WebSocket, engine: Arc<RelayEngine>) {
    let connection_id = Uuid::new_v4().simple().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let (mut sink, mut stream) = socket.split();
    let mut credential: Option<String> = None;
    let mut ping = tokio::time::interval(PING_INTERVAL);

    tracing::info!(
        target = "openclaw_relay::agent",
        connection_id = %connection_id,
        "agent connected"
    );

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_agent_text(
                            &engine,
                            &connection_id,
                            &tx,
                            &mut credential,
                            text.as_str(),
                        )
                        .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(error)) => {
                        tracing::warn!(
                            target = "openclaw_relay::agent",
                            connection_id = %connection_id,
                            error = %error,
                            "agent socket read error"
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

    if let Some(credential) = credential {
        if let Err(error) = engine.agent_closed(&credential, &connection_id).await {
            tracing::warn!(
                target = "openclaw_relay::agent",
                connection_id = %connection_id,
                error = %error,
                "agent close cleanup failed"
            );
        }
    }
    tracing::info!(
        target = "openclaw_relay::agent",
        connection_id = %connection_id,
        "agent disconnected"
    );
}

async fn handle_agent_text(
    engine: &RelayEngine,
    connection_id: &str,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    credential: &mut Option<String>,
    text: &str,
) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        tracing::warn!(
            target = "openclaw_relay::agent",
            connection_id = %connection_id,
            "invalid frame, dropping"
        );
        let _ = tx.send(ServerFrame::Error {
            error: "Invalid message format".into(),
        });
        return;
    };

    match serde_json::from_value::<AgentFrame>(value) {
        Ok(AgentFrame::Auth { token }) => {
            match engine.authenticate_agent(connection_id, &token, tx.clone()).await {
                Ok(AuthOutcome::Accepted(_)) => {
                    // A re-auth under a new credential must not leave the
                    // old one routing to this connection.
                    if let Some(previous) = credential.replace(token) {
                        if credential.as_deref() != Some(previous.as_str()) {
                            if let Err(error) =
                                engine.credential_replaced(&previous, connection_id).await
                            {
                                tracing::warn!(
                                    target = "openclaw_relay::agent",
                                    connection_id = %connection_id,
                                    error = %error,
                                    "failed to release previous credential"
                                );
                            }
                        }
                    }
                }
                Ok(AuthOutcome::Denied(reason)) => {
                    let _ = tx.send(ServerFrame::Error {
                        error: reason.into(),
                    });
                }
                Err(error) => {
                    tracing::error!(
                        target = "openclaw_relay::agent",
                        connection_id = %connection_id,
                        error = %error,
                        "authentication failed"
                    );
                    let _ = tx.send(ServerFrame::Error {
                        error: "Internal error".into(),
                    });
                }
            }
        }
        Ok(AgentFrame::LlmRequest {
            content,
            message_id,
        }) => match credential.as_deref() {
            Some(credential) => {
                engine.dispatch_outbound(credential, content, message_id).await;
            }
            None => {
                let _ = tx.send(ServerFrame::Error {
                    error: "Not authenticated".into(),
                });
            }
        },
        Err(_) => {
            // Valid JSON of an unrecognized kind.
            if credential.is_none() {
                let _ = tx.send(ServerFrame::Error {
                    error: "Not authenticated".into(),
                });
            } else {
                tracing::debug!(
                    target = "openclaw_relay::agent",
                    connection_id = %connection_id,
                    "ignoring unrecognized frame"
                );
            }
        }
    }
}
