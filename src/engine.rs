//! The dual-channel relay engine: both connection pools, the routing table,
//! the offline queues, and cross-pool dispatch.
//!
//! All relay state lives on one `RelayEngine` instance. Shared maps are
//! guarded by `parking_lot` mutexes and never held across an await; delivery
//! to a socket goes through that connection's unbounded sender, so dispatch
//! never blocks on a peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::FeishuApi;
use crate::error::Result;
use crate::protocol::{correlation_id, InboundMessage, OutboundMessage, Queued, ServerFrame};
use crate::queue::OfflineQueue;
use crate::signer::CredentialSigner;
use crate::store::{RelayStore, UserRecord};

/// A live, authenticated agent connection.
#[derive(Debug, Clone)]
struct AgentHandle {
    connection_id: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

impl AgentHandle {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A registered platform-side connection. The platform never receives frames
/// over this socket (responses travel through the REST API), so only the
/// identity is tracked.
#[derive(Debug, Clone)]
struct PlatformHandle {
    connection_id: String,
}

/// Result of an agent `auth` frame.
pub enum AuthOutcome {
    Accepted(UserRecord),
    Denied(&'static str),
}

pub struct RelayEngine {
    store: Arc<dyn RelayStore>,
    signer: CredentialSigner,
    api: FeishuApi,
    /// platform-user-id -> platform connection.
    platform_conns: Mutex<HashMap<String, PlatformHandle>>,
    /// credential -> live agent connection. At most one per credential.
    agent_conns: Mutex<HashMap<String, AgentHandle>>,
    /// platform-user-id -> credential, memoized after the first store lookup.
    credential_memo: Mutex<HashMap<String, String>>,
    inbound_queue: Mutex<OfflineQueue<InboundMessage>>,
    outbound_queue: Mutex<OfflineQueue<OutboundMessage>>,
}

impl RelayEngine {
    pub fn new(store: Arc<dyn RelayStore>, signer: CredentialSigner, api: FeishuApi) -> Self {
        Self {
            store,
            signer,
            api,
            platform_conns: Mutex::new(HashMap::new()),
            agent_conns: Mutex::new(HashMap::new()),
            credential_memo: Mutex::new(HashMap::new()),
            inbound_queue: Mutex::new(OfflineQueue::new()),
            outbound_queue: Mutex::new(OfflineQueue::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Platform-side pool
    // -----------------------------------------------------------------------

    /// Register a platform connection as identified. A reconnect for the same
    /// platform user supersedes the previous entry.
    pub fn register_platform(&self, platform_user_id: &str, connection_id: &str) {
        self.platform_conns.lock().insert(
            platform_user_id.to_string(),
            PlatformHandle {
                connection_id: connection_id.to_string(),
            },
        );
        tracing::info!(
            target = "openclaw_relay::platform",
            user_id = %platform_user_id,
            connection_id = %connection_id,
            "platform connection identified"
        );
    }

    /// Drop a platform connection, unless a newer one already took its slot.
    pub fn unregister_platform(&self, platform_user_id: &str, connection_id: &str) {
        let mut conns = self.platform_conns.lock();
        if conns
            .get(platform_user_id)
            .is_some_and(|h| h.connection_id == connection_id)
        {
            conns.remove(platform_user_id);
            tracing::info!(
                target = "openclaw_relay::platform",
                user_id = %platform_user_id,
                "platform connection closed"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Agent-side pool
    // -----------------------------------------------------------------------

    /// Handle an agent `auth` frame. On success the account is marked live
    /// and a session record is created, then the connection is registered
    /// and the credential's backlog flushed through it in one critical
    /// section, so a dispatch interleaving with the store calls still lands
    /// in the queue and drains in enqueue order ahead of anything newer.
    pub async fn authenticate_agent(
        &self,
        connection_id: &str,
        credential: &str,
        tx: mpsc::UnboundedSender<ServerFrame>,
    ) -> Result<AuthOutcome> {
        if self.signer.verify(credential).is_none() {
            return Ok(AuthOutcome::Denied("Invalid token"));
        }
        let Some(user) = self.store.get_user_by_credential(credential).await? else {
            return Ok(AuthOutcome::Denied("User not found"));
        };

        // Store updates run before the connection becomes routable.
        self.store.set_live_connection(user.id, true).await?;
        self.store.create_session(user.id, connection_id).await?;

        // Lock order queue -> conns, same as the drain tick. Unbounded sends
        // never block, so both locks are held only briefly.
        let prior = {
            let mut queue = self.inbound_queue.lock();
            let mut conns = self.agent_conns.lock();
            let prior = conns.insert(
                credential.to_string(),
                AgentHandle {
                    connection_id: connection_id.to_string(),
                    tx: tx.clone(),
                },
            );
            let _ = tx.send(ServerFrame::AuthSuccess {});

            let backlog = queue.drain_credential(credential);
            let count = backlog.len();
            for entry in backlog {
                let frame = ServerFrame::FeishuMessage {
                    user_token: credential.to_string(),
                    sender_id: entry.payload.sender_id.clone(),
                    content: entry.payload.content.clone(),
                    message_id: entry.payload.message_id.clone(),
                    chat_type: entry.payload.chat_type.clone(),
                    chat_id: entry.payload.chat_id.clone(),
                    timestamp: Utc::now().timestamp_millis(),
                };
                if tx.send(frame).is_err() {
                    // The connection vanished mid-drain; keep the message.
                    queue.push(entry);
                }
            }
            if count > 0 {
                tracing::info!(
                    target = "openclaw_relay::queue",
                    count = count,
                    "drained offline messages at authentication"
                );
            }
            prior
        };

        if let Some(prior) = prior {
            if prior.connection_id != connection_id {
                tracing::info!(
                    target = "openclaw_relay::agent",
                    account_id = user.id,
                    superseded = %prior.connection_id,
                    connection_id = %connection_id,
                    "newer agent connection supersedes prior one"
                );
                self.store.delete_session(&prior.connection_id).await?;
            }
        }

        self.credential_memo
            .lock()
            .insert(user.platform_user_id.clone(), credential.to_string());
        tracing::info!(
            target = "openclaw_relay::agent",
            connection_id = %connection_id,
            account_id = user.id,
            "agent authenticated"
        );
        Ok(AuthOutcome::Accepted(user))
    }

    /// A connection re-authenticated under a different credential: release
    /// the previous credential's routing entry and live flag, if this
    /// connection still owns them.
    pub async fn credential_replaced(
        &self,
        old_credential: &str,
        connection_id: &str,
    ) -> Result<()> {
        let released = {
            let mut conns = self.agent_conns.lock();
            if conns
                .get(old_credential)
                .is_some_and(|h| h.connection_id == connection_id)
            {
                conns.remove(old_credential);
                true
            } else {
                false
            }
        };
        if !released {
            return Ok(());
        }

        if let Some(user) = self.store.get_user_by_credential(old_credential).await? {
            self.store.set_live_connection(user.id, false).await?;
        }
        tracing::info!(
            target = "openclaw_relay::agent",
            connection_id = %connection_id,
            "previous credential released after re-authentication"
        );
        Ok(())
    }

    /// Handle an agent connection closing. Records are cleared only while
    /// this connection is still the registered one for its credential; a
    /// stale, already-superseded close must not clobber the newer entry.
    pub async fn agent_closed(&self, credential: &str, connection_id: &str) -> Result<()> {
        let still_registered = {
            let mut conns = self.agent_conns.lock();
            if conns
                .get(credential)
                .is_some_and(|h| h.connection_id == connection_id)
            {
                conns.remove(credential);
                true
            } else {
                false
            }
        };

        if !still_registered {
            tracing::debug!(
                target = "openclaw_relay::agent",
                connection_id = %connection_id,
                "superseded agent connection closed, records untouched"
            );
            return Ok(());
        }

        if let Some(user) = self.store.get_user_by_credential(credential).await? {
            self.store.set_live_connection(user.id, false).await?;
        }
        self.store.delete_session(connection_id).await?;
        tracing::info!(
            target = "openclaw_relay::agent",
            connection_id = %connection_id,
            "agent connection closed"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Routing & dispatch
    // -----------------------------------------------------------------------

    /// Map a platform user id to its routing credential: memo map first,
    /// then the store, memoizing on success.
    pub async fn resolve_credential(&self, platform_user_id: &str) -> Result<Option<String>> {
        if let Some(credential) = self.credential_memo.lock().get(platform_user_id) {
            return Ok(Some(credential.clone()));
        }
        let Some(user) = self.store.get_user_by_platform_id(platform_user_id).await? else {
            return Ok(None);
        };
        self.credential_memo
            .lock()
            .insert(platform_user_id.to_string(), user.credential.clone());
        Ok(Some(user.credential))
    }

    /// Route a platform-origin message toward its agent: forward immediately
    /// when a live connection exists, otherwise buffer it.
    pub async fn dispatch_inbound(&self, platform_user_id: &str, message: InboundMessage) {
        let credential = match self.resolve_credential(platform_user_id).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                tracing::warn!(
                    target = "openclaw_relay::dispatch",
                    user_id = %platform_user_id,
                    "no credential for sender, dropping message"
                );
                return;
            }
            Err(error) => {
                tracing::error!(
                    target = "openclaw_relay::dispatch",
                    user_id = %platform_user_id,
                    error = %error,
                    "credential lookup failed, dropping message"
                );
                return;
            }
        };

        if self.try_forward_inbound(&credential, &message) {
            tracing::debug!(
                target = "openclaw_relay::dispatch",
                user_id = %platform_user_id,
                "forwarded to live agent"
            );
            return;
        }

        let depth = self
            .inbound_queue
            .lock()
            .push(Queued::new(&credential, message));
        tracing::info!(
            target = "openclaw_relay::queue",
            user_id = %platform_user_id,
            depth = depth,
            "agent offline, message queued"
        );
    }

    /// Route an agent request toward the platform. A live agent connection
    /// receives an `llm_response` acknowledgment and the content is sent to
    /// the platform over the REST API; with no live connection the message
    /// is buffered for the outbound drain.
    pub async fn dispatch_outbound(
        &self,
        credential: &str,
        content: Value,
        message_id: Option<String>,
    ) {
        let message = OutboundMessage {
            content,
            message_id: message_id.unwrap_or_else(correlation_id),
        };

        if let Some(tx) = self.agent_sender(credential) {
            let _ = tx.send(ServerFrame::LlmResponse {
                user_token: credential.to_string(),
                content: message.content.clone(),
                message_id: message.message_id.clone(),
                timestamp: Utc::now().timestamp_millis(),
            });
            self.forward_to_platform(credential, &message).await;
            return;
        }

        let depth = self
            .outbound_queue
            .lock()
            .push(Queued::new(credential, message));
        tracing::info!(
            target = "openclaw_relay::queue",
            depth = depth,
            "agent offline, response queued"
        );
    }

    /// Deliver an agent's content to the platform via the API client.
    /// Failures are logged, never propagated: the upstream send is
    /// best-effort from the relay's point of view.
    async fn forward_to_platform(&self, credential: &str, message: &OutboundMessage) {
        let user = match self.store.get_user_by_credential(credential).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(
                    target = "openclaw_relay::dispatch",
                    "no account for credential, platform send skipped"
                );
                return;
            }
            Err(error) => {
                tracing::error!(
                    target = "openclaw_relay::dispatch",
                    error = %error,
                    "account lookup failed, platform send skipped"
                );
                return;
            }
        };

        let sent = match &message.content {
            Value::String(text) => self.api.send_text(&user.platform_user_id, text).await,
            other => self.api.send_rich(&user.platform_user_id, other).await,
        };
        match sent {
            Ok(true) => tracing::debug!(
                target = "openclaw_relay::dispatch",
                user_id = %user.platform_user_id,
                message_id = %message.message_id,
                "platform send ok"
            ),
            Ok(false) => tracing::warn!(
                target = "openclaw_relay::dispatch",
                user_id = %user.platform_user_id,
                message_id = %message.message_id,
                "platform rejected send"
            ),
            Err(error) => tracing::warn!(
                target = "openclaw_relay::dispatch",
                user_id = %user.platform_user_id,
                message_id = %message.message_id,
                error = %error,
                "platform send failed"
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Offline queue draining
    // -----------------------------------------------------------------------

    /// One periodic tick over the inbound queue: deliver every entry whose
    /// credential has a live agent connection.
    pub fn drain_inbound_tick(&self) {
        let ready = {
            let mut queue = self.inbound_queue.lock();
            queue.drain_ready(|credential| self.agent_sender(credential).is_some())
        };
        for entry in ready {
            if !self.try_forward_inbound(&entry.credential, &entry.payload) {
                self.inbound_queue.lock().push(entry);
            }
        }
    }

    /// One periodic tick over the outbound queue.
    pub async fn drain_outbound_tick(&self) {
        let ready = {
            let mut queue = self.outbound_queue.lock();
            queue.drain_ready(|credential| self.agent_sender(credential).is_some())
        };
        for entry in ready {
            match self.agent_sender(&entry.credential) {
                Some(tx) => {
                    let _ = tx.send(ServerFrame::LlmResponse {
                        user_token: entry.credential.clone(),
                        content: entry.payload.content.clone(),
                        message_id: entry.payload.message_id.clone(),
                        timestamp: Utc::now().timestamp_millis(),
                    });
                    self.forward_to_platform(&entry.credential, &entry.payload).await;
                }
                None => {
                    self.outbound_queue.lock().push(entry);
                }
            }
        }
    }

    /// Spawn the two periodic drain loops.
    pub fn spawn_drain_loops(self: &Arc<Self>, period: Duration) -> Vec<tokio::task::JoinHandle<()>> {
        let inbound = {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    engine.drain_inbound_tick();
                }
            })
        };
        let outbound = {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    engine.drain_outbound_tick().await;
                }
            })
        };
        vec![inbound, outbound]
    }

    // -----------------------------------------------------------------------
    // Introspection & helpers
    // -----------------------------------------------------------------------

    /// (platform, agent) live connection counts, for the health endpoint.
    pub fn connected_counts(&self) -> (usize, usize) {
        (
            self.platform_conns.lock().len(),
            self.agent_conns
                .lock()
                .values()
                .filter(|h| h.is_open())
                .count(),
        )
    }

    /// (inbound, outbound) offline queue depths.
    pub fn queue_depths(&self) -> (usize, usize) {
        (
            self.inbound_queue.lock().len(),
            self.outbound_queue.lock().len(),
        )
    }

    fn agent_sender(&self, credential: &str) -> Option<mpsc::UnboundedSender<ServerFrame>> {
        self.agent_conns
            .lock()
            .get(credential)
            .filter(|h| h.is_open())
            .map(|h| h.tx.clone())
    }

    fn try_forward_inbound(&self, credential: &str, message: &InboundMessage) -> bool {
        let Some(tx) = self.agent_sender(credential) else {
            return false;
        };
        tx.send(ServerFrame::FeishuMessage {
            user_token: credential.to_string(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            message_id: message.message_id.clone(),
            chat_type: message.chat_type.clone(),
            chat_id: message.chat_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
        })
        .is_ok()
    }
}
