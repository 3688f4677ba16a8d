use crate::registry::{ClientEntry, ConnectionRegistry};
use crate::sessions::SessionIndex;
use axum::extract::ws::Message;
use gamehub_core::debug::{ConnectionSnapshot, DebugInfo, SessionSnapshot};
use gamehub_core::protocol::{now_rfc3339, ClientCommand, ClientRole, ServerEvent};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const WELCOME_MESSAGE: &str = "connected to gamehub";

/// The realtime core: owns the connection registry and the session
/// membership index, and routes events between them. Every mutating
/// path goes through this object; the underlying maps are never handed
/// out.
pub struct RealtimeHub {
    registry: ConnectionRegistry,
    sessions: SessionIndex,
    // Serializes the compound join/leave/disconnect paths. The registry
    // and the index sit behind separate locks; without this, a teardown
    // can land between a join's identity write and its membership
    // insert and leave a member id with no registry entry behind it.
    membership_lock: Mutex<()>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            sessions: SessionIndex::new(),
            membership_lock: Mutex::new(()),
        }
    }

    /// Registers a fresh transport connection and sends the `connected`
    /// acknowledgment carrying its new identity.
    pub async fn accept(&self, sender: mpsc::Sender<Message>) -> String {
        let conn_id = self.registry.register(sender).await;
        info!(event = "client_connected", conn_id = %conn_id);
        self.unicast(
            &conn_id,
            &ServerEvent::Connected {
                client_id: conn_id.clone(),
                message: WELCOME_MESSAGE.to_string(),
            },
        )
        .await;
        conn_id
    }

    /// Dispatches one parsed inbound command for a connection.
    pub async fn handle_command(&self, conn_id: &str, command: ClientCommand) {
        match command {
            ClientCommand::JoinSession {
                session_id,
                player_name,
                client_type,
            } => {
                self.join_session(conn_id, &session_id, &player_name, client_type)
                    .await;
            }
            ClientCommand::LeaveSession { session_id } => {
                if let Some(entry) = self.registry.entry(conn_id).await {
                    if entry.session_id.as_deref() != Some(session_id.as_str()) {
                        warn!(
                            event = "leave_session_mismatch",
                            conn_id,
                            requested = %session_id,
                            actual = entry.session_id.as_deref().unwrap_or_default()
                        );
                    }
                }
                self.leave_session(conn_id).await;
            }
            ClientCommand::PlayerAction { action, data, .. } => {
                self.relay_player_action(conn_id, action, data).await;
            }
            ClientCommand::GmAction { data, .. } => {
                self.relay_gm_action(conn_id, data).await;
            }
            ClientCommand::Unrecognized => {
                warn!(event = "unknown_message", conn_id);
            }
        }
    }

    /// Joins a session. A connection already joined to a different
    /// session is fully removed from it first, so an identity is never
    /// a member of two sets at once.
    pub async fn join_session(
        &self,
        conn_id: &str,
        session_id: &str,
        player_name: &str,
        role: ClientRole,
    ) {
        if session_id.is_empty() {
            warn!(event = "join_missing_session", conn_id);
            return;
        }
        let _guard = self.membership_lock.lock().await;
        let Some(entry) = self.registry.entry(conn_id).await else {
            warn!(event = "join_unknown_connection", conn_id);
            return;
        };

        match entry.session_id.as_deref() {
            Some(prior) if prior == session_id => {
                // Same session: refresh the identity fields and re-ack.
                self.registry
                    .set_identity(conn_id, session_id, player_name, role)
                    .await;
                self.ack_join(conn_id, session_id, player_name).await;
                return;
            }
            Some(_) => {
                self.leave_session_locked(conn_id).await;
            }
            None => {}
        }

        if !self
            .registry
            .set_identity(conn_id, session_id, player_name, role)
            .await
        {
            warn!(event = "join_unknown_connection", conn_id);
            return;
        }
        self.sessions.join(session_id, conn_id).await;

        info!(
            event = "session_joined",
            conn_id,
            session_id,
            player_name,
            role = %role
        );

        self.broadcast_to_session(
            session_id,
            &ServerEvent::PlayerJoined {
                player_name: player_name.to_string(),
                player_type: role,
                session_id: session_id.to_string(),
                timestamp: now_rfc3339(),
            },
            Some(conn_id),
        )
        .await;
        self.ack_join(conn_id, session_id, player_name).await;
    }

    async fn ack_join(&self, conn_id: &str, session_id: &str, player_name: &str) {
        self.unicast(
            conn_id,
            &ServerEvent::SessionJoined {
                session_id: session_id.to_string(),
                player_name: player_name.to_string(),
                message: format!("joined session {session_id}"),
            },
        )
        .await;
    }

    /// Removes the connection from its current session, notifies the
    /// remaining members, and resets the identity fields. Returns false
    /// when the connection was not joined to anything.
    pub async fn leave_session(&self, conn_id: &str) -> bool {
        let _guard = self.membership_lock.lock().await;
        self.leave_session_locked(conn_id).await
    }

    async fn leave_session_locked(&self, conn_id: &str) -> bool {
        let Some((session_id, player_name)) = self.registry.clear_identity(conn_id).await else {
            return false;
        };
        self.sessions.leave(&session_id, conn_id).await;

        info!(
            event = "session_left",
            conn_id,
            session_id = %session_id,
            player_name = player_name.as_deref().unwrap_or_default()
        );

        self.broadcast_to_session(
            &session_id,
            &ServerEvent::PlayerLeft {
                player_name,
                session_id: session_id.clone(),
                timestamp: now_rfc3339(),
            },
            None,
        )
        .await;
        true
    }

    async fn relay_player_action(&self, conn_id: &str, action: String, data: Value) {
        let Some(entry) = self.registry.entry(conn_id).await else {
            return;
        };
        let Some(session_id) = entry.session_id else {
            warn!(event = "action_without_session", conn_id, action = %action);
            return;
        };
        self.broadcast_to_session(
            &session_id,
            &ServerEvent::PlayerAction {
                player_name: entry.player_name,
                action,
                data,
                timestamp: now_rfc3339(),
            },
            Some(conn_id),
        )
        .await;
    }

    async fn relay_gm_action(&self, conn_id: &str, data: Value) {
        let Some(entry) = self.registry.entry(conn_id).await else {
            return;
        };
        let Some(session_id) = entry.session_id else {
            warn!(event = "action_without_session", conn_id);
            return;
        };
        self.broadcast_to_session(
            &session_id,
            &ServerEvent::GmAction {
                data,
                timestamp: now_rfc3339(),
            },
            Some(conn_id),
        )
        .await;
    }

    /// Transport close or fatal error: run the implicit leave if the
    /// connection was joined, then drop the registry entry. Idempotent,
    /// so racing teardown paths produce exactly one `player_left`.
    pub async fn disconnect(&self, conn_id: &str, reason: &str) {
        let _guard = self.membership_lock.lock().await;
        if self.registry.entry(conn_id).await.is_none() {
            return;
        }
        self.leave_session_locked(conn_id).await;
        if self.registry.remove(conn_id).await.is_some() {
            info!(event = "client_disconnected", conn_id, reason);
        }
    }

    /// Delivers an event to every member of the session except
    /// `exclude`. Unknown sessions deliver to nobody; they are not
    /// created here, only `join` creates entries.
    pub async fn broadcast_to_session(
        &self,
        session_id: &str,
        event: &ServerEvent,
        exclude: Option<&str>,
    ) -> usize {
        let members = self.sessions.members(session_id).await;
        if members.is_empty() {
            debug!(
                event = "broadcast_no_members",
                session_id,
                kind = event.kind()
            );
            return 0;
        }
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(err) => {
                warn!(event = "event_serialize_error", kind = event.kind(), error = %err);
                return 0;
            }
        };
        let mut delivered = 0;
        for member in &members {
            if Some(member.as_str()) == exclude {
                continue;
            }
            if self.registry.send(member, &json).await.is_delivered() {
                delivered += 1;
            }
        }
        debug!(
            event = "broadcast",
            session_id,
            kind = event.kind(),
            recipients = members.len(),
            delivered
        );
        delivered
    }

    /// Process-wide delivery regardless of session membership; used for
    /// diagnostics, not game events.
    pub async fn broadcast_to_all(&self, event: &ServerEvent, exclude: Option<&str>) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(err) => {
                warn!(event = "event_serialize_error", kind = event.kind(), error = %err);
                return 0;
            }
        };
        let mut delivered = 0;
        for entry in self.registry.snapshot().await {
            if Some(entry.id.as_str()) == exclude {
                continue;
            }
            if self.registry.send(&entry.id, &json).await.is_delivered() {
                delivered += 1;
            }
        }
        debug!(event = "broadcast_all", kind = event.kind(), delivered);
        delivered
    }

    async fn unicast(&self, conn_id: &str, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = self.registry.send(conn_id, &json).await;
            }
            Err(err) => {
                warn!(event = "event_serialize_error", kind = event.kind(), error = %err);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.count().await
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.session_count().await
    }

    pub async fn connection_exists(&self, conn_id: &str) -> bool {
        self.registry.entry(conn_id).await.is_some()
    }

    pub async fn touch(&self, conn_id: &str) {
        self.registry.touch(conn_id).await;
    }

    /// Connection entries for the liveness tasks (ping, stale reaper).
    pub async fn connections(&self) -> Vec<ClientEntry> {
        self.registry.snapshot().await
    }

    /// Read-only dump for operational tooling.
    pub async fn debug_info(&self) -> DebugInfo {
        let mut connections: Vec<ConnectionSnapshot> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|entry| {
                let connected = entry.is_connected();
                ConnectionSnapshot {
                    id: entry.id,
                    role: entry.role,
                    session_id: entry.session_id,
                    player_name: entry.player_name,
                    connected,
                    joined_at: entry.connected_at.to_rfc3339(),
                }
            })
            .collect();
        connections.sort_by(|a, b| a.id.cmp(&b.id));

        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .snapshot()
            .await
            .into_iter()
            .map(|(session_id, clients)| SessionSnapshot {
                session_id,
                client_count: clients.len(),
                clients,
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        DebugInfo {
            total_connections: connections.len(),
            total_sessions: sessions.len(),
            sessions,
            connections,
        }
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
