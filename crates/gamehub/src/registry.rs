use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use gamehub_core::protocol::{new_client_id, ClientRole};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

/// Why a delivery attempt did not reach the peer. Surfaced to callers
/// instead of being thrown; one unreachable peer must never abort a
/// broadcast to the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
    #[error("connection not registered")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Failed(SendError),
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}

/// One live transport connection. Owned exclusively by the registry;
/// the membership index only holds id strings.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub id: String,
    pub session_id: Option<String>,
    pub player_name: Option<String>,
    pub role: Option<ClientRole>,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<Message>,
    last_seen: Arc<Mutex<Instant>>,
}

impl ClientEntry {
    fn new(id: String, sender: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            session_id: None,
            player_name: None,
            role: None,
            connected_at: Utc::now(),
            sender,
            last_seen: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn try_send(&self, message: Message) -> SendOutcome {
        match self.sender.try_send(message) {
            Ok(()) => SendOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Failed(SendError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Failed(SendError::Closed),
        }
    }

    /// Best-effort close frame; the writer task forwards it to the peer.
    pub fn close(&self, reason: &str) {
        let _ = self.sender.try_send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: reason.to_string().into(),
        })));
    }

    /// Whether the writer side of the channel is still alive.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn touch(&self) {
        let mut last = self.last_seen.lock().expect("last_seen lock poisoned");
        *last = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().expect("last_seen lock poisoned")
    }
}

/// Connection Registry: the single owner of live connection entries.
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, ClientEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Allocates a fresh identity and stores a new entry with all
    /// optional fields unset. Retries id generation on a collision.
    pub async fn register(&self, sender: mpsc::Sender<Message>) -> String {
        let mut clients = self.clients.write().await;
        let mut id = new_client_id();
        while clients.contains_key(&id) {
            id = new_client_id();
        }
        clients.insert(id.clone(), ClientEntry::new(id.clone(), sender));
        id
    }

    /// Lookup; `None` means the connection is already gone and callers
    /// must treat the operation as a silent no-op.
    pub async fn entry(&self, id: &str) -> Option<ClientEntry> {
        self.clients.read().await.get(id).cloned()
    }

    /// Populates the session fields on a join.
    pub async fn set_identity(
        &self,
        id: &str,
        session_id: &str,
        player_name: &str,
        role: ClientRole,
    ) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get_mut(id) {
            Some(entry) => {
                entry.session_id = Some(session_id.to_string());
                entry.player_name = Some(player_name.to_string());
                entry.role = Some(role);
                true
            }
            None => false,
        }
    }

    /// Resets the session fields back to unset and returns the prior
    /// session id and display name. `None` when the connection is gone
    /// or was never joined.
    pub async fn clear_identity(&self, id: &str) -> Option<(String, Option<String>)> {
        let mut clients = self.clients.write().await;
        let entry = clients.get_mut(id)?;
        let session_id = entry.session_id.take()?;
        let player_name = entry.player_name.take();
        entry.role = None;
        Some((session_id, player_name))
    }

    /// Idempotent removal; returns the entry on the first call only.
    pub async fn remove(&self, id: &str) -> Option<ClientEntry> {
        self.clients.write().await.remove(id)
    }

    /// Attempts delivery of pre-serialized JSON. Transport problems are
    /// reported through the outcome, never propagated.
    pub async fn send(&self, id: &str, json: &str) -> SendOutcome {
        let entry = match self.clients.read().await.get(id) {
            Some(entry) => entry.clone(),
            None => return SendOutcome::Failed(SendError::Unknown),
        };
        let outcome = entry.try_send(Message::Text(json.to_string()));
        if let SendOutcome::Failed(reason) = outcome {
            warn!(event = "send_error", conn_id = id, reason = %reason);
        }
        outcome
    }

    pub async fn touch(&self, id: &str) {
        if let Some(entry) = self.clients.read().await.get(id) {
            entry.touch();
        }
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<ClientEntry> {
        self.clients.read().await.values().cloned().collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
