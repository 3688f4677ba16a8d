use crate::protocol::ClientRole;
use serde::{Deserialize, Serialize};

/// Read-only dump of the realtime layer, served to operational tooling.
/// Producing one must never mutate hub state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub total_connections: usize,
    pub total_sessions: usize,
    pub sessions: Vec<SessionSnapshot>,
    pub connections: Vec<ConnectionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub client_count: usize,
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub role: Option<ClientRole>,
    pub session_id: Option<String>,
    pub player_name: Option<String>,
    pub connected: bool,
    pub joined_at: String,
}
