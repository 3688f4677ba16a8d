use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Role a client declares when joining a session. Browsers send the tag
/// as a lowercase string in the `clientType` field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Gm,
    Player,
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Gm => "gm",
            ClientRole::Player => "player",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generates an opaque connection identity. The space is large enough
/// that collisions have no realistic path, but registration still
/// retries on one.
pub fn new_client_id() -> String {
    format!("client-{}", Uuid::new_v4())
}

/// Server-assigned timestamp carried on every broadcast event.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Inbound commands, tagged on `type`. Field names follow the camelCase
/// shapes the browser clients send. Unknown tags land in `Unrecognized`
/// instead of failing the read loop.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    JoinSession {
        session_id: String,
        player_name: String,
        client_type: ClientRole,
    },
    #[serde(rename_all = "camelCase")]
    LeaveSession { session_id: String },
    #[serde(rename_all = "camelCase")]
    PlayerAction {
        #[serde(default)]
        session_id: Option<String>,
        action: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    GmAction {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        data: Value,
    },
    #[serde(other)]
    Unrecognized,
}

/// Outbound events, tagged on `type`, camelCase fields. Immutable once
/// constructed; delivery is fire-and-forget and at-most-once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected { client_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    SessionJoined {
        session_id: String,
        player_name: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    PlayerJoined {
        player_name: String,
        player_type: ClientRole,
        session_id: String,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    PlayerLeft {
        player_name: Option<String>,
        session_id: String,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    PlayerAction {
        player_name: Option<String>,
        action: String,
        data: Value,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    GmAction { data: Value, timestamp: String },
    #[serde(rename_all = "camelCase")]
    PlayerAnswerReceived {
        session_id: String,
        player_id: String,
        player_name: String,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    RoundResultsReady {
        session_id: String,
        round_data: Value,
        timestamp: String,
    },
}

impl ServerEvent {
    /// Tag string as it appears on the wire, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::SessionJoined { .. } => "session_joined",
            ServerEvent::PlayerJoined { .. } => "player_joined",
            ServerEvent::PlayerLeft { .. } => "player_left",
            ServerEvent::PlayerAction { .. } => "player_action",
            ServerEvent::GmAction { .. } => "gm_action",
            ServerEvent::PlayerAnswerReceived { .. } => "player_answer_received",
            ServerEvent::RoundResultsReady { .. } => "round_results_ready",
        }
    }
}
