use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Session Membership Index: session id → set of connection ids.
/// Entries are created lazily on the first join and removed as soon as
/// the set empties, so the index never grows across session lifetimes.
pub struct SessionIndex {
    sessions: RwLock<HashMap<String, HashSet<String>>>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent: re-joining the same session is a no-op, not an error.
    pub async fn join(&self, session_id: &str, conn_id: &str) {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .insert(conn_id.to_string());
    }

    /// Removes the member if present and garbage-collects the session
    /// entry when its set becomes empty.
    pub async fn leave(&self, session_id: &str, conn_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(members) = sessions.get_mut(session_id) {
            members.remove(conn_id);
            if members.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    /// Current membership; empty set (not an error) for unknown ids.
    pub async fn members(&self, session_id: &str) -> HashSet<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(session_id, members)| {
                let mut ids: Vec<String> = members.iter().cloned().collect();
                ids.sort();
                (session_id.clone(), ids)
            })
            .collect()
    }
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self::new()
    }
}
