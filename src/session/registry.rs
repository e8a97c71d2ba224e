//! Concurrent registry of live sessions.
//!
//! One session per (client, device) tuple. Lookups hand out `Arc` clones so
//! no caller ever holds the map lock across I/O.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::session::Session;

/// Registry key for a (client app, device) tuple. Case-insensitive.
pub fn session_key(client: &str, device_id: &str) -> String {
    format!("{}{}", client, device_id).to_lowercase()
}

/// Deterministic session id for a registry key.
pub fn session_id_for_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Inserts the session unless the key is already taken; returns the
    /// occupant either way.
    pub async fn insert_if_absent(&self, key: String, session: Arc<Session>) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        sessions.entry(key).or_insert(session).clone()
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Point-in-time snapshot, most recently active first.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.last_activity()));
        sessions
    }

    pub async fn get_by_session_id(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.id() == session_id)
            .cloned()
    }

    /// All sessions of a device, case-insensitively.
    pub async fn get_by_device_id(&self, device_id: &str) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.device_id().eq_ignore_ascii_case(device_id))
            .cloned()
            .collect()
    }

    pub async fn get_by_device_and_client(
        &self,
        device_id: &str,
        client: &str,
    ) -> Option<Arc<Session>> {
        self.get(&session_key(client, device_id)).await
    }

    /// Removes and returns every session.
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
