//! Session Registry
//!
//! Process-wide mapping from an opaque session id to one login attempt. The
//! registry is an injected component: constructed at service start, handed
//! to the transport layer, shut down explicitly. Each session serializes
//! its own operations behind a lock so concurrent requests against one id
//! cannot interleave on the shared page handle.

use crate::error::{FlowError, Result};
use crate::flow::machine::LoginFlow;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One in-progress or completed login attempt.
pub struct Session {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Per-session mutual exclusion: every operation on the flow takes this
    /// lock for its whole duration.
    pub flow: Mutex<LoginFlow>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Keyed store of live sessions. At most one live session per id.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new session. When `id` is absent one is generated; when it
    /// is supplied and already maps to a live session, the request is
    /// rejected and the existing session is left untouched.
    pub async fn create(&self, id: Option<String>, flow: LoginFlow) -> Result<Arc<Session>> {
        let id = match id {
            Some(id) if !id.is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&id) {
            return Err(FlowError::Validation(format!(
                "session '{}' already exists",
                id
            )));
        }

        let session = Arc::new(Session {
            id: id.clone(),
            created_at: chrono::Utc::now(),
            flow: Mutex::new(flow),
        });
        sessions.insert(id.clone(), session.clone());
        log::info!("session {} created ({} live)", id, sessions.len());
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Eviction hook: release every session's page handle and empty the map.
    /// Sessions otherwise live for the process lifetime.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            let flow = session.flow.lock().await;
            if let Err(e) = flow.shutdown().await {
                log::warn!("failed to close session {}: {}", session.id, e);
            }
        }
        log::info!("session registry shut down");
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
