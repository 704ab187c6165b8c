use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tether_common::Size;
use tokio::sync::RwLock;

mod state;
mod terminal;

pub use state::{SessionState, StateCell};
pub use terminal::{CloseReason, SessionSummary, TerminalSession};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a new unique session ID
    pub fn new() -> Self {
        Self(SESSION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session metadata
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub shell: String,
    pub pid: Option<u32>,
    pub size: Size,
    pub created_at: u64,
}

impl SessionInfo {
    pub fn new(shell: String, pid: Option<u32>, size: Size) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            id: SessionId::new(),
            shell,
            pid,
            size,
            created_at,
        }
    }
}

/// Best-effort directory of live terminal sessions.
///
/// Sessions add themselves once active and remove themselves during teardown;
/// nothing here owns a session or keeps it alive.
pub struct SessionManager {
    sessions: RwLock<Vec<SessionInfo>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, info: SessionInfo) {
        self.sessions.write().await.push(info);
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.clone()
    }

    pub async fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.read().await.iter().find(|s| s.id == id).cloned()
    }

    pub async fn update_size(&self, id: SessionId, size: Size) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.iter_mut().find(|s| s.id == id) {
            session.size = size;
        }
    }

    /// Returns whether the session was listed
    pub async fn remove_session(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        sessions.len() != before
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
