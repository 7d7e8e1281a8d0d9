//! Per-connection session state.
//!
//! Sessions are created on first contact, keyed by the transport's session
//! key. Every inbound request refreshes activity; all non-`initialize`
//! requests require a completed `initialize` and fail with `-32002`
//! otherwise. Idle sessions expire; `max_sessions` evicts the oldest idle
//! session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use toolgate_types::config::SessionConfig;
use toolgate_types::errors::GateError;

/// State for one client connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Stable session id.
    pub id: Uuid,
    /// Transport-provided session key.
    pub key: String,
    /// Whether `initialize` completed.
    pub is_initialized: bool,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    /// Monotonic last-activity marker.
    pub last_activity: Instant,
    /// Protocol version negotiated at initialize.
    pub protocol_version: Option<Value>,
    /// Client info supplied at initialize.
    pub client_info: Option<Value>,
    /// Task type declared by the client, consulted by the filter chain.
    pub task_type: Option<String>,
}

impl Session {
    fn new(key: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.to_string(),
            is_initialized: false,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            protocol_version: None,
            client_info: None,
            task_type: None,
        }
    }
}

/// Creates, tracks, and expires sessions.
pub struct SessionManager {
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    /// Create a manager with the given limits.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or create the session for a transport key, refreshing its
    /// activity. Creating may evict the oldest idle session when the
    /// session cap is reached.
    pub async fn touch(&self, key: &str) -> Session {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(key) {
            session.last_activity = Instant::now();
            return session.clone();
        }

        if sessions.len() >= self.config.max_sessions {
            // Oldest idle session loses the eviction race.
            if let Some(victim) = sessions
                .values()
                .min_by_key(|s| s.last_activity)
                .map(|s| s.key.clone())
            {
                sessions.remove(&victim);
                info!(session = %victim, "evicted oldest idle session at capacity");
            }
        }

        let session = Session::new(key);
        debug!(session = %key, id = %session.id, "session created");
        sessions.insert(key.to_string(), session.clone());
        session
    }

    /// Mark a session initialized, storing the negotiated protocol version
    /// and client info.
    pub async fn initialize(
        &self,
        key: &str,
        protocol_version: Option<Value>,
        client_info: Option<Value>,
        task_type: Option<String>,
    ) -> Session {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key));
        session.is_initialized = true;
        session.last_activity = Instant::now();
        session.protocol_version = protocol_version;
        session.client_info = client_info;
        session.task_type = task_type;
        info!(session = %key, "session initialized");
        session.clone()
    }

    /// Require an initialized session, refreshing its activity.
    ///
    /// Fails with `NotInitialized` (-32002) when the session is missing or
    /// has not completed `initialize`.
    pub async fn require_initialized(&self, key: &str) -> Result<Session, GateError> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(key) {
            Some(session) if session.is_initialized => {
                session.last_activity = Instant::now();
                Ok(session.clone())
            }
            _ => Err(GateError::NotInitialized(format!(
                "session '{key}' has not initialized"
            ))),
        }
    }

    /// Remove a session explicitly. Returns whether one existed.
    pub async fn terminate(&self, key: &str) -> bool {
        let removed = self.sessions.lock().await.remove(key).is_some();
        if removed {
            info!(session = %key, "session terminated");
        }
        removed
    }

    /// Expire sessions idle past the configured timeout. Returns the
    /// removed keys.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let timeout = Duration::from_millis(self.config.session_timeout_ms);
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.last_activity.elapsed() >= timeout)
            .map(|s| s.key.clone())
            .collect();
        for key in &expired {
            sessions.remove(key);
            info!(session = %key, "session expired");
        }
        expired
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(timeout_ms: u64, max_sessions: usize) -> SessionManager {
        SessionManager::new(SessionConfig {
            session_timeout_ms: timeout_ms,
            max_sessions,
            auth_token: None,
        })
    }

    #[tokio::test]
    async fn test_sessions_created_on_first_contact() {
        let sessions = manager(60_000, 8);
        let first = sessions.touch("conn-1").await;
        assert!(!first.is_initialized);
        assert_eq!(sessions.count().await, 1);

        // Same key returns the same session.
        let again = sessions.touch("conn-1").await;
        assert_eq!(again.id, first.id);
        assert_eq!(sessions.count().await, 1);
    }

    #[tokio::test]
    async fn test_uninitialized_requests_rejected() {
        let sessions = manager(60_000, 8);
        sessions.touch("conn-1").await;

        let err = sessions.require_initialized("conn-1").await.unwrap_err();
        assert!(matches!(err, GateError::NotInitialized(_)));
        assert_eq!(err.code(), -32002);

        // Unknown keys are rejected the same way.
        let err = sessions.require_initialized("ghost").await.unwrap_err();
        assert_eq!(err.code(), -32002);
    }

    #[tokio::test]
    async fn test_initialize_stores_negotiated_state() {
        let sessions = manager(60_000, 8);
        let session = sessions
            .initialize(
                "conn-1",
                Some(json!({"major": 2024, "minor": 11, "patch": 5})),
                Some(json!({"name": "agent", "version": "1.0"})),
                Some("coding".to_string()),
            )
            .await;
        assert!(session.is_initialized);
        assert_eq!(session.task_type.as_deref(), Some("coding"));

        let fetched = sessions.require_initialized("conn-1").await.unwrap();
        assert_eq!(
            fetched.client_info.unwrap()["name"],
            json!("agent")
        );
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let sessions = manager(30, 8);
        sessions.initialize("conn-1", None, None, None).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let expired = sessions.sweep_expired().await;
        assert_eq!(expired, vec!["conn-1"]);
        assert_eq!(sessions.count().await, 0);
    }

    #[tokio::test]
    async fn test_activity_defers_expiry() {
        let sessions = manager(60, 8);
        sessions.initialize("conn-1", None, None, None).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        sessions.require_initialized("conn-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(sessions.sweep_expired().await.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_idle() {
        let sessions = manager(60_000, 2);
        let old_id = sessions.touch("old").await.id;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mid_id = sessions.touch("mid").await.id;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Refresh "old" so "mid" is now the oldest idle, then overflow.
        sessions.touch("old").await;
        sessions.touch("new").await;

        assert_eq!(sessions.count().await, 2);
        // "old" survived with its identity intact.
        assert_eq!(sessions.touch("old").await.id, old_id);
        // "mid" was evicted: contacting it again creates a fresh session.
        assert_ne!(sessions.touch("mid").await.id, mid_id);
    }

    #[tokio::test]
    async fn test_terminate_removes_session() {
        let sessions = manager(60_000, 8);
        sessions.touch("conn-1").await;
        assert!(sessions.terminate("conn-1").await);
        assert!(!sessions.terminate("conn-1").await);
        assert_eq!(sessions.count().await, 0);
    }
}
