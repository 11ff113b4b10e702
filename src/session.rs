//! Session registry: maps session ids to conversations and owns idle expiry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::conversation::ConversationStore;
use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Ended,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub turn_count: u64,
    pub state: SessionState,
}

/// Live session index. The registry owns liveness metadata and the idle
/// sweep; conversations live in the [`ConversationStore`] so history can be
/// read without going through a session.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    store: Arc<ConversationStore>,
    preamble: String,
    idle_timeout: chrono::Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<ConversationStore>, preamble: String, idle_timeout_secs: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            preamble,
            idle_timeout: chrono::Duration::seconds(idle_timeout_secs as i64),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a session, seeding its conversation with the system preamble.
    ///
    /// If `requested_id` names a live session it is returned unchanged, so a
    /// reconnecting peer lands back on its existing conversation.
    pub async fn create_session(&self, requested_id: Option<&str>) -> Session {
        let mut sessions = self.sessions.write().await;
        if let Some(id) = requested_id {
            if let Some(existing) = sessions.get_mut(id) {
                // Reconnecting counts as activity, or the idle sweep could
                // end the session right after the handshake.
                existing.last_activity = Utc::now();
                return existing.clone();
            }
        }

        let preamble = if self.preamble.trim().is_empty() {
            None
        } else {
            Some(self.preamble.as_str())
        };
        let conversation = self.store.create(preamble).await;

        let now = Utc::now();
        let session = Session {
            id: requested_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            conversation_id: conversation.id,
            created_at: now,
            last_activity: now,
            turn_count: 0,
            state: SessionState::Active,
        };
        sessions.insert(session.id.clone(), session.clone());
        tracing::info!(session = %session.id, "created session");
        session
    }

    /// Look up a live session, refreshing its activity timestamp.
    pub async fn get_session(&self, id: &str) -> Result<Session, ChatError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| ChatError::not_found(format!("session '{}' not found", id)))?;
        session.last_activity = Utc::now();
        Ok(session.clone())
    }

    /// Record a completed turn submission on the session.
    pub async fn record_turn(&self, id: &str) -> Result<Session, ChatError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| ChatError::not_found(format!("session '{}' expired or ended", id)))?;
        session.turn_count += 1;
        session.last_activity = Utc::now();
        Ok(session.clone())
    }

    /// End a session. Idempotent if already absent. The conversation stays in
    /// the store for export/history reads.
    pub async fn end_session(&self, id: &str) {
        let removed = self.sessions.write().await.remove(id);
        if let Some(mut session) = removed {
            session.state = SessionState::Ended;
            tracing::info!(session = %id, "ended session");
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// End every session idle past the timeout, returning the ended ids.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now - s.last_activity > self.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
            tracing::info!(session = %id, "expired idle session");
        }
        expired
    }

    /// Spawn the periodic idle sweep. An in-flight turn on a swept session
    /// surfaces as a clean session-expired error on the controller's next
    /// lookup rather than racing the sweep.
    pub fn start_sweeper(self: &Arc<Self>, interval: std::time::Duration) {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                let ended = registry.sweep_once(Utc::now()).await;
                if !ended.is_empty() {
                    tracing::info!(count = ended.len(), "idle sweep ended sessions");
                }
            }
        });
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(previous) = sweeper.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop the sweep task on shutdown.
    pub fn shutdown(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(idle_timeout_secs: u64, preamble: &str) -> Arc<SessionRegistry> {
        let store = Arc::new(ConversationStore::new(100));
        Arc::new(SessionRegistry::new(
            store,
            preamble.to_string(),
            idle_timeout_secs,
        ))
    }

    #[tokio::test]
    async fn create_session_is_idempotent_for_live_ids() {
        let registry = registry(3600, "sys");
        let first = registry.create_session(Some("abc")).await;
        let second = registry.create_session(Some("abc")).await;
        assert_eq!(first.conversation_id, second.conversation_id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn create_session_seeds_system_preamble() {
        let store = Arc::new(ConversationStore::new(100));
        let registry = Arc::new(SessionRegistry::new(
            store.clone(),
            "be helpful".to_string(),
            3600,
        ));
        let session = registry.create_session(None).await;

        let conversation = store.get(&session.conversation_id).await.unwrap();
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].content, "be helpful");
    }

    #[tokio::test]
    async fn empty_preamble_seeds_nothing() {
        let store = Arc::new(ConversationStore::new(100));
        let registry = Arc::new(SessionRegistry::new(store.clone(), String::new(), 3600));
        let session = registry.create_session(None).await;
        let conversation = store.get(&session.conversation_id).await.unwrap();
        assert!(conversation.messages.is_empty());
    }

    #[tokio::test]
    async fn reconnect_refreshes_last_activity() {
        let registry = registry(60, "");
        let session = registry.create_session(Some("abc")).await;
        let stale = session.last_activity - chrono::Duration::seconds(59);
        registry
            .sessions
            .write()
            .await
            .get_mut("abc")
            .unwrap()
            .last_activity = stale;

        let reconnected = registry.create_session(Some("abc")).await;
        assert_eq!(reconnected.conversation_id, session.conversation_id);
        assert!(reconnected.last_activity > stale);

        // A sweep that would have caught the stale stamp leaves it alone.
        let ended = registry
            .sweep_once(stale + chrono::Duration::seconds(61))
            .await;
        assert!(ended.is_empty());
    }

    #[tokio::test]
    async fn get_session_refreshes_activity() {
        let registry = registry(3600, "");
        let created = registry.create_session(None).await;
        let fetched = registry.get_session(&created.id).await.unwrap();
        assert!(fetched.last_activity >= created.last_activity);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let registry = registry(3600, "");
        assert!(matches!(
            registry.get_session("missing").await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn end_session_is_idempotent() {
        let registry = registry(3600, "");
        let session = registry.create_session(None).await;
        registry.end_session(&session.id).await;
        registry.end_session(&session.id).await;
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_ends_idle_sessions_only() {
        let registry = registry(60, "");
        let idle = registry.create_session(Some("idle")).await;
        registry.create_session(Some("fresh")).await;

        let later = idle.last_activity + chrono::Duration::seconds(120);
        // "fresh" was created at roughly the same instant, so give it a
        // recent touch before sweeping at the later timestamp.
        registry.get_session("fresh").await.unwrap();
        let mut sessions = registry.sessions.write().await;
        sessions.get_mut("fresh").unwrap().last_activity = later;
        drop(sessions);

        let ended = registry.sweep_once(later).await;
        assert_eq!(ended, vec!["idle".to_string()]);
        assert!(registry.get_session("idle").await.is_err());
        assert!(registry.get_session("fresh").await.is_ok());
    }

    #[tokio::test]
    async fn turn_count_increments() {
        let registry = registry(3600, "");
        let session = registry.create_session(None).await;
        registry.record_turn(&session.id).await.unwrap();
        let session = registry.record_turn(&session.id).await.unwrap();
        assert_eq!(session.turn_count, 2);
    }
}
