//! Session History
//!
//! In-memory dialogue windows per session for conversation continuity.
//! Each session keeps a ring buffer of the last turns; the oldest turn is
//! dropped on overflow to bound memory. Nothing here is persisted;
//! transcript durability belongs to the persistence collaborator.
//!
//! Concurrent requests against the same session may interleave their
//! appends; per-session ordering is only as strong as the order the
//! owning requests complete. Single writer per session is the
//! recommended deployment discipline, not enforced here.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Maximum turns kept per session (rolling window)
pub const MAX_TURNS_PER_SESSION: usize = 20;

/// Speaker role for a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single turn in a session's dialogue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    /// Unix timestamp in milliseconds
    pub at: i64,
}

/// Session store statistics
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub sessions: usize,
    pub total_turns: usize,
}

/// Bounded in-memory session histories
pub struct SessionStore {
    sessions: RwLock<HashMap<String, VecDeque<ConversationTurn>>>,
    max_turns: usize,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_max_turns(MAX_TURNS_PER_SESSION)
    }

    pub fn with_max_turns(max_turns: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns,
        }
    }

    /// Append a single turn, dropping the oldest on overflow
    pub async fn append(&self, session_id: &str, role: Role, text: &str) {
        let turn = ConversationTurn {
            role,
            text: text.to_string(),
            at: chrono::Utc::now().timestamp_millis(),
        };

        let mut sessions = self.sessions.write().await;
        let history = sessions.entry(session_id.to_string()).or_default();
        history.push_back(turn);
        while history.len() > self.max_turns {
            history.pop_front();
        }
        debug!(
            "Session {} now has {} turns",
            session_id,
            history.len()
        );
    }

    /// Append a user message and the assistant reply as one exchange
    pub async fn append_exchange(&self, session_id: &str, user_text: &str, assistant_text: &str) {
        self.append(session_id, Role::User, user_text).await;
        self.append(session_id, Role::Assistant, assistant_text).await;
    }

    /// Last `last_n` turns in chronological order
    pub async fn history(&self, session_id: &str, last_n: usize) -> Vec<ConversationTurn> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(history) => {
                let skip = history.len().saturating_sub(last_n);
                history.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// History formatted for prompt injection
    pub async fn as_prompt_context(&self, session_id: &str, last_n: usize) -> String {
        let turns = self.history(session_id, last_n).await;
        if turns.is_empty() {
            return String::new();
        }

        let mut context = String::from("[Previous conversation:]\n");
        for turn in turns {
            let label = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            context.push_str(&format!("{}: {}\n", label, turn.text));
        }
        context
    }

    /// Drop a session's history; returns how many turns were removed
    pub async fn clear(&self, session_id: &str) -> usize {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id).map(|h| h.len()).unwrap_or(0)
    }

    pub async fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read().await;
        SessionStats {
            sessions: sessions.len(),
            total_turns: sessions.values().map(|h| h.len()).sum(),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_history() {
        let store = SessionStore::new();

        store.append("s1", Role::User, "Hello, my name is Max").await;
        store.append("s1", Role::Assistant, "Nice to meet you, Max!").await;

        let history = store.history("s1", 10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert!(history[0].text.contains("Max"));
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_ring_buffer_drops_oldest() {
        let store = SessionStore::with_max_turns(3);

        for i in 0..5 {
            store.append("s1", Role::User, &format!("Message {}", i)).await;
        }

        let history = store.history("s1", 10).await;
        assert_eq!(history.len(), 3);
        assert!(history[0].text.contains("Message 2"));
        assert!(history[2].text.contains("Message 4"));
    }

    #[tokio::test]
    async fn test_history_last_n_slicing() {
        let store = SessionStore::new();
        for i in 0..6 {
            store.append("s1", Role::User, &format!("m{}", i)).await;
        }

        let recent = store.history("s1", 2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "m4");
        assert_eq!(recent[1].text, "m5");
    }

    #[tokio::test]
    async fn test_prompt_context_format() {
        let store = SessionStore::new();
        store.append_exchange("s1", "My name is Max", "Hello Max!").await;

        let context = store.as_prompt_context("s1", 10).await;
        assert!(context.contains("[Previous conversation:]"));
        assert!(context.contains("User: My name is Max"));
        assert!(context.contains("Assistant: Hello Max!"));
    }

    #[tokio::test]
    async fn test_empty_session_yields_empty_context() {
        let store = SessionStore::new();
        assert!(store.as_prompt_context("nope", 10).await.is_empty());
        assert!(store.history("nope", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_session_isolation() {
        let store = SessionStore::new();
        store.append("s1", Role::User, "Session 1 message").await;
        store.append("s2", Role::User, "Session 2 message").await;

        assert_eq!(store.history("s1", 10).await.len(), 1);
        assert_eq!(store.history("s2", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let store = SessionStore::new();
        store.append_exchange("s1", "Hello", "Hi").await;
        store.append("s2", Role::User, "Hey").await;

        let stats = store.stats().await;
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.total_turns, 3);

        assert_eq!(store.clear("s1").await, 2);
        assert_eq!(store.stats().await.sessions, 1);
    }
}
