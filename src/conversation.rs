//! In-memory conversation store and message log.
//!
//! Append-only per conversation: messages are never edited or reordered in
//! place. Exceeding the configured maximum length silently drops the oldest
//! non-system messages; system messages are never evicted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            MessageRole::System => "System",
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
            MessageRole::Tool => "Tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Conversation {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Drop the oldest non-system messages until the log fits `max_len`.
    /// System messages are always retained, even if they alone exceed the cap.
    fn enforce_max_len(&mut self, max_len: usize) {
        if self.messages.len() <= max_len {
            return;
        }
        let system_count = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .count();
        let keep_recent = max_len.saturating_sub(system_count);
        let non_system = self.messages.len() - system_count;
        let mut to_drop = non_system.saturating_sub(keep_recent);
        self.messages.retain(|m| {
            if m.role == MessageRole::System {
                return true;
            }
            if to_drop > 0 {
                to_drop -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// A (role, content) entry handed to the text generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Read-only derived view of a conversation for export. Re-parsing the JSON
/// form yields the same ordered message sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationExport {
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

/// Shared message log, keyed by conversation id. All mutation goes through
/// [`ConversationStore::append`] under the write lock, so appends on one
/// conversation never interleave.
pub struct ConversationStore {
    max_len: usize,
    inner: RwLock<HashMap<String, Conversation>>,
}

impl ConversationStore {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Create a new conversation, optionally seeded with a system message.
    pub async fn create(&self, system_preamble: Option<&str>) -> Conversation {
        let mut conversation = Conversation::new();
        if let Some(preamble) = system_preamble.filter(|p| !p.trim().is_empty()) {
            conversation.messages.push(Message {
                id: Uuid::new_v4().to_string(),
                role: MessageRole::System,
                content: preamble.to_string(),
                timestamp: Utc::now(),
                metadata: serde_json::Map::new(),
            });
        }
        let snapshot = conversation.clone();
        self.inner
            .write()
            .await
            .insert(conversation.id.clone(), conversation);
        snapshot
    }

    /// Append a message, enforcing the truncation invariant before returning.
    pub async fn append(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Message, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::validation("message content cannot be empty"));
        }

        let mut conversations = self.inner.write().await;
        let conversation = conversations.get_mut(conversation_id).ok_or_else(|| {
            ChatError::not_found(format!("conversation '{}' not found", conversation_id))
        })?;

        let message = Message {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            metadata,
        };
        conversation.messages.push(message.clone());
        conversation.updated_at = message.timestamp;
        conversation.enforce_max_len(self.max_len);

        tracing::debug!(
            conversation = conversation_id,
            role = role.as_str(),
            length = content.len(),
            "message appended"
        );
        Ok(message)
    }

    /// Most recent context for the generator: all retained system messages
    /// first, then the most recent non-system messages filling the remaining
    /// budget, in append order.
    pub async fn context_window(
        &self,
        conversation_id: &str,
        max_messages: usize,
    ) -> Result<Vec<ContextMessage>, ChatError> {
        let conversations = self.inner.read().await;
        let conversation = conversations.get(conversation_id).ok_or_else(|| {
            ChatError::not_found(format!("conversation '{}' not found", conversation_id))
        })?;

        let system: Vec<&Message> = conversation
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .collect();
        let budget = max_messages.saturating_sub(system.len());
        let non_system: Vec<&Message> = conversation
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .collect();
        let skip = non_system.len().saturating_sub(budget);

        Ok(system
            .into_iter()
            .chain(non_system.into_iter().skip(skip))
            .map(|m| ContextMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect())
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.inner.read().await.get(conversation_id).cloned()
    }

    pub async fn export_json(&self, conversation_id: &str) -> Result<ConversationExport, ChatError> {
        let conversation = self.get(conversation_id).await.ok_or_else(|| {
            ChatError::not_found(format!("conversation '{}' not found", conversation_id))
        })?;
        Ok(ConversationExport {
            conversation_id: conversation.id,
            created_at: conversation.created_at,
            messages: conversation.messages,
        })
    }

    pub async fn export_markdown(&self, conversation_id: &str) -> Result<String, ChatError> {
        let conversation = self.get(conversation_id).await.ok_or_else(|| {
            ChatError::not_found(format!("conversation '{}' not found", conversation_id))
        })?;

        let mut md = String::from("# Conversation Export\n\n");
        md.push_str(&format!("**Conversation ID:** {}\n", conversation.id));
        md.push_str(&format!(
            "**Date:** {}\n\n",
            conversation.created_at.format("%Y-%m-%d %H:%M:%S")
        ));
        for message in &conversation.messages {
            md.push_str(&format!(
                "## {} ({})\n\n{}\n\n",
                message.role.label(),
                message.timestamp.format("%H:%M:%S"),
                message.content
            ));
        }
        Ok(md)
    }

    /// (conversations, total messages) for the stats endpoint.
    pub async fn counts(&self) -> (usize, usize) {
        let conversations = self.inner.read().await;
        let total_messages = conversations.values().map(|c| c.messages.len()).sum();
        (conversations.len(), total_messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_metadata() -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    #[tokio::test]
    async fn append_rejects_whitespace_only_content() {
        let store = ConversationStore::new(10);
        let conversation = store.create(None).await;
        let result = store
            .append(&conversation.id, MessageRole::User, "   \n\t ", no_metadata())
            .await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn append_to_unknown_conversation_is_not_found() {
        let store = ConversationStore::new(10);
        let result = store
            .append("missing", MessageRole::User, "hello", no_metadata())
            .await;
        assert!(matches!(result, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn truncation_keeps_system_plus_most_recent() {
        // Max length 10 with 1 system message: 15 turns leave the system
        // message plus the 9 most recent turns.
        let store = ConversationStore::new(10);
        let conversation = store.create(Some("preamble")).await;
        for i in 0..15 {
            store
                .append(
                    &conversation.id,
                    MessageRole::User,
                    &format!("turn {}", i),
                    no_metadata(),
                )
                .await
                .unwrap();
        }

        let kept = store.get(&conversation.id).await.unwrap().messages;
        assert_eq!(kept.len(), 10);
        assert_eq!(kept[0].role, MessageRole::System);
        assert_eq!(kept[1].content, "turn 6");
        assert_eq!(kept[9].content, "turn 14");
    }

    #[tokio::test]
    async fn truncation_never_exceeds_max_for_any_append_sequence() {
        let store = ConversationStore::new(5);
        let conversation = store.create(Some("a")).await;
        store
            .append(&conversation.id, MessageRole::System, "b", no_metadata())
            .await
            .unwrap();
        for i in 0..20 {
            store
                .append(
                    &conversation.id,
                    if i % 2 == 0 {
                        MessageRole::User
                    } else {
                        MessageRole::Assistant
                    },
                    &format!("m{}", i),
                    no_metadata(),
                )
                .await
                .unwrap();
            let messages = store.get(&conversation.id).await.unwrap().messages;
            assert!(messages.len() <= 5);
            assert_eq!(
                messages
                    .iter()
                    .filter(|m| m.role == MessageRole::System)
                    .count(),
                2
            );
        }
    }

    #[tokio::test]
    async fn context_window_preserves_append_order() {
        let store = ConversationStore::new(50);
        let conversation = store.create(None).await;
        for i in 0..6 {
            store
                .append(
                    &conversation.id,
                    MessageRole::User,
                    &format!("m{}", i),
                    no_metadata(),
                )
                .await
                .unwrap();
        }

        let window = store.context_window(&conversation.id, 3).await.unwrap();
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4", "m5"]);
    }

    #[tokio::test]
    async fn context_window_always_prepends_system_messages() {
        let store = ConversationStore::new(50);
        let conversation = store.create(Some("you are helpful")).await;
        for i in 0..8 {
            store
                .append(
                    &conversation.id,
                    MessageRole::User,
                    &format!("m{}", i),
                    no_metadata(),
                )
                .await
                .unwrap();
        }

        // System preamble is old, yet still enters a window of 4.
        let window = store.context_window(&conversation.id, 4).await.unwrap();
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].role, MessageRole::System);
        assert_eq!(window[1].content, "m5");
        assert_eq!(window[3].content, "m7");
    }

    #[tokio::test]
    async fn export_json_round_trips() {
        let store = ConversationStore::new(20);
        let conversation = store.create(Some("sys")).await;
        store
            .append(&conversation.id, MessageRole::User, "hello", no_metadata())
            .await
            .unwrap();
        store
            .append(
                &conversation.id,
                MessageRole::Assistant,
                "hi there",
                no_metadata(),
            )
            .await
            .unwrap();

        let export = store.export_json(&conversation.id).await.unwrap();
        let serialized = serde_json::to_string(&export).unwrap();
        let reparsed: ConversationExport = serde_json::from_str(&serialized).unwrap();

        let original: Vec<(MessageRole, String)> = export
            .messages
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect();
        let round_tripped: Vec<(MessageRole, String)> = reparsed
            .messages
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect();
        assert_eq!(original, round_tripped);
    }

    #[tokio::test]
    async fn export_markdown_sections_follow_message_order() {
        let store = ConversationStore::new(20);
        let conversation = store.create(None).await;
        store
            .append(&conversation.id, MessageRole::User, "question", no_metadata())
            .await
            .unwrap();
        store
            .append(
                &conversation.id,
                MessageRole::Assistant,
                "answer",
                no_metadata(),
            )
            .await
            .unwrap();

        let md = store.export_markdown(&conversation.id).await.unwrap();
        let user_at = md.find("## User").unwrap();
        let assistant_at = md.find("## Assistant").unwrap();
        assert!(user_at < assistant_at);
        assert!(md.contains("question"));
        assert!(md.contains("answer"));
    }
}
