//! Bounded per-conversation chat history
//!
//! Conversations are keyed by device and contact so that two tenants talking
//! to the same guest never see each other's turns.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::models::{ConversationStats, HistoryStats};

pub const DEFAULT_MAX_ENTRIES: usize = 10;
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub device_id: String,
    pub contact_number: String,
}

impl ConversationKey {
    pub fn new(device_id: impl Into<String>, contact_number: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            contact_number: contact_number.into(),
        }
    }
}

/// Shared, bounded chat history
#[derive(Clone)]
pub struct ChatHistoryStore {
    conversations: Arc<RwLock<HashMap<ConversationKey, VecDeque<HistoryEntry>>>>,
    max_entries: usize,
    retention: Duration,
}

impl Default for ChatHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, Duration::hours(DEFAULT_RETENTION_HOURS))
    }
}

impl ChatHistoryStore {
    pub fn new(max_entries: usize, retention: Duration) -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
            max_entries: max_entries.max(1),
            retention,
        }
    }

    pub async fn append(&self, key: &ConversationKey, role: Role, text: &str) {
        self.append_at(key, role, text, Utc::now()).await;
    }

    /// Append a turn, evicting the oldest entries beyond the cap
    pub async fn append_at(
        &self,
        key: &ConversationKey,
        role: Role,
        text: &str,
        timestamp: DateTime<Utc>,
    ) {
        let mut conversations = self.conversations.write().await;
        let entries = conversations.entry(key.clone()).or_default();
        entries.push_back(HistoryEntry {
            role,
            text: text.to_string(),
            timestamp,
        });
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    pub async fn entries(&self, key: &ConversationKey) -> Vec<HistoryEntry> {
        self.conversations
            .read()
            .await
            .get(key)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// One `Role: text` line per turn, oldest first
    pub async fn formatted(&self, key: &ConversationKey) -> String {
        self.entries(key)
            .await
            .iter()
            .map(|entry| format!("{}: {}", entry.role.label(), entry.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn clear(&self, key: &ConversationKey) -> bool {
        self.conversations.write().await.remove(key).is_some()
    }

    /// Drop every conversation, returning how many there were
    pub async fn clear_all(&self) -> usize {
        let mut conversations = self.conversations.write().await;
        let count = conversations.len();
        conversations.clear();
        count
    }

    /// Remove conversations whose newest turn is older than the retention window
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut conversations = self.conversations.write().await;
        let before = conversations.len();
        conversations.retain(|_, entries| {
            entries
                .back()
                .is_some_and(|newest| newest.timestamp >= cutoff)
        });
        before - conversations.len()
    }

    pub async fn stats(&self) -> HistoryStats {
        let conversations = self.conversations.read().await;
        let mut stats: Vec<ConversationStats> = conversations
            .iter()
            .map(|(key, entries)| ConversationStats {
                device_id: key.device_id.clone(),
                whatsapp_number: key.contact_number.clone(),
                message_count: entries.len(),
                last_message: entries.back().map(|entry| entry.timestamp),
            })
            .collect();
        stats.sort_by(|a, b| b.last_message.cmp(&a.last_message));

        HistoryStats {
            total_conversations: stats.len(),
            conversations: stats,
        }
    }

    /// Run `sweep` on a cron schedule
    pub async fn start_sweep(&self, schedule: &str) -> Result<JobScheduler> {
        let store = self.clone();
        let scheduler = JobScheduler::new().await?;

        let job = Job::new_async(schedule, move |_, _| {
            let store = store.clone();
            Box::pin(async move {
                let removed = store.sweep(Utc::now()).await;
                info!(removed, "Chat history sweep finished");
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;

        info!("Started chat history sweep with schedule: {}", schedule);
        Ok(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(contact: &str) -> ConversationKey {
        ConversationKey::new("device-5511987654321", contact)
    }

    #[tokio::test]
    async fn test_history_keeps_only_the_newest_turns() {
        let store = ChatHistoryStore::default();
        let guest = key("5511911112222");

        for i in 0..15 {
            store.append(&guest, Role::User, &format!("message {i}")).await;
        }

        let entries = store.entries(&guest).await;
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0].text, "message 5");
        assert_eq!(entries[9].text, "message 14");
    }

    #[tokio::test]
    async fn test_formatted_history() {
        let store = ChatHistoryStore::default();
        let guest = key("5511911112222");
        store.append(&guest, Role::User, "Any rooms?").await;
        store.append(&guest, Role::Assistant, "Yes, two.").await;

        assert_eq!(
            store.formatted(&guest).await,
            "User: Any rooms?\nAssistant: Yes, two."
        );
        assert_eq!(store.formatted(&key("5511933334444")).await, "");
    }

    #[tokio::test]
    async fn test_conversations_are_isolated_per_device() {
        let store = ChatHistoryStore::default();
        let a = ConversationKey::new("device-a", "5511911112222");
        let b = ConversationKey::new("device-b", "5511911112222");

        store.append(&a, Role::User, "hello a").await;
        assert!(store.entries(&b).await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_conversations() {
        let store = ChatHistoryStore::default();
        let now = Utc::now();
        store
            .append_at(&key("idle"), Role::User, "old", now - Duration::hours(25))
            .await;
        store
            .append_at(&key("active"), Role::User, "new", now - Duration::hours(1))
            .await;

        assert_eq!(store.sweep(now).await, 1);

        let stats = store.stats().await;
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.conversations[0].whatsapp_number, "active");
        assert_eq!(stats.conversations[0].message_count, 1);
    }

    #[tokio::test]
    async fn test_clear_and_clear_all() {
        let store = ChatHistoryStore::default();
        store.append(&key("one"), Role::User, "a").await;
        store.append(&key("two"), Role::User, "b").await;

        assert!(store.clear(&key("one")).await);
        assert!(!store.clear(&key("one")).await);
        assert_eq!(store.clear_all().await, 1);
        assert_eq!(store.stats().await.total_conversations, 0);
    }
}
