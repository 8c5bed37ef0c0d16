//! Message History
//!
//! The append-only list of delivered messages for the session. A single
//! task owns the list; appends and reads are messages to that task, so
//! every read observes all earlier appends, in order, and no append is
//! ever interleaved with another.

use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use super::message_types::UnifiedMessage;
use crate::error::Result;
use crate::tasks::TaskRegistry;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

enum HistoryCommand {
    Append(UnifiedMessage),
    Snapshot(oneshot::Sender<Vec<UnifiedMessage>>),
    Len(oneshot::Sender<usize>),
    Find(Uuid, oneshot::Sender<Option<UnifiedMessage>>),
}

/// Handle to the history task. Cheap to clone.
#[derive(Clone)]
pub struct MessageHistory {
    commands: mpsc::UnboundedSender<HistoryCommand>,
    updates: broadcast::Sender<UnifiedMessage>,
}

impl MessageHistory {
    /// Start the history task in `tasks`. Once the registry shuts down,
    /// appends are ignored and reads come back empty.
    pub fn spawn(tasks: &TaskRegistry) -> Self {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        let notify = updates.clone();
        tasks.spawn_cancellable(async move {
            let mut messages: Vec<UnifiedMessage> = Vec::new();
            while let Some(command) = rx.recv().await {
                match command {
                    HistoryCommand::Append(message) => {
                        debug!("History append {} from {} ({})", message.id, message.sender_id, message.source);
                        messages.push(message.clone());
                        // no subscribers is fine
                        let _ = notify.send(message);
                    }
                    HistoryCommand::Snapshot(reply) => {
                        let _ = reply.send(messages.clone());
                    }
                    HistoryCommand::Len(reply) => {
                        let _ = reply.send(messages.len());
                    }
                    HistoryCommand::Find(id, reply) => {
                        let _ = reply.send(messages.iter().find(|m| m.id == id).cloned());
                    }
                }
            }
            debug!("History task finished with {} messages", messages.len());
        });

        Self { commands, updates }
    }

    pub fn append(&self, message: UnifiedMessage) {
        let _ = self.commands.send(HistoryCommand::Append(message));
    }

    async fn request<T: Default>(&self, command: impl FnOnce(oneshot::Sender<T>) -> HistoryCommand) -> T {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(command(tx)).is_err() {
            return T::default();
        }
        rx.await.unwrap_or_default()
    }

    /// All messages in delivery order
    pub async fn snapshot(&self) -> Vec<UnifiedMessage> {
        self.request(HistoryCommand::Snapshot).await
    }

    pub async fn len(&self) -> usize {
        self.request(HistoryCommand::Len).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get_message(&self, id: Uuid) -> Option<UnifiedMessage> {
        self.request(|reply| HistoryCommand::Find(id, reply)).await
    }

    /// Most recent first
    pub async fn recent(&self, limit: usize) -> Vec<UnifiedMessage> {
        self.snapshot().await.into_iter().rev().take(limit).collect()
    }

    /// Case-insensitive match on text or nickname, most recent first
    pub async fn search(&self, query: &str, limit: usize) -> Vec<UnifiedMessage> {
        let query = query.to_lowercase();
        self.snapshot()
            .await
            .into_iter()
            .rev()
            .filter(|m| m.text.to_lowercase().contains(&query) || m.nickname.to_lowercase().contains(&query))
            .take(limit)
            .collect()
    }

    /// Every message appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<UnifiedMessage> {
        self.updates.subscribe()
    }

    pub async fn get_statistics(&self) -> Value {
        let messages = self.snapshot().await;
        let mut by_source: HashMap<String, usize> = HashMap::new();
        for message in &messages {
            *by_source.entry(message.source.to_string()).or_insert(0) += 1;
        }
        serde_json::json!({
            "total_messages": messages.len(),
            "by_source": by_source,
        })
    }

    pub async fn export_json(&self) -> Result<String> {
        let messages = self.snapshot().await;
        let export = serde_json::json!({
            "export_timestamp": chrono::Utc::now(),
            "message_count": messages.len(),
            "messages": messages,
        });
        Ok(serde_json::to_string_pretty(&export)?)
    }
}
